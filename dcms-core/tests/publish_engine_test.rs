//! Publish engine integration tests
//!
//! Every test runs against an in-memory repository with the online project,
//! both root folders and one normal staging project rooted at `/`.

use dcms_core::{
    CmsConfig, CmsError, CmsRepository, DefinitionScope, FOLDER_TYPE, MemoryReport, ONLINE_PROJECT_ID, PLAIN_TYPE, ProjectDraft,
    ProjectId, ProjectType, PropertyMap, PublishOptions, Resource, ResourceDraft, ResourceState, TreeScope, UserId,
    WarningKind,
};

struct Fixture {
    repo: CmsRepository,
    project: ProjectId,
    admin: UserId,
}

fn fixture() -> Fixture {
    let repo = CmsRepository::open_in_memory(CmsConfig::default()).unwrap();
    repo.initialize().unwrap();
    let admin = repo.admin().unwrap();
    let project = new_project(&repo, "Staging", ProjectType::Normal);
    Fixture { repo, project, admin }
}

fn new_project(repo: &CmsRepository, name: &str, project_type: ProjectType) -> ProjectId {
    let admin = repo.admin().unwrap();
    let users = repo.users_group().unwrap();
    repo.create_project(
        &ProjectDraft {
            name: name.to_string(),
            description: format!("{} project", name),
            owner: admin,
            group: users,
            manager_group: users,
            project_type,
            task_id: 0,
        },
        &["/".to_string()],
    )
    .unwrap()
    .id
}

impl Fixture {
    fn publish(&self) -> dcms_core::PublishOutcome {
        self.repo
            .publish_project(self.project, &PublishOptions::by(self.admin), &MemoryReport::new())
            .unwrap()
    }

    fn publish_with(&self, options: PublishOptions, report: &MemoryReport) -> dcms_core::Result<dcms_core::PublishOutcome> {
        self.repo.publish_project(self.project, &options, report)
    }

    fn staging(&self, path: &str) -> Option<Resource> {
        self.repo.tree().lookup(TreeScope::Offline, path).unwrap()
    }

    fn online(&self, path: &str) -> Option<Resource> {
        self.repo.tree().lookup(TreeScope::Online, path).unwrap()
    }

    fn folder(&self, path: &str) -> Resource {
        self.repo.create_folder(self.project, path, self.admin).unwrap()
    }

    fn file(&self, path: &str, content: &[u8]) -> Resource {
        self.repo
            .create_file(self.project, path, PLAIN_TYPE, content, self.admin)
            .unwrap()
    }

    fn delete(&self, path: &str) {
        self.repo.delete_resource(self.project, path, self.admin).unwrap();
    }
}

fn assert_same_attributes(online: &Resource, staging: &Resource) {
    assert_eq!(online.path, staging.path);
    assert_eq!(online.resource_type, staging.resource_type);
    assert_eq!(online.flags, staging.flags);
    assert_eq!(online.owner, staging.owner);
    assert_eq!(online.group, staging.group);
    assert_eq!(online.access_flags, staging.access_flags);
    assert_eq!(online.date_created, staging.date_created);
    assert_eq!(online.date_last_modified, staging.date_last_modified);
    assert_eq!(online.last_modified_by, staging.last_modified_by);
    assert_eq!(online.length, staging.length);
    assert_eq!(online.state, ResourceState::Unchanged);
    assert_eq!(online.project_id, ONLINE_PROJECT_ID);
    assert!(online.locked_by.is_none());
}

#[test]
fn test_site_scenario() {
    let f = fixture();
    f.folder("/site/");
    let first = f.publish();
    assert_eq!(first.changed_paths, vec!["/site/"]);
    assert_eq!(f.online("/site/").unwrap().state, ResourceState::Unchanged);
    assert_eq!(f.staging("/site/").unwrap().state, ResourceState::Unchanged);

    let before = f.repo.backups().peek_version_id();
    assert_eq!(Some(before - 1), first.version_id);

    let staged = f.file("/site/index.html", b"<h1>Hello</h1>");
    assert_eq!(staged.state, ResourceState::New);
    let second = f.publish();
    assert_eq!(second.changed_paths, vec!["/site/index.html"]);
    assert_eq!(second.version_id, Some(before));
    assert_eq!(f.repo.backups().peek_version_id(), before + 1);

    let online = f.online("/site/index.html").unwrap();
    assert_same_attributes(&online, &staged);
    assert_eq!(
        f.repo.read_content(TreeScope::Online, "/site/index.html").unwrap().as_ref(),
        b"<h1>Hello</h1>"
    );
    assert_eq!(online.parent_id, Some(f.online("/site/").unwrap().id));
}

#[test]
fn test_changed_file_updates_online_copy() {
    let f = fixture();
    f.file("/a.txt", b"first");
    f.publish();
    let online_before = f.online("/a.txt").unwrap();

    let edited = f.repo.write_file(f.project, "/a.txt", b"second version", f.admin).unwrap();
    assert_eq!(edited.state, ResourceState::Changed);
    assert_eq!(f.repo.plan(f.project).unwrap().changed.len(), 1);

    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/a.txt"]);
    assert_eq!(outcome.changed.len(), 1);
    let online = f.online("/a.txt").unwrap();
    assert_eq!(online.id, online_before.id);
    assert_same_attributes(&online, &edited);
    assert_eq!(f.repo.read_content(TreeScope::Online, "/a.txt").unwrap().as_ref(), b"second version");
    assert!(f.repo.plan(f.project).unwrap().is_empty());
}

#[test]
fn test_deleted_resources_leave_both_trees() {
    let f = fixture();
    f.folder("/docs/");
    f.file("/docs/old.html", b"old");
    f.publish();

    f.delete("/docs/old.html");
    f.delete("/docs/");
    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/docs/old.html", "/docs/"]);
    for path in ["/docs/old.html", "/docs/"] {
        assert!(f.staging(path).is_none(), "{} still staged", path);
        assert!(f.online(path).is_none(), "{} still online", path);
    }
}

#[test]
fn test_folder_deletions_run_last_and_deepest_first() {
    let f = fixture();
    f.folder("/a/");
    f.folder("/a/b/");
    f.folder("/a/b/c/");
    f.file("/a/b/c/leaf.txt", b"leaf");
    f.file("/z.txt", b"z");
    f.publish();

    f.delete("/a/b/c/leaf.txt");
    f.delete("/a/b/c/");
    f.delete("/a/b/");
    f.delete("/a/");
    f.repo.write_file(f.project, "/z.txt", b"zz", f.admin).unwrap();

    let report = MemoryReport::new();
    let outcome = f.publish_with(PublishOptions::by(f.admin), &report).unwrap();
    assert_eq!(outcome.changed_paths, vec!["/a/b/c/leaf.txt", "/z.txt", "/a/b/c/", "/a/b/", "/a/"]);
    assert_eq!(
        report.lines(),
        vec![
            "delete file /a/b/c/leaf.txt",
            "publish file /z.txt",
            "delete folder /a/b/c/",
            "delete folder /a/b/",
            "delete folder /a/",
        ]
    );
    assert!(f.online("/a/").is_none());
}

#[test]
fn test_new_folder_with_online_counterpart_is_updated_in_place() {
    let f = fixture();
    let staged = f.folder("/site/");
    let online_root = f.online("/").unwrap();
    let leftover = f
        .repo
        .tree()
        .create_folder(
            TreeScope::Online,
            &ResourceDraft::published_from(&staged, Some(online_root.id), ONLINE_PROJECT_ID),
        )
        .unwrap();

    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/site/"]);
    let online = f.online("/site/").unwrap();
    assert_eq!(online.id, leftover.id);
    assert_same_attributes(&online, &staged);
}

#[test]
fn test_resources_locked_in_other_project_are_skipped() {
    let f = fixture();
    let other = new_project(&f.repo, "Other", ProjectType::Normal);
    f.file("/free.html", b"free");
    f.file("/held.html", b"held");
    f.repo.lock(other, "/held.html", f.admin).unwrap();
    f.repo.lock(f.project, "/free.html", f.admin).unwrap();

    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/free.html"]);
    assert!(f.online("/held.html").is_none());
    assert_eq!(f.staging("/held.html").unwrap().state, ResourceState::New);

    f.repo.unlock("/held.html").unwrap();
    assert_eq!(f.publish().changed_paths, vec!["/held.html"]);
}

#[test]
fn test_temporary_files_are_purged_not_published() {
    let f = fixture();
    f.folder("/site/");
    f.file("/site/~index.html", b"draft");
    f.file("/site/index.html", b"final");
    f.repo.set_links("/site/~index.html", &["/site/index.html".to_string()]).unwrap();

    assert_eq!(f.repo.plan(f.project).unwrap().created.len(), 2);
    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/site/", "/site/index.html"]);
    assert_eq!(outcome.purged_temporary, vec!["/site/~index.html"]);
    assert!(f.staging("/site/~index.html").is_none());
    assert!(f.online("/site/~index.html").is_none());
    assert!(f.repo.links().read_referencing(TreeScope::Offline, "/site/index.html").unwrap().is_empty());
}

#[test]
fn test_broken_link_to_deleted_target() {
    let f = fixture();
    f.folder("/x/");
    f.file("/x/y", b"target");
    f.file("/a.html", b"<a href=\"/x/y\">");
    f.repo.set_links("/a.html", &["/x/y".to_string()]).unwrap();
    f.publish();

    f.delete("/x/y");
    f.repo.write_file(f.project, "/a.html", b"<a href=\"/x/y\">!", f.admin).unwrap();

    let plan = f.repo.plan(f.project).unwrap();
    let report = MemoryReport::new();
    let broken = f
        .repo
        .checker()
        .broken_links(&plan.changed, &plan.deleted, &plan.created, &report)
        .unwrap();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].resource_path, "/a.html");
    assert_eq!(broken[0].targets, vec!["/x/y"]);
    assert_eq!(report.lines(), vec!["broken link: /a.html -> /x/y"]);

    let mut options = PublishOptions::by(f.admin);
    options.check_links = Some(true);
    let outcome = f.publish_with(options, &MemoryReport::new()).unwrap();
    assert_eq!(outcome.broken_links, broken);
}

#[test]
fn test_online_references_to_deleted_resource_are_reported() {
    let f = fixture();
    f.file("/target.html", b"t");
    f.file("/one.html", b"1");
    f.file("/two.html", b"2");
    f.repo.set_links("/one.html", &["/target.html".to_string(), "/gone.html".to_string()]).unwrap();
    f.repo.set_links("/two.html", &["/target.html".to_string()]).unwrap();
    f.publish();

    let online_one = f.online("/one.html").unwrap();
    assert_eq!(
        f.repo.links().read_link_entries(TreeScope::Online, online_one.id).unwrap(),
        vec!["/gone.html", "/target.html"]
    );

    f.delete("/target.html");
    f.repo.write_file(f.project, "/two.html", b"2!", f.admin).unwrap();
    let broken = f.repo.check_links(f.project, &MemoryReport::new()).unwrap();
    // /two.html is part of the publish and reported through its own edges
    let paths: Vec<&str> = broken.iter().map(|b| b.resource_path.as_str()).collect();
    assert_eq!(paths, vec!["/one.html", "/two.html"]);
    assert_eq!(broken[0].targets, vec!["/target.html"]);
}

#[test]
fn test_properties_follow_the_publish() {
    let f = fixture();
    f.repo.define_property("Title", PLAIN_TYPE).unwrap();
    f.file("/p.html", b"p");
    f.repo.write_property(f.project, "/p.html", "Title", "Welcome", f.admin).unwrap();
    let outcome = f.publish();
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let online = f.online("/p.html").unwrap();
    let props = f.repo.properties().read_properties(TreeScope::Online, online.id, PLAIN_TYPE).unwrap();
    assert_eq!(props.get("Title").map(String::as_str), Some("Welcome"));

    let version = outcome.version_id.unwrap();
    let header = f.repo.backups().read_file_header_for_hist(version, "/p.html").unwrap();
    let mut expected = PropertyMap::new();
    expected.insert("Title".into(), "Welcome".into());
    assert_eq!(header.properties, expected);
    assert_eq!(f.repo.backups().read_backup_content(version, "/p.html").unwrap().as_ref(), b"p");
}

#[test]
fn test_property_copy_failure_is_a_warning() {
    let f = fixture();
    f.repo
        .properties()
        .create_definition(DefinitionScope::Tree(TreeScope::Offline), "Keywords", PLAIN_TYPE)
        .unwrap();
    f.file("/k.html", b"k");
    f.repo.write_property(f.project, "/k.html", "Keywords", "a,b", f.admin).unwrap();

    let mut options = PublishOptions::by(f.admin);
    options.historize = Some(false);
    let outcome = f.publish_with(options, &MemoryReport::new()).unwrap();
    assert_eq!(outcome.changed_paths, vec!["/k.html"]);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].kind, WarningKind::PropertyCopy);
    assert_eq!(outcome.warnings[0].path, "/k.html");
    assert!(outcome.version_id.is_none());
    assert!(f.online("/k.html").is_some());
}

#[test]
fn test_missing_backup_definition_aborts_and_rolls_back_resource() {
    let f = fixture();
    f.repo
        .properties()
        .create_definition(DefinitionScope::Tree(TreeScope::Offline), "Keywords", PLAIN_TYPE)
        .unwrap();
    f.file("/a.html", b"a");
    f.file("/b.html", b"b");
    f.repo.write_property(f.project, "/b.html", "Keywords", "x", f.admin).unwrap();

    let err = f.publish_with(PublishOptions::by(f.admin), &MemoryReport::new()).unwrap_err();
    match err {
        CmsError::PublishAborted { path, completed, source } => {
            assert_eq!(path, "/b.html");
            assert_eq!(completed, vec!["/a.html"]);
            assert!(source.is_not_found());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(f.online("/a.html").is_some());
    assert!(f.online("/b.html").is_none());
    assert_eq!(f.staging("/b.html").unwrap().state, ResourceState::New);
}

#[test]
fn test_folder_with_remaining_children_is_kept() {
    let f = fixture();
    let other = new_project(&f.repo, "Other", ProjectType::Normal);
    f.folder("/keep/");
    f.file("/keep/a.txt", b"a");
    f.publish();

    f.delete("/keep/a.txt");
    f.delete("/keep/");
    f.repo.lock(other, "/keep/a.txt", f.admin).unwrap();

    let outcome = f.publish();
    assert!(outcome.changed_paths.is_empty());
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].kind, WarningKind::FolderNotEmpty);
    assert!(f.online("/keep/").is_some());
    assert_eq!(f.staging("/keep/").unwrap().state, ResourceState::Deleted);
}

#[test]
fn test_direct_folder_delete_requires_purged_children() {
    let f = fixture();
    f.folder("/site/");
    f.file("/site/page.html", b"page");
    f.publish();

    let tree = f.repo.tree();
    assert!(matches!(tree.delete_folder(TreeScope::Offline, "/site/"), Err(CmsError::NotEmpty(_))));
    f.delete("/site/page.html");
    assert!(matches!(tree.delete_folder(TreeScope::Offline, "/site/"), Err(CmsError::NotEmpty(_))));

    f.publish();
    assert!(f.staging("/site/page.html").is_none());
    tree.delete_folder(TreeScope::Offline, "/site/").unwrap();
    assert!(f.staging("/site/").is_none());
}

#[test]
fn test_history_and_retention() {
    let f = fixture();
    f.file("/h.txt", b"v1");
    let first = f.publish().version_id.unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    f.repo.write_file(f.project, "/h.txt", b"v2", f.admin).unwrap();
    let second = f.publish().version_id.unwrap();
    assert_eq!(second, first + 1);

    let history = f.repo.backups().read_all_file_headers_for_hist("/h.txt").unwrap();
    let versions: Vec<i64> = history.iter().map(|h| h.version_id).collect();
    assert_eq!(versions, vec![second, first]);
    assert_eq!(f.repo.backups().read_backup_content(first, "/h.txt").unwrap().as_ref(), b"v1");

    let projects = f.repo.read_all_backup_projects().unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].name, "Staging");
    assert_eq!(projects[0].resources, vec!["/"]);
    assert_eq!(projects[0].published_by_name, "Admin");

    let cutoff = f.repo.read_backup_project(second).unwrap().published_at;
    assert_eq!(f.repo.delete_backups_older_than(cutoff).unwrap(), second);
    assert!(f.repo.read_backup_project(first).unwrap_err().is_not_found());
    assert_eq!(f.repo.backups().peek_version_id(), second + 1);
}

#[test]
fn test_temporary_project_is_removed_after_publish() {
    let f = fixture();
    let temp = new_project(&f.repo, "Quickfix", ProjectType::Temporary);
    f.repo.create_file(temp, "/fix.html", PLAIN_TYPE, b"fix", f.admin).unwrap();
    let outcome = f
        .repo
        .publish_project(temp, &PublishOptions::by(f.admin), &MemoryReport::new())
        .unwrap();
    assert_eq!(outcome.changed_paths, vec!["/fix.html"]);
    assert!(f.repo.projects().read_project(temp).unwrap_err().is_not_found());
}

#[test]
fn test_publishing_the_online_project_is_refused() {
    let f = fixture();
    let result = f
        .repo
        .publish_project(ONLINE_PROJECT_ID, &PublishOptions::by(f.admin), &MemoryReport::new());
    assert!(result.is_err());
}

#[test]
fn test_aborted_publish_keeps_links_of_merged_resources() {
    let f = fixture();
    f.repo
        .properties()
        .create_definition(DefinitionScope::Tree(TreeScope::Offline), "Keywords", PLAIN_TYPE)
        .unwrap();
    f.file("/t.html", b"t");
    f.publish();
    f.file("/a.html", b"<a href=\"/t.html\">");
    f.repo.set_links("/a.html", &["/t.html".to_string()]).unwrap();
    f.file("/b.html", b"b");
    f.repo.write_property(f.project, "/b.html", "Keywords", "x", f.admin).unwrap();

    let err = f.publish_with(PublishOptions::by(f.admin), &MemoryReport::new()).unwrap_err();
    assert!(matches!(err, CmsError::PublishAborted { ref path, .. } if path == "/b.html"));
    let online_a = f.online("/a.html").unwrap();
    assert_eq!(f.staging("/a.html").unwrap().state, ResourceState::Unchanged);
    assert_eq!(
        f.repo.links().read_link_entries(TreeScope::Online, online_a.id).unwrap(),
        vec!["/t.html"]
    );

    f.repo.define_property("Keywords", PLAIN_TYPE).unwrap();
    assert_eq!(f.publish().changed_paths, vec!["/b.html"]);
    assert_eq!(
        f.repo.links().read_link_entries(TreeScope::Online, online_a.id).unwrap(),
        vec!["/t.html"]
    );

    f.delete("/t.html");
    let broken = f.repo.check_links(f.project, &MemoryReport::new()).unwrap();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].resource_path, "/a.html");
}

#[test]
fn test_changed_resources_missing_online_are_recreated() {
    let f = fixture();
    f.repo.define_property("Title", FOLDER_TYPE).unwrap();
    f.folder("/f/");
    f.file("/f/page.html", b"one");
    f.publish();

    let tree = f.repo.tree();
    let online_page = f.online("/f/page.html").unwrap();
    tree.delete_resource(TreeScope::Online, online_page.id).unwrap();
    tree.delete_folder(TreeScope::Online, "/f/").unwrap();
    assert!(f.online("/f/").is_none());

    f.repo.write_property(f.project, "/f/", "Title", "Folder", f.admin).unwrap();
    let edited = f.repo.write_file(f.project, "/f/page.html", b"two", f.admin).unwrap();
    assert_eq!(f.staging("/f/").unwrap().state, ResourceState::Changed);

    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/f/", "/f/page.html"]);
    let folder = f.online("/f/").unwrap();
    let page = f.online("/f/page.html").unwrap();
    assert_eq!(page.parent_id, Some(folder.id));
    assert_same_attributes(&page, &edited);
    assert_eq!(f.repo.read_content(TreeScope::Online, "/f/page.html").unwrap().as_ref(), b"two");
}

#[test]
fn test_changed_folder_properties_replace_online_set() {
    let f = fixture();
    f.repo.define_property("Title", FOLDER_TYPE).unwrap();
    f.repo.define_property("Keywords", FOLDER_TYPE).unwrap();
    let folder = f.folder("/f/");
    f.repo.write_property(f.project, "/f/", "Title", "Old", f.admin).unwrap();
    f.repo.write_property(f.project, "/f/", "Keywords", "a,b", f.admin).unwrap();
    f.publish();

    let online = f.online("/f/").unwrap();
    assert_eq!(
        f.repo.properties().read_properties(TreeScope::Online, online.id, FOLDER_TYPE).unwrap().len(),
        2
    );

    f.repo
        .properties()
        .delete_property(TreeScope::Offline, "Keywords", folder.id, FOLDER_TYPE)
        .unwrap();
    f.repo.write_property(f.project, "/f/", "Title", "New", f.admin).unwrap();
    let outcome = f.publish();
    assert_eq!(outcome.changed_paths, vec!["/f/"]);

    let mut expected = PropertyMap::new();
    expected.insert("Title".into(), "New".into());
    assert_eq!(
        f.repo.properties().read_properties(TreeScope::Online, online.id, FOLDER_TYPE).unwrap(),
        expected
    );
}
