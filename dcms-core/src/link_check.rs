//! Broken-link detection and online link maintenance around a publish

use crate::database::TreeScope;
use crate::error::Result;
use crate::links::LinkIndex;
use crate::model::{Resource, ResourceId};
use crate::report::{BrokenLink, ReportSink, Warning};
use crate::tree::ResourceTree;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

pub struct LinkChecker {
    tree: Arc<dyn ResourceTree>,
    links: Arc<dyn LinkIndex>,
}

impl LinkChecker {
    pub fn new(tree: Arc<dyn ResourceTree>, links: Arc<dyn LinkIndex>) -> Self {
        Self { tree, links }
    }

    /// Links that would dangle once `changed`, `deleted` and `created` are
    /// published.
    ///
    /// Outbound edges of changed and created resources must resolve to a
    /// published path that survives the publish or to a path being created.
    /// Published resources still pointing at a deleted path are reported
    /// against the referencing resource unless it is itself part of the
    /// publish. Findings for one resource are merged into one entry.
    pub fn broken_links(
        &self,
        changed: &[Resource],
        deleted: &[Resource],
        created: &[Resource],
        report: &dyn ReportSink,
    ) -> Result<Vec<BrokenLink>> {
        let deleted_paths: HashSet<&str> = deleted.iter().map(|r| r.path.as_str()).collect();
        let created_paths: HashSet<&str> = created.iter().map(|r| r.path.as_str()).collect();
        let touched: HashSet<&str> = changed
            .iter()
            .chain(deleted)
            .map(|r| r.path.as_str())
            .collect();

        let live: HashSet<String> = self
            .tree
            .read_project_view(TreeScope::Online, &["/".to_string()])?
            .into_iter()
            .map(|r| r.path)
            .filter(|p| !deleted_paths.contains(p.as_str()))
            .collect();

        let mut findings: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for resource in changed.iter().chain(created) {
            for target in self.links.read_link_entries(TreeScope::Offline, resource.id)? {
                if !live.contains(&target) && !created_paths.contains(target.as_str()) {
                    findings.entry(resource.path.clone()).or_default().insert(target);
                }
            }
        }

        for gone in deleted {
            if created_paths.contains(gone.path.as_str()) {
                continue;
            }
            for source in self.links.read_referencing(TreeScope::Online, &gone.path)? {
                let referencing = match self.tree.read_resource(TreeScope::Online, source) {
                    Ok(r) => r,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                if touched.contains(referencing.path.as_str()) {
                    continue;
                }
                findings.entry(referencing.path).or_default().insert(gone.path.clone());
            }
        }

        let broken: Vec<BrokenLink> = findings
            .into_iter()
            .map(|(resource_path, targets)| BrokenLink { resource_path, targets: targets.into_iter().collect() })
            .collect();
        for entry in &broken {
            report.print(&format!("broken link: {}", entry));
        }
        if !broken.is_empty() {
            tracing::warn!("{} resource(s) with broken links", broken.len());
        }
        Ok(broken)
    }

    /// Bring the published edges in line with a finished publish. Deleted
    /// resources lose their online edges; changed and created resources of
    /// `linkable_type` get their staging edges copied under their online id.
    pub fn update_online_project_links(
        &self,
        deleted: &[Resource],
        changed: &[Resource],
        created: &[Resource],
        linkable_type: i32,
    ) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        for resource in deleted.iter().filter(|r| r.resource_type == linkable_type) {
            if let Some(online) = self.tree.lookup(TreeScope::Online, &resource.path)? {
                self.links.delete_link_entries(TreeScope::Online, online.id)?;
            }
        }
        for resource in changed.iter().chain(created).filter(|r| r.resource_type == linkable_type) {
            let Some(online) = self.tree.lookup(TreeScope::Online, &resource.path)? else {
                tracing::debug!("{} has no online counterpart, links not copied", resource.path);
                continue;
            };
            warnings.extend(self.copy_links_online(resource, online.id, linkable_type)?);
        }
        Ok(warnings)
    }

    /// Replace the online edges of `online` with the staging edges of
    /// `staging`. Resources not of `linkable_type` carry no edges.
    pub fn copy_links_online(&self, staging: &Resource, online: ResourceId, linkable_type: i32) -> Result<Vec<Warning>> {
        if staging.resource_type != linkable_type {
            return Ok(Vec::new());
        }
        let targets = self.links.read_link_entries(TreeScope::Offline, staging.id)?;
        self.links.create_online_link_entries(online, &targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::database::SqliteDatabase;
    use crate::links::SqliteLinkIndex;
    use crate::model::{FOLDER_TYPE, GroupId, PLAIN_TYPE, ProjectId, ResourceDraft, ResourceState, UserId};
    use crate::report::MemoryReport;
    use crate::tree::SqliteResourceTree;

    struct Fixture {
        tree: Arc<SqliteResourceTree>,
        links: Arc<SqliteLinkIndex>,
        checker: LinkChecker,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let tree = Arc::new(SqliteResourceTree::new(db.clone(), Arc::new(MemoryBlobStore::new()), 248));
        let links = Arc::new(SqliteLinkIndex::new(db));
        let checker = LinkChecker::new(tree.clone(), links.clone());
        for scope in [TreeScope::Offline, TreeScope::Online] {
            tree.create_folder(scope, &draft("/", None, FOLDER_TYPE)).unwrap();
        }
        Fixture { tree, links, checker }
    }

    fn draft(path: &str, parent: Option<ResourceId>, resource_type: i32) -> ResourceDraft {
        ResourceDraft {
            parent_id: parent,
            path: path.to_string(),
            resource_type,
            flags: 0,
            owner: UserId(1),
            group: GroupId(1),
            project_id: ProjectId(2),
            access_flags: 0o644,
            state: ResourceState::Changed,
            locked_by: None,
            locked_in_project: ProjectId(2),
            date_created: 1,
            date_last_modified: 1,
            last_modified_by: UserId(1),
        }
    }

    impl Fixture {
        /// Same file in both trees, returned as (staging, online)
        fn file(&self, path: &str, resource_type: i32) -> (Resource, Resource) {
            let mut pair = Vec::new();
            for scope in [TreeScope::Offline, TreeScope::Online] {
                let root = self.tree.read_folder(scope, "/").unwrap();
                pair.push(self.tree.create_file(scope, &draft(path, Some(root.id), resource_type), b"x").unwrap());
            }
            let online = pair.pop().unwrap();
            (pair.pop().unwrap(), online)
        }
    }

    #[test]
    fn test_copy_links_online_replaces_edges() {
        let f = fixture();
        let (staging, online) = f.file("/a.html", PLAIN_TYPE);
        f.links.create_online_link_entries(online.id, &["/old.html".to_string()]).unwrap();
        f.links.create_link_entries(staging.id, &["/new.html".to_string()]).unwrap();

        assert!(f.checker.copy_links_online(&staging, online.id, PLAIN_TYPE).unwrap().is_empty());
        assert_eq!(f.links.read_link_entries(TreeScope::Online, online.id).unwrap(), vec!["/new.html"]);
    }

    #[test]
    fn test_copy_links_online_ignores_other_types() {
        let f = fixture();
        let (staging, online) = f.file("/img.png", 7);
        f.links.create_link_entries(staging.id, &["/x".to_string()]).unwrap();
        f.checker.copy_links_online(&staging, online.id, PLAIN_TYPE).unwrap();
        assert!(f.links.read_link_entries(TreeScope::Online, online.id).unwrap().is_empty());
    }

    #[test]
    fn test_update_online_project_links() {
        let f = fixture();
        let (changed, changed_online) = f.file("/changed.html", PLAIN_TYPE);
        let (gone, gone_online) = f.file("/gone.html", PLAIN_TYPE);
        f.links.create_link_entries(changed.id, &["/target.html".to_string()]).unwrap();
        f.links.create_online_link_entries(gone_online.id, &["/target.html".to_string()]).unwrap();

        f.checker
            .update_online_project_links(&[gone], &[changed], &[], PLAIN_TYPE)
            .unwrap();
        assert_eq!(
            f.links.read_referencing(TreeScope::Online, "/target.html").unwrap(),
            vec![changed_online.id]
        );
    }

    #[test]
    fn test_broken_links_merges_targets_per_resource() {
        let f = fixture();
        let (page, _) = f.file("/page.html", PLAIN_TYPE);
        f.file("/live.html", PLAIN_TYPE);
        f.links
            .create_link_entries(page.id, &["/live.html".into(), "/missing-a".into(), "/missing-b".into()])
            .unwrap();

        let report = MemoryReport::new();
        let broken = f.checker.broken_links(&[page], &[], &[], &report).unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].targets, vec!["/missing-a", "/missing-b"]);
        assert_eq!(report.lines(), vec!["broken link: /page.html -> /missing-a, /missing-b"]);
    }
}
