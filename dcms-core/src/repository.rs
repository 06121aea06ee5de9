//! Repository facade
//!
//! Wires the stores, the publish engine and the link checker over one
//! repository directory:
//!
//! ```text
//! <repo>/uuid               repository id
//! <repo>/cms.sqlite         all relational tables
//! <repo>/blobs/             content keyspace
//! <repo>/dcms-config.json   optional configuration
//! ```
//!
//! The edit helpers maintain lifecycle states the way interactive editing
//! does: new resources start `NEW`, edits of published ones turn them
//! `CHANGED` and deletes mark them `DELETED` for the next publish.

use crate::backup::{BackupStore, SqliteBackupStore};
use crate::blob::{BlobStore, FjallBlobStore, MemoryBlobStore};
use crate::config::CmsConfig;
use crate::database::{SqliteDatabase, TreeScope, UnitOfWork};
use crate::directory::{SqliteDirectory, UserDirectory};
use crate::error::{CmsError, Result};
use crate::export::{DirectoryExport, ExportMirror, NoExport};
use crate::link_check::LinkChecker;
use crate::links::{LinkIndex, SqliteLinkIndex};
use crate::model::{
    BackupProject, FOLDER_TYPE, GroupId, ONLINE_PROJECT_ID, Project, ProjectDraft, ProjectId, ProjectType,
    PropertyDefinition, Resource, ResourceDraft, ResourceState, Timestamp, UserId, VersionId, now_millis,
    parent_path,
};
use crate::permits::PublishPermits;
use crate::projects::{ProjectStore, SqliteProjectStore};
use crate::properties::{DefinitionScope, PropertyStore, SqlitePropertyStore};
use crate::publish::{PublishEngine, PublishOutcome, PublishPlan};
use crate::report::{BrokenLink, ReportSink, Warning};
use crate::tree::{ResourceTree, SqliteResourceTree};
use anyhow::Context;
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ADMIN_USER: &str = "Admin";
pub const USERS_GROUP: &str = "Users";
pub const ADMIN_GROUP: &str = "Administrators";

/// Per-call publish settings; `None` falls back to the repository config
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub publisher: UserId,
    pub historize: Option<bool>,
    pub check_links: Option<bool>,
}

impl PublishOptions {
    pub fn by(publisher: UserId) -> Self {
        Self { publisher, historize: None, check_links: None }
    }
}

pub struct CmsRepository {
    root: Option<PathBuf>,
    uuid: String,
    config: CmsConfig,
    db: Arc<SqliteDatabase>,
    fjall: Option<Arc<FjallBlobStore>>,
    tree: Arc<SqliteResourceTree>,
    properties: Arc<SqlitePropertyStore>,
    projects: Arc<SqliteProjectStore>,
    directory: Arc<SqliteDirectory>,
    backups: Arc<SqliteBackupStore>,
    links: Arc<SqliteLinkIndex>,
    engine: PublishEngine,
    checker: Arc<LinkChecker>,
    permits: PublishPermits,
}

impl CmsRepository {
    /// Open or create a repository directory
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let root = path.to_path_buf();
        fs::create_dir_all(&root).with_context(|| format!("Failed to create repository at {:?}", root))?;

        let uuid_path = root.join("uuid");
        let uuid = if uuid_path.exists() {
            fs::read_to_string(&uuid_path)?.trim().to_string()
        } else {
            let u = uuid::Uuid::new_v4().to_string();
            fs::write(&uuid_path, &u)?;
            u
        };

        let config = CmsConfig::load(&root)?;
        let db = Arc::new(SqliteDatabase::open(&root.join("cms.sqlite"))?);
        let fjall = Arc::new(FjallBlobStore::open(&root.join("blobs"), config.blob_cache_capacity)?);
        let export: Arc<dyn ExportMirror> = match &config.export_root {
            Some(dir) => {
                let dir = if dir.is_absolute() { dir.clone() } else { root.join(dir) };
                Arc::new(DirectoryExport::new(dir, config.export_points.clone()))
            }
            None => Arc::new(NoExport),
        };
        tracing::info!("Opened repository {} at {:?}", uuid, root);
        Ok(Self::assemble(Some(root), uuid, config, db, fjall.clone(), Some(fjall), export))
    }

    /// Repository that lives only in memory
    pub fn open_in_memory(config: CmsConfig) -> Result<Self> {
        let db = Arc::new(SqliteDatabase::open_in_memory()?);
        let uuid = uuid::Uuid::new_v4().to_string();
        Ok(Self::assemble(None, uuid, config, db, Arc::new(MemoryBlobStore::new()), None, Arc::new(NoExport)))
    }

    fn assemble(
        root: Option<PathBuf>,
        uuid: String,
        config: CmsConfig,
        db: Arc<SqliteDatabase>,
        blobs: Arc<dyn BlobStore>,
        fjall: Option<Arc<FjallBlobStore>>,
        export: Arc<dyn ExportMirror>,
    ) -> Self {
        let tree = Arc::new(SqliteResourceTree::new(db.clone(), blobs.clone(), config.max_path_length));
        let properties = Arc::new(SqlitePropertyStore::new(db.clone()));
        let projects = Arc::new(SqliteProjectStore::new(db.clone()));
        let directory = Arc::new(SqliteDirectory::new(db.clone()));
        let backups = Arc::new(SqliteBackupStore::new(db.clone(), blobs, directory.clone()));
        let links = Arc::new(SqliteLinkIndex::new(db.clone()));
        let checker = Arc::new(LinkChecker::new(tree.clone(), links.clone()));
        let engine = PublishEngine::new(
            tree.clone(),
            properties.clone(),
            projects.clone(),
            backups.clone(),
            export,
            checker.clone(),
            db.clone(),
            config.clone(),
        );
        Self {
            root,
            uuid,
            config,
            db,
            fjall,
            tree,
            properties,
            projects,
            directory,
            backups,
            links,
            engine,
            checker,
            permits: PublishPermits::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &CmsConfig {
        &self.config
    }

    pub fn tree(&self) -> &dyn ResourceTree {
        self.tree.as_ref()
    }

    pub fn properties(&self) -> &dyn PropertyStore {
        self.properties.as_ref()
    }

    pub fn projects(&self) -> &dyn ProjectStore {
        self.projects.as_ref()
    }

    pub fn directory(&self) -> &SqliteDirectory {
        &self.directory
    }

    pub fn backups(&self) -> &dyn BackupStore {
        self.backups.as_ref()
    }

    pub fn links(&self) -> &dyn LinkIndex {
        self.links.as_ref()
    }

    pub fn engine(&self) -> &PublishEngine {
        &self.engine
    }

    pub fn checker(&self) -> &LinkChecker {
        &self.checker
    }

    /// Sync blob content to disk
    pub fn flush(&self) -> Result<()> {
        match &self.fjall {
            Some(store) => store.persist(),
            None => Ok(()),
        }
    }

    /// Create the principals, the online project and both root folders.
    /// A no-op on an initialized repository.
    pub fn initialize(&self) -> Result<()> {
        if self.projects.online_project().is_ok() {
            return Ok(());
        }
        self.edit(|| {
            let admin = self.directory.create_user(ADMIN_USER)?;
            let users = self.directory.create_group(USERS_GROUP)?;
            let admins = self.directory.create_group(ADMIN_GROUP)?;
            let online = self.projects.create_project(&ProjectDraft {
                name: "Online".into(),
                description: "The published tree".into(),
                owner: admin,
                group: users,
                manager_group: admins,
                project_type: ProjectType::Normal,
                task_id: 0,
            })?;
            if online.id != ONLINE_PROJECT_ID {
                return Err(CmsError::Store(format!("online project got id {}", online.id)));
            }
            let now = now_millis();
            let root = ResourceDraft {
                parent_id: None,
                path: "/".into(),
                resource_type: FOLDER_TYPE,
                flags: 0,
                owner: admin,
                group: users,
                project_id: ONLINE_PROJECT_ID,
                access_flags: 0o755,
                state: ResourceState::Unchanged,
                locked_by: None,
                locked_in_project: ONLINE_PROJECT_ID,
                date_created: now,
                date_last_modified: now,
                last_modified_by: admin,
            };
            self.tree.create_folder(TreeScope::Offline, &root)?;
            self.tree.create_folder(TreeScope::Online, &root)?;
            self.projects.add_project_resource(ONLINE_PROJECT_ID, "/")?;
            Ok(())
        })?;
        tracing::info!("Initialized repository {}", self.uuid);
        Ok(())
    }

    pub fn admin(&self) -> Result<UserId> {
        self.directory.find_user(ADMIN_USER)
    }

    pub fn users_group(&self) -> Result<GroupId> {
        self.directory.find_group(USERS_GROUP)
    }

    /// Run `work` as one unit of work
    fn edit<T>(&self, mut work: impl FnMut() -> Result<T>) -> Result<T> {
        let mut value = None;
        self.db.atomically(&mut || {
            value = Some(work()?);
            Ok(())
        })?;
        value.ok_or_else(|| CmsError::Unknown("edit produced no result".into()))
    }

    /// Define a property in the staging, online and backup scopes
    pub fn define_property(&self, name: &str, resource_type: i32) -> Result<PropertyDefinition> {
        self.edit(|| {
            let mut staging = None;
            for scope in DefinitionScope::ALL {
                let def = match self.properties.create_definition(scope, name, resource_type) {
                    Ok(def) => def,
                    Err(CmsError::AlreadyExists(_)) => self.properties.read_definition(scope, name, resource_type)?,
                    Err(e) => return Err(e),
                };
                staging.get_or_insert(def);
            }
            staging.ok_or_else(|| CmsError::Unknown(format!("no definition for {}", name)))
        })
    }

    /// New staging project rooted at `roots`
    pub fn create_project(&self, draft: &ProjectDraft, roots: &[String]) -> Result<Project> {
        self.edit(|| {
            let project = self.projects.create_project(draft)?;
            for root in roots {
                self.projects.add_project_resource(project.id, root)?;
            }
            Ok(project)
        })
    }

    fn staging_draft(&self, project: ProjectId, path: &str, resource_type: i32, user: UserId) -> Result<ResourceDraft> {
        let parent_path = parent_path(path).ok_or_else(|| CmsError::AlreadyExists(path.to_string()))?;
        let parent = self.tree.read_folder(TreeScope::Offline, &parent_path)?;
        if parent.state == ResourceState::Deleted {
            return Err(CmsError::NotFound(format!("folder {} is deleted", parent_path)));
        }
        let group = self.users_group().unwrap_or(parent.group);
        let now = now_millis();
        Ok(ResourceDraft {
            parent_id: Some(parent.id),
            path: path.to_string(),
            resource_type,
            flags: 0,
            owner: user,
            group,
            project_id: project,
            access_flags: if resource_type == FOLDER_TYPE { 0o755 } else { 0o644 },
            state: ResourceState::New,
            locked_by: None,
            locked_in_project: project,
            date_created: now,
            date_last_modified: now,
            last_modified_by: user,
        })
    }

    pub fn create_folder(&self, project: ProjectId, path: &str, user: UserId) -> Result<Resource> {
        self.edit(|| {
            let draft = self.staging_draft(project, path, FOLDER_TYPE, user)?;
            self.tree.create_folder(TreeScope::Offline, &draft)
        })
    }

    pub fn create_file(
        &self,
        project: ProjectId,
        path: &str,
        resource_type: i32,
        content: &[u8],
        user: UserId,
    ) -> Result<Resource> {
        if resource_type == FOLDER_TYPE {
            return Err(CmsError::BadName(format!("{} cannot be created as a file", path)));
        }
        self.edit(|| {
            let draft = self.staging_draft(project, path, resource_type, user)?;
            self.tree.create_file(TreeScope::Offline, &draft, content)
        })
    }

    /// Touch `resource` on behalf of `project`: `NEW` stays `NEW`, anything
    /// else becomes `CHANGED`.
    fn modified(resource: &Resource, project: ProjectId, user: UserId) -> Resource {
        let mut edited = resource.clone();
        if edited.state != ResourceState::New {
            edited.state = ResourceState::Changed;
        }
        edited.project_id = project;
        edited.date_last_modified = now_millis();
        edited.last_modified_by = user;
        edited
    }

    fn live_staging(&self, path: &str) -> Result<Resource> {
        match self.tree.lookup(TreeScope::Offline, path)? {
            Some(r) if r.state != ResourceState::Deleted => Ok(r),
            _ => Err(CmsError::NotFound(path.to_string())),
        }
    }

    pub fn write_file(&self, project: ProjectId, path: &str, content: &[u8], user: UserId) -> Result<Resource> {
        self.edit(|| {
            let file = self.tree.read_file(TreeScope::Offline, path)?;
            if file.state == ResourceState::Deleted {
                return Err(CmsError::NotFound(path.to_string()));
            }
            self.tree
                .update_resource(TreeScope::Offline, &Self::modified(&file, project, user), Some(content))
        })
    }

    pub fn write_property(&self, project: ProjectId, path: &str, name: &str, value: &str, user: UserId) -> Result<()> {
        self.edit(|| {
            let resource = self.live_staging(path)?;
            self.properties
                .write_property(TreeScope::Offline, name, value, resource.id, resource.resource_type)?;
            self.tree
                .update_resource(TreeScope::Offline, &Self::modified(&resource, project, user), None)?;
            Ok(())
        })
    }

    /// Delete from staging. Never-published resources disappear at once,
    /// others are marked `DELETED` for the next publish of `project`.
    pub fn delete_resource(&self, project: ProjectId, path: &str, user: UserId) -> Result<()> {
        self.edit(|| {
            let resource = self.live_staging(path)?;
            if resource.parent_id.is_none() {
                return Err(CmsError::BadName("the root folder cannot be deleted".into()));
            }
            if resource.state == ResourceState::New {
                return if resource.is_folder() {
                    self.tree.delete_folder(TreeScope::Offline, path)
                } else {
                    self.tree.delete_resource(TreeScope::Offline, resource.id)
                };
            }
            let mut deleted = self.tree.mark_deleted(path)?;
            deleted.project_id = project;
            deleted.date_last_modified = now_millis();
            deleted.last_modified_by = user;
            self.tree.update_resource(TreeScope::Offline, &deleted, None)?;
            Ok(())
        })
    }

    pub fn lock(&self, project: ProjectId, path: &str, user: UserId) -> Result<Resource> {
        self.edit(|| {
            let mut resource = self.tree.lookup(TreeScope::Offline, path)?.ok_or_else(|| CmsError::NotFound(path.into()))?;
            resource.locked_by = Some(user);
            resource.locked_in_project = project;
            self.tree.update_resource(TreeScope::Offline, &resource, None)
        })
    }

    pub fn unlock(&self, path: &str) -> Result<Resource> {
        self.edit(|| {
            let mut resource = self.tree.lookup(TreeScope::Offline, path)?.ok_or_else(|| CmsError::NotFound(path.into()))?;
            resource.locked_by = None;
            resource.locked_in_project = resource.project_id;
            self.tree.update_resource(TreeScope::Offline, &resource, None)
        })
    }

    /// Replace the outbound links of a staging resource
    pub fn set_links(&self, path: &str, targets: &[String]) -> Result<Vec<Warning>> {
        let resource = self.live_staging(path)?;
        self.links.create_link_entries(resource.id, targets)
    }

    pub fn read_content(&self, scope: TreeScope, path: &str) -> Result<Bytes> {
        let file = self.tree.read_file(scope, path)?;
        self.tree.read_content(scope, &file)
    }

    pub fn plan(&self, project: ProjectId) -> Result<PublishPlan> {
        self.engine.plan(project)
    }

    /// Links that would break if `project` were published now
    pub fn check_links(&self, project: ProjectId, report: &dyn ReportSink) -> Result<Vec<BrokenLink>> {
        let plan = self.engine.plan(project)?;
        self.checker.broken_links(&plan.changed, &plan.deleted, &plan.created, report)
    }

    /// Publish `staging` into the online project.
    ///
    /// Holds the project's publish permit for the whole call. A temporary
    /// project is removed afterwards.
    pub fn publish_project(
        &self,
        staging: ProjectId,
        options: &PublishOptions,
        report: &dyn ReportSink,
    ) -> Result<PublishOutcome> {
        let _permit = self.permits.acquire(staging)?;
        let project = self.projects.read_project(staging)?;
        let online = self.projects.online_project()?;

        let broken_links = if options.check_links.unwrap_or(self.config.check_links_before_publish) {
            self.check_links(staging, report)?
        } else {
            Vec::new()
        };

        let historize = options.historize.unwrap_or(self.config.historize);
        let mut outcome = self
            .engine
            .publish(staging, online.id, historize, options.publisher, report)?;
        outcome.broken_links = broken_links;

        if project.project_type == ProjectType::Temporary {
            self.projects.delete_project(staging)?;
            tracing::info!("Removed temporary project {}", project.name);
        }
        self.flush()?;
        Ok(outcome)
    }

    pub fn read_backup_project(&self, version: VersionId) -> Result<BackupProject> {
        self.backups.read_backup_project(version)
    }

    /// Newest backups, capped by the configured list limit
    pub fn read_all_backup_projects(&self) -> Result<Vec<BackupProject>> {
        self.backups.read_all_backup_projects(self.config.backup_list_limit)
    }

    pub fn delete_backups_older_than(&self, before: Timestamp) -> Result<VersionId> {
        self.edit(|| self.backups.delete_backups_older_than(before))
    }

    /// Display name of `user`, empty if unknown
    pub fn user_name(&self, user: UserId) -> String {
        self.directory.user_name(user).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PLAIN_TYPE;
    use crate::report::MemoryReport;
    use tempfile::TempDir;

    fn repo() -> (CmsRepository, ProjectId, UserId) {
        let repo = CmsRepository::open_in_memory(CmsConfig::default()).unwrap();
        repo.initialize().unwrap();
        let admin = repo.admin().unwrap();
        let users = repo.users_group().unwrap();
        let project = repo
            .create_project(
                &ProjectDraft {
                    name: "Work".into(),
                    description: String::new(),
                    owner: admin,
                    group: users,
                    manager_group: users,
                    project_type: ProjectType::Normal,
                    task_id: 0,
                },
                &["/".to_string()],
            )
            .unwrap();
        (repo, project.id, admin)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (repo, _, _) = repo();
        repo.initialize().unwrap();
        assert!(repo.tree().exists(TreeScope::Online, "/").unwrap());
        assert!(repo.tree().exists(TreeScope::Offline, "/").unwrap());
        assert_eq!(repo.projects().online_project().unwrap().id, ONLINE_PROJECT_ID);
    }

    #[test]
    fn test_edit_states() {
        let (repo, p, admin) = repo();
        let file = repo.create_file(p, "/a.txt", PLAIN_TYPE, b"one", admin).unwrap();
        assert_eq!(file.state, ResourceState::New);
        let file = repo.write_file(p, "/a.txt", b"two", admin).unwrap();
        assert_eq!(file.state, ResourceState::New);

        repo.delete_resource(p, "/a.txt", admin).unwrap();
        assert!(!repo.tree().exists(TreeScope::Offline, "/a.txt").unwrap());

        repo.create_file(p, "/b.txt", PLAIN_TYPE, b"b", admin).unwrap();
        repo.publish_project(p, &PublishOptions::by(admin), &MemoryReport::new()).unwrap();
        let edited = repo.write_file(p, "/b.txt", b"bb", admin).unwrap();
        assert_eq!(edited.state, ResourceState::Changed);
        repo.delete_resource(p, "/b.txt", admin).unwrap();
        assert_eq!(
            repo.tree().read_file(TreeScope::Offline, "/b.txt").unwrap().state,
            ResourceState::Deleted
        );
        assert!(repo.write_file(p, "/b.txt", b"x", admin).unwrap_err().is_not_found());
    }

    #[test]
    fn test_define_property_in_every_scope() {
        let (repo, _, _) = repo();
        repo.define_property("Title", PLAIN_TYPE).unwrap();
        repo.define_property("Title", PLAIN_TYPE).unwrap();
        for scope in DefinitionScope::ALL {
            repo.properties().read_definition(scope, "Title", PLAIN_TYPE).unwrap();
        }
    }

    #[test]
    fn test_concurrent_publish_of_same_project_is_refused() {
        let (repo, p, admin) = repo();
        let _held = repo.permits.acquire(p).unwrap();
        let err = repo
            .publish_project(p, &PublishOptions::by(admin), &MemoryReport::new())
            .unwrap_err();
        assert!(matches!(err, CmsError::PublishInProgress(_)));
    }

    #[test]
    fn test_on_disk_repository_reopens() {
        let tmp = TempDir::new().unwrap();
        let uuid;
        {
            let repo = CmsRepository::open(tmp.path()).unwrap();
            repo.initialize().unwrap();
            uuid = repo.uuid().to_string();
            let admin = repo.admin().unwrap();
            let online = repo.projects().online_project().unwrap();
            let p = repo
                .create_project(
                    &ProjectDraft {
                        name: "Disk".into(),
                        description: String::new(),
                        owner: admin,
                        group: online.group,
                        manager_group: online.manager_group,
                        project_type: ProjectType::Temporary,
                        task_id: 0,
                    },
                    &["/".to_string()],
                )
                .unwrap();
            repo.create_file(p.id, "/index.html", PLAIN_TYPE, b"<html/>", admin).unwrap();
            repo.publish_project(p.id, &PublishOptions::by(admin), &MemoryReport::new()).unwrap();
            assert!(repo.projects().read_project(p.id).unwrap_err().is_not_found());
        }
        let repo = CmsRepository::open(tmp.path()).unwrap();
        assert_eq!(repo.uuid(), uuid);
        assert_eq!(repo.read_content(TreeScope::Online, "/index.html").unwrap().as_ref(), b"<html/>");
        assert_eq!(repo.read_all_backup_projects().unwrap().len(), 1);
    }
}
