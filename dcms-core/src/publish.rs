//! Publish engine
//!
//! Merges one staging project into the published tree:
//!
//! 1. With history enabled, reserve a version id and back up the project.
//! 2. Folder pass in path order. `NEW`/`CHANGED` folders are created or
//!    updated online, `DELETED` ones are deferred.
//! 3. File pass in path order. Temporary files are purged, `DELETED` files
//!    removed from both trees, `NEW`/`CHANGED` files created or updated.
//! 4. Deferred folders are removed deepest first.
//!
//! Resources locked in another project are skipped. Each resource is handled
//! in its own unit of work, which also carries its online link edges: if its
//! primary write fails, that resource is rolled back and the publish stops
//! with [`CmsError::PublishAborted`]. The resources processed before it stay
//! published. Property copies, export mirroring and name resolution only
//! produce warnings.

use crate::backup::BackupStore;
use crate::config::CmsConfig;
use crate::database::{TreeScope, UnitOfWork};
use crate::error::{CmsError, Result};
use crate::export::ExportMirror;
use crate::link_check::LinkChecker;
use crate::model::{
    ProjectId, PropertyMap, Resource, ResourceDraft, ResourceId, ResourceState, Timestamp, UserId, VersionId,
    now_millis, parent_path,
};
use crate::projects::ProjectStore;
use crate::properties::PropertyStore;
use crate::report::{BrokenLink, ReportSink, Warning, WarningKind};
use crate::tree::ResourceTree;
use std::collections::HashMap;
use std::sync::Arc;

/// Staging resources a publish would touch, split by lifecycle state
#[derive(Debug, Clone, Default)]
pub struct PublishPlan {
    pub created: Vec<Resource>,
    pub changed: Vec<Resource>,
    pub deleted: Vec<Resource>,
}

impl PublishPlan {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.changed.len() + self.deleted.len()
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    /// Version the publish was historized under
    pub version_id: Option<VersionId>,
    /// Created, updated or deleted paths in processing order
    pub changed_paths: Vec<String>,
    /// Staging resources as they were before the publish
    pub created: Vec<Resource>,
    pub changed: Vec<Resource>,
    pub deleted: Vec<Resource>,
    /// Temporary files removed from staging
    pub purged_temporary: Vec<String>,
    pub warnings: Vec<Warning>,
    /// Findings of the pre-publish link check, if one ran
    pub broken_links: Vec<BrokenLink>,
}

/// State of one publish call. The parent cache maps a staging folder id to
/// its online id and lives only as long as the call.
struct PublishRun<'a> {
    staging: ProjectId,
    online: ProjectId,
    version: Option<VersionId>,
    published_at: Timestamp,
    parents: HashMap<ResourceId, ResourceId>,
    report: &'a dyn ReportSink,
    outcome: PublishOutcome,
}

impl PublishRun<'_> {
    fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning);
        self.outcome.warnings.push(warning);
    }
}

enum FolderRemoval {
    Removed,
    Blocked,
}

pub struct PublishEngine {
    tree: Arc<dyn ResourceTree>,
    properties: Arc<dyn PropertyStore>,
    projects: Arc<dyn ProjectStore>,
    backups: Arc<dyn BackupStore>,
    export: Arc<dyn ExportMirror>,
    links: Arc<LinkChecker>,
    unit_of_work: Arc<dyn UnitOfWork>,
    config: CmsConfig,
}

impl PublishEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: Arc<dyn ResourceTree>,
        properties: Arc<dyn PropertyStore>,
        projects: Arc<dyn ProjectStore>,
        backups: Arc<dyn BackupStore>,
        export: Arc<dyn ExportMirror>,
        links: Arc<LinkChecker>,
        unit_of_work: Arc<dyn UnitOfWork>,
        config: CmsConfig,
    ) -> Self {
        Self { tree, properties, projects, backups, export, links, unit_of_work, config }
    }

    /// What `publish` would do to `project`, without changing anything
    pub fn plan(&self, project: ProjectId) -> Result<PublishPlan> {
        let mut plan = PublishPlan::default();
        let folders = self.tree.read_folders(project)?;
        let files = self.tree.read_files(project)?;
        for resource in folders.into_iter().chain(files) {
            if resource.is_locked_outside(project) || self.config.is_temporary(&resource.path) {
                continue;
            }
            match resource.state {
                ResourceState::New => plan.created.push(resource),
                ResourceState::Changed => plan.changed.push(resource),
                ResourceState::Deleted => plan.deleted.push(resource),
                ResourceState::Unchanged => {}
            }
        }
        Ok(plan)
    }

    /// Merge `staging` into the `online` project
    pub fn publish(
        &self,
        staging: ProjectId,
        online: ProjectId,
        historize: bool,
        publisher: UserId,
        report: &dyn ReportSink,
    ) -> Result<PublishOutcome> {
        if staging == online {
            return Err(CmsError::Unknown(format!("project {} is the online project", staging)));
        }
        let project = self.projects.read_project(staging)?;
        self.projects.read_project(online)?;

        let mut run = PublishRun {
            staging,
            online,
            version: None,
            published_at: now_millis(),
            parents: HashMap::new(),
            report,
            outcome: PublishOutcome::default(),
        };

        tracing::info!("Publishing project {} ({})", project.name, staging);

        if historize {
            let version = self.backups.reserve_version_id()?;
            let warnings = self.backups.backup_project(&project, version, run.published_at, publisher)?;
            for w in warnings {
                run.warn(w);
            }
            run.version = Some(version);
            run.outcome.version_id = Some(version);
        }

        let mut deferred = Vec::new();
        for folder in self.tree.read_folders(staging)? {
            if folder.is_locked_outside(staging) {
                tracing::debug!("Skipping {}: locked in project {}", folder.path, folder.locked_in_project);
                continue;
            }
            match folder.state {
                ResourceState::Deleted => deferred.push(folder),
                ResourceState::New | ResourceState::Changed => {
                    let path = folder.path.clone();
                    self.step(&mut run, &path, |run| self.publish_folder(run, &folder))?;
                    run.report.print(&format!("publish folder {}", path));
                    run.outcome.changed_paths.push(path);
                    Self::record(&mut run.outcome, folder);
                }
                ResourceState::Unchanged => {}
            }
        }

        for file in self.tree.read_files(staging)? {
            if file.is_locked_outside(staging) {
                tracing::debug!("Skipping {}: locked in project {}", file.path, file.locked_in_project);
                continue;
            }
            let path = file.path.clone();
            if self.config.is_temporary(&file.path) {
                self.step(&mut run, &path, |_| self.tree.delete_resource(TreeScope::Offline, file.id))?;
                run.report.print(&format!("purge temporary file {}", path));
                run.outcome.purged_temporary.push(path);
                continue;
            }
            match file.state {
                ResourceState::Deleted => {
                    self.step(&mut run, &path, |run| self.delete_file(run, &file))?;
                    run.report.print(&format!("delete file {}", path));
                }
                ResourceState::New | ResourceState::Changed => {
                    self.step(&mut run, &path, |run| self.publish_file(run, &file))?;
                    run.report.print(&format!("publish file {}", path));
                }
                ResourceState::Unchanged => continue,
            }
            run.outcome.changed_paths.push(path);
            Self::record(&mut run.outcome, file);
        }

        for folder in deferred.into_iter().rev() {
            let path = folder.path.clone();
            let removal = self.step(&mut run, &path, |run| self.delete_folder(run, &folder))?;
            match removal {
                FolderRemoval::Removed => {
                    run.report.print(&format!("delete folder {}", path));
                    run.outcome.changed_paths.push(path);
                    Self::record(&mut run.outcome, folder);
                }
                FolderRemoval::Blocked => {}
            }
        }

        let outcome = run.outcome;
        tracing::info!(
            "Published project {}: {} created, {} changed, {} deleted, {} warning(s)",
            staging,
            outcome.created.len(),
            outcome.changed.len(),
            outcome.deleted.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    fn record(outcome: &mut PublishOutcome, resource: Resource) {
        match resource.state {
            ResourceState::New => outcome.created.push(resource),
            ResourceState::Changed => outcome.changed.push(resource),
            ResourceState::Deleted => outcome.deleted.push(resource),
            ResourceState::Unchanged => {}
        }
    }

    /// Run `work` as one unit of work; a failure aborts the publish
    fn step<T>(
        &self,
        run: &mut PublishRun<'_>,
        path: &str,
        mut work: impl FnMut(&mut PublishRun<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut value = None;
        let result = self.unit_of_work.atomically(&mut || {
            value = Some(work(&mut *run)?);
            Ok(())
        });
        match (result, value) {
            (Ok(()), Some(value)) => Ok(value),
            (Ok(()), None) => Err(CmsError::Unknown(format!("no result for {}", path))),
            (Err(e), _) => {
                tracing::error!("Publish of {} failed: {}", path, e);
                Err(CmsError::PublishAborted {
                    path: path.to_string(),
                    completed: run.outcome.changed_paths.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Online id of the parent of `resource`, resolved once per staging parent
    fn online_parent(&self, run: &mut PublishRun<'_>, resource: &Resource) -> Result<Option<ResourceId>> {
        let Some(staging_parent) = resource.parent_id else {
            return Ok(None);
        };
        if let Some(id) = run.parents.get(&staging_parent) {
            return Ok(Some(*id));
        }
        let path = parent_path(&resource.path)
            .ok_or_else(|| CmsError::NotFound(format!("parent folder of {}", resource.path)))?;
        let parent = self.tree.read_folder(TreeScope::Online, &path)?;
        run.parents.insert(staging_parent, parent.id);
        Ok(Some(parent.id))
    }

    /// Staging properties; a read failure yields an empty set and a warning
    fn staging_properties(&self, run: &mut PublishRun<'_>, resource: &Resource) -> PropertyMap {
        match self.properties.read_properties(TreeScope::Offline, resource.id, resource.resource_type) {
            Ok(props) => props,
            Err(e) => {
                run.warn(Warning::new(&resource.path, WarningKind::PropertyCopy, format!("read failed: {}", e)));
                PropertyMap::new()
            }
        }
    }

    /// Replace the properties of the online twin
    fn copy_properties(&self, run: &mut PublishRun<'_>, resource: &Resource, online: ResourceId, props: &PropertyMap) {
        let result = self
            .properties
            .delete_all_properties(TreeScope::Online, online)
            .and_then(|()| {
                self.properties
                    .write_properties(TreeScope::Online, online, resource.resource_type, props)
            });
        if let Err(e) = result {
            run.warn(Warning::new(&resource.path, WarningKind::PropertyCopy, e));
        }
    }

    /// Mirror the staging link edges of `resource` onto its online twin
    fn copy_links(&self, run: &mut PublishRun<'_>, resource: &Resource, online: ResourceId) -> Result<()> {
        let warnings = self.links.copy_links_online(resource, online, self.config.link_resource_type)?;
        for w in warnings {
            run.warn(w);
        }
        Ok(())
    }

    fn backup(
        &self,
        run: &mut PublishRun<'_>,
        resource: &Resource,
        content: Option<&[u8]>,
        props: &PropertyMap,
    ) -> Result<()> {
        if let Some(version) = run.version {
            let warnings =
                self.backups
                    .backup_resource(run.staging, resource, content, props, version, run.published_at)?;
            for w in warnings {
                run.warn(w);
            }
        }
        Ok(())
    }

    /// Apply the attributes of `draft` to an existing online resource
    fn overwrite(existing: &Resource, draft: &ResourceDraft) -> Resource {
        Resource {
            id: existing.id,
            parent_id: draft.parent_id,
            content_id: existing.content_id,
            path: draft.path.clone(),
            resource_type: draft.resource_type,
            flags: draft.flags,
            owner: draft.owner,
            group: draft.group,
            project_id: draft.project_id,
            access_flags: draft.access_flags,
            state: draft.state,
            locked_by: draft.locked_by,
            locked_in_project: draft.locked_in_project,
            date_created: draft.date_created,
            date_last_modified: draft.date_last_modified,
            last_modified_by: draft.last_modified_by,
            length: existing.length,
        }
    }

    fn publish_folder(&self, run: &mut PublishRun<'_>, folder: &Resource) -> Result<()> {
        let parent = self.online_parent(run, folder)?;
        let draft = ResourceDraft::published_from(folder, parent, run.online);
        let online = match self.tree.lookup(TreeScope::Online, &folder.path)? {
            Some(existing) if existing.state != ResourceState::Deleted => {
                tracing::debug!("Folder {} already online, updating in place", folder.path);
                self.tree
                    .update_resource(TreeScope::Online, &Self::overwrite(&existing, &draft), None)?
            }
            _ => self.tree.create_folder(TreeScope::Online, &draft)?,
        };
        run.parents.insert(folder.id, online.id);

        let props = self.staging_properties(run, folder);
        self.copy_properties(run, folder, online.id, &props);
        self.copy_links(run, folder, online.id)?;
        self.backup(run, folder, None, &props)?;
        self.tree.set_state(TreeScope::Offline, folder.id, ResourceState::Unchanged)
    }

    fn publish_file(&self, run: &mut PublishRun<'_>, file: &Resource) -> Result<()> {
        let content = self.tree.read_content(TreeScope::Offline, file)?;
        let parent = self.online_parent(run, file)?;
        let draft = ResourceDraft::published_from(file, parent, run.online);
        let online = match self.tree.lookup(TreeScope::Online, &file.path)? {
            Some(existing) if existing.state != ResourceState::Deleted => self.tree.update_resource(
                TreeScope::Online,
                &Self::overwrite(&existing, &draft),
                Some(&content[..]),
            )?,
            _ => self.tree.create_file(TreeScope::Online, &draft, &content)?,
        };

        let props = self.staging_properties(run, file);
        self.copy_properties(run, file, online.id, &props);
        self.copy_links(run, file, online.id)?;
        self.backup(run, file, Some(&content[..]), &props)?;
        self.tree.set_state(TreeScope::Offline, file.id, ResourceState::Unchanged)?;

        if let Err(e) = self.export.export(&file.path, &content) {
            run.warn(Warning::new(&file.path, WarningKind::Export, e));
        }
        tracing::debug!("Published {} ({} bytes)", file.path, content.len());
        Ok(())
    }

    fn delete_file(&self, run: &mut PublishRun<'_>, file: &Resource) -> Result<()> {
        let props = self.staging_properties(run, file);
        if run.version.is_some() {
            let content = self.tree.read_content(TreeScope::Offline, file)?;
            self.backup(run, file, Some(&content[..]), &props)?;
        }
        self.properties.delete_all_properties(TreeScope::Offline, file.id)?;
        if let Some(online) = self.tree.lookup(TreeScope::Online, &file.path)? {
            self.properties.delete_all_properties(TreeScope::Online, online.id)?;
            self.tree.delete_resource(TreeScope::Online, online.id)?;
        }
        self.tree.delete_resource(TreeScope::Offline, file.id)?;

        if let Err(e) = self.export.remove(&file.path) {
            run.warn(Warning::new(&file.path, WarningKind::Export, e));
        }
        Ok(())
    }

    fn delete_folder(&self, run: &mut PublishRun<'_>, folder: &Resource) -> Result<FolderRemoval> {
        let online = self.tree.lookup(TreeScope::Online, &folder.path)?;
        let online_children = match &online {
            Some(o) => self.tree.read_children(TreeScope::Online, o.id)?.len(),
            None => 0,
        };
        let staging_children = self.tree.read_children(TreeScope::Offline, folder.id)?.len();
        if online_children > 0 || staging_children > 0 {
            run.warn(Warning::new(
                &folder.path,
                WarningKind::FolderNotEmpty,
                format!(
                    "{} online and {} staging child(ren) remain, folder kept",
                    online_children, staging_children
                ),
            ));
            return Ok(FolderRemoval::Blocked);
        }

        let props = self.staging_properties(run, folder);
        self.backup(run, folder, None, &props)?;
        self.properties.delete_all_properties(TreeScope::Offline, folder.id)?;
        if let Some(online) = online {
            self.properties.delete_all_properties(TreeScope::Online, online.id)?;
            self.tree.delete_resource(TreeScope::Online, online.id)?;
        }
        self.tree.delete_resource(TreeScope::Offline, folder.id)?;
        Ok(FolderRemoval::Removed)
    }
}
