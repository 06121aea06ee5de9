//! Version/backup store
//!
//! Every historized publish gets a version id. The project row and every
//! published resource are copied into the `_backup` tables under that id,
//! together with resolved display names and the property set. Version ids
//! come from the `backup_sequence` row and share one namespace across the
//! project and resource backups.
//!
//! Backed-up file content gets a fresh content identity (a `files_backup`
//! row) while the bytes themselves stay in the content-addressed blob store.

use crate::blob::{BlobId, BlobStore};
use crate::database::SqliteDatabase;
use crate::directory::UserDirectory;
use crate::error::{CmsError, Result};
use crate::model::{
    BackupProject, BackupResource, GroupId, Project, ProjectId, ProjectType, PropertyMap, Resource, Timestamp,
    UserId, VersionId,
};
use crate::properties::{DefinitionScope, conn_read_definition};
use crate::report::{Warning, WarningKind};
use crate::tree::{RESOURCE_COLUMNS, resource_from_row};
use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Arc;

/// Default cap of [`BackupStore::read_all_backup_projects`]
pub const DEFAULT_BACKUP_LIST_LIMIT: usize = 300;

/// Tables cleared by retention, all keyed by `version_id`
const VERSIONED_TABLES: [&str; 5] = [
    "projects_backup",
    "project_resources_backup",
    "resources_backup",
    "files_backup",
    "properties_backup",
];

pub trait BackupStore: Send + Sync {
    /// Next version id without reserving it; `1` if history cannot be read
    fn peek_version_id(&self) -> VersionId;

    /// Atomically allocate the next version id
    fn reserve_version_id(&self) -> Result<VersionId>;

    /// Snapshot the project row and its memberships under `version`
    fn backup_project(
        &self,
        project: &Project,
        version: VersionId,
        published_at: Timestamp,
        publisher: UserId,
    ) -> Result<Vec<Warning>>;

    /// Snapshot one resource. Fails with `NotFound` if a property has no
    /// backup definition.
    fn backup_resource(
        &self,
        project_id: ProjectId,
        resource: &Resource,
        content: Option<&[u8]>,
        properties: &PropertyMap,
        version: VersionId,
        published_at: Timestamp,
    ) -> Result<Vec<Warning>>;

    fn read_backup_project(&self, version: VersionId) -> Result<BackupProject>;

    /// Newest first, at most `limit` entries
    fn read_all_backup_projects(&self, limit: usize) -> Result<Vec<BackupProject>>;

    fn read_file_header_for_hist(&self, version: VersionId, path: &str) -> Result<BackupResource>;

    /// Every backed-up version of `path`, newest first
    fn read_all_file_headers_for_hist(&self, path: &str) -> Result<Vec<BackupResource>>;

    fn read_backup_content(&self, version: VersionId, path: &str) -> Result<Bytes>;

    /// Drop every version older than the oldest project backup published at
    /// or after `before`. Returns the oldest retained version id.
    fn delete_backups_older_than(&self, before: Timestamp) -> Result<VersionId>;
}

pub struct SqliteBackupStore {
    db: Arc<SqliteDatabase>,
    blobs: Arc<dyn BlobStore>,
    directory: Arc<dyn UserDirectory>,
}

const PROJECT_BACKUP_COLUMNS: &str = "version_id, project_id, name, description, task_id, user_id, user_name, \
     group_id, group_name, managergroup_id, managergroup_name, project_flags, project_type, date_created, \
     project_published, project_publishedby, project_publishedby_name";

fn backup_project_from_row(row: &Row<'_>) -> rusqlite::Result<BackupProject> {
    Ok(BackupProject {
        version_id: row.get(0)?,
        project_id: ProjectId(row.get(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        task_id: row.get(4)?,
        owner: UserId(row.get(5)?),
        owner_name: row.get(6)?,
        group: GroupId(row.get(7)?),
        group_name: row.get(8)?,
        manager_group: GroupId(row.get(9)?),
        manager_group_name: row.get(10)?,
        flags: row.get(11)?,
        project_type: ProjectType::from_code(row.get(12)?),
        date_created: row.get(13)?,
        published_at: row.get(14)?,
        published_by: UserId(row.get(15)?),
        published_by_name: row.get(16)?,
        resources: Vec::new(),
    })
}

/// `max(sequence, project backups, resource backups)`, `None` on empty history
fn conn_last_version(conn: &Connection) -> Result<Option<VersionId>> {
    Ok(conn.query_row(
        "SELECT MAX(v) FROM ( \
             SELECT last_value AS v FROM backup_sequence WHERE name = 'version' \
             UNION ALL SELECT MAX(version_id) FROM projects_backup \
             UNION ALL SELECT MAX(version_id) FROM resources_backup)",
        [],
        |r| r.get::<_, Option<i64>>(0),
    )?)
}

fn conn_project_members(conn: &Connection, version: VersionId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT resource_name FROM project_resources_backup WHERE version_id = ?1 ORDER BY resource_name",
    )?;
    let rows = stmt.query_map([version], |r| r.get(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn conn_backup_properties(conn: &Connection, version: VersionId, resource: &Resource) -> Result<PropertyMap> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.name, p.property_value FROM properties_backup p \
         JOIN propertydef_backup d ON p.propertydef_id = d.propertydef_id \
         WHERE p.version_id = ?1 AND p.resource_id = ?2 AND d.resource_type = ?3",
    )?;
    let rows = stmt.query_map(params![version, resource.id.0, resource.resource_type], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut map = PropertyMap::new();
    for row in rows {
        let (name, value) = row?;
        map.insert(name, value);
    }
    Ok(map)
}

fn conn_resource_headers(conn: &Connection, filter: &str, params: impl rusqlite::Params) -> Result<Vec<BackupResource>> {
    let sql = format!(
        "SELECT {}, version_id, date_published, user_name, group_name, lastmodified_by_name \
         FROM resources_backup WHERE {} ORDER BY version_id DESC",
        RESOURCE_COLUMNS, filter
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(BackupResource {
            resource: resource_from_row(row)?,
            version_id: row.get(17)?,
            published_at: row.get(18)?,
            owner_name: row.get(19)?,
            group_name: row.get(20)?,
            last_modified_by_name: row.get(21)?,
            properties: PropertyMap::new(),
        })
    })?;
    let mut headers = Vec::new();
    for r in rows {
        headers.push(r?);
    }
    for header in &mut headers {
        header.properties = conn_backup_properties(conn, header.version_id, &header.resource)?;
    }
    Ok(headers)
}

impl SqliteBackupStore {
    pub fn new(db: Arc<SqliteDatabase>, blobs: Arc<dyn BlobStore>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { db, blobs, directory }
    }

    /// Best-effort display name; failures are returned as warnings
    fn resolve(&self, path: &str, what: &str, name: Result<String>, warnings: &mut Vec<Warning>) -> String {
        match name {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Could not resolve {} for backup of {}: {}", what, path, e);
                warnings.push(Warning::new(path, WarningKind::NameResolution, format!("{}: {}", what, e)));
                String::new()
            }
        }
    }
}

impl BackupStore for SqliteBackupStore {
    fn peek_version_id(&self) -> VersionId {
        let last = self.db.conn().and_then(|conn| conn_last_version(&conn));
        match last {
            Ok(v) => v.unwrap_or(0) + 1,
            Err(e) => {
                tracing::warn!("Reading backup history failed, assuming none: {}", e);
                1
            }
        }
    }

    fn reserve_version_id(&self) -> Result<VersionId> {
        let version: VersionId = self.db.conn()?.query_row(
            "UPDATE backup_sequence SET last_value = MAX(last_value, \
                 (SELECT COALESCE(MAX(version_id), 0) FROM projects_backup), \
                 (SELECT COALESCE(MAX(version_id), 0) FROM resources_backup)) + 1 \
             WHERE name = 'version' RETURNING last_value",
            [],
            |r| r.get(0),
        )?;
        tracing::debug!("Reserved backup version {}", version);
        Ok(version)
    }

    fn backup_project(
        &self,
        project: &Project,
        version: VersionId,
        published_at: Timestamp,
        publisher: UserId,
    ) -> Result<Vec<Warning>> {
        let label = format!("project {}", project.name);
        let mut warnings = Vec::new();
        let owner_name = self.resolve(&label, "owner", self.directory.user_name(project.owner), &mut warnings);
        let group_name = self.resolve(&label, "group", self.directory.group_name(project.group), &mut warnings);
        let manager_name = self.resolve(
            &label,
            "manager group",
            self.directory.group_name(project.manager_group),
            &mut warnings,
        );
        let publisher_name = self.resolve(&label, "publisher", self.directory.user_name(publisher), &mut warnings);

        self.db.with_savepoint("backup_project", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO projects_backup ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    PROJECT_BACKUP_COLUMNS
                ),
                params![
                    version,
                    project.id.0,
                    project.name,
                    project.description,
                    project.task_id,
                    project.owner.0,
                    owner_name,
                    project.group.0,
                    group_name,
                    project.manager_group.0,
                    manager_name,
                    project.flags,
                    project.project_type.code(),
                    project.date_created,
                    published_at,
                    publisher.0,
                    publisher_name,
                ],
            )?;
            conn.execute(
                "INSERT INTO project_resources_backup (version_id, project_id, resource_name) \
                 SELECT ?1, project_id, resource_name FROM project_resources WHERE project_id = ?2",
                params![version, project.id.0],
            )?;
            Ok(())
        })?;
        Ok(warnings)
    }

    fn backup_resource(
        &self,
        project_id: ProjectId,
        resource: &Resource,
        content: Option<&[u8]>,
        properties: &PropertyMap,
        version: VersionId,
        published_at: Timestamp,
    ) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        let path = resource.path.as_str();
        let owner_name = self.resolve(path, "owner", self.directory.user_name(resource.owner), &mut warnings);
        let group_name = self.resolve(path, "group", self.directory.group_name(resource.group), &mut warnings);
        let modifier_name = self.resolve(
            path,
            "last modifier",
            self.directory.user_name(resource.last_modified_by),
            &mut warnings,
        );
        let blob = match content {
            Some(data) if !resource.is_folder() => Some((self.blobs.put(data)?, data.len() as i64)),
            _ => None,
        };

        self.db.with_savepoint("backup_resource", |conn| {
            let (content_id, size) = match &blob {
                Some((id, size)) => {
                    conn.execute(
                        "INSERT INTO files_backup (version_id, blob_id, size) VALUES (?1, ?2, ?3)",
                        params![version, id.to_hex(), size],
                    )?;
                    (Some(conn.last_insert_rowid()), *size)
                }
                None => (None, resource.length),
            };
            conn.execute(
                "INSERT INTO resources_backup (version_id, resource_id, parent_id, content_id, resource_name, \
                 resource_type, resource_flags, user_id, user_name, group_id, group_name, project_id, access_flags, \
                 state, locked_by, locked_in_project, date_created, date_lastmodified, resource_lastmodified_by, \
                 lastmodified_by_name, resource_size, date_published) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, \
                 ?21, ?22)",
                params![
                    version,
                    resource.id.0,
                    resource.parent_id.map(|p| p.0),
                    content_id,
                    resource.path,
                    resource.resource_type,
                    resource.flags,
                    resource.owner.0,
                    owner_name,
                    resource.group.0,
                    group_name,
                    project_id.0,
                    resource.access_flags,
                    resource.state.code(),
                    resource.locked_by.map(|u| u.0),
                    resource.locked_in_project.0,
                    resource.date_created,
                    resource.date_last_modified,
                    resource.last_modified_by.0,
                    modifier_name,
                    size,
                    published_at,
                ],
            )?;
            for (name, value) in properties {
                let def = conn_read_definition(conn, DefinitionScope::Backup, name, resource.resource_type)?
                    .ok_or_else(|| {
                        CmsError::NotFound(format!(
                            "backup property definition {} for type {}",
                            name, resource.resource_type
                        ))
                    })?;
                conn.execute(
                    "INSERT INTO properties_backup (version_id, propertydef_id, resource_id, property_value) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![version, def.id.0, resource.id.0, value],
                )?;
            }
            Ok(())
        })?;
        Ok(warnings)
    }

    fn read_backup_project(&self, version: VersionId) -> Result<BackupProject> {
        let conn = self.db.conn()?;
        let mut project = conn
            .query_row(
                &format!("SELECT {} FROM projects_backup WHERE version_id = ?1", PROJECT_BACKUP_COLUMNS),
                [version],
                backup_project_from_row,
            )
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("backup version {}", version)))?;
        project.resources = conn_project_members(&conn, version)?;
        Ok(project)
    }

    fn read_all_backup_projects(&self, limit: usize) -> Result<Vec<BackupProject>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM projects_backup ORDER BY version_id DESC LIMIT ?1",
            PROJECT_BACKUP_COLUMNS
        ))?;
        let rows = stmt.query_map([limit as i64], backup_project_from_row)?;
        let mut projects = Vec::new();
        for r in rows {
            projects.push(r?);
        }
        drop(stmt);
        for project in &mut projects {
            project.resources = conn_project_members(&conn, project.version_id)?;
        }
        Ok(projects)
    }

    fn read_file_header_for_hist(&self, version: VersionId, path: &str) -> Result<BackupResource> {
        conn_resource_headers(&*self.db.conn()?, "version_id = ?1 AND resource_name = ?2", params![version, path])?
            .into_iter()
            .next()
            .ok_or_else(|| CmsError::NotFound(format!("{} in backup version {}", path, version)))
    }

    fn read_all_file_headers_for_hist(&self, path: &str) -> Result<Vec<BackupResource>> {
        conn_resource_headers(&*self.db.conn()?, "resource_name = ?1", [path])
    }

    fn read_backup_content(&self, version: VersionId, path: &str) -> Result<Bytes> {
        let header = self.read_file_header_for_hist(version, path)?;
        let content = header
            .resource
            .content_id
            .ok_or_else(|| CmsError::NotFound(format!("content of {} in backup version {}", path, version)))?;
        let blob_hex: String = self
            .db
            .conn()?
            .query_row(
                "SELECT blob_id FROM files_backup WHERE content_id = ?1",
                [content.0],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("backup content {} of {}", content, path)))?;
        self.blobs.get(&BlobId::from_hex(&blob_hex)?)
    }

    fn delete_backups_older_than(&self, before: Timestamp) -> Result<VersionId> {
        self.db.with_savepoint("delete_backups", |conn| {
            let retained: Option<VersionId> = conn.query_row(
                "SELECT MIN(version_id) FROM projects_backup WHERE project_published >= ?1",
                [before],
                |r| r.get(0),
            )?;
            let last = conn_last_version(conn)?.unwrap_or(0);
            // Numbering continues after the pruned versions
            conn.execute(
                "UPDATE backup_sequence SET last_value = MAX(last_value, ?1) WHERE name = 'version'",
                [last],
            )?;
            let retained = retained.unwrap_or(last + 1);
            let mut removed = 0;
            for table in VERSIONED_TABLES {
                removed += conn.execute(&format!("DELETE FROM {} WHERE version_id < ?1", table), [retained])?;
            }
            tracing::info!("Deleted {} backup row(s) older than version {}", removed, retained);
            Ok(retained)
        })
    }
}
