//! Resource tree store
//!
//! Files and folders of the staging and the published tree. Both trees share
//! one table layout (see [`crate::database`]); [`TreeScope`] picks the family.
//! Content is kept in a [`BlobStore`] and referenced through the `files`
//! table, so every content identity is a row id and never a blob address.

use crate::blob::{BlobId, BlobStore};
use crate::database::{SqliteDatabase, TreeScope};
use crate::error::{CmsError, Result};
use crate::model::{
    ContentId, FOLDER_TYPE, GroupId, ProjectId, Resource, ResourceDraft, ResourceId, ResourceState, UserId,
    parent_path,
};
use bytes::Bytes;
use rusqlite::types::{FromSqlError, Type};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Arc;

/// Column list matching [`resource_from_row`]
pub(crate) const RESOURCE_COLUMNS: &str = "resource_id, parent_id, content_id, resource_name, resource_type, \
     resource_flags, user_id, group_id, project_id, access_flags, state, locked_by, locked_in_project, \
     date_created, date_lastmodified, resource_lastmodified_by, resource_size";

pub(crate) fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let state_code: i64 = row.get(10)?;
    let state = ResourceState::from_code(state_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(10, Type::Integer, Box::new(FromSqlError::OutOfRange(state_code)))
    })?;
    Ok(Resource {
        id: ResourceId(row.get(0)?),
        parent_id: row.get::<_, Option<i64>>(1)?.map(ResourceId),
        content_id: row.get::<_, Option<i64>>(2)?.map(ContentId),
        path: row.get(3)?,
        resource_type: row.get(4)?,
        flags: row.get(5)?,
        owner: UserId(row.get(6)?),
        group: GroupId(row.get(7)?),
        project_id: ProjectId(row.get(8)?),
        access_flags: row.get(9)?,
        state,
        locked_by: row.get::<_, Option<i64>>(11)?.map(UserId),
        locked_in_project: ProjectId(row.get(12)?),
        date_created: row.get(13)?,
        date_last_modified: row.get(14)?,
        last_modified_by: UserId(row.get(15)?),
        length: row.get(16)?,
    })
}

/// CRUD over one of the two live trees
pub trait ResourceTree: Send + Sync {
    fn read_resource(&self, scope: TreeScope, id: ResourceId) -> Result<Resource>;

    /// Resource at `path`, soft-deleted ones included
    fn lookup(&self, scope: TreeScope, path: &str) -> Result<Option<Resource>>;

    fn exists(&self, scope: TreeScope, path: &str) -> Result<bool> {
        Ok(self.lookup(scope, path)?.is_some())
    }

    /// Folder at `path`; `NotFound` if absent or not a folder
    fn read_folder(&self, scope: TreeScope, path: &str) -> Result<Resource> {
        match self.lookup(scope, path)? {
            Some(r) if r.is_folder() => Ok(r),
            _ => Err(CmsError::NotFound(format!("folder {}", path))),
        }
    }

    /// File at `path`; `NotFound` if absent or a folder
    fn read_file(&self, scope: TreeScope, path: &str) -> Result<Resource> {
        match self.lookup(scope, path)? {
            Some(r) if !r.is_folder() => Ok(r),
            _ => Err(CmsError::NotFound(format!("file {}", path))),
        }
    }

    fn create_folder(&self, scope: TreeScope, draft: &ResourceDraft) -> Result<Resource>;

    fn create_file(&self, scope: TreeScope, draft: &ResourceDraft, content: &[u8]) -> Result<Resource>;

    /// Rewrite every attribute of `resource` (matched by id); `content` replaces
    /// the file content with a new content row.
    fn update_resource(&self, scope: TreeScope, resource: &Resource, content: Option<&[u8]>) -> Result<Resource>;

    fn set_state(&self, scope: TreeScope, id: ResourceId, state: ResourceState) -> Result<()>;

    /// Physically remove the row with its content row, properties and links
    fn delete_resource(&self, scope: TreeScope, id: ResourceId) -> Result<()>;

    /// Soft delete in the staging tree
    fn mark_deleted(&self, path: &str) -> Result<Resource>;

    /// Direct (non-publish) removal of an empty folder
    fn delete_folder(&self, scope: TreeScope, path: &str) -> Result<()>;

    /// Staging folders last modified in `project`, ordered by path
    fn read_folders(&self, project: ProjectId) -> Result<Vec<Resource>>;

    /// Staging files last modified in `project`, ordered by path
    fn read_files(&self, project: ProjectId) -> Result<Vec<Resource>>;

    fn read_children(&self, scope: TreeScope, folder: ResourceId) -> Result<Vec<Resource>>;

    /// Every resource below one of `roots`, ordered by path
    fn read_project_view(&self, scope: TreeScope, roots: &[String]) -> Result<Vec<Resource>>;

    fn read_content(&self, scope: TreeScope, resource: &Resource) -> Result<Bytes>;
}

/// SQLite-backed resource tree
pub struct SqliteResourceTree {
    db: Arc<SqliteDatabase>,
    blobs: Arc<dyn BlobStore>,
    max_path_length: usize,
}

fn conn_lookup(conn: &Connection, scope: TreeScope, path: &str) -> Result<Option<Resource>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE resource_name = ?1",
        RESOURCE_COLUMNS,
        scope.table("resources")
    );
    Ok(conn.prepare_cached(&sql)?.query_row([path], resource_from_row).optional()?)
}

fn conn_read(conn: &Connection, scope: TreeScope, id: ResourceId) -> Result<Resource> {
    let sql = format!(
        "SELECT {} FROM {} WHERE resource_id = ?1",
        RESOURCE_COLUMNS,
        scope.table("resources")
    );
    conn.prepare_cached(&sql)?
        .query_row([id.0], resource_from_row)
        .optional()?
        .ok_or_else(|| CmsError::NotFound(format!("resource {} in {:?} tree", id, scope)))
}

fn conn_query(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Resource>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, resource_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn conn_children(conn: &Connection, scope: TreeScope, folder: ResourceId) -> Result<Vec<Resource>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE parent_id = ?1 ORDER BY resource_name",
        RESOURCE_COLUMNS,
        scope.table("resources")
    );
    conn_query(conn, &sql, [folder.0])
}

fn conn_insert_content(conn: &Connection, scope: TreeScope, blob: &BlobId, size: i64) -> Result<ContentId> {
    conn.execute(
        &format!("INSERT INTO {} (blob_id, size) VALUES (?1, ?2)", scope.table("files")),
        params![blob.to_hex(), size],
    )?;
    Ok(ContentId(conn.last_insert_rowid()))
}

fn conn_delete_content(conn: &Connection, scope: TreeScope, content: ContentId) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE content_id = ?1", scope.table("files")),
        [content.0],
    )?;
    Ok(())
}

/// Remove a row together with everything hanging off it in the same scope
fn conn_purge(conn: &Connection, scope: TreeScope, resource: &Resource) -> Result<()> {
    if let Some(content) = resource.content_id {
        conn_delete_content(conn, scope, content)?;
    }
    conn.execute(
        &format!("DELETE FROM {} WHERE resource_id = ?1", scope.table("properties")),
        [resource.id.0],
    )?;
    conn.execute(
        &format!("DELETE FROM {} WHERE source_id = ?1", scope.table("link_entries")),
        [resource.id.0],
    )?;
    conn.execute(
        &format!("DELETE FROM {} WHERE resource_id = ?1", scope.table("resources")),
        [resource.id.0],
    )?;
    Ok(())
}

fn conn_insert_resource(
    conn: &Connection,
    scope: TreeScope,
    draft: &ResourceDraft,
    content: Option<ContentId>,
    length: i64,
) -> Result<ResourceId> {
    let sql = format!(
        "INSERT INTO {} (parent_id, content_id, resource_name, resource_type, resource_flags, user_id, group_id, \
         project_id, access_flags, state, locked_by, locked_in_project, date_created, date_lastmodified, \
         resource_lastmodified_by, resource_size) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        scope.table("resources")
    );
    conn.execute(
        &sql,
        params![
            draft.parent_id.map(|p| p.0),
            content.map(|c| c.0),
            draft.path,
            draft.resource_type,
            draft.flags,
            draft.owner.0,
            draft.group.0,
            draft.project_id.0,
            draft.access_flags,
            draft.state.code(),
            draft.locked_by.map(|u| u.0),
            draft.locked_in_project.0,
            draft.date_created,
            draft.date_last_modified,
            draft.last_modified_by.0,
            length,
        ],
    )?;
    Ok(ResourceId(conn.last_insert_rowid()))
}

impl SqliteResourceTree {
    pub fn new(db: Arc<SqliteDatabase>, blobs: Arc<dyn BlobStore>, max_path_length: usize) -> Self {
        Self { db, blobs, max_path_length }
    }

    /// Reject malformed or over-long paths
    fn validate_path(&self, path: &str, folder: bool) -> Result<()> {
        if path.len() > self.max_path_length {
            return Err(CmsError::BadName(format!(
                "{} exceeds {} bytes",
                path, self.max_path_length
            )));
        }
        if !path.starts_with('/') || path.contains("//") || path.contains('\0') {
            return Err(CmsError::BadName(path.to_string()));
        }
        if folder != path.ends_with('/') {
            return Err(CmsError::BadName(format!(
                "{} must {}end with '/'",
                path,
                if folder { "" } else { "not " }
            )));
        }
        Ok(())
    }

    fn create(&self, scope: TreeScope, draft: &ResourceDraft, content: Option<&[u8]>) -> Result<Resource> {
        let folder = draft.resource_type == FOLDER_TYPE;
        self.validate_path(&draft.path, folder)?;
        let blob = match content {
            Some(data) if !folder => Some((self.blobs.put(data)?, data.len() as i64)),
            _ => None,
        };

        self.db.with_savepoint("create_resource", |conn| {
            match (draft.parent_id, parent_path(&draft.path)) {
                (None, None) => {}
                (Some(parent_id), Some(expected)) => {
                    let parent = conn_read(conn, scope, parent_id)
                        .map_err(|_| CmsError::NotFound(format!("parent folder of {}", draft.path)))?;
                    if !parent.is_folder() || parent.path != expected {
                        return Err(CmsError::NotFound(format!("parent folder {} of {}", expected, draft.path)));
                    }
                }
                _ => return Err(CmsError::NotFound(format!("parent folder of {}", draft.path))),
            }

            if let Some(existing) = conn_lookup(conn, scope, &draft.path)? {
                if existing.state != ResourceState::Deleted {
                    return Err(CmsError::AlreadyExists(draft.path.clone()));
                }
                tracing::debug!("Purging soft-deleted {} before re-creating it", existing.path);
                conn_purge(conn, scope, &existing)?;
            }

            let (content_id, length) = match &blob {
                Some((id, size)) => (Some(conn_insert_content(conn, scope, id, *size)?), *size),
                None => (None, 0),
            };
            let id = conn_insert_resource(conn, scope, draft, content_id, length)?;
            conn_read(conn, scope, id)
        })
    }
}

impl ResourceTree for SqliteResourceTree {
    fn read_resource(&self, scope: TreeScope, id: ResourceId) -> Result<Resource> {
        conn_read(&*self.db.conn()?, scope, id)
    }

    fn lookup(&self, scope: TreeScope, path: &str) -> Result<Option<Resource>> {
        conn_lookup(&*self.db.conn()?, scope, path)
    }

    fn create_folder(&self, scope: TreeScope, draft: &ResourceDraft) -> Result<Resource> {
        if draft.resource_type != FOLDER_TYPE {
            return Err(CmsError::BadName(format!("{} is not a folder type", draft.path)));
        }
        self.create(scope, draft, None)
    }

    fn create_file(&self, scope: TreeScope, draft: &ResourceDraft, content: &[u8]) -> Result<Resource> {
        if draft.resource_type == FOLDER_TYPE {
            return Err(CmsError::BadName(format!("{} is a folder type", draft.path)));
        }
        self.create(scope, draft, Some(content))
    }

    fn update_resource(&self, scope: TreeScope, resource: &Resource, content: Option<&[u8]>) -> Result<Resource> {
        self.validate_path(&resource.path, resource.is_folder())?;
        let blob = match content {
            Some(data) if !resource.is_folder() => Some((self.blobs.put(data)?, data.len() as i64)),
            _ => None,
        };

        self.db.with_savepoint("update_resource", |conn| {
            let current = conn_read(conn, scope, resource.id)?;
            let (content_id, length) = match &blob {
                Some((id, size)) => {
                    let fresh = conn_insert_content(conn, scope, id, *size)?;
                    if let Some(old) = current.content_id {
                        conn_delete_content(conn, scope, old)?;
                    }
                    (Some(fresh), *size)
                }
                None => (current.content_id, if resource.is_folder() { 0 } else { current.length }),
            };
            let sql = format!(
                "UPDATE {} SET parent_id = ?1, content_id = ?2, resource_name = ?3, resource_type = ?4, \
                 resource_flags = ?5, user_id = ?6, group_id = ?7, project_id = ?8, access_flags = ?9, state = ?10, \
                 locked_by = ?11, locked_in_project = ?12, date_created = ?13, date_lastmodified = ?14, \
                 resource_lastmodified_by = ?15, resource_size = ?16 WHERE resource_id = ?17",
                scope.table("resources")
            );
            conn.execute(
                &sql,
                params![
                    resource.parent_id.map(|p| p.0),
                    content_id.map(|c| c.0),
                    resource.path,
                    resource.resource_type,
                    resource.flags,
                    resource.owner.0,
                    resource.group.0,
                    resource.project_id.0,
                    resource.access_flags,
                    resource.state.code(),
                    resource.locked_by.map(|u| u.0),
                    resource.locked_in_project.0,
                    resource.date_created,
                    resource.date_last_modified,
                    resource.last_modified_by.0,
                    length,
                    resource.id.0,
                ],
            )?;
            conn_read(conn, scope, resource.id)
        })
    }

    fn set_state(&self, scope: TreeScope, id: ResourceId, state: ResourceState) -> Result<()> {
        let changed = self.db.conn()?.execute(
            &format!("UPDATE {} SET state = ?1 WHERE resource_id = ?2", scope.table("resources")),
            params![state.code(), id.0],
        )?;
        if changed == 0 {
            return Err(CmsError::NotFound(format!("resource {} in {:?} tree", id, scope)));
        }
        Ok(())
    }

    fn delete_resource(&self, scope: TreeScope, id: ResourceId) -> Result<()> {
        self.db.with_savepoint("delete_resource", |conn| {
            let resource = conn_read(conn, scope, id)?;
            conn_purge(conn, scope, &resource)
        })
    }

    fn mark_deleted(&self, path: &str) -> Result<Resource> {
        let scope = TreeScope::Offline;
        self.db.with_savepoint("mark_deleted", |conn| {
            let mut resource =
                conn_lookup(conn, scope, path)?.ok_or_else(|| CmsError::NotFound(path.to_string()))?;
            if resource.is_folder()
                && conn_children(conn, scope, resource.id)?
                    .iter()
                    .any(|c| c.state != ResourceState::Deleted)
            {
                return Err(CmsError::NotEmpty(path.to_string()));
            }
            conn.execute(
                &format!("UPDATE {} SET state = ?1 WHERE resource_id = ?2", scope.table("resources")),
                params![ResourceState::Deleted.code(), resource.id.0],
            )?;
            resource.state = ResourceState::Deleted;
            Ok(resource)
        })
    }

    fn delete_folder(&self, scope: TreeScope, path: &str) -> Result<()> {
        self.db.with_savepoint("delete_folder", |conn| {
            let folder = match conn_lookup(conn, scope, path)? {
                Some(r) if r.is_folder() => r,
                _ => return Err(CmsError::NotFound(format!("folder {}", path))),
            };
            if !conn_children(conn, scope, folder.id)?.is_empty() {
                return Err(CmsError::NotEmpty(path.to_string()));
            }
            conn_purge(conn, scope, &folder)
        })
    }

    fn read_folders(&self, project: ProjectId) -> Result<Vec<Resource>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE project_id = ?1 AND resource_type = ?2 ORDER BY resource_name",
            RESOURCE_COLUMNS
        );
        conn_query(&*self.db.conn()?, &sql, params![project.0, FOLDER_TYPE])
    }

    fn read_files(&self, project: ProjectId) -> Result<Vec<Resource>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE project_id = ?1 AND resource_type <> ?2 ORDER BY resource_name",
            RESOURCE_COLUMNS
        );
        conn_query(&*self.db.conn()?, &sql, params![project.0, FOLDER_TYPE])
    }

    fn read_children(&self, scope: TreeScope, folder: ResourceId) -> Result<Vec<Resource>> {
        conn_children(&*self.db.conn()?, scope, folder)
    }

    fn read_project_view(&self, scope: TreeScope, roots: &[String]) -> Result<Vec<Resource>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY resource_name",
            RESOURCE_COLUMNS,
            scope.table("resources")
        );
        let all = conn_query(&*self.db.conn()?, &sql, [])?;
        Ok(all
            .into_iter()
            .filter(|r| roots.iter().any(|root| r.path.starts_with(root.as_str())))
            .collect())
    }

    fn read_content(&self, scope: TreeScope, resource: &Resource) -> Result<Bytes> {
        let content = resource
            .content_id
            .ok_or_else(|| CmsError::NotFound(format!("content of folder {}", resource.path)))?;
        let blob_hex: String = self
            .db
            .conn()?
            .query_row(
                &format!("SELECT blob_id FROM {} WHERE content_id = ?1", scope.table("files")),
                [content.0],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("content {} of {}", content, resource.path)))?;
        self.blobs.get(&BlobId::from_hex(&blob_hex)?)
    }
}
