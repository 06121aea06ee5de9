//! Resource property storage
//!
//! Key/value attributes attached to resources. A value is stored under a
//! property definition `(name, resource_type)`, and each scope (staging,
//! online, backup) keeps its own definitions. Writing a value whose
//! definition is missing fails with `NotFound`.

use crate::database::{SqliteDatabase, TreeScope};
use crate::error::{CmsError, Result};
use crate::model::{PropertyDefId, PropertyDefinition, PropertyMap, ResourceId};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;

/// Where a property definition lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionScope {
    Tree(TreeScope),
    Backup,
}

impl DefinitionScope {
    /// Staging, online and backup, in that order
    pub const ALL: [DefinitionScope; 3] = [
        DefinitionScope::Tree(TreeScope::Offline),
        DefinitionScope::Tree(TreeScope::Online),
        DefinitionScope::Backup,
    ];

    fn table(self) -> String {
        match self {
            DefinitionScope::Tree(scope) => scope.table("propertydef"),
            DefinitionScope::Backup => "propertydef_backup".to_string(),
        }
    }
}

/// Property access for the staging and online trees
pub trait PropertyStore: Send + Sync {
    fn create_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<PropertyDefinition>;

    fn read_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<PropertyDefinition>;

    fn read_definitions(&self, scope: DefinitionScope, resource_type: i32) -> Result<Vec<PropertyDefinition>>;

    /// Remove a definition; tree scopes refuse while values still use it
    fn delete_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<()>;

    fn read_property(&self, scope: TreeScope, name: &str, resource: ResourceId, resource_type: i32)
    -> Result<Option<String>>;

    fn read_properties(&self, scope: TreeScope, resource: ResourceId, resource_type: i32) -> Result<PropertyMap>;

    fn write_property(
        &self,
        scope: TreeScope,
        name: &str,
        value: &str,
        resource: ResourceId,
        resource_type: i32,
    ) -> Result<()>;

    /// Write every entry of `properties`; all or nothing
    fn write_properties(
        &self,
        scope: TreeScope,
        resource: ResourceId,
        resource_type: i32,
        properties: &PropertyMap,
    ) -> Result<()>;

    fn delete_property(&self, scope: TreeScope, name: &str, resource: ResourceId, resource_type: i32) -> Result<()>;

    fn delete_all_properties(&self, scope: TreeScope, resource: ResourceId) -> Result<()>;
}

/// SQLite-backed property store
pub struct SqlitePropertyStore {
    db: Arc<SqliteDatabase>,
}

pub(crate) fn conn_read_definition(
    conn: &Connection,
    scope: DefinitionScope,
    name: &str,
    resource_type: i32,
) -> Result<Option<PropertyDefinition>> {
    let sql = format!(
        "SELECT propertydef_id, name, resource_type FROM {} WHERE name = ?1 AND resource_type = ?2",
        scope.table()
    );
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![name, resource_type], |r| {
            Ok(PropertyDefinition {
                id: PropertyDefId(r.get(0)?),
                name: r.get(1)?,
                resource_type: r.get(2)?,
            })
        })
        .optional()?)
}

fn conn_write_property(
    conn: &Connection,
    scope: TreeScope,
    name: &str,
    value: &str,
    resource: ResourceId,
    resource_type: i32,
) -> Result<()> {
    let def = conn_read_definition(conn, DefinitionScope::Tree(scope), name, resource_type)?
        .ok_or_else(|| CmsError::NotFound(format!("property definition {} for type {}", name, resource_type)))?;
    conn.execute(
        &format!(
            "INSERT INTO {} (propertydef_id, resource_id, property_value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(propertydef_id, resource_id) DO UPDATE SET property_value = excluded.property_value",
            scope.table("properties")
        ),
        params![def.id.0, resource.0, value],
    )?;
    Ok(())
}

impl SqlitePropertyStore {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }
}

impl PropertyStore for SqlitePropertyStore {
    fn create_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<PropertyDefinition> {
        if name.is_empty() {
            return Err(CmsError::BadName("empty property name".into()));
        }
        let conn = self.db.conn()?;
        if conn_read_definition(&conn, scope, name, resource_type)?.is_some() {
            return Err(CmsError::AlreadyExists(format!("property definition {}", name)));
        }
        conn.execute(
            &format!("INSERT INTO {} (name, resource_type) VALUES (?1, ?2)", scope.table()),
            params![name, resource_type],
        )?;
        Ok(PropertyDefinition {
            id: PropertyDefId(conn.last_insert_rowid()),
            name: name.to_string(),
            resource_type,
        })
    }

    fn read_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<PropertyDefinition> {
        conn_read_definition(&*self.db.conn()?, scope, name, resource_type)?
            .ok_or_else(|| CmsError::NotFound(format!("property definition {} for type {}", name, resource_type)))
    }

    fn read_definitions(&self, scope: DefinitionScope, resource_type: i32) -> Result<Vec<PropertyDefinition>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT propertydef_id, name, resource_type FROM {} WHERE resource_type = ?1 ORDER BY name",
            scope.table()
        ))?;
        let rows = stmt.query_map([resource_type], |r| {
            Ok(PropertyDefinition {
                id: PropertyDefId(r.get(0)?),
                name: r.get(1)?,
                resource_type: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn delete_definition(&self, scope: DefinitionScope, name: &str, resource_type: i32) -> Result<()> {
        self.db.with_savepoint("delete_propertydef", |conn| {
            let def = conn_read_definition(conn, scope, name, resource_type)?
                .ok_or_else(|| CmsError::NotFound(format!("property definition {}", name)))?;
            if let DefinitionScope::Tree(tree) = scope {
                let in_use: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE propertydef_id = ?1", tree.table("properties")),
                    [def.id.0],
                    |r| r.get(0),
                )?;
                if in_use > 0 {
                    return Err(CmsError::NotEmpty(format!("property definition {} still has {} value(s)", name, in_use)));
                }
            }
            conn.execute(
                &format!("DELETE FROM {} WHERE propertydef_id = ?1", scope.table()),
                [def.id.0],
            )?;
            Ok(())
        })
    }

    fn read_property(
        &self,
        scope: TreeScope,
        name: &str,
        resource: ResourceId,
        resource_type: i32,
    ) -> Result<Option<String>> {
        let sql = format!(
            "SELECT p.property_value FROM {} p JOIN {} d ON p.propertydef_id = d.propertydef_id \
             WHERE p.resource_id = ?1 AND d.name = ?2 AND d.resource_type = ?3",
            scope.table("properties"),
            scope.table("propertydef")
        );
        Ok(self
            .db
            .conn()?
            .query_row(&sql, params![resource.0, name, resource_type], |r| r.get(0))
            .optional()?)
    }

    fn read_properties(&self, scope: TreeScope, resource: ResourceId, resource_type: i32) -> Result<PropertyMap> {
        let sql = format!(
            "SELECT d.name, p.property_value FROM {} p JOIN {} d ON p.propertydef_id = d.propertydef_id \
             WHERE p.resource_id = ?1 AND d.resource_type = ?2",
            scope.table("properties"),
            scope.table("propertydef")
        );
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![resource.0, resource_type], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut map = PropertyMap::new();
        for row in rows {
            let (name, value) = row?;
            map.insert(name, value);
        }
        Ok(map)
    }

    fn write_property(
        &self,
        scope: TreeScope,
        name: &str,
        value: &str,
        resource: ResourceId,
        resource_type: i32,
    ) -> Result<()> {
        conn_write_property(&*self.db.conn()?, scope, name, value, resource, resource_type)
    }

    fn write_properties(
        &self,
        scope: TreeScope,
        resource: ResourceId,
        resource_type: i32,
        properties: &PropertyMap,
    ) -> Result<()> {
        self.db.with_savepoint("write_properties", |conn| {
            for (name, value) in properties {
                conn_write_property(conn, scope, name, value, resource, resource_type)?;
            }
            Ok(())
        })
    }

    fn delete_property(&self, scope: TreeScope, name: &str, resource: ResourceId, resource_type: i32) -> Result<()> {
        let conn = self.db.conn()?;
        if let Some(def) = conn_read_definition(&conn, DefinitionScope::Tree(scope), name, resource_type)? {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE propertydef_id = ?1 AND resource_id = ?2",
                    scope.table("properties")
                ),
                params![def.id.0, resource.0],
            )?;
        }
        Ok(())
    }

    fn delete_all_properties(&self, scope: TreeScope, resource: ResourceId) -> Result<()> {
        self.db.conn()?.execute(
            &format!("DELETE FROM {} WHERE resource_id = ?1", scope.table("properties")),
            [resource.0],
        )?;
        Ok(())
    }
}
