//! Link graph index
//!
//! Outbound hyperlinks of each resource, stored as `(source_id, target_path)`
//! edges separately for the staging and the published tree. Targets are
//! paths so they may point at resources that do not exist (yet).

use crate::database::{SqliteDatabase, TreeScope};
use crate::error::Result;
use crate::model::ResourceId;
use crate::report::{Warning, WarningKind};
use rusqlite::params;
use std::sync::Arc;

pub trait LinkIndex: Send + Sync {
    /// Replace the staging edges of `source`
    fn create_link_entries(&self, source: ResourceId, targets: &[String]) -> Result<Vec<Warning>>;

    /// Replace the published edges of `source`
    fn create_online_link_entries(&self, source: ResourceId, targets: &[String]) -> Result<Vec<Warning>>;

    fn read_link_entries(&self, scope: TreeScope, source: ResourceId) -> Result<Vec<String>>;

    fn delete_link_entries(&self, scope: TreeScope, source: ResourceId) -> Result<()>;

    /// Sources with an edge to `target`
    fn read_referencing(&self, scope: TreeScope, target: &str) -> Result<Vec<ResourceId>>;
}

pub struct SqliteLinkIndex {
    db: Arc<SqliteDatabase>,
}

impl SqliteLinkIndex {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    /// Drop all edges of `source`, then insert one per target. A failing
    /// insert only skips that target.
    fn replace(&self, scope: TreeScope, source: ResourceId, targets: &[String]) -> Result<Vec<Warning>> {
        let table = scope.table("link_entries");
        self.db.with_savepoint("replace_links", |conn| {
            conn.execute(&format!("DELETE FROM {} WHERE source_id = ?1", table), [source.0])?;
            let mut stmt =
                conn.prepare_cached(&format!("INSERT INTO {} (source_id, target_path) VALUES (?1, ?2)", table))?;
            let mut warnings = Vec::new();
            for target in targets {
                if let Err(e) = stmt.execute(params![source.0, target]) {
                    tracing::warn!("Skipping link {} -> {}: {}", source, target, e);
                    warnings.push(Warning::new(
                        target.as_str(),
                        WarningKind::LinkTarget,
                        format!("edge from resource {}: {}", source, e),
                    ));
                }
            }
            Ok(warnings)
        })
    }
}

impl LinkIndex for SqliteLinkIndex {
    fn create_link_entries(&self, source: ResourceId, targets: &[String]) -> Result<Vec<Warning>> {
        self.replace(TreeScope::Offline, source, targets)
    }

    fn create_online_link_entries(&self, source: ResourceId, targets: &[String]) -> Result<Vec<Warning>> {
        self.replace(TreeScope::Online, source, targets)
    }

    fn read_link_entries(&self, scope: TreeScope, source: ResourceId) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT target_path FROM {} WHERE source_id = ?1 ORDER BY target_path",
            scope.table("link_entries")
        ))?;
        let rows = stmt.query_map([source.0], |r| r.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn delete_link_entries(&self, scope: TreeScope, source: ResourceId) -> Result<()> {
        self.db.conn()?.execute(
            &format!("DELETE FROM {} WHERE source_id = ?1", scope.table("link_entries")),
            [source.0],
        )?;
        Ok(())
    }

    fn read_referencing(&self, scope: TreeScope, target: &str) -> Result<Vec<ResourceId>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT source_id FROM {} WHERE target_path = ?1 ORDER BY source_id",
            scope.table("link_entries")
        ))?;
        let rows = stmt.query_map([target], |r| r.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ResourceId(r?));
        }
        Ok(out)
    }
}
