//! SQLite connection, schema and units of work
//!
//! Every relational table of the repository lives in one SQLite database
//! (WAL mode on disk). Stores share the connection through [`SqliteDatabase`]
//! and express multi-row writes with savepoints, so a store operation called
//! inside a publish unit of work nests instead of committing early.

use crate::error::{CmsError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS user_groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS projects (
    project_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    managergroup_id INTEGER NOT NULL,
    project_flags INTEGER NOT NULL,
    project_type INTEGER NOT NULL,
    date_created INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS project_resources (
    project_id INTEGER NOT NULL,
    resource_name TEXT NOT NULL,
    PRIMARY KEY (project_id, resource_name)
);
CREATE TABLE IF NOT EXISTS projects_backup (
    version_id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    user_name TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    group_name TEXT NOT NULL,
    managergroup_id INTEGER NOT NULL,
    managergroup_name TEXT NOT NULL,
    project_flags INTEGER NOT NULL,
    project_type INTEGER NOT NULL,
    date_created INTEGER NOT NULL,
    project_published INTEGER NOT NULL,
    project_publishedby INTEGER NOT NULL,
    project_publishedby_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS project_resources_backup (
    version_id INTEGER NOT NULL,
    project_id INTEGER NOT NULL,
    resource_name TEXT NOT NULL,
    PRIMARY KEY (version_id, resource_name)
);
CREATE TABLE IF NOT EXISTS backup_sequence (
    name TEXT PRIMARY KEY,
    last_value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS resources_backup (
    backup_id INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id INTEGER NOT NULL,
    resource_id INTEGER NOT NULL,
    parent_id INTEGER,
    content_id INTEGER,
    resource_name TEXT NOT NULL,
    resource_type INTEGER NOT NULL,
    resource_flags INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    user_name TEXT NOT NULL,
    group_id INTEGER NOT NULL,
    group_name TEXT NOT NULL,
    project_id INTEGER NOT NULL,
    access_flags INTEGER NOT NULL,
    state INTEGER NOT NULL,
    locked_by INTEGER,
    locked_in_project INTEGER NOT NULL,
    date_created INTEGER NOT NULL,
    date_lastmodified INTEGER NOT NULL,
    resource_lastmodified_by INTEGER NOT NULL,
    lastmodified_by_name TEXT NOT NULL,
    resource_size INTEGER NOT NULL,
    date_published INTEGER NOT NULL,
    UNIQUE (version_id, resource_name)
);
CREATE TABLE IF NOT EXISTS files_backup (
    content_id INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id INTEGER NOT NULL,
    blob_id TEXT NOT NULL,
    size INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS propertydef_backup (
    propertydef_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    resource_type INTEGER NOT NULL,
    UNIQUE (name, resource_type)
);
CREATE TABLE IF NOT EXISTS properties_backup (
    version_id INTEGER NOT NULL,
    propertydef_id INTEGER NOT NULL,
    resource_id INTEGER NOT NULL,
    property_value TEXT NOT NULL,
    PRIMARY KEY (version_id, propertydef_id, resource_id)
);
";

/// Tables that exist once for the staging tree and once (suffixed `_online`)
/// for the published tree.
const TREE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resources{s} (
    resource_id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER,
    content_id INTEGER,
    resource_name TEXT NOT NULL UNIQUE,
    resource_type INTEGER NOT NULL,
    resource_flags INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    project_id INTEGER NOT NULL,
    access_flags INTEGER NOT NULL,
    state INTEGER NOT NULL,
    locked_by INTEGER,
    locked_in_project INTEGER NOT NULL,
    date_created INTEGER NOT NULL,
    date_lastmodified INTEGER NOT NULL,
    resource_lastmodified_by INTEGER NOT NULL,
    resource_size INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS resources{s}_parent ON resources{s} (parent_id);
CREATE INDEX IF NOT EXISTS resources{s}_project ON resources{s} (project_id);
CREATE TABLE IF NOT EXISTS files{s} (
    content_id INTEGER PRIMARY KEY AUTOINCREMENT,
    blob_id TEXT NOT NULL,
    size INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS propertydef{s} (
    propertydef_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    resource_type INTEGER NOT NULL,
    UNIQUE (name, resource_type)
);
CREATE TABLE IF NOT EXISTS properties{s} (
    propertydef_id INTEGER NOT NULL,
    resource_id INTEGER NOT NULL,
    property_value TEXT NOT NULL,
    PRIMARY KEY (propertydef_id, resource_id)
);
CREATE TABLE IF NOT EXISTS link_entries{s} (
    source_id INTEGER NOT NULL,
    target_path TEXT NOT NULL,
    PRIMARY KEY (source_id, target_path)
);
CREATE INDEX IF NOT EXISTS link_entries{s}_target ON link_entries{s} (target_path);
";

/// Which of the two live trees an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeScope {
    /// Staging tree shared by all offline projects
    Offline,
    /// The published tree
    Online,
}

impl TreeScope {
    /// Table name suffix for this scope
    pub fn suffix(self) -> &'static str {
        match self {
            TreeScope::Offline => "",
            TreeScope::Online => "_online",
        }
    }

    /// `base` with this scope's suffix, e.g. `resources_online`
    pub fn table(self, base: &str) -> String {
        format!("{}{}", base, self.suffix())
    }
}

/// Groups the writes of one logical step so they commit or roll back together
pub trait UnitOfWork: Send + Sync {
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Thread running the open unit of work and its nesting depth
struct UnitOwner {
    thread: ThreadId,
    depth: usize,
}

/// Shared SQLite connection for all relational stores.
///
/// While a unit of work is open its savepoint lives on the shared
/// connection, so [`SqliteDatabase::conn`] blocks every other thread until the
/// unit ends. Reads and writes from other threads therefore never join, see or
/// lose to an uncommitted unit.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    unit: Mutex<Option<UnitOwner>>,
    unit_done: Condvar,
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    for scope in [TreeScope::Offline, TreeScope::Online] {
        conn.execute_batch(&TREE_SCHEMA.replace("{s}", scope.suffix()))?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO backup_sequence (name, last_value) VALUES ('version', 0)",
        [],
    )?;
    Ok(())
}

fn poisoned<T>(_: T) -> CmsError {
    CmsError::Store("database mutex poisoned".into())
}

impl SqliteDatabase {
    /// Open (and migrate) the database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CmsError::Store(format!("Failed to open SQLite database at {:?}: {}", path, e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", "-64000")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        create_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn), unit: Mutex::new(None), unit_done: Condvar::new() }
    }

    /// Wait until no other thread has a unit of work open
    fn wait_for_unit(&self) -> Result<MutexGuard<'_, Option<UnitOwner>>> {
        let me = thread::current().id();
        let mut owner = self.unit.lock().map_err(poisoned)?;
        while owner.as_ref().is_some_and(|o| o.thread != me) {
            owner = self.unit_done.wait(owner).map_err(poisoned)?;
        }
        Ok(owner)
    }

    /// Lock the connection for the duration of one store call.
    /// Blocks while another thread has a unit of work open.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        let _unit = self.wait_for_unit()?;
        self.conn.lock().map_err(poisoned)
    }

    /// Run `f` inside a named savepoint; rolled back if `f` fails.
    /// `f` receives the locked connection and must not re-enter the database.
    pub fn with_savepoint<T>(&self, name: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch(&format!("RELEASE {}", name))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) =
                    conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}", name = name))
                {
                    tracing::error!("Rollback of savepoint {} failed: {}", name, rollback);
                }
                Err(e)
            }
        }
    }

    fn enter_unit(&self) -> Result<UnitGuard<'_>> {
        let mut owner = self.wait_for_unit()?;
        match owner.as_mut() {
            Some(o) => o.depth += 1,
            None => *owner = Some(UnitOwner { thread: thread::current().id(), depth: 1 }),
        }
        Ok(UnitGuard { db: self })
    }

    fn run_unit(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.conn()?.execute_batch("SAVEPOINT unit_of_work")?;
        match work() {
            Ok(()) => {
                self.conn()?.execute_batch("RELEASE unit_of_work")?;
                Ok(())
            }
            Err(e) => {
                let conn = self.conn()?;
                if let Err(rollback) = conn.execute_batch("ROLLBACK TO unit_of_work; RELEASE unit_of_work") {
                    tracing::error!("Rollback of unit of work failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

/// Leaves the unit on drop and wakes waiting threads once the outermost
/// unit of this thread ends
struct UnitGuard<'a> {
    db: &'a SqliteDatabase,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.db.unit.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(o) = owner.as_mut() {
            o.depth -= 1;
            if o.depth == 0 {
                *owner = None;
                self.db.unit_done.notify_all();
            }
        }
    }
}

impl UnitOfWork for SqliteDatabase {
    /// Nests on the calling thread; other threads wait for the outermost unit
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let _unit = self.enter_unit()?;
        self.run_unit(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, mpsc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn count_users(db: &SqliteDatabase) -> i64 {
        db.conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_schema_has_both_tree_families() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        for table in ["resources", "resources_online", "files_online", "link_entries_online", "properties_backup"] {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(n, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_unit_of_work_rolls_back_on_error() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let result = db.atomically(&mut || {
            db.conn()?.execute("INSERT INTO users (name) VALUES ('alice')", [])?;
            Err(CmsError::Unknown("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(count_users(&db), 0);

        db.atomically(&mut || {
            db.conn()?.execute("INSERT INTO users (name) VALUES ('bob')", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count_users(&db), 1);
    }

    #[test]
    fn test_savepoint_nests_inside_unit_of_work() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let result = db.atomically(&mut || {
            db.with_savepoint("inner", |conn| {
                conn.execute("INSERT INTO users (name) VALUES ('carol')", [])?;
                Ok(())
            })?;
            Err(CmsError::Unknown("outer failure".into()))
        });
        assert!(result.is_err());
        assert_eq!(count_users(&db), 0);
    }

    #[test]
    fn test_other_thread_waits_for_open_unit() {
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let (started, ready) = mpsc::channel();
        let mut writer = None;
        let result = db.atomically(&mut || {
            db.conn()?.execute("INSERT INTO users (name) VALUES ('rolled-back')", [])?;
            let other = Arc::clone(&db);
            let started = started.clone();
            writer = Some(thread::spawn(move || {
                started.send(()).unwrap();
                other
                    .with_savepoint("other_thread", |conn| {
                        conn.execute("INSERT INTO users (name) VALUES ('survivor')", [])?;
                        Ok(())
                    })
                    .unwrap();
            }));
            ready.recv().unwrap();
            thread::sleep(Duration::from_millis(50));
            Err(CmsError::Unknown("unrelated failure".into()))
        });
        assert!(result.is_err());
        writer.take().unwrap().join().unwrap();

        let names: Vec<String> = {
            let conn = db.conn().unwrap();
            let mut stmt = conn.prepare("SELECT name FROM users").unwrap();
            stmt.query_map([], |r| r.get(0)).unwrap().map(|r| r.unwrap()).collect()
        };
        assert_eq!(names, vec!["survivor".to_string()]);
    }

    #[test]
    fn test_units_nest_on_one_thread() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.atomically(&mut || {
            db.conn()?.execute("INSERT INTO users (name) VALUES ('outer')", [])?;
            let inner = db.atomically(&mut || {
                db.conn()?.execute("INSERT INTO users (name) VALUES ('inner')", [])?;
                Err(CmsError::Unknown("inner failure".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();
        assert_eq!(count_users(&db), 1);
    }

    #[test]
    fn test_open_on_disk_twice() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cms.sqlite");
        {
            let db = SqliteDatabase::open(&path).unwrap();
            db.conn().unwrap().execute("INSERT INTO user_groups (name) VALUES ('Users')", []).unwrap();
        }
        let db = SqliteDatabase::open(&path).unwrap();
        let n: i64 = db.conn().unwrap().query_row("SELECT COUNT(*) FROM user_groups", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
    }
}
