//! User and group directory
//!
//! Only what publishing needs: creating principals and resolving their
//! display names for backup rows.

use crate::database::SqliteDatabase;
use crate::error::{CmsError, Result};
use crate::model::{GroupId, UserId};
use rusqlite::OptionalExtension;
use std::sync::Arc;

/// Resolves principal ids to display names
pub trait UserDirectory: Send + Sync {
    fn user_name(&self, id: UserId) -> Result<String>;

    fn group_name(&self, id: GroupId) -> Result<String>;
}

/// SQLite-backed directory over the `users` and `user_groups` tables
pub struct SqliteDirectory {
    db: Arc<SqliteDatabase>,
}

impl SqliteDirectory {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    pub fn create_user(&self, name: &str) -> Result<UserId> {
        let conn = self.db.conn()?;
        conn.execute("INSERT INTO users (name) VALUES (?1)", [name])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    CmsError::AlreadyExists(format!("user {}", name))
                }
                other => other.into(),
            })?;
        Ok(UserId(conn.last_insert_rowid()))
    }

    pub fn create_group(&self, name: &str) -> Result<GroupId> {
        let conn = self.db.conn()?;
        conn.execute("INSERT INTO user_groups (name) VALUES (?1)", [name])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    CmsError::AlreadyExists(format!("group {}", name))
                }
                other => other.into(),
            })?;
        Ok(GroupId(conn.last_insert_rowid()))
    }

    pub fn find_user(&self, name: &str) -> Result<UserId> {
        self.db
            .conn()?
            .query_row("SELECT user_id FROM users WHERE name = ?1", [name], |r| r.get(0))
            .optional()?
            .map(UserId)
            .ok_or_else(|| CmsError::NotFound(format!("user {}", name)))
    }

    pub fn find_group(&self, name: &str) -> Result<GroupId> {
        self.db
            .conn()?
            .query_row("SELECT group_id FROM user_groups WHERE name = ?1", [name], |r| r.get(0))
            .optional()?
            .map(GroupId)
            .ok_or_else(|| CmsError::NotFound(format!("group {}", name)))
    }

    pub fn delete_user(&self, id: UserId) -> Result<()> {
        self.db.conn()?.execute("DELETE FROM users WHERE user_id = ?1", [id.0])?;
        Ok(())
    }
}

impl UserDirectory for SqliteDirectory {
    fn user_name(&self, id: UserId) -> Result<String> {
        self.db
            .conn()?
            .query_row("SELECT name FROM users WHERE user_id = ?1", [id.0], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("user {}", id)))
    }

    fn group_name(&self, id: GroupId) -> Result<String> {
        self.db
            .conn()?
            .query_row("SELECT name FROM user_groups WHERE group_id = ?1", [id.0], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("group {}", id)))
    }
}
