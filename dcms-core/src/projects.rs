//! Project (staging area) store

use crate::database::SqliteDatabase;
use crate::error::{CmsError, Result};
use crate::model::{GroupId, ONLINE_PROJECT_ID, Project, ProjectDraft, ProjectId, ProjectType, UserId, now_millis};
use rusqlite::{OptionalExtension, Row, params};
use std::sync::Arc;

const PROJECT_COLUMNS: &str = "project_id, name, description, user_id, group_id, managergroup_id, project_flags, \
     project_type, task_id, date_created";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: ProjectId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        owner: UserId(row.get(3)?),
        group: GroupId(row.get(4)?),
        manager_group: GroupId(row.get(5)?),
        flags: row.get(6)?,
        project_type: ProjectType::from_code(row.get(7)?),
        task_id: row.get(8)?,
        date_created: row.get(9)?,
    })
}

pub trait ProjectStore: Send + Sync {
    fn create_project(&self, draft: &ProjectDraft) -> Result<Project>;

    fn read_project(&self, id: ProjectId) -> Result<Project>;

    fn read_all_projects(&self) -> Result<Vec<Project>>;

    /// Memberships first, then the project row
    fn delete_project(&self, id: ProjectId) -> Result<()>;

    fn add_project_resource(&self, project: ProjectId, root: &str) -> Result<()>;

    fn read_project_resources(&self, project: ProjectId) -> Result<Vec<String>>;

    fn online_project(&self) -> Result<Project> {
        self.read_project(ONLINE_PROJECT_ID)
    }
}

pub struct SqliteProjectStore {
    db: Arc<SqliteDatabase>,
}

impl SqliteProjectStore {
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }
}

impl ProjectStore for SqliteProjectStore {
    fn create_project(&self, draft: &ProjectDraft) -> Result<Project> {
        if draft.name.trim().is_empty() {
            return Err(CmsError::BadName("empty project name".into()));
        }
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO projects (name, description, task_id, user_id, group_id, managergroup_id, project_flags, \
             project_type, date_created) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                draft.name,
                draft.description,
                draft.task_id,
                draft.owner.0,
                draft.group.0,
                draft.manager_group.0,
                draft.project_type.code(),
                now_millis(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {} FROM projects WHERE project_id = ?1", PROJECT_COLUMNS),
            [id],
            project_from_row,
        )?)
    }

    fn read_project(&self, id: ProjectId) -> Result<Project> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {} FROM projects WHERE project_id = ?1", PROJECT_COLUMNS),
                [id.0],
                project_from_row,
            )
            .optional()?
            .ok_or_else(|| CmsError::NotFound(format!("project {}", id)))
    }

    fn read_all_projects(&self) -> Result<Vec<Project>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM projects ORDER BY project_id", PROJECT_COLUMNS))?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn delete_project(&self, id: ProjectId) -> Result<()> {
        self.db.with_savepoint("delete_project", |conn| {
            conn.execute("DELETE FROM project_resources WHERE project_id = ?1", [id.0])?;
            let removed = conn.execute("DELETE FROM projects WHERE project_id = ?1", [id.0])?;
            if removed == 0 {
                return Err(CmsError::NotFound(format!("project {}", id)));
            }
            Ok(())
        })
    }

    fn add_project_resource(&self, project: ProjectId, root: &str) -> Result<()> {
        self.db.conn()?.execute(
            "INSERT OR IGNORE INTO project_resources (project_id, resource_name) VALUES (?1, ?2)",
            params![project.0, root],
        )?;
        Ok(())
    }

    fn read_project_resources(&self, project: ProjectId) -> Result<Vec<String>> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT resource_name FROM project_resources WHERE project_id = ?1 ORDER BY resource_name")?;
        let rows = stmt.query_map([project.0], |r| r.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
