//! Core data model for DCMS
//!
//! Resources, projects, properties and the historical backup records written
//! at publish time. Timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Resource identity, stable across renames within one tree
    ResourceId
);
id_type!(
    /// Identity of a content row; distinct from the resource identity
    ContentId
);
id_type!(ProjectId);
id_type!(UserId);
id_type!(GroupId);
id_type!(PropertyDefId);

/// Backup version id. Starts at 1, shared by project and resource backups.
pub type VersionId = i64;

/// Unix milliseconds
pub type Timestamp = i64;

/// Property name -> value
pub type PropertyMap = BTreeMap<String, String>;

/// The single published project
pub const ONLINE_PROJECT_ID: ProjectId = ProjectId(1);

/// Type code of folders; every other code is a file type
pub const FOLDER_TYPE: i32 = 0;

/// Default file type code (plain content)
pub const PLAIN_TYPE: i32 = 1;

/// Current time in Unix milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a staging resource relative to the online tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Unchanged,
    Changed,
    New,
    Deleted,
}

impl ResourceState {
    pub fn code(self) -> i64 {
        match self {
            ResourceState::Unchanged => 0,
            ResourceState::Changed => 1,
            ResourceState::New => 2,
            ResourceState::Deleted => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ResourceState::Unchanged),
            1 => Some(ResourceState::Changed),
            2 => Some(ResourceState::New),
            3 => Some(ResourceState::Deleted),
            _ => None,
        }
    }
}

/// A file or folder row in either tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    /// `None` only for the root folder
    pub parent_id: Option<ResourceId>,
    /// `None` for folders
    pub content_id: Option<ContentId>,
    /// Absolute path; folders end with `/`
    pub path: String,
    pub resource_type: i32,
    pub flags: i32,
    pub owner: UserId,
    pub group: GroupId,
    /// Project that last modified the resource
    pub project_id: ProjectId,
    pub access_flags: i32,
    pub state: ResourceState,
    /// `None` = unlocked
    pub locked_by: Option<UserId>,
    pub locked_in_project: ProjectId,
    pub date_created: Timestamp,
    pub date_last_modified: Timestamp,
    pub last_modified_by: UserId,
    pub length: i64,
}

impl Resource {
    pub fn is_folder(&self) -> bool {
        self.resource_type == FOLDER_TYPE
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Locked by somebody working in a project other than `project`
    pub fn is_locked_outside(&self, project: ProjectId) -> bool {
        self.is_locked() && self.locked_in_project != project
    }

    /// Last path segment without the trailing slash of folders
    pub fn name(&self) -> &str {
        resource_name(&self.path)
    }
}

/// Last path segment of `path`, ignoring a trailing `/`
pub fn resource_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Path of the folder containing `path`, `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map(|pos| trimmed[..=pos].to_string())
}

/// Attributes of a resource about to be created; identities are assigned by
/// the tree store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDraft {
    pub parent_id: Option<ResourceId>,
    pub path: String,
    pub resource_type: i32,
    pub flags: i32,
    pub owner: UserId,
    pub group: GroupId,
    pub project_id: ProjectId,
    pub access_flags: i32,
    pub state: ResourceState,
    pub locked_by: Option<UserId>,
    pub locked_in_project: ProjectId,
    pub date_created: Timestamp,
    pub date_last_modified: Timestamp,
    pub last_modified_by: UserId,
}

impl ResourceDraft {
    /// Online twin of a staging resource: unlocked, `UNCHANGED`, owned by the
    /// `online` project, attached to `online_parent`.
    pub fn published_from(staging: &Resource, online_parent: Option<ResourceId>, online: ProjectId) -> Self {
        Self {
            parent_id: online_parent,
            path: staging.path.clone(),
            resource_type: staging.resource_type,
            flags: staging.flags,
            owner: staging.owner,
            group: staging.group,
            project_id: online,
            access_flags: staging.access_flags,
            state: ResourceState::Unchanged,
            locked_by: None,
            locked_in_project: online,
            date_created: staging.date_created,
            date_last_modified: staging.date_last_modified,
            last_modified_by: staging.last_modified_by,
        }
    }
}

/// Normal staging area or a throwaway one removed after its first publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectType {
    Normal,
    Temporary,
}

impl ProjectType {
    pub fn code(self) -> i64 {
        match self {
            ProjectType::Normal => 0,
            ProjectType::Temporary => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 { ProjectType::Temporary } else { ProjectType::Normal }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub owner: UserId,
    pub group: GroupId,
    pub manager_group: GroupId,
    pub flags: i32,
    pub project_type: ProjectType,
    pub task_id: i64,
    pub date_created: Timestamp,
}

impl Project {
    pub fn is_online(&self) -> bool {
        self.id == ONLINE_PROJECT_ID
    }
}

/// Attributes for a new project; the id is allocated by the project store
#[derive(Debug, Clone)]
pub struct ProjectDraft {
    pub name: String,
    pub description: String,
    pub owner: UserId,
    pub group: GroupId,
    pub manager_group: GroupId,
    pub project_type: ProjectType,
    pub task_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: PropertyDefId,
    pub name: String,
    pub resource_type: i32,
}

/// Project row as it looked when a version was published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProject {
    pub version_id: VersionId,
    pub project_id: ProjectId,
    pub name: String,
    pub description: String,
    pub task_id: i64,
    pub owner: UserId,
    pub owner_name: String,
    pub group: GroupId,
    pub group_name: String,
    pub manager_group: GroupId,
    pub manager_group_name: String,
    pub flags: i32,
    pub project_type: ProjectType,
    pub date_created: Timestamp,
    pub published_at: Timestamp,
    pub published_by: UserId,
    pub published_by_name: String,
    /// Membership roots at publish time
    pub resources: Vec<String>,
}

/// Resource header, names and properties captured at one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResource {
    pub version_id: VersionId,
    pub published_at: Timestamp,
    pub resource: Resource,
    pub owner_name: String,
    pub group_name: String,
    pub last_modified_by_name: String,
    pub properties: PropertyMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_roundtrip() {
        for state in [
            ResourceState::Unchanged,
            ResourceState::Changed,
            ResourceState::New,
            ResourceState::Deleted,
        ] {
            assert_eq!(ResourceState::from_code(state.code()), Some(state));
        }
        assert_eq!(ResourceState::from_code(7), None);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(resource_name("/site/index.html"), "index.html");
        assert_eq!(resource_name("/site/"), "site");
        assert_eq!(parent_path("/site/index.html").as_deref(), Some("/site/"));
        assert_eq!(parent_path("/site/").as_deref(), Some("/"));
        assert_eq!(parent_path("/a/b/c/").as_deref(), Some("/a/b/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_locked_outside() {
        let mut r = Resource {
            id: ResourceId(5),
            parent_id: Some(ResourceId(1)),
            content_id: None,
            path: "/a/".into(),
            resource_type: FOLDER_TYPE,
            flags: 0,
            owner: UserId(1),
            group: GroupId(1),
            project_id: ProjectId(2),
            access_flags: 0,
            state: ResourceState::New,
            locked_by: None,
            locked_in_project: ProjectId(2),
            date_created: 0,
            date_last_modified: 0,
            last_modified_by: UserId(1),
            length: 0,
        };
        assert!(!r.is_locked_outside(ProjectId(2)));
        r.locked_by = Some(UserId(3));
        assert!(!r.is_locked_outside(ProjectId(2)));
        r.locked_in_project = ProjectId(9);
        assert!(r.is_locked_outside(ProjectId(2)));
        assert!(r.is_folder());
    }
}
