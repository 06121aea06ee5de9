//! DCMS Core Library
//!
//! Persistence and publication core of a staged content repository:
//! - Resource tree store for the staging and the published tree
//! - Properties, projects, users and groups
//! - Content-addressed blob store (Fjall LSM-tree)
//! - Publish engine merging a staging project into the published tree
//! - Version/backup store with point-in-time snapshots
//! - Link graph index and broken-link detection

pub mod backup;
pub mod blob;
pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod export;
pub mod link_check;
pub mod links;
pub mod model;
pub mod permits;
pub mod projects;
pub mod properties;
pub mod publish;
pub mod report;
pub mod repository;
pub mod tree;

pub use backup::{BackupStore, DEFAULT_BACKUP_LIST_LIMIT, SqliteBackupStore};
pub use blob::{BlobId, BlobStore, FjallBlobStore, MemoryBlobStore};
pub use config::CmsConfig;
pub use database::{SqliteDatabase, TreeScope, UnitOfWork};
pub use directory::{SqliteDirectory, UserDirectory};
pub use error::{CmsError, Result};
pub use export::{DirectoryExport, ExportMirror, NoExport};
pub use link_check::LinkChecker;
pub use links::{LinkIndex, SqliteLinkIndex};
pub use model::{
    BackupProject, BackupResource, ContentId, FOLDER_TYPE, GroupId, ONLINE_PROJECT_ID, PLAIN_TYPE, Project,
    ProjectDraft, ProjectId, ProjectType, PropertyDefinition, PropertyMap, Resource, ResourceDraft, ResourceId,
    ResourceState, Timestamp, UserId, VersionId,
};
pub use permits::{PublishPermit, PublishPermits};
pub use projects::{ProjectStore, SqliteProjectStore};
pub use properties::{DefinitionScope, PropertyStore, SqlitePropertyStore};
pub use publish::{PublishEngine, PublishOutcome, PublishPlan};
pub use report::{BrokenLink, MemoryReport, ReportSink, TracingReport, Warning, WarningKind};
pub use repository::{CmsRepository, PublishOptions};
pub use tree::{ResourceTree, SqliteResourceTree};
