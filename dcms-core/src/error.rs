//! Error types shared by every DCMS store and the publish engine

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, CmsError>;

/// Errors that can occur while reading, editing or publishing the tree
#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Folder is not empty: {0}")]
    NotEmpty(String),

    #[error("Bad resource name: {0}")]
    BadName(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Project {0} is already being published")]
    PublishInProgress(i64),

    /// The primary write for `path` failed. Everything in `completed` was
    /// already merged into the online tree and stays there.
    #[error("Publish aborted at {path} after {} change(s): {source}", .completed.len())]
    PublishAborted {
        path: String,
        completed: Vec<String>,
        #[source]
        source: Box<CmsError>,
    },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CmsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CmsError::NotFound(_))
    }
}

impl From<rusqlite::Error> for CmsError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => CmsError::NotFound("query returned no rows".into()),
            other => CmsError::Store(other.to_string()),
        }
    }
}

impl From<bincode::Error> for CmsError {
    fn from(e: bincode::Error) -> Self {
        CmsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CmsError {
    fn from(e: serde_json::Error) -> Self {
        CmsError::Serialization(e.to_string())
    }
}
