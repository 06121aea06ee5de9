//! Filesystem mirror of published files
//!
//! After a file is published its content can be written below an export
//! root so a plain web server can serve it. Only paths below one of the
//! configured export points are mirrored.

use crate::error::{CmsError, Result};
use std::path::PathBuf;

/// Best-effort sink for published content
pub trait ExportMirror: Send + Sync {
    fn export(&self, path: &str, content: &[u8]) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;
}

/// Mirror that exports nothing
pub struct NoExport;

impl ExportMirror for NoExport {
    fn export(&self, _path: &str, _content: &[u8]) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

/// Writes published files below `root`
pub struct DirectoryExport {
    root: PathBuf,
    export_points: Vec<String>,
}

impl DirectoryExport {
    pub fn new(root: PathBuf, export_points: Vec<String>) -> Self {
        Self { root, export_points }
    }

    /// Local path for `path`, `None` when it is outside every export point
    fn target(&self, path: &str) -> Result<Option<PathBuf>> {
        if !self.export_points.iter().any(|p| path.starts_with(p.as_str())) {
            return Ok(None);
        }
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|seg| seg == "..") {
            return Err(CmsError::BadName(format!("{} escapes the export root", path)));
        }
        Ok(Some(self.root.join(relative)))
    }
}

impl ExportMirror for DirectoryExport {
    fn export(&self, path: &str, content: &[u8]) -> Result<()> {
        let Some(target) = self.target(path)? else {
            return Ok(());
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
        tracing::debug!("Exported {} to {:?}", path, target);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let Some(target) = self.target(path)? else {
            return Ok(());
        };
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
