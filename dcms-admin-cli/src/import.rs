//! Import a local directory tree into a staging project
//!
//! Folders are created when missing, files are created or overwritten. The
//! walk is sorted so parents always exist before their children.

use anyhow::{Context, Result};
use dcms_core::{CmsRepository, PLAIN_TYPE, ProjectId, ResourceState, TreeScope, UserId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;

#[derive(Debug, Default)]
pub struct ImportStats {
    pub folders: u64,
    pub created: u64,
    pub updated: u64,
    pub bytes: u64,
}

/// Import `dir` below the staging folder `target` of `project`.
///
/// Runs on the blocking pool since every step is a synchronous store call.
pub async fn import_directory(
    repo: Arc<CmsRepository>,
    project: ProjectId,
    user: UserId,
    dir: PathBuf,
    target: String,
) -> Result<ImportStats> {
    task::spawn_blocking(move || import_directory_blocking(&repo, project, user, &dir, &target))
        .await
        .map_err(|e| anyhow::anyhow!("Import task failed: {:?}", e))?
}

fn import_directory_blocking(
    repo: &CmsRepository,
    project: ProjectId,
    user: UserId,
    dir: &Path,
    target: &str,
) -> Result<ImportStats> {
    let start = Instant::now();
    let mut stats = ImportStats::default();
    let target = if target.ends_with('/') { target.to_string() } else { format!("{}/", target) };
    ensure_folder(repo, project, user, &target, &mut stats)?;
    walk(repo, project, user, dir, &target, &mut stats)?;

    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!(
        "Imported {:?} in {:.1}s: {} folder(s), {} new file(s), {} updated",
        dir,
        elapsed,
        stats.folders,
        stats.created,
        stats.updated
    );
    Ok(stats)
}

fn walk(
    repo: &CmsRepository,
    project: ProjectId,
    user: UserId,
    dir: &Path,
    folder: &str,
    stats: &mut ImportStats,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {:?}", dir))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let path = format!("{}{}/", folder, name);
            ensure_folder(repo, project, user, &path, stats)?;
            walk(repo, project, user, &entry.path(), &path, stats)?;
        } else if file_type.is_file() {
            let path = format!("{}{}", folder, name);
            let content = fs::read(entry.path()).with_context(|| format!("Failed to read {:?}", entry.path()))?;
            stats.bytes += content.len() as u64;
            if is_live(repo, &path)? {
                repo.write_file(project, &path, &content, user)
                    .with_context(|| format!("Failed to update {}", path))?;
                stats.updated += 1;
            } else {
                repo.create_file(project, &path, PLAIN_TYPE, &content, user)
                    .with_context(|| format!("Failed to create {}", path))?;
                stats.created += 1;
            }
            tracing::debug!("Imported {}", path);
        } else {
            tracing::warn!("Skipping {:?}: not a regular file", entry.path());
        }
    }
    Ok(())
}

fn ensure_folder(repo: &CmsRepository, project: ProjectId, user: UserId, path: &str, stats: &mut ImportStats) -> Result<()> {
    if path == "/" || is_live(repo, path)? {
        return Ok(());
    }
    repo.create_folder(project, path, user)
        .with_context(|| format!("Failed to create folder {}", path))?;
    stats.folders += 1;
    Ok(())
}

fn is_live(repo: &CmsRepository, path: &str) -> Result<bool> {
    Ok(repo
        .tree()
        .lookup(TreeScope::Offline, path)?
        .is_some_and(|r| r.state != ResourceState::Deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcms_core::{CmsConfig, ProjectDraft, ProjectType};
    use tempfile::TempDir;

    #[test]
    fn test_import_creates_then_updates() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("site/css")).unwrap();
        fs::write(src.path().join("site/index.html"), b"<html/>").unwrap();
        fs::write(src.path().join("site/css/main.css"), b"body {}").unwrap();

        let repo = CmsRepository::open_in_memory(CmsConfig::default()).unwrap();
        repo.initialize().unwrap();
        let admin = repo.admin().unwrap();
        let users = repo.users_group().unwrap();
        let project = repo
            .create_project(
                &ProjectDraft {
                    name: "Import".into(),
                    description: String::new(),
                    owner: admin,
                    group: users,
                    manager_group: users,
                    project_type: ProjectType::Normal,
                    task_id: 0,
                },
                &["/".to_string()],
            )
            .unwrap()
            .id;

        let stats = import_directory_blocking(&repo, project, admin, src.path(), "/").unwrap();
        assert_eq!(stats.folders, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(repo.read_content(TreeScope::Offline, "/site/css/main.css").unwrap().as_ref(), b"body {}");

        fs::write(src.path().join("site/index.html"), b"<html>2</html>").unwrap();
        let stats = import_directory_blocking(&repo, project, admin, src.path(), "/").unwrap();
        assert_eq!(stats.folders, 0);
        assert_eq!(stats.updated, 2);
        assert_eq!(
            repo.read_content(TreeScope::Offline, "/site/index.html").unwrap().as_ref(),
            b"<html>2</html>"
        );
    }
}
