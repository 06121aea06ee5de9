//! Repository configuration stored at `repo/dcms-config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "dcms-config.json";

/// Tunables for editing, publishing and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmsConfig {
    /// Write backups (version snapshots) on publish.
    pub historize: bool,
    /// Files whose name starts with this prefix never publish.
    #[serde(default = "default_temp_file_prefix")]
    pub temp_file_prefix: String,
    /// Upper bound for a resource path in bytes.
    pub max_path_length: usize,
    /// Cap for `read_all_backup_projects`.
    pub backup_list_limit: usize,
    /// Resource type whose link entries are mirrored into the online index.
    pub link_resource_type: i32,
    /// Run the broken link check before every publish.
    pub check_links_before_publish: bool,
    /// Directory receiving exported copies of published files.
    pub export_root: Option<PathBuf>,
    /// Path prefixes mirrored into `export_root` (`["/"]` exports everything).
    #[serde(default = "default_export_points")]
    pub export_points: Vec<String>,
    /// Entries kept in the blob read cache.
    pub blob_cache_capacity: usize,
}

fn default_temp_file_prefix() -> String {
    "~".to_string()
}

fn default_export_points() -> Vec<String> {
    vec!["/".to_string()]
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            historize: true,
            temp_file_prefix: default_temp_file_prefix(),
            max_path_length: 248,
            backup_list_limit: 300,
            link_resource_type: crate::model::PLAIN_TYPE,
            check_links_before_publish: false,
            export_root: None,
            export_points: default_export_points(),
            blob_cache_capacity: 256,
        }
    }
}

impl CmsConfig {
    /// Load config from a repository path, falling back to defaults.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: CmsConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        Ok(config)
    }

    /// Save config to a repository path.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// Whether `path` names a temporary file that must never publish.
    pub fn is_temporary(&self, path: &str) -> bool {
        !self.temp_file_prefix.is_empty()
            && !path.ends_with('/')
            && crate::model::resource_name(path).starts_with(&self.temp_file_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = CmsConfig::load(tmp.path()).unwrap();
        assert!(config.historize);
        assert_eq!(config.backup_list_limit, 300);
        assert_eq!(config.temp_file_prefix, "~");
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let mut config = CmsConfig::default();
        config.historize = false;
        config.export_points = vec!["/site/".into()];
        config.save(tmp.path()).unwrap();

        let loaded = CmsConfig::load(tmp.path()).unwrap();
        assert!(!loaded.historize);
        assert_eq!(loaded.export_points, vec!["/site/".to_string()]);
        assert!(!tmp.path().join("dcms-config.tmp").exists());
    }

    #[test]
    fn test_temporary_names() {
        let config = CmsConfig::default();
        assert!(config.is_temporary("/site/~index.html"));
        assert!(!config.is_temporary("/site/index.html"));
        assert!(!config.is_temporary("/~drafts/"));
        assert!(!config.is_temporary("/~drafts/page.html"));
    }
}
