//! DCMS Administration CLI

mod import;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dcms_core::{
    CmsRepository, ProjectDraft, ProjectId, ProjectType, PublishOptions, Timestamp, TracingReport, VersionId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dcms-admin")]
#[command(author = "DCMS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DCMS repository administration and publishing tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init { path: String },

    /// Manage staging projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Import a local directory into a staging project
    Import {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        project: i64,
        #[arg(short, long)]
        dir: PathBuf,
        /// Staging folder receiving the tree
        #[arg(short, long, default_value = "/")]
        target: String,
    },

    /// Publish a staging project
    Publish {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        project: i64,
        /// Skip version snapshots for this publish
        #[arg(long)]
        no_history: bool,
        /// Report broken links before publishing
        #[arg(long)]
        check_links: bool,
    },

    /// Report links a publish of the project would break
    CheckLinks {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        project: i64,
    },

    /// List published versions, newest first
    Backups {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one published version
    ShowBackup {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: VersionId,
        #[arg(long)]
        json: bool,
    },

    /// Version history of one path
    History {
        #[arg(short, long)]
        repo: String,
        path: String,
    },

    /// Delete versions published before a date (YYYY-MM-DD) or a number of days ago
    Prune {
        #[arg(short, long)]
        repo: String,
        #[arg(long, conflicts_with = "days")]
        before: Option<String>,
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Create a staging project
    Create {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Remove the project after its first publish
        #[arg(long)]
        temporary: bool,
        /// Folders the project covers
        #[arg(long = "root", default_value = "/")]
        roots: Vec<String>,
    },

    /// List all projects
    List {
        #[arg(short, long)]
        repo: String,
    },
}

fn open(path: &str) -> Result<CmsRepository> {
    let repo = CmsRepository::open(Path::new(path))?;
    repo.initialize()
        .with_context(|| format!("Failed to initialize repository at {}", path))?;
    Ok(repo)
}

fn format_time(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn prune_cutoff(before: Option<String>, days: Option<i64>) -> Result<Timestamp> {
    match (before, days) {
        (Some(date), _) => {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .with_context(|| format!("Invalid date {:?}, expected YYYY-MM-DD", date))?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| anyhow::anyhow!("Invalid date {}", date))?;
            Ok(midnight.and_utc().timestamp_millis())
        }
        (None, Some(days)) => Ok((Utc::now() - chrono::Duration::days(days)).timestamp_millis()),
        (None, None) => anyhow::bail!("Either --before or --days is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init { path } => {
            println!("Initializing repository at {}", path);
            let repo = open(&path)?;
            println!("Repository initialized successfully (UUID: {})", repo.uuid());
        }

        Commands::Project { command: ProjectCommands::Create { repo, name, description, temporary, roots } } => {
            let repository = open(&repo)?;
            let admin = repository.admin()?;
            let online = repository.projects().online_project()?;
            let project = repository.create_project(
                &ProjectDraft {
                    name,
                    description,
                    owner: admin,
                    group: online.group,
                    manager_group: online.manager_group,
                    project_type: if temporary { ProjectType::Temporary } else { ProjectType::Normal },
                    task_id: 0,
                },
                &roots,
            )?;
            println!("Created project {} ({})", project.id, project.name);
        }

        Commands::Project { command: ProjectCommands::List { repo } } => {
            let repository = open(&repo)?;
            for project in repository.projects().read_all_projects()? {
                let roots = repository.projects().read_project_resources(project.id)?;
                println!(
                    "{:>4}  {:<20} {:?}  created {}  roots {}",
                    project.id,
                    project.name,
                    project.project_type,
                    format_time(project.date_created),
                    roots.join(", ")
                );
            }
        }

        Commands::Import { repo, project, dir, target } => {
            let repository = Arc::new(open(&repo)?);
            let admin = repository.admin()?;
            println!("Importing {:?} into project {} at {}", dir, project, target);
            let stats =
                import::import_directory(repository.clone(), ProjectId(project), admin, dir, target).await?;
            repository.flush()?;
            println!("Import complete!");
            println!("  Folders created: {}", stats.folders);
            println!("  Files created: {}", stats.created);
            println!("  Files updated: {}", stats.updated);
            println!("  Bytes: {}", stats.bytes);
        }

        Commands::Publish { repo, project, no_history, check_links } => {
            let repository = Arc::new(open(&repo)?);
            let mut options = PublishOptions::by(repository.admin()?);
            if no_history {
                options.historize = Some(false);
            }
            if check_links {
                options.check_links = Some(true);
            }
            let outcome = task::spawn_blocking(move || {
                repository.publish_project(ProjectId(project), &options, &TracingReport)
            })
            .await
            .map_err(|e| anyhow::anyhow!("Publish task failed: {:?}", e))??;

            println!("Publish complete!");
            if let Some(version) = outcome.version_id {
                println!("  Version: {}", version);
            }
            println!("  Created: {}", outcome.created.len());
            println!("  Changed: {}", outcome.changed.len());
            println!("  Deleted: {}", outcome.deleted.len());
            println!("  Temporary files purged: {}", outcome.purged_temporary.len());
            for link in &outcome.broken_links {
                println!("  Broken link: {}", link);
            }
            for warning in &outcome.warnings {
                println!("  Warning: {}", warning);
            }
        }

        Commands::CheckLinks { repo, project } => {
            let repository = open(&repo)?;
            let broken = repository.check_links(ProjectId(project), &TracingReport)?;
            if broken.is_empty() {
                println!("No broken links");
            }
            for link in broken {
                println!("{}", link);
            }
        }

        Commands::Backups { repo, limit, json } => {
            let repository = open(&repo)?;
            let versions = match limit {
                Some(limit) => repository.backups().read_all_backup_projects(limit)?,
                None => repository.read_all_backup_projects()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
                return Ok(());
            }
            for backup in versions {
                println!(
                    "{:>6}  {}  {:<20} by {}",
                    backup.version_id,
                    format_time(backup.published_at),
                    backup.name,
                    backup.published_by_name
                );
            }
        }

        Commands::ShowBackup { repo, version, json } => {
            let repository = open(&repo)?;
            let backup = repository.read_backup_project(version)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backup)?);
                return Ok(());
            }
            println!("Version:      {}", backup.version_id);
            println!("Project:      {} ({})", backup.name, backup.project_id);
            println!("Description:  {}", backup.description);
            println!("Type:         {:?}", backup.project_type);
            println!("Owner:        {}", backup.owner_name);
            println!("Group:        {}", backup.group_name);
            println!("Managers:     {}", backup.manager_group_name);
            println!("Created:      {}", format_time(backup.date_created));
            println!("Published:    {} by {}", format_time(backup.published_at), backup.published_by_name);
            println!("Roots:        {}", backup.resources.join(", "));
        }

        Commands::History { repo, path } => {
            let repository = open(&repo)?;
            for entry in repository.backups().read_all_file_headers_for_hist(&path)? {
                println!(
                    "{:>6}  {}  {:?}  {} bytes  modified by {}",
                    entry.version_id,
                    format_time(entry.published_at),
                    entry.resource.state,
                    entry.resource.length,
                    entry.last_modified_by_name
                );
            }
        }

        Commands::Prune { repo, before, days } => {
            let cutoff = prune_cutoff(before, days)?;
            let repository = open(&repo)?;
            let retained = repository.delete_backups_older_than(cutoff)?;
            println!("Deleted versions published before {}", format_time(cutoff));
            println!("Oldest retained version: {}", retained);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_cutoff_from_date() {
        let cutoff = prune_cutoff(Some("2024-01-02".into()), None).unwrap();
        assert_eq!(cutoff, 1_704_153_600_000);
        assert!(prune_cutoff(Some("02.01.2024".into()), None).is_err());
        assert!(prune_cutoff(None, None).is_err());
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from(["dcms-admin", "publish", "-r", "/tmp/repo", "-p", "2", "--check-links"]).unwrap();
        match cli.command {
            Commands::Publish { project, check_links, no_history, .. } => {
                assert_eq!(project, 2);
                assert!(check_links);
                assert!(!no_history);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
