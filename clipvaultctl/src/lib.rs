use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;

use clipvault_core::{ArchiveStore, ResourceFilter, ResourceRecord};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipvault_core::ConfigError),
    #[error("archive error: {0}")]
    Archive(#[from] clipvault_core::ArchiveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "clipvault archive inspection tool", long_about = None)]
pub struct Cli {
    /// Path to clipvault.toml
    #[arg(long, default_value = "configs/clipvault.toml")]
    pub config: PathBuf,
    /// Override path to the archive database
    #[arg(long)]
    pub archive_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summarize the archive contents
    Status,
    /// List archived resources
    Resources(ResourceListArgs),
    /// List resources whose attachment URL expires soon
    Expiring(ExpiringArgs),
    /// Write a compressed SQL dump of the archive
    Backup(BackupArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

#[derive(Args, Debug)]
pub struct ResourceListArgs {
    /// Filter by poster name
    #[arg(long)]
    pub poster: Option<String>,
    /// Filter by channel id
    #[arg(long)]
    pub channel: Option<String>,
    /// Maximum number of rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct ExpiringArgs {
    /// Window in seconds from now
    #[arg(long, default_value_t = 86400)]
    pub within: i64,
    /// Maximum number of rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Destination file (gzip'd SQL)
    pub output: PathBuf,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "clipvaultctl", &mut std::io::stdout());
        return Ok(());
    }
    let store = open_store(&cli)?;
    match &cli.command {
        Commands::Status => status(&store, cli.format),
        Commands::Resources(args) => list_resources(&store, args, cli.format),
        Commands::Expiring(args) => list_expiring(&store, args, cli.format),
        Commands::Backup(args) => {
            store.export_backup(&args.output)?;
            println!("backup written to {}", args.output.display());
            Ok(())
        }
        // Handled before the store is opened.
        Commands::Completions(_) => Ok(()),
    }
}

fn open_store(cli: &Cli) -> Result<ArchiveStore> {
    let path = match &cli.archive_db {
        Some(path) => path.clone(),
        None => {
            let config = clipvault_core::load_clipvault_config(&cli.config)?;
            config
                .resolve_path(&config.paths.data_dir)
                .join("archive.sqlite")
        }
    };
    Ok(ArchiveStore::builder()
        .path(path)
        .read_only(false)
        .create_if_missing(false)
        .build()?)
}

fn status(store: &ArchiveStore, format: OutputFormat) -> Result<()> {
    let summary = store.summary()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("resources:           {}", summary.resources);
            println!("posters:             {}", summary.posters);
            println!("durations recorded:  {}", summary.durations_recorded);
            println!("with expiry:         {}", summary.with_expiry);
            match summary.next_expire_at {
                Some(ts) => println!("next expiry:         {}", format_instant(ts)),
                None => println!("next expiry:         none"),
            }
        }
    }
    Ok(())
}

fn list_resources(store: &ArchiveStore, args: &ResourceListArgs, format: OutputFormat) -> Result<()> {
    let records = store.list_resources(&ResourceFilter {
        poster: args.poster.clone(),
        channel: args.channel.clone(),
        limit: Some(args.limit),
    })?;
    print_records(&records, format)
}

fn list_expiring(store: &ArchiveStore, args: &ExpiringArgs, format: OutputFormat) -> Result<()> {
    let cutoff = Utc::now().timestamp() + args.within;
    let records = store.expiring_before(cutoff, args.limit)?;
    print_records(&records, format)
}

fn print_records(records: &[ResourceRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("no matching resources");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:<20}  {:<18}  expires {}  duration {}",
                    record.id,
                    truncate(&record.poster_name, 20),
                    truncate(&record.channel_id, 18),
                    record
                        .expire_at
                        .map(format_instant)
                        .unwrap_or_else(|| "never".into()),
                    record
                        .duration_s
                        .map(|d| format!("{d:.1}s"))
                        .unwrap_or_else(|| "unknown".into()),
                );
            }
        }
    }
    Ok(())
}

fn format_instant(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => format!("@{ts}"),
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let truncated: String = value.chars().take(max.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipvault_core::MessageDraft;
    use tempfile::TempDir;

    fn seeded_store(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("archive.sqlite");
        let store = ArchiveStore::new(&path).unwrap();
        store.initialize().unwrap();
        store
            .upsert_messages(&[MessageDraft {
                id: "abc123".into(),
                platform_message_id: "msg-1".into(),
                poster_name: "gamer".into(),
                posted_at: 1700000000.0,
                permalink: String::new(),
                description: String::new(),
                attachment_url: "https://cdn.example.com/clip.mp4".into(),
                filename: "clip".into(),
                expire_at: Some(1735689600),
                channel_id: "chan-1".into(),
            }])
            .unwrap();
        path
    }

    #[test]
    fn status_runs_against_a_seeded_archive() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir);
        let cli = Cli::parse_from([
            "clipvaultctl",
            "--archive-db",
            path.to_str().unwrap(),
            "--format",
            "json",
            "status",
        ]);
        run(cli).expect("status should succeed");
    }

    #[test]
    fn resource_listing_honors_filters() {
        let dir = TempDir::new().unwrap();
        let path = seeded_store(&dir);
        let store = ArchiveStore::new(&path).unwrap();
        let records = store
            .list_resources(&ResourceFilter {
                poster: Some("gamer".into()),
                channel: None,
                limit: Some(10),
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        let none = store
            .list_resources(&ResourceFilter {
                poster: Some("nobody".into()),
                channel: None,
                limit: Some(10),
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
