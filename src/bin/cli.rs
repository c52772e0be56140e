//! Session Sync CLI
//!
//! Classify and resolve conflicts between two session snapshot files, and
//! inspect backups, resolution history and sync state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_sync::storage::HistoryFilter;
use session_sync::sync::conflict::{
    ClassifyOptions, ConflictClassifier, ConflictDetails, ResolutionStrategy, StrategyKind,
};
use session_sync::sync::SnapshotProvider;
use session_sync::{
    HostIdentity, IdentityProvider, SessionSnapshot, StaticIdentity, SyncConfig, SyncEngine,
    Version,
};

#[derive(Parser)]
#[command(name = "session-sync")]
#[command(about = "Conflict detection and resolution for replicated chat sessions")]
#[command(version)]
struct Cli {
    /// Directory for backups and the resolution history
    #[arg(
        long,
        env = "SESSION_SYNC_BACKUP_DIR",
        default_value = "~/.local/share/session-sync/backups"
    )]
    backup_dir: String,

    /// SQLite database holding sync baselines
    #[arg(
        long,
        env = "SESSION_SYNC_STATE_DB",
        default_value = "~/.local/share/session-sync/sync-state.db"
    )]
    state_db: String,

    /// Backup retention in days
    #[arg(long, env = "SESSION_SYNC_RETENTION_DAYS", default_value = "30")]
    retention_days: i64,

    /// Maximum resolution history entries kept
    #[arg(long, env = "SESSION_SYNC_HISTORY_LIMIT", default_value = "100")]
    history_limit: usize,

    /// Timeout for each store or provider call
    #[arg(long, env = "SESSION_SYNC_IO_TIMEOUT_MS", default_value = "10000")]
    io_timeout_ms: u64,

    /// Retries for transient snapshot read failures
    #[arg(long, env = "SESSION_SYNC_MAX_IO_RETRIES", default_value = "3")]
    max_io_retries: u32,

    /// Treat diverging versions without a baseline as a conflict
    #[arg(long, env = "SESSION_SYNC_REQUIRE_BASELINE")]
    require_baseline: bool,

    /// Device id used when stamping versions (default: derived from host)
    #[arg(long, env = "SESSION_SYNC_DEVICE_ID")]
    device_id: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "SESSION_SYNC_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the divergence between two snapshot files
    Classify {
        /// Local snapshot (JSON)
        local: PathBuf,
        /// Cloud snapshot (JSON)
        cloud: PathBuf,
        /// Baseline version (JSON); defaults to the stored baseline
        #[arg(short, long)]
        baseline: Option<PathBuf>,
        /// Human-readable output instead of JSON
        #[arg(short, long)]
        text: bool,
    },
    /// Resolve a conflict with an explicit strategy
    Resolve {
        local: PathBuf,
        cloud: PathBuf,
        /// keep_local, keep_cloud, manual_merge, merge_metadata or auto_merge
        #[arg(short, long)]
        strategy: String,
        /// Merged snapshot for manual_merge
        #[arg(short, long)]
        merged: Option<PathBuf>,
        #[arg(short, long)]
        baseline: Option<PathBuf>,
        /// Write the resolved snapshot here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Classify and auto-merge when lossless
    Reconcile {
        session_id: String,
        local: PathBuf,
        cloud: PathBuf,
    },
    /// Record that both replicas hold the version in a snapshot file
    MarkSynced {
        snapshot: PathBuf,
    },
    /// List backups
    Backups {
        /// Only this session
        session_id: Option<String>,
        /// Plain-text report
        #[arg(short, long)]
        report: bool,
    },
    /// Print the session stored in a backup
    Restore {
        backup_id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show resolution history, newest first
    History {
        #[arg(short, long)]
        session_id: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete expired backups
    Purge,
    /// Show stored sync state
    Status {
        session_id: Option<String>,
    },
}

/// Snapshot provider over a JSON file; a missing file is a missing replica
struct FileSnapshotProvider {
    path: PathBuf,
}

#[async_trait]
impl SnapshotProvider for FileSnapshotProvider {
    async fn fetch(&self, _session_id: &str) -> session_sync::Result<Option<SessionSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn init_logging(json: bool) {
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            println!("Written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Explicit baseline file, else the stored one for the local session
fn baseline_for(
    engine: &SyncEngine,
    local: &SessionSnapshot,
    baseline: Option<&Path>,
) -> anyhow::Result<ClassifyOptions> {
    let last_synced_version = match baseline {
        Some(path) => Some(read_json::<Version>(path)?),
        None => engine.state().last_synced_version(local.session_id())?,
    };
    Ok(ClassifyOptions {
        last_synced_version,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = SyncConfig {
        backup_dir: PathBuf::from(shellexpand::tilde(&cli.backup_dir).to_string()),
        retention_days: cli.retention_days,
        history_limit: cli.history_limit,
        io_timeout_ms: cli.io_timeout_ms,
        max_io_retries: cli.max_io_retries,
        require_baseline: cli.require_baseline,
        state_db_path: Some(PathBuf::from(shellexpand::tilde(&cli.state_db).to_string())),
    };

    let identity: Arc<dyn IdentityProvider> = match cli.device_id {
        Some(id) => Arc::new(StaticIdentity::new(id)),
        None => Arc::new(HostIdentity::new()),
    };
    let engine = SyncEngine::new(config, identity)?;

    match cli.command {
        Commands::Classify {
            local,
            cloud,
            baseline,
            text,
        } => {
            let local: SessionSnapshot = read_json(&local)?;
            let cloud: SessionSnapshot = read_json(&cloud)?;
            let options = baseline_for(&engine, &local, baseline.as_deref())?;

            let report = engine.classify_conflict(Some(&local), Some(&cloud), &options);
            let assessment = engine.assess_auto_merge(&report);
            let strategies = engine.recommend_strategies(&report);

            if text {
                println!("{}", ConflictClassifier::render_report(&report));
                if report.has_conflict {
                    println!();
                    println!("{}", ConflictDetails::from_report(&report).render());
                }
                println!();
                println!("Auto-merge: {} ({})", assessment.can_auto_merge, assessment.reason);
                let names: Vec<&str> = strategies.iter().map(|s| s.as_str()).collect();
                println!("Recommended: {}", names.join(", "));
            } else {
                write_json(
                    &serde_json::json!({
                        "report": report,
                        "assessment": assessment,
                        "recommendedStrategies": strategies,
                    }),
                    None,
                )?;
            }
        }

        Commands::Resolve {
            local,
            cloud,
            strategy,
            merged,
            baseline,
            output,
        } => {
            let kind: StrategyKind = strategy.parse()?;
            let local: SessionSnapshot = read_json(&local)?;
            let cloud: SessionSnapshot = read_json(&cloud)?;
            let merged: Option<SessionSnapshot> = merged.as_deref().map(read_json).transpose()?;
            if merged.is_some() && kind != StrategyKind::ManualMerge {
                bail!("--merged only applies to manual_merge");
            }

            let options = baseline_for(&engine, &local, baseline.as_deref())?;
            let report = engine.classify_conflict(Some(&local), Some(&cloud), &options);
            let result = engine
                .resolve(&report, ResolutionStrategy::from_kind(kind, merged)?)
                .await?;

            match (&result.resolved_session, output) {
                (Some(resolved), Some(path)) => write_json(resolved, Some(&path))?,
                _ => write_json(&result, None)?,
            }
        }

        Commands::Reconcile {
            session_id,
            local,
            cloud,
        } => {
            let outcome = engine
                .reconcile(
                    &session_id,
                    &FileSnapshotProvider { path: local },
                    &FileSnapshotProvider { path: cloud },
                )
                .await?;
            write_json(&outcome, None)?;
        }

        Commands::MarkSynced { snapshot } => {
            let snapshot: SessionSnapshot = read_json(&snapshot)?;
            engine.mark_synced(snapshot.session_id(), snapshot.version(), None)?;
            println!(
                "Baseline for {} set to {}",
                snapshot.session_id(),
                snapshot.version()
            );
        }

        Commands::Backups { session_id, report } => {
            if report {
                println!("{}", engine.backup_report(session_id.as_deref()).await?);
            } else {
                for backup in engine.list_backups(session_id.as_deref()).await? {
                    println!(
                        "{} [{}] {} - {} messages, expires {}",
                        backup.backup_id,
                        backup.backup_type,
                        backup.session_id,
                        backup.session.messages.len(),
                        backup.expires_at.format("%Y-%m-%d")
                    );
                }
            }
        }

        Commands::Restore { backup_id, output } => {
            let session = engine.restore_backup(&backup_id).await?;
            write_json(&session, output.as_deref())?;
        }

        Commands::History { session_id, limit } => {
            let filter = HistoryFilter {
                session_id,
                limit: Some(limit),
            };
            for entry in engine.get_resolution_history(&filter).await? {
                println!(
                    "{} {} {} ({}, {}) -> {}{}",
                    entry.resolved_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.session_id,
                    entry.conflict_type,
                    entry.conflict_severity,
                    entry.conflict_reason,
                    entry.resolution_strategy,
                    if entry.success { "" } else { " [FAILED]" }
                );
            }
        }

        Commands::Purge => {
            let report = engine.purge_expired_backups().await?;
            println!("Deleted {} expired backups", report.deleted.len());
            for failure in &report.errors {
                eprintln!("  {}: {}", failure.backup_id, failure.error);
            }
        }

        Commands::Status { session_id } => {
            let statuses = match session_id {
                Some(id) => engine.state().status(&id)?.into_iter().collect(),
                None => engine.state().list()?,
            };
            write_json(&statuses, None)?;
        }
    }

    Ok(())
}
