//! Archive Manager - Main entry point

use archive_manager::{AppConfig, AppState, Archive, ArchiveRun};
use clap::{Parser, Subcommand};
use restic_agent::stream::progress::{describe, format_bytes};
use restic_agent::MessageKind;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "archive-manager", version, about = "Versioned backups of local directories with restic")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run in the background, refreshing the archive cache periodically (default)
    Serve,
    /// List registered archives
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Register a directory as an archive
    Add {
        name: String,
        path: PathBuf,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Change an archive's name, path or comment
    Edit {
        archive_id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Remove an archive and forget all of its backups
    Remove { archive_id: i64 },
    /// Back up an archive now
    Backup {
        archive_id: i64,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Restore a backup over its archive directory
    Restore { record_id: i64 },
    /// Show the backups of an archive
    History {
        archive_id: i64,
        /// Also query repository usage of every backup
        #[arg(long)]
        stats: bool,
        #[arg(long)]
        json: bool,
    },
    /// Change the comment of a backup
    Note { record_id: i64, comment: String },
    /// Delete one backup and forget its snapshot
    Forget { record_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    restic_agent::utils::logger::init(&config.log_level)?;

    tracing::info!(data_dir = %config.data_dir.display(), "Starting archive manager");
    let state = AppState::init(config).await?;
    state.archives.restic().ensure_repository().await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&state).await,
        Command::List { json } => {
            let archives = state.archives.list_archives();
            if json {
                let plain: Vec<&Archive> = archives.iter().map(|a| &**a).collect();
                println!("{}", serde_json::to_string_pretty(&plain)?);
                return Ok(());
            }
            for archive in archives {
                println!("{:>4}  {:<24} {}  {}", archive.id, archive.name, archive.path, archive.comment);
            }
            Ok(())
        }
        Command::Add {
            name,
            path,
            comment,
        } => {
            let archive = state.archives.create_archive(&name, &path, &comment).await?;
            println!("Added archive {} ({})", archive.id, archive.name);
            Ok(())
        }
        Command::Edit {
            archive_id,
            name,
            path,
            comment,
        } => {
            let mut archive = (*state.archives.archive(archive_id).await?).clone();
            if let Some(name) = name {
                archive.name = name.trim().to_string();
            }
            if let Some(path) = path {
                archive.path = path.to_string_lossy().into_owned();
            }
            if let Some(comment) = comment {
                archive.comment = comment;
            }
            let archive = state.archives.update_archive(archive).await?;
            println!("Updated archive {} ({})", archive.id, archive.name);
            Ok(())
        }
        Command::Remove { archive_id } => {
            state.archives.delete_archive(archive_id).await?;
            println!("Removed archive {archive_id}");
            Ok(())
        }
        Command::Backup {
            archive_id,
            comment,
        } => {
            let mut run = state.archives.start_backup(archive_id).await?;
            follow(&state, &mut run).await;
            let record = state.archives.finish_backup(run, &comment).await?;
            println!("Backup {} saved as snapshot {}", record.id, record.short_snapshot());
            Ok(())
        }
        Command::Restore { record_id } => {
            let mut run = state.archives.start_restore(record_id).await?;
            follow(&state, &mut run).await;
            state.archives.finish_restore(run).await?;
            println!("Restore finished");
            Ok(())
        }
        Command::History {
            archive_id,
            stats,
            json,
        } => {
            let mut rows = Vec::new();
            for record in state.archives.records_for(archive_id).await? {
                let usage = if stats {
                    match state.archives.snapshot_stats(record.id).await {
                        Ok(s) => Some(s),
                        Err(e) => {
                            tracing::warn!(record_id = record.id, error = %e, "Failed to read snapshot stats");
                            None
                        }
                    }
                } else {
                    None
                };
                rows.push((record, usage));
            }

            if json {
                let rows: Vec<_> = rows
                    .iter()
                    .map(|(record, usage)| serde_json::json!({ "record": record, "stats": usage }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            for (record, usage) in rows {
                let mut line = format!(
                    "{:>4}  {}  {}  {}",
                    record.id,
                    record.created_at,
                    record.short_snapshot(),
                    record.comment
                );
                if let Some(s) = usage {
                    line.push_str(&format!(
                        "  stored {} / restores to {}",
                        format_bytes(s.raw.total_size),
                        format_bytes(s.restore.total_size)
                    ));
                }
                println!("{line}");
            }
            Ok(())
        }
        Command::Note { record_id, comment } => {
            let record = state.archives.update_record_comment(record_id, &comment).await?;
            println!("Updated backup {}", record.id);
            Ok(())
        }
        Command::Forget { record_id } => {
            state.archives.delete_backup(record_id).await?;
            println!("Deleted backup {record_id}");
            Ok(())
        }
    }
}

async fn serve(state: &AppState) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    state.scheduler.for_each_task(|task| {
        tracing::info!(task = task.key(), interval_secs = task.interval().as_secs(), "Scheduling task");
    });
    state.scheduler.start(cancel.clone());
    tracing::info!(
        archives = state.archives.cache().len(),
        refresh_secs = state.config.cache_refresh.as_secs(),
        "Archive manager running, press Ctrl+C to stop"
    );

    shutdown_signal(cancel.clone()).await;

    tracing::info!("Shutting down...");
    for run in state.archives.runs().active() {
        tracing::info!(archive_id = run.archive_id, kind = %run.kind, started_at = %run.started_at, "Stopping active run");
    }
    let cancelled = state.archives.runs().cancel_all();
    if cancelled > 0 {
        tracing::info!(cancelled, "Cancelled active runs");
    }
    tracing::info!("Archive manager stopped");
    Ok(())
}

/// Print a run's progress until it ends; Ctrl+C cancels the run once
async fn follow(state: &AppState, run: &mut ArchiveRun) {
    let mut interrupted = false;
    loop {
        tokio::select! {
            msg = run.recv() => {
                let Some(msg) = msg else { break };
                if msg.message_type == MessageKind::Status {
                    if let Some(line) = describe(&msg) {
                        eprint!("\r{line}");
                    }
                } else if let Some(line) = describe(&msg) {
                    eprintln!("\r{line}");
                }
            }
            _ = signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!(archive_id = run.archive().id, kind = %run.kind(), "Interrupted, cancelling run");
                state.archives.cancel(run.archive().id);
            }
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
