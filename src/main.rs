// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! NVR — Network Video Recorder
//!
//! Usage:
//!   nvr run     --config config.toml
//!   nvr status  --config config.toml
//!   nvr list    --config config.toml --stream cam1
//!   nvr export  --config config.toml --stream cam1 --from <us> --to <us> -o output.mp4
//!   nvr check   --config config.toml
//!   nvr backup  --config config.toml -o catalog.bak
//!   nvr restore --config config.toml --from catalog.bak

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nvr::api;
use nvr::catalog::{Catalog, QueryParams, SortOrder, TimeRange};
use nvr::config::Config;
use nvr::error::NvrError;
use nvr::manager::Manager;
use nvr::playback;

#[derive(Parser)]
#[command(name = "nvr", about = "Network Video Recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start recording all enabled streams and (if configured) the HTTP API.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List recorded segments for a stream.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stream id to list segments for.
        #[arg(long)]
        stream: String,
    },
    /// Export recorded video for a stream in a time range to a single file.
    Export {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stream id.
        #[arg(long)]
        stream: String,
        /// Start of range, microseconds since the Unix epoch.
        #[arg(long)]
        from: i64,
        /// End of range, microseconds since the Unix epoch.
        #[arg(long)]
        to: i64,
        /// Output file path (default: export.mp4)
        #[arg(short, long, default_value = "export.mp4")]
        output: PathBuf,
    },
    /// Run the catalog's structural integrity check and exit.
    Check {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Export a crash-consistent catalog snapshot.
    Backup {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, default_value = "catalog.bak")]
        output: PathBuf,
    },
    /// Restore the catalog from a snapshot taken with `nvr backup`.
    Restore {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => run_record(config).await,
        Command::Status { config } => run_status(config),
        Command::List { config, stream } => run_list(config, &stream).await,
        Command::Export { config, stream, from, to, output } => {
            run_export(config, &stream, from, to, &output).await
        }
        Command::Check { config } => run_check(config),
        Command::Backup { config, output } => run_backup(config, &output).await,
        Command::Restore { config, from } => run_restore(config, &from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(exit_code_for(&e));
    }
}

/// Map a top-level CLI failure to the exit codes named in the design
/// (§6: 0 clean, 1 misconfiguration, 2 storage unusable, 3 forced
/// termination). Errors not originating from this crate's own `NvrError`
/// (clap parsing, plain `io::Error` from an export write) fall back to 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<NvrError>().map(NvrError::exit_code).unwrap_or(1)
}

async fn run_record(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;

    info!(
        streams = cfg.streams.len(),
        storage_path = ?cfg.storage.storage_path,
        segment_seconds = cfg.storage.segment_duration_seconds,
        "starting NVR"
    );

    let manager = Manager::new(&cfg)?;
    manager.start(&cfg).await?;

    if cfg.api.enabled {
        let state = std::sync::Arc::new(api::AppState {
            manager: manager.clone(),
            config: std::sync::RwLock::new(cfg.clone()),
            config_path: config_path.clone(),
        });
        let port = cfg.api.web_port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    let report = manager.drain(Duration::from_secs(30)).await;
    info!(completed = report.completed.len(), leaked = report.leaked.len(), "shutdown complete");
    if !report.leaked.is_empty() {
        anyhow::bail!(NvrError::DeadlineExceeded(format!("{} component(s) did not quiesce in time", report.leaked.len())));
    }
    Ok(())
}

fn run_status(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    println!("=== NVR Status ===");
    println!("Storage path : {}", cfg.storage.storage_path.display());
    println!("Streams      : {}", cfg.streams.len());
    for s in &cfg.streams {
        println!("  {} ({}): {} — enabled={} priority={}", s.id, s.name, s.url, s.enabled, s.priority);
    }
    Ok(())
}

async fn run_list(config_path: PathBuf, stream_id: &str) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let db_path = cfg.storage.storage_path.join("catalog.db");
    let (catalog, _thread) = Catalog::open(&db_path)?;

    let page = catalog
        .query(QueryParams {
            stream_id: Some(stream_id.to_string()),
            order: SortOrder::StartDesc,
            limit: 1000,
            ..Default::default()
        })
        .await?;

    if page.rows.is_empty() {
        println!("No segments found for stream '{stream_id}'");
        catalog.shutdown().await;
        return Ok(());
    }

    println!("=== Segments for stream '{stream_id}' ===");
    println!("{:<38} {:<16} {:<16} {:<10}", "ID", "start_us", "end_us", "bytes");
    println!("{}", "-".repeat(82));
    for row in &page.rows {
        let s = &row.segment;
        println!("{:<38} {:<16} {:<16} {:<10}", s.id, s.start_us, s.end_us, s.bytes);
    }
    println!("\nTotal: {} segments", page.rows.len());
    catalog.shutdown().await;
    Ok(())
}

async fn run_export(config_path: PathBuf, stream_id: &str, from: i64, to: i64, output: &PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let db_path = cfg.storage.storage_path.join("catalog.db");
    let (catalog, _thread) = Catalog::open(&db_path)?;

    let page = catalog
        .query(QueryParams {
            stream_id: Some(stream_id.to_string()),
            range: Some(TimeRange { from_us: from, to_us: to }),
            order: SortOrder::StartAsc,
            limit: 10_000,
            ..Default::default()
        })
        .await?;

    let segments: Vec<_> = page.rows.into_iter().map(|r| r.segment).collect();
    let count = playback::export_concatenated(&segments, output)?;
    println!("Exported {count} segments for stream '{stream_id}' -> {}", output.display());
    catalog.shutdown().await;
    Ok(())
}

fn run_check(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let db_path = cfg.storage.storage_path.join("catalog.db");
    Catalog::check_integrity(&db_path)?;
    println!("catalog OK: {}", db_path.display());
    Ok(())
}

async fn run_backup(config_path: PathBuf, output: &PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let db_path = cfg.storage.storage_path.join("catalog.db");
    let (catalog, _thread) = Catalog::open(&db_path)?;
    let report = catalog.export_backup(output).await?;
    println!("Backed up {} pages -> {}", report.pages_copied, output.display());
    catalog.shutdown().await;
    Ok(())
}

fn run_restore(config_path: PathBuf, from: &PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let db_path = cfg.storage.storage_path.join("catalog.db");
    match Catalog::restore_backup(&db_path, from)? {
        nvr::catalog::RestoreOutcome::Restored => {
            println!("Restored catalog from {}", from.display());
            Ok(())
        }
        nvr::catalog::RestoreOutcome::BackupAlsoCorrupt => {
            anyhow::bail!(NvrError::CatalogCorrupt(format!("backup source '{}' failed integrity check", from.display())))
        }
    }
}
