use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use meterd::config::Config;
use meterd::engine::{MeterEngine, RecordError, ShutdownMode};
use meterd::spool::SpoolBuffer;
use meterd::store::ledger::FileWatermarkStore;
use meterd::store::registry::InMemoryRegistry;
use meterd::store::MemoryChunkStore;
use meterd::timeline::sample::SampleValue;

/// Metering daemon: accumulates usage samples into compressed chunks.
#[derive(Parser)]
#[command(name = "meterd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Fully drain accumulated data and discard the spool on shutdown,
    /// instead of the fast ledger-only shutdown.
    #[arg(long)]
    drain: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("meterd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting meterd",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli.drain).await })
}

async fn run(cfg: Config, drain: bool) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let spool = SpoolBuffer::open(&cfg.spool.dir, cfg.spool.max_file_bytes)
        .context("opening spool")?;
    let engine = Arc::new(MeterEngine::new(
        cfg.engine.clone(),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(MemoryChunkStore::new()),
        spool,
        Arc::new(FileWatermarkStore::new(&cfg.ledger_path)),
    ));

    // Recover anything a previous run left in the spool before accepting
    // new batches.
    engine.replay().context("replaying spool")?;
    engine.start();

    let ingest = tokio::spawn(ingest_stdin(Arc::clone(&engine)));

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;
    ingest.abort();

    let mode = if drain {
        ShutdownMode::Full
    } else {
        ShutdownMode::Fast
    };
    engine.stop(mode).await?;

    let stats = engine.stats().snapshot();
    tracing::info!(
        recorded = stats.events_recorded,
        replayed = stats.events_replayed,
        discarded = stats.events_discarded,
        out_of_order = stats.events_out_of_order,
        "meterd stopped",
    );

    Ok(())
}

/// One JSON line on stdin: a batch of named samples for a source and
/// category, optionally stamped by the producer.
#[derive(Deserialize)]
struct InputBatch {
    source: String,
    category: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    values: BTreeMap<String, serde_json::Value>,
}

async fn ingest_stdin(engine: Arc<MeterEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed, no longer accepting batches");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reading stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let batch: InputBatch = match serde_json::from_str(&line) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable input line, skipped");
                continue;
            }
        };

        let timestamp = batch.timestamp.unwrap_or_else(Utc::now);
        let values: Vec<(&str, SampleValue)> = batch
            .values
            .iter()
            .filter_map(|(name, value)| {
                convert_value(value).map(|v| (name.as_str(), v))
            })
            .collect();

        match engine.record(&batch.source, &batch.category, timestamp, &values) {
            Ok(()) => {}
            Err(RecordError::ShuttingDown) => return,
            Err(e) => tracing::warn!(
                source = batch.source,
                category = batch.category,
                error = %e,
                "batch rejected",
            ),
        }
    }
}

/// Maps a JSON scalar onto a sample value; arrays and objects have no
/// metering meaning and are dropped with a warning.
fn convert_value(value: &serde_json::Value) -> Option<SampleValue> {
    match value {
        serde_json::Value::Null => Some(SampleValue::Missing),
        serde_json::Value::Bool(b) => Some(SampleValue::Int(i64::from(*b))),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SampleValue::Int(i))
            } else {
                n.as_f64().map(SampleValue::Float)
            }
        }
        serde_json::Value::String(s) => Some(SampleValue::Tag(s.clone())),
        other => {
            tracing::warn!(value = %other, "unsupported sample value, dropped");
            None
        }
    }
}
