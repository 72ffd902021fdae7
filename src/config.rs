use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::engine::writer::WriteMode;

/// Top-level configuration for the meterd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Crash-recovery spool configuration.
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Path of the watermark ledger file. Default: "meterd-ledger.json".
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    /// Metering engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Crash-recovery spool configuration.
#[derive(Debug, Deserialize)]
pub struct SpoolConfig {
    /// Directory holding spool files. Default: "meterd-spool".
    #[serde(default = "default_spool_dir")]
    pub dir: String,

    /// Size at which the active spool file rolls over. Default: 16MB.
    #[serde(default = "default_spool_max_file_bytes")]
    pub max_file_bytes: u64,
}

/// Metering engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Target span of one chunk of accumulated samples. Default: 2h.
    #[serde(default = "default_chunk_window", with = "humantime_serde")]
    pub chunk_window: Duration,

    /// Verify timeline lengths after every ingest (diagnostic, slow).
    /// Default: false.
    #[serde(default)]
    pub check_sample_counts: bool,

    /// Keep spool files after replaying them instead of deleting them.
    /// Default: false.
    #[serde(default)]
    pub keep_spool_on_replay: bool,

    /// Chunk writer configuration.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Idle accumulator purge configuration.
    #[serde(default)]
    pub purge: PurgeConfig,
}

/// Chunk writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Persist chunks inline (foreground) or via the flush loop
    /// (background). Default: background.
    #[serde(default = "default_write_mode")]
    pub mode: WriteMode,

    /// How often the background flush condition is evaluated. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Queued chunk count that forces a flush. Default: 1000.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    /// Maximum time a queued chunk may wait before a flush is forced.
    /// Default: 60s.
    #[serde(default = "default_max_flush_delay", with = "humantime_serde")]
    pub max_flush_delay: Duration,
}

/// Idle accumulator purge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    /// How often the purge sweep runs. Default: 10m.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Idle time after which an accumulator is evicted. Default: 4h.
    #[serde(default = "default_purge_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ledger_path() -> String {
    "meterd-ledger.json".to_string()
}

fn default_spool_dir() -> String {
    "meterd-spool".to_string()
}

fn default_spool_max_file_bytes() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_chunk_window() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_write_mode() -> WriteMode {
    WriteMode::Background
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_threshold() -> usize {
    1000
}

fn default_max_flush_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_purge_idle_timeout() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            spool: SpoolConfig::default(),
            ledger_path: default_ledger_path(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            max_file_bytes: default_spool_max_file_bytes(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_window: default_chunk_window(),
            check_sample_counts: false,
            keep_spool_on_replay: false,
            writer: WriterConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mode: default_write_mode(),
            flush_interval: default_flush_interval(),
            batch_threshold: default_batch_threshold(),
            max_flush_delay: default_max_flush_delay(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: default_purge_interval(),
            idle_timeout: default_purge_idle_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.spool.dir.is_empty() {
            bail!("spool.dir is required");
        }
        if self.spool.max_file_bytes == 0 {
            bail!("spool.max_file_bytes must be positive");
        }
        if self.ledger_path.is_empty() {
            bail!("ledger_path is required");
        }
        if self.engine.chunk_window.is_zero() {
            bail!("engine.chunk_window must be positive");
        }
        if self.engine.writer.flush_interval.is_zero() {
            bail!("engine.writer.flush_interval must be positive");
        }
        if self.engine.writer.batch_threshold == 0 {
            bail!("engine.writer.batch_threshold must be positive");
        }
        if self.engine.writer.max_flush_delay < self.engine.writer.flush_interval {
            bail!("engine.writer.max_flush_delay must be at least the flush interval");
        }
        if self.engine.purge.interval.is_zero() {
            bail!("engine.purge.interval must be positive");
        }
        if self.engine.purge.idle_timeout < self.engine.chunk_window {
            bail!("engine.purge.idle_timeout must be at least the chunk window");
        }

        Ok(())
    }
}
