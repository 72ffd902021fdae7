use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-(source, category) watermark: the earliest sample time (unix
/// millis) accumulated but not yet durably chunked at the last controlled
/// shutdown. Replay skips spooled records strictly before the watermark.
pub type Watermarks = HashMap<(u32, u32), i64>;

/// Durable store for the retention ledger, written at shutdown and read
/// once at startup to bound replay.
pub trait WatermarkStore: Send + Sync {
    fn load(&self) -> Result<Watermarks>;
    fn save(&self, watermarks: &Watermarks) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct WatermarkEntry {
    source_id: u32,
    category_id: u32,
    earliest_ms: i64,
}

/// JSON-file ledger. A missing file loads as an empty map, which makes
/// first boot and full-shutdown boot indistinguishable from replay's
/// point of view.
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn load(&self) -> Result<Watermarks> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Watermarks::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading watermark ledger {}", self.path.display()))
            }
        };
        let entries: Vec<WatermarkEntry> =
            serde_json::from_slice(&raw).context("parsing watermark ledger")?;
        Ok(entries
            .into_iter()
            .map(|e| ((e.source_id, e.category_id), e.earliest_ms))
            .collect())
    }

    fn save(&self, watermarks: &Watermarks) -> Result<()> {
        let mut entries: Vec<WatermarkEntry> = watermarks
            .iter()
            .map(|(&(source_id, category_id), &earliest_ms)| WatermarkEntry {
                source_id,
                category_id,
                earliest_ms,
            })
            .collect();
        entries.sort_by_key(|e| (e.source_id, e.category_id));
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }
        let raw = serde_json::to_vec_pretty(&entries).context("serializing watermark ledger")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing watermark ledger {}", self.path.display()))
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("deleting watermark ledger {}", self.path.display())),
        }
    }
}

/// In-memory ledger for tests.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    watermarks: Mutex<Watermarks>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self) -> Result<Watermarks> {
        Ok(self.watermarks.lock().expect("ledger lock poisoned").clone())
    }

    fn save(&self, watermarks: &Watermarks) -> Result<()> {
        *self.watermarks.lock().expect("ledger lock poisoned") = watermarks.clone();
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.watermarks.lock().expect("ledger lock poisoned").clear();
        Ok(())
    }
}
