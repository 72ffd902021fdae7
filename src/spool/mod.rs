use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::timeline::sample::SampleValue;

/// One raw ingested batch as spooled to disk, in resolved-id form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub source_id: u32,
    pub category_id: u32,
    pub timestamp_ms: i64,
    pub samples: Vec<(u32, SampleValue)>,
}

struct SpoolInner {
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    bytes_written: u64,
    seq: u64,
}

/// Durable append-only local log of raw ingested samples, used only for
/// crash recovery before they are durably persisted as chunks.
///
/// Records are JSON lines in size-rotated files named
/// `spool-<unix_millis>-<seq>.jsonl`; lexicographic file order is
/// chronological order.
pub struct SpoolBuffer {
    dir: PathBuf,
    max_file_bytes: u64,
    inner: Mutex<SpoolInner>,
}

impl SpoolBuffer {
    pub fn open(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating spool directory {}", dir.display()))?;

        // Continue the sequence after any files left by a previous run.
        let seq = list_spool_files(&dir)?
            .last()
            .and_then(|p| parse_file_name(p).map(|(_, s)| s + 1))
            .unwrap_or(0);

        Ok(Self {
            dir,
            max_file_bytes,
            inner: Mutex::new(SpoolInner {
                writer: None,
                current_path: None,
                bytes_written: 0,
                seq,
            }),
        })
    }

    /// Appends one record and flushes it to the OS.
    pub fn append(&self, record: &SpoolRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("serializing spool record")?;
        line.push(b'\n');

        let mut inner = self.inner.lock().expect("spool lock poisoned");
        if inner.writer.is_none() || inner.bytes_written >= self.max_file_bytes {
            self.roll(&mut inner)?;
        }
        let writer = inner.writer.as_mut().expect("writer opened above");
        writer.write_all(&line).context("appending spool record")?;
        writer.flush().context("flushing spool file")?;
        inner.bytes_written += line.len() as u64;
        Ok(())
    }

    fn roll(&self, inner: &mut SpoolInner) -> Result<()> {
        let name = format!("spool-{:013}-{:06}.jsonl", Utc::now().timestamp_millis(), inner.seq);
        inner.seq += 1;
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening spool file {}", path.display()))?;
        inner.writer = Some(BufWriter::new(file));
        inner.current_path = Some(path);
        inner.bytes_written = 0;
        Ok(())
    }

    /// Reads every spooled record in file order and invokes the visitor.
    ///
    /// A file is skipped without parsing when `min_time_ms` is set and the
    /// next file's start timestamp is at or before it (everything in the
    /// earlier file predates the watermark). Undecodable lines are logged
    /// and skipped. When `delete_on_read` is set, each fully consumed file
    /// is removed. Returns the number of files skipped.
    pub fn read_all(
        &self,
        delete_on_read: bool,
        min_time_ms: Option<i64>,
        visitor: &mut dyn FnMut(SpoolRecord),
    ) -> Result<usize> {
        // Close the active writer so its contents are visible and no file
        // is appended to while being read.
        {
            let mut inner = self.inner.lock().expect("spool lock poisoned");
            inner.writer = None;
            inner.current_path = None;
            inner.bytes_written = 0;
        }

        let files = list_spool_files(&self.dir)?;
        let mut skipped = 0usize;
        for (idx, path) in files.iter().enumerate() {
            let wholly_stale = match (min_time_ms, files.get(idx + 1)) {
                (Some(min), Some(next)) => {
                    parse_file_name(next).map(|(ts, _)| ts <= min).unwrap_or(false)
                }
                _ => false,
            };
            if wholly_stale {
                skipped += 1;
                if delete_on_read {
                    remove_file(path);
                }
                continue;
            }

            let file = File::open(path)
                .with_context(|| format!("opening spool file {}", path.display()))?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line
                    .with_context(|| format!("reading spool file {}", path.display()))?;
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<SpoolRecord>(&line) {
                    Ok(record) => visitor(record),
                    Err(e) => warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "skipping undecodable spool record",
                    ),
                }
            }
            if delete_on_read {
                remove_file(path);
            }
        }
        Ok(skipped)
    }

    /// Deletes spool files whose entire contents predate `cutoff_ms`,
    /// judged by the start timestamp of the following file.
    pub fn purge_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        let files = list_spool_files(&self.dir)?;
        let mut removed = 0usize;
        for (idx, path) in files.iter().enumerate() {
            let stale = files
                .get(idx + 1)
                .and_then(|next| parse_file_name(next))
                .map(|(ts, _)| ts <= cutoff_ms)
                .unwrap_or(false);
            if stale {
                remove_file(path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every spool file. Called after a full shutdown has flushed
    /// all accumulated data through the writer.
    pub fn discard(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("spool lock poisoned");
            inner.writer = None;
            inner.current_path = None;
            inner.bytes_written = 0;
        }
        for path in list_spool_files(&self.dir)? {
            remove_file(&path);
        }
        Ok(())
    }

    /// Number of spool files currently on disk.
    pub fn file_count(&self) -> Result<usize> {
        Ok(list_spool_files(&self.dir)?.len())
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(file = %path.display(), error = %e, "failed to remove spool file");
    }
}

fn list_spool_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("listing spool directory {}", dir.display()))?
    {
        let path = entry.context("reading spool directory entry")?.path();
        if parse_file_name(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parses `spool-<millis>-<seq>.jsonl`, returning (millis, seq).
fn parse_file_name(path: &Path) -> Option<(i64, u64)> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("spool-")?.strip_suffix(".jsonl")?;
    let (ts, seq) = rest.split_once('-')?;
    Some((ts.parse().ok()?, seq.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source_id: u32, timestamp_ms: i64, value: i64) -> SpoolRecord {
        SpoolRecord {
            source_id,
            category_id: 1,
            timestamp_ms,
            samples: vec![(10, SampleValue::Int(value))],
        }
    }

    fn collect(spool: &SpoolBuffer, delete: bool, min: Option<i64>) -> (Vec<SpoolRecord>, usize) {
        let mut out = Vec::new();
        let skipped = spool.read_all(delete, min, &mut |r| out.push(r)).unwrap();
        (out, skipped)
    }

    #[test]
    fn test_append_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();

        for i in 0..5 {
            spool.append(&record(1, 1000 + i, i)).unwrap();
        }

        let (records, skipped) = collect(&spool, false, None);
        assert_eq!(skipped, 0);
        assert_eq!(records.len(), 5);
        let times: Vec<i64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn test_size_rotation_creates_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny limit: every append rolls to a fresh file.
        let spool = SpoolBuffer::open(dir.path(), 16).unwrap();

        for i in 0..3 {
            spool.append(&record(1, i, i)).unwrap();
        }

        assert_eq!(spool.file_count().unwrap(), 3);
        let (records, _) = collect(&spool, false, None);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_delete_on_read_consumes_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();
        spool.append(&record(1, 1, 1)).unwrap();

        let (records, _) = collect(&spool, true, None);
        assert_eq!(records.len(), 1);
        assert_eq!(spool.file_count().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();
        spool.append(&record(1, 1, 1)).unwrap();
        spool.append(&record(1, 2, 2)).unwrap();

        // Corrupt the middle of the file by appending garbage directly.
        let file = list_spool_files(dir.path()).unwrap().pop().unwrap();
        let mut f = OpenOptions::new().append(true).open(&file).unwrap();
        writeln!(f, "{{not json").unwrap();
        spool.append(&record(1, 3, 3)).unwrap();

        let (records, _) = collect(&spool, false, None);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_purge_older_than_drops_wholly_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        for (millis, seq) in [(1_000i64, 0u64), (2_000, 1), (3_000, 2)] {
            let name = format!("spool-{millis:013}-{seq:06}.jsonl");
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();

        // A file is stale only when the following file starts at or before
        // the cutoff, so a file straddling the cutoff is kept.
        assert_eq!(spool.purge_older_than(2_000).unwrap(), 1);
        assert_eq!(spool.file_count().unwrap(), 2);

        // The newest file never has a successor and is never dropped.
        assert_eq!(spool.purge_older_than(i64::MAX).unwrap(), 1);
        assert_eq!(spool.file_count().unwrap(), 1);
    }

    #[test]
    fn test_discard_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolBuffer::open(dir.path(), 16).unwrap();
        for i in 0..4 {
            spool.append(&record(1, i, i)).unwrap();
        }

        spool.discard().unwrap();
        assert_eq!(spool.file_count().unwrap(), 0);

        // The spool is still usable after a discard.
        spool.append(&record(1, 9, 9)).unwrap();
        assert_eq!(spool.file_count().unwrap(), 1);
    }

    #[test]
    fn test_sequence_continues_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();
            spool.append(&record(1, 1, 1)).unwrap();
        }
        let spool = SpoolBuffer::open(dir.path(), 1 << 20).unwrap();
        spool.append(&record(1, 2, 2)).unwrap();

        assert_eq!(spool.file_count().unwrap(), 2);
        let (records, _) = collect(&spool, false, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp_ms, 1);
        assert_eq!(records[1].timestamp_ms, 2);
    }
}
