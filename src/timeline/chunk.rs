use std::sync::Arc;

use chrono::{DateTime, Utc};

/// An immutable, time-bounded, compressed snapshot of one metric's
/// timeline. Uniquely identified by (source_id, metric_id, start_time).
/// Payload bytes are shared via `Arc` so queries and the background
/// writer can hold the same chunk without copying.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub source_id: u32,
    pub metric_id: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sample_count: usize,
    /// Encoded shared time axis (see `codec::encode_times`).
    pub time_bytes: Arc<[u8]>,
    /// Encoded sample payload (see `codec::encode_samples`).
    pub sample_bytes: Arc<[u8]>,
}

impl Chunk {
    /// True if this chunk's covered range intersects [start, end].
    pub fn intersects(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time <= end && self.end_time >= start
    }
}

/// A monotonically-numbered group of chunks (one per metric) extracted
/// together from one accumulator. Owned by the accumulator until the
/// background writer acknowledges the durable write.
#[derive(Debug)]
pub struct PendingBatch {
    pub id: u64,
    pub chunks: Vec<Chunk>,
}
