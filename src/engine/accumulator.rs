use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::timeline::chunk::{Chunk, PendingBatch};
use crate::timeline::codec::{compress_sample, encode_samples, encode_times};
use crate::timeline::sample::{MetricTimeline, SampleValue};

use super::writer::ChunkWriter;

/// Result of offering one batch to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Timestamp was strictly before the accumulator's end time; the
    /// batch is dropped, never reordered.
    OutOfOrder,
    /// The accumulator was evicted by a purge sweep between lookup and
    /// ingest; the caller must retry against a fresh accumulator.
    Closed,
}

struct Inner {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    /// Window rotation deadline; crossing it extracts the current window.
    chunk_end_time: Option<DateTime<Utc>>,
    times: Vec<DateTime<Utc>>,
    timelines: HashMap<u32, MetricTimeline>,
    /// Per-metric high-water sequence numbers, used to find the metrics
    /// absent from a batch that need a gap marker.
    metric_seq: HashMap<u32, u64>,
    sample_seq: u64,
    sample_count: usize,
    pending: VecDeque<PendingBatch>,
    next_batch_id: u64,
    /// Wall-clock millis of the last accepted sample, checked by the
    /// purge sweep under this same lock.
    last_touched_ms: i64,
    closed: bool,
}

/// Buffers samples for one (source, category) pair, keeps every
/// per-metric timeline sample-count-aligned via gap filling, and rotates
/// full windows into immutable chunks.
///
/// All mutating operations are serialized by one internal lock; this
/// keeps the length invariant trivially correct without cross-metric
/// coordination. Distinct accumulators proceed fully in parallel.
pub struct SourceAccumulator {
    source_id: u32,
    category_id: u32,
    chunk_window: Option<Duration>,
    check_on_ingest: bool,
    inner: Mutex<Inner>,
}

impl SourceAccumulator {
    /// Creates an accumulator whose first rotation deadline is jittered
    /// within the chunk window, so accumulators created together do not
    /// all rotate (and hit the writer) at the same instant.
    pub fn new(
        source_id: u32,
        category_id: u32,
        first_sample_time: DateTime<Utc>,
        chunk_window: Option<Duration>,
        check_on_ingest: bool,
    ) -> Self {
        let chunk_end_time = chunk_window.map(|window| {
            let window_ms = window.as_millis().max(1) as u64;
            let jitter_ms = splitmix64((u64::from(source_id) << 32) | u64::from(category_id))
                % window_ms;
            first_sample_time + chrono::Duration::milliseconds(jitter_ms as i64)
        });

        Self {
            source_id,
            category_id,
            chunk_window,
            check_on_ingest,
            inner: Mutex::new(Inner {
                start_time: None,
                end_time: None,
                chunk_end_time,
                times: Vec::new(),
                timelines: HashMap::new(),
                metric_seq: HashMap::new(),
                sample_seq: 0,
                sample_count: 0,
                pending: VecDeque::new(),
                next_batch_id: 1,
                last_touched_ms: Utc::now().timestamp_millis(),
                closed: false,
            }),
        }
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn category_id(&self) -> u32 {
        self.category_id
    }

    /// Buffers one batch. Rotates the window first when the timestamp
    /// crosses the chunk deadline. Every metric in the batch gets its
    /// (compressed) sample appended; every tracked metric absent from the
    /// batch gets an explicit gap marker, so all timelines stay
    /// length-aligned.
    pub fn ingest(
        self: &Arc<Self>,
        writer: &ChunkWriter,
        timestamp: DateTime<Utc>,
        samples: &[(u32, SampleValue)],
    ) -> IngestOutcome {
        let (outcome, extracted) = {
            let mut inner = self.inner.lock().expect("accumulator lock poisoned");
            if inner.closed {
                return IngestOutcome::Closed;
            }

            let mut extracted = None;
            if let Some(deadline) = inner.chunk_end_time {
                if deadline < timestamp {
                    extracted = Self::extract_locked(self, &mut inner);
                    inner.start_time = Some(timestamp);
                    if let Some(window) = self.chunk_window {
                        inner.chunk_end_time = Some(
                            timestamp
                                + chrono::Duration::milliseconds(window.as_millis() as i64),
                        );
                    }
                }
            }

            if inner.start_time.is_none() {
                inner.start_time = Some(timestamp);
            }
            if let Some(end) = inner.end_time {
                // Equal timestamps are allowed; strictly earlier ones are not.
                if timestamp < end {
                    warn!(
                        source_id = self.source_id,
                        category_id = self.category_id,
                        timestamp = %timestamp,
                        end_time = %end,
                        "batch timestamp is before accumulator end time, ignored",
                    );
                    return IngestOutcome::OutOfOrder;
                }
            }

            inner.sample_seq += 1;
            let seq = inner.sample_seq;
            let backfill = inner.sample_count;
            for (metric_id, value) in samples {
                inner.metric_seq.insert(*metric_id, seq);
                let timeline = inner
                    .timelines
                    .entry(*metric_id)
                    .or_insert_with(|| MetricTimeline::with_placeholders(backfill));
                timeline.append(compress_sample(value.clone()));
            }

            // Gap-fill every tracked metric the batch did not mention.
            let stale: Vec<u32> = inner
                .metric_seq
                .iter()
                .filter(|(_, &s)| s < seq)
                .map(|(&id, _)| id)
                .collect();
            for metric_id in stale {
                inner.metric_seq.insert(metric_id, seq);
                if let Some(timeline) = inner.timelines.get_mut(&metric_id) {
                    timeline.append_missing();
                }
            }

            inner.end_time = Some(timestamp);
            inner.sample_count += 1;
            inner.times.push(timestamp);
            inner.last_touched_ms = Utc::now().timestamp_millis();

            if self.check_on_ingest {
                let expected = inner.sample_count;
                Self::check_counts_locked(self, &inner, expected);
            }

            (IngestOutcome::Accepted, extracted)
        };

        if let Some(batch) = extracted {
            writer.enqueue(Arc::clone(self), batch.id, batch.chunks);
        }
        outcome
    }

    /// Forces extraction of the current window into a pending batch and
    /// hands it to the writer. No-op when nothing is buffered.
    pub fn extract(self: &Arc<Self>, writer: &ChunkWriter) {
        let extracted = {
            let mut inner = self.inner.lock().expect("accumulator lock poisoned");
            Self::extract_locked(self, &mut inner)
        };
        if let Some(batch) = extracted {
            writer.enqueue(Arc::clone(self), batch.id, batch.chunks);
        }
    }

    /// Extraction body; caller holds the lock. The returned handle
    /// duplicates what was appended to the pending list so the writer
    /// enqueue can happen after the lock is released.
    fn extract_locked(&self, inner: &mut Inner) -> Option<ExtractedBatch> {
        if inner.times.is_empty() {
            return None;
        }
        let start = inner.start_time.unwrap_or(inner.times[0]);
        let end = inner.end_time.unwrap_or(*inner.times.last().expect("non-empty"));
        let time_bytes: Arc<[u8]> = encode_times(&inner.times).into();
        let sample_count = inner.sample_count;

        let mut chunks = Vec::with_capacity(inner.timelines.len());
        for (&metric_id, timeline) in inner.timelines.iter_mut() {
            chunks.push(Chunk {
                source_id: self.source_id,
                metric_id,
                start_time: start,
                end_time: end,
                sample_count,
                time_bytes: Arc::clone(&time_bytes),
                sample_bytes: encode_samples(timeline.tokens()).into(),
            });
            timeline.reset();
        }
        chunks.sort_by_key(|c| c.metric_id);

        inner.times.clear();
        inner.sample_count = 0;
        inner.start_time = None;

        let id = inner.next_batch_id;
        inner.next_batch_id += 1;
        inner.pending.push_back(PendingBatch {
            id,
            chunks: chunks.clone(),
        });
        Some(ExtractedBatch { id, chunks })
    }

    /// Marks a pending batch durably written. Acknowledgments must arrive
    /// in FIFO order; a mismatch is logged as a consistency error and the
    /// pending list is left untouched, favoring liveness over crashing.
    pub fn acknowledge(&self, batch_id: u64) {
        let mut inner = self.inner.lock().expect("accumulator lock poisoned");
        match inner.pending.front() {
            None => error!(
                source_id = self.source_id,
                category_id = self.category_id,
                batch_id,
                "acknowledge with no outstanding pending batches",
            ),
            Some(front) if front.id != batch_id => error!(
                source_id = self.source_id,
                category_id = self.category_id,
                expected = front.id,
                batch_id,
                "out-of-order pending batch acknowledgment",
            ),
            Some(_) => {
                inner.pending.pop_front();
            }
        }
    }

    /// Returns, for the requested metrics, every chunk still held in a
    /// pending batch (oldest first) plus a copy-based snapshot of the
    /// in-progress window. The live window is not mutated by a read.
    pub fn query_chunks(&self, metric_ids: &[u32]) -> Vec<Chunk> {
        let inner = self.inner.lock().expect("accumulator lock poisoned");
        let mut chunks = Vec::new();

        for batch in &inner.pending {
            for chunk in &batch.chunks {
                if metric_ids.contains(&chunk.metric_id) {
                    chunks.push(chunk.clone());
                }
            }
        }

        if !inner.times.is_empty() {
            let start = inner.start_time.unwrap_or(inner.times[0]);
            let end = inner
                .end_time
                .unwrap_or(*inner.times.last().expect("non-empty"));
            let time_bytes: Arc<[u8]> = encode_times(&inner.times).into();
            for &metric_id in metric_ids {
                if let Some(timeline) = inner.timelines.get(&metric_id) {
                    chunks.push(Chunk {
                        source_id: self.source_id,
                        metric_id,
                        start_time: start,
                        end_time: end,
                        sample_count: inner.sample_count,
                        time_bytes: Arc::clone(&time_bytes),
                        sample_bytes: encode_samples(timeline.tokens()).into(),
                    });
                }
            }
        }

        chunks
    }

    /// True if any buffered or pending data intersects [start, end].
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let inner = self.inner.lock().expect("accumulator lock poisoned");
        let earliest = inner
            .pending
            .iter()
            .flat_map(|b| b.chunks.iter().map(|c| c.start_time))
            .chain(inner.start_time)
            .min();
        let latest = inner.end_time.or_else(|| {
            inner
                .pending
                .iter()
                .flat_map(|b| b.chunks.iter().map(|c| c.end_time))
                .max()
        });
        match (earliest, latest) {
            (Some(lo), Some(hi)) => lo <= end && hi >= start,
            _ => false,
        }
    }

    /// Earliest sample time not yet handed to durable storage: the start
    /// of the oldest unacknowledged pending chunk, or of the in-progress
    /// window. Feeds the retention ledger at fast shutdown.
    pub fn earliest_unpersisted(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("accumulator lock poisoned");
        inner
            .pending
            .iter()
            .flat_map(|b| b.chunks.iter().map(|c| c.start_time))
            .chain(inner.start_time)
            .min()
    }

    /// Evicts this accumulator if it has seen no sample since
    /// `idle_before`. The freshness check, the final forced extract, and
    /// the closed mark all happen under the lock, so a concurrently
    /// arriving sample either refreshes the accumulator first (eviction
    /// aborts) or observes `closed` and is retried by the engine.
    pub fn close_if_idle(
        self: &Arc<Self>,
        writer: &ChunkWriter,
        idle_before: DateTime<Utc>,
    ) -> bool {
        let extracted = {
            let mut inner = self.inner.lock().expect("accumulator lock poisoned");
            if inner.closed {
                return true;
            }
            if inner.last_touched_ms >= idle_before.timestamp_millis() {
                return false;
            }
            inner.closed = true;
            Self::extract_locked(self, &mut inner)
        };
        if let Some(batch) = extracted {
            writer.enqueue(Arc::clone(self), batch.id, batch.chunks);
        }
        true
    }

    /// Diagnostic hook: verifies every tracked timeline holds exactly
    /// `expected` samples, logging each divergent metric. Returns false
    /// on any divergence instead of panicking.
    pub fn check_sample_counts(&self, expected: usize) -> bool {
        let inner = self.inner.lock().expect("accumulator lock poisoned");
        Self::check_counts_locked(self, &inner, expected)
    }

    fn check_counts_locked(&self, inner: &Inner, expected: usize) -> bool {
        let mut ok = true;
        if inner.sample_count != expected {
            error!(
                source_id = self.source_id,
                category_id = self.category_id,
                sample_count = inner.sample_count,
                expected,
                "accumulator sample count diverges",
            );
            ok = false;
        }
        for (&metric_id, timeline) in &inner.timelines {
            if timeline.sample_count() != expected {
                error!(
                    source_id = self.source_id,
                    category_id = self.category_id,
                    metric_id,
                    sample_count = timeline.sample_count(),
                    expected,
                    "metric timeline length diverges",
                );
                ok = false;
            }
        }
        ok
    }

    #[cfg(test)]
    pub(crate) fn pending_batch_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock().expect("accumulator lock poisoned");
        inner.pending.iter().map(|b| b.id).collect()
    }

    #[cfg(test)]
    pub(crate) fn buffered_sample_count(&self) -> usize {
        self.inner
            .lock()
            .expect("accumulator lock poisoned")
            .sample_count
    }
}

struct ExtractedBatch {
    id: u64,
    chunks: Vec<Chunk>,
}

/// SplitMix64 finalizer; cheap deterministic jitter for rotation
/// deadlines (distinct per (source, category), stable across restarts).
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::config::WriterConfig;
    use crate::engine::writer::{ChunkWriter, WriteMode};
    use crate::store::MemoryChunkStore;
    use crate::timeline::codec::decode_chunk;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn test_writer() -> (Arc<ChunkWriter>, Arc<MemoryChunkStore>) {
        let store = Arc::new(MemoryChunkStore::new());
        let writer = Arc::new(ChunkWriter::new(
            Arc::clone(&store) as _,
            WriterConfig {
                mode: WriteMode::Background,
                flush_interval: Duration::from_millis(100),
                batch_threshold: usize::MAX,
                max_flush_delay: Duration::from_secs(3600),
            },
        ));
        (writer, store)
    }

    fn accumulator() -> Arc<SourceAccumulator> {
        Arc::new(SourceAccumulator::new(1, 2, ts(0), None, false))
    }

    #[test]
    fn test_length_invariant_with_gap_filling() {
        let (writer, _) = test_writer();
        let acc = accumulator();

        // cpu at t=0,1,2; mem only at t=0,2.
        let cpu = 10u32;
        let mem = 11u32;
        acc.ingest(
            &writer,
            ts(0),
            &[(cpu, SampleValue::Int(1)), (mem, SampleValue::Int(100))],
        );
        acc.ingest(&writer, ts(1), &[(cpu, SampleValue::Int(2))]);
        acc.ingest(
            &writer,
            ts(2),
            &[(cpu, SampleValue::Int(3)), (mem, SampleValue::Int(300))],
        );

        assert!(acc.check_sample_counts(3));

        let chunks = acc.query_chunks(&[mem]);
        assert_eq!(chunks.len(), 1);
        let decoded = decode_chunk(&chunks[0]).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].1, SampleValue::Int(100));
        assert_eq!(decoded[1].1, SampleValue::Missing);
        assert_eq!(decoded[2].1, SampleValue::Int(300));
    }

    #[test]
    fn test_late_metric_gets_backfilled() {
        let (writer, _) = test_writer();
        let acc = accumulator();

        acc.ingest(&writer, ts(0), &[(1, SampleValue::Int(1))]);
        acc.ingest(&writer, ts(1), &[(1, SampleValue::Int(2))]);
        // Metric 2 appears mid-window.
        acc.ingest(
            &writer,
            ts(2),
            &[(1, SampleValue::Int(3)), (2, SampleValue::Float(0.5))],
        );

        assert!(acc.check_sample_counts(3));
        let chunks = acc.query_chunks(&[2]);
        let decoded = decode_chunk(&chunks[0]).unwrap();
        assert_eq!(decoded[0].1, SampleValue::Missing);
        assert_eq!(decoded[1].1, SampleValue::Missing);
        assert_eq!(decoded[2].1, SampleValue::Float(0.5));
    }

    #[test]
    fn test_out_of_order_rejected_ties_allowed() {
        let (writer, _) = test_writer();
        let acc = accumulator();

        assert_eq!(
            acc.ingest(&writer, ts(10), &[(1, SampleValue::Int(1))]),
            IngestOutcome::Accepted
        );
        assert_eq!(
            acc.ingest(&writer, ts(10), &[(1, SampleValue::Int(2))]),
            IngestOutcome::Accepted
        );
        assert_eq!(
            acc.ingest(&writer, ts(9), &[(1, SampleValue::Int(3))]),
            IngestOutcome::OutOfOrder
        );
        assert_eq!(acc.buffered_sample_count(), 2);
    }

    #[test]
    fn test_rotation_extracts_previous_window() {
        let (writer, _) = test_writer();
        let acc = Arc::new(SourceAccumulator::new(
            1,
            2,
            ts(0),
            Some(Duration::from_secs(60)),
            false,
        ));

        // Ties keep both samples inside the first window regardless of
        // where the jittered deadline landed.
        acc.ingest(&writer, ts(0), &[(1, SampleValue::Int(1))]);
        acc.ingest(&writer, ts(0), &[(1, SampleValue::Int(2))]);
        // Far past any jittered deadline within the 60s window.
        acc.ingest(&writer, ts(120), &[(1, SampleValue::Int(3))]);

        assert_eq!(acc.pending_batch_ids(), vec![1]);
        assert_eq!(acc.buffered_sample_count(), 1);
        assert_eq!(writer.queued_chunk_count(), 1);
    }

    #[test]
    fn test_fifo_acknowledgment_mismatch_recovers() {
        let (writer, _) = test_writer();
        let acc = accumulator();

        acc.ingest(&writer, ts(0), &[(1, SampleValue::Int(1))]);
        acc.extract(&writer);
        acc.ingest(&writer, ts(1), &[(1, SampleValue::Int(2))]);
        acc.extract(&writer);
        assert_eq!(acc.pending_batch_ids(), vec![1, 2]);

        // Acknowledging batch 2 first is logged, not applied.
        acc.acknowledge(2);
        assert_eq!(acc.pending_batch_ids(), vec![1, 2]);

        acc.acknowledge(1);
        acc.acknowledge(2);
        assert!(acc.pending_batch_ids().is_empty());
    }

    #[test]
    fn test_query_returns_pending_plus_live_window() {
        let (writer, _) = test_writer();
        let acc = accumulator();

        for window in 0..2 {
            acc.ingest(&writer, ts(window * 10), &[(1, SampleValue::Int(window))]);
            acc.extract(&writer);
        }
        acc.ingest(&writer, ts(20), &[(1, SampleValue::Int(9))]);

        let chunks = acc.query_chunks(&[1]);
        assert_eq!(chunks.len(), 3);
        // Disjoint, ordered segments.
        assert!(chunks[0].end_time < chunks[1].start_time);
        assert!(chunks[1].end_time < chunks[2].start_time);

        // The read did not disturb the live window.
        assert_eq!(acc.buffered_sample_count(), 1);
        let again = acc.query_chunks(&[1]);
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_extract_empty_is_noop() {
        let (writer, _) = test_writer();
        let acc = accumulator();
        acc.extract(&writer);
        assert!(acc.pending_batch_ids().is_empty());
        assert_eq!(writer.queued_chunk_count(), 0);
    }

    #[test]
    fn test_close_if_idle_respects_fresh_samples() {
        let (writer, _) = test_writer();
        let acc = accumulator();
        acc.ingest(&writer, ts(0), &[(1, SampleValue::Int(1))]);

        // The accumulator was touched "now"; an idle-before in the past
        // must not evict it.
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(!acc.close_if_idle(&writer, long_ago));

        // An idle-before in the future evicts and extracts.
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(acc.close_if_idle(&writer, future));
        assert_eq!(writer.queued_chunk_count(), 1);

        // Closed accumulators reject further ingest.
        assert_eq!(
            acc.ingest(&writer, ts(5), &[(1, SampleValue::Int(2))]),
            IngestOutcome::Closed
        );
    }

    #[test]
    fn test_jitter_is_deterministic_and_distinct() {
        let a = splitmix64((1u64 << 32) | 2);
        let b = splitmix64((1u64 << 32) | 2);
        let c = splitmix64((1u64 << 32) | 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
