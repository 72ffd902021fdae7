pub mod accumulator;
pub mod writer;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::spool::{SpoolBuffer, SpoolRecord};
use crate::store::ledger::{WatermarkStore, Watermarks};
use crate::store::registry::MetricRegistry;
use crate::store::ChunkStore;
use crate::timeline::chunk::Chunk;
use crate::timeline::codec::decode_chunk;
use crate::timeline::decimate::{decimate, Decimation};
use crate::timeline::sample::SampleValue;

use self::accumulator::{IngestOutcome, SourceAccumulator};
use self::writer::ChunkWriter;

/// Why a call to [`MeterEngine::record`] did not commit the batch.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("batch contains no samples")]
    EmptyBatch,
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("id resolution failed: {0}")]
    Resolution(anyhow::Error),
    #[error("spool append failed: {0}")]
    Spool(anyhow::Error),
}

/// How [`MeterEngine::stop`] treats data still in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Persist nothing extra; save the watermark ledger so the next boot
    /// replays the spool from the right point.
    Fast,
    /// Extract and drain everything through the writer, then discard the
    /// spool and the ledger.
    Full,
}

#[derive(Default)]
struct SourceEntry {
    categories: DashMap<u32, Arc<SourceAccumulator>>,
    /// Wall-clock millis of the last batch routed through this source.
    last_updated: AtomicI64,
}

/// Engine-level counters, readable at any time via [`EngineStats::snapshot`].
#[derive(Default)]
pub struct EngineStats {
    pub events_recorded: AtomicU64,
    pub events_discarded: AtomicU64,
    pub events_out_of_order: AtomicU64,
    pub events_replayed: AtomicU64,
    pub replay_files_skipped: AtomicU64,
    pub accumulators_purged: AtomicU64,
    pub sources_purged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_recorded: u64,
    pub events_discarded: u64,
    pub events_out_of_order: u64,
    pub events_replayed: u64,
    pub replay_files_skipped: u64,
    pub accumulators_purged: u64,
    pub sources_purged: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            events_out_of_order: self.events_out_of_order.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            replay_files_skipped: self.replay_files_skipped.load(Ordering::Relaxed),
            accumulators_purged: self.accumulators_purged.load(Ordering::Relaxed),
            sources_purged: self.sources_purged.load(Ordering::Relaxed),
        }
    }
}

/// Front door of the metering pipeline. Resolves names to ids, spools the
/// raw batch for crash recovery, and routes it to the per-(source,
/// category) accumulator; background tasks rotate chunks into durable
/// storage and evict idle accumulators.
pub struct MeterEngine {
    cfg: EngineConfig,
    registry: Arc<dyn MetricRegistry>,
    spool: SpoolBuffer,
    ledger: Arc<dyn WatermarkStore>,
    writer: Arc<ChunkWriter>,
    sources: DashMap<u32, Arc<SourceEntry>>,
    stats: EngineStats,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeterEngine {
    pub fn new(
        cfg: EngineConfig,
        registry: Arc<dyn MetricRegistry>,
        store: Arc<dyn ChunkStore>,
        spool: SpoolBuffer,
        ledger: Arc<dyn WatermarkStore>,
    ) -> Self {
        let writer = Arc::new(ChunkWriter::new(store, cfg.writer.clone()));
        Self {
            cfg,
            registry,
            spool,
            ledger,
            writer,
            sources: DashMap::new(),
            stats: EngineStats::default(),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn registry(&self) -> &dyn MetricRegistry {
        self.registry.as_ref()
    }

    /// Accepts one batch of named samples stamped with a single timestamp.
    ///
    /// Ids are resolved before anything is committed, so a resolution
    /// failure leaves no partial state and the producer can simply retry.
    /// The resolved batch is spooled, then buffered in its accumulator.
    pub fn record(
        &self,
        source: &str,
        category: &str,
        timestamp: DateTime<Utc>,
        values: &[(&str, SampleValue)],
    ) -> Result<(), RecordError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.stats.events_discarded.fetch_add(1, Ordering::Relaxed);
            return Err(RecordError::ShuttingDown);
        }
        if values.is_empty() {
            self.stats.events_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(source, category, "empty batch discarded");
            return Err(RecordError::EmptyBatch);
        }

        let source_id = self
            .registry
            .get_or_add_source(source)
            .map_err(RecordError::Resolution)?;
        let category_id = self
            .registry
            .get_or_add_category(category)
            .map_err(RecordError::Resolution)?;
        let samples: Vec<(u32, SampleValue)> = values
            .iter()
            .map(|(name, value)| {
                Ok((
                    self.registry.get_or_add_metric(category_id, name)?,
                    value.clone(),
                ))
            })
            .collect::<Result<_>>()
            .map_err(RecordError::Resolution)?;

        self.spool
            .append(&SpoolRecord {
                source_id,
                category_id,
                timestamp_ms: timestamp.timestamp_millis(),
                samples: samples.clone(),
            })
            .map_err(RecordError::Spool)?;

        self.ingest_resolved(source_id, category_id, timestamp, &samples);
        Ok(())
    }

    /// Routes an already-resolved batch, retrying when the target
    /// accumulator was closed by a concurrent purge sweep.
    fn ingest_resolved(
        &self,
        source_id: u32,
        category_id: u32,
        timestamp: DateTime<Utc>,
        samples: &[(u32, SampleValue)],
    ) {
        loop {
            let acc = self.accumulator_for(source_id, category_id, timestamp);
            match acc.ingest(&self.writer, timestamp, samples) {
                IngestOutcome::Accepted => {
                    self.stats.events_recorded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                IngestOutcome::OutOfOrder => {
                    self.stats.events_out_of_order.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                IngestOutcome::Closed => {
                    // Evict the closed accumulator (only if it is still the
                    // mapped one) and take a fresh one on the next pass.
                    if let Some(entry) = self.sources.get(&source_id) {
                        entry
                            .categories
                            .remove_if(&category_id, |_, mapped| Arc::ptr_eq(mapped, &acc));
                    }
                }
            }
        }
    }

    fn accumulator_for(
        &self,
        source_id: u32,
        category_id: u32,
        first_sample_time: DateTime<Utc>,
    ) -> Arc<SourceAccumulator> {
        loop {
            let entry = Arc::clone(
                &self
                    .sources
                    .entry(source_id)
                    .or_insert_with(|| Arc::new(SourceEntry::default())),
            );
            entry
                .last_updated
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            let acc = {
                let mapped = entry.categories.entry(category_id).or_insert_with(|| {
                    Arc::new(SourceAccumulator::new(
                        source_id,
                        category_id,
                        first_sample_time,
                        Some(self.cfg.chunk_window),
                        self.cfg.check_sample_counts,
                    ))
                });
                Arc::clone(&mapped)
            };
            // The purge sweep drops a source entry only while it is empty,
            // with the emptiness check and the removal under one shard
            // write lock. Re-reading the map after the category insert
            // therefore decides the race: either the insert landed before
            // the sweep's check (entry kept), or the entry is already gone
            // and the accumulator must be rebuilt inside a live one.
            let still_mapped = self
                .sources
                .get(&source_id)
                .map_or(false, |mapped| Arc::ptr_eq(mapped.value(), &entry));
            if still_mapped {
                return acc;
            }
        }
    }

    /// Every buffered or pending chunk for the given source and metrics
    /// whose span intersects `[start, end]`, sorted by (source, metric,
    /// start time). Durably stored chunks are the store's concern, not
    /// the engine's.
    pub fn query_range(
        &self,
        source_id: u32,
        metric_ids: &[u32],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if let Some(entry) = self.sources.get(&source_id) {
            for acc in entry.categories.iter() {
                let acc = acc.value();
                if !acc.covers(start, end) {
                    continue;
                }
                chunks.extend(
                    acc.query_chunks(metric_ids)
                        .into_iter()
                        .filter(|c| c.intersects(start, end)),
                );
            }
        }
        chunks.sort_by_key(|c| (c.source_id, c.metric_id, c.start_time));
        chunks
    }

    /// Decoded, time-ordered series for one metric over `[start, end]`,
    /// merged across pending and live chunks. With `decimation` set the
    /// series is reduced to a bounded point count, preserving peaks in
    /// peak-pick mode.
    pub fn query_series(
        &self,
        source_id: u32,
        metric_id: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        decimation: Option<Decimation>,
    ) -> Result<Vec<(DateTime<Utc>, SampleValue)>> {
        let mut series = Vec::new();
        // Chunks come back ordered by start time and cover disjoint
        // spans, so concatenating decoded samples keeps time order.
        for chunk in self.query_range(source_id, &[metric_id], start, end) {
            for (time, value) in decode_chunk(&chunk).context("decoding chunk")? {
                if time >= start && time <= end {
                    series.push((time, value));
                }
            }
        }
        Ok(match decimation {
            Some(decimation) => decimate(&series, decimation),
            None => series,
        })
    }

    /// Re-ingests spooled batches from a previous run. Records strictly
    /// before the per-(source, category) watermark (or the global minimum
    /// watermark when the pair has none) were already durably chunked and
    /// are skipped. Consumed files are deleted unless configured otherwise.
    pub fn replay(&self) -> Result<u64> {
        let watermarks = self.ledger.load().context("loading watermark ledger")?;
        let global_min = watermarks.values().copied().min();

        let mut replayed = 0u64;
        let result = self.spool.read_all(
            !self.cfg.keep_spool_on_replay,
            global_min,
            &mut |record: SpoolRecord| {
                let min = watermarks
                    .get(&(record.source_id, record.category_id))
                    .copied()
                    .or(global_min);
                if let Some(min) = min {
                    if record.timestamp_ms < min {
                        return;
                    }
                }
                let Some(timestamp) = DateTime::from_timestamp_millis(record.timestamp_ms)
                else {
                    warn!(
                        source_id = record.source_id,
                        category_id = record.category_id,
                        timestamp_ms = record.timestamp_ms,
                        "spool record timestamp out of range, skipped",
                    );
                    return;
                };
                self.ingest_resolved(
                    record.source_id,
                    record.category_id,
                    timestamp,
                    &record.samples,
                );
                replayed += 1;
            },
        );
        let files_skipped = result.context("replaying spool")?;

        self.stats
            .events_replayed
            .fetch_add(replayed, Ordering::Relaxed);
        self.stats
            .replay_files_skipped
            .fetch_add(files_skipped as u64, Ordering::Relaxed);
        info!(replayed, files_skipped, "spool replay complete");
        Ok(replayed)
    }

    /// Evicts accumulators that have seen no sample since `idle_before`,
    /// forcing their remaining data through the writer. Sources whose
    /// every category was evicted are dropped entirely.
    pub fn purge(&self, idle_before: DateTime<Utc>) {
        let cutoff_ms = idle_before.timestamp_millis();
        let source_ids: Vec<u32> = self.sources.iter().map(|e| *e.key()).collect();

        for source_id in source_ids {
            let Some(entry) = self.sources.get(&source_id).map(|e| Arc::clone(e.value()))
            else {
                continue;
            };

            let category_ids: Vec<u32> = entry.categories.iter().map(|c| *c.key()).collect();
            for category_id in category_ids {
                let Some(acc) = entry
                    .categories
                    .get(&category_id)
                    .map(|a| Arc::clone(a.value()))
                else {
                    continue;
                };
                if acc.close_if_idle(&self.writer, idle_before) {
                    entry
                        .categories
                        .remove_if(&category_id, |_, mapped| Arc::ptr_eq(mapped, &acc));
                    self.stats.accumulators_purged.fetch_add(1, Ordering::Relaxed);
                    debug!(source_id, category_id, "idle accumulator evicted");
                }
            }

            if entry.last_updated.load(Ordering::Relaxed) < cutoff_ms {
                let removed = self
                    .sources
                    .remove_if(&source_id, |_, mapped| {
                        Arc::ptr_eq(mapped, &entry) && mapped.categories.is_empty()
                    })
                    .is_some();
                if removed {
                    self.stats.sources_purged.fetch_add(1, Ordering::Relaxed);
                    debug!(source_id, "idle source evicted");
                }
            }
        }
    }

    /// Extracts every live window and triggers one writer flush.
    pub fn force_flush(&self) {
        for entry in self.sources.iter() {
            for acc in entry.value().categories.iter() {
                acc.value().extract(&self.writer);
            }
        }
        self.writer.flush();
    }

    /// Spawns the writer flush loop and the purge ticker.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("engine task lock poisoned");
        tasks.push(Arc::clone(&self.writer).run(self.shutdown.clone()));

        let engine = Arc::clone(self);
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.cfg.purge.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let idle_before = Utc::now()
                            - chrono::Duration::milliseconds(
                                engine.cfg.purge.idle_timeout.as_millis() as i64,
                            );
                        engine.purge(idle_before);
                    }
                }
            }
        }));
        info!("meter engine started");
    }

    /// Stops background tasks, then finalizes state per `mode`.
    pub async fn stop(&self, mode: ShutdownMode) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        let tasks = {
            let mut tasks = self.tasks.lock().expect("engine task lock poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }

        match mode {
            ShutdownMode::Fast => {
                let mut watermarks = Watermarks::new();
                for entry in self.sources.iter() {
                    for acc in entry.value().categories.iter() {
                        let acc = acc.value();
                        if let Some(earliest) = acc.earliest_unpersisted() {
                            watermarks.insert(
                                (acc.source_id(), acc.category_id()),
                                earliest.timestamp_millis(),
                            );
                        }
                    }
                }
                self.ledger
                    .save(&watermarks)
                    .context("saving watermark ledger")?;
                // Spool files wholly behind every watermark hold only
                // data that is already durably chunked; drop them so the
                // spool does not grow across restarts.
                if let Some(&min) = watermarks.values().min() {
                    let removed = self
                        .spool
                        .purge_older_than(min)
                        .context("purging stale spool files")?;
                    if removed > 0 {
                        debug!(removed, "stale spool files dropped");
                    }
                }
                info!(
                    entries = watermarks.len(),
                    "fast shutdown, watermark ledger saved",
                );
            }
            ShutdownMode::Full => {
                self.force_flush();
                self.writer.shutdown().await;
                self.spool.discard().context("discarding spool")?;
                self.ledger.delete().context("deleting watermark ledger")?;
                info!("full shutdown, all data drained and spool discarded");
            }
        }
        Ok(())
    }
}
