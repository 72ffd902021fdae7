use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::store::ChunkStore;
use crate::timeline::chunk::Chunk;

use super::accumulator::SourceAccumulator;

/// Writer operating mode, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Every pending batch is persisted synchronously the moment it is
    /// produced. Low-volume and test configurations.
    Foreground,
    /// Pending batches accumulate in a local queue and are flushed in
    /// bulk on size or delay triggers.
    Background,
}

struct QueuedBatch {
    owner: Arc<SourceAccumulator>,
    batch_id: u64,
    chunks: Vec<Chunk>,
}

/// Decouples durable chunk persistence from the ingestion path.
///
/// The hand-off from "accept a pending batch" to "currently flushing" is
/// a single short critical section: the queue is taken under its lock
/// and persisted with no lock held, so ingestion never waits on storage.
pub struct ChunkWriter {
    store: Arc<dyn ChunkStore>,
    mode: WriteMode,
    batch_threshold: usize,
    max_flush_delay: std::time::Duration,
    flush_interval: std::time::Duration,

    queue: Mutex<Vec<QueuedBatch>>,
    queued_chunks: AtomicUsize,
    /// A flush in progress suppresses a concurrent second flush.
    flushing: AtomicBool,
    shutting_down: AtomicBool,
    last_flush: Mutex<Instant>,
}

impl ChunkWriter {
    pub fn new(store: Arc<dyn ChunkStore>, cfg: WriterConfig) -> Self {
        Self {
            store,
            mode: cfg.mode,
            batch_threshold: cfg.batch_threshold,
            max_flush_delay: cfg.max_flush_delay,
            flush_interval: cfg.flush_interval,
            queue: Mutex::new(Vec::new()),
            queued_chunks: AtomicUsize::new(0),
            flushing: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Accepts one extracted pending batch. In foreground mode the batch
    /// is persisted and acknowledged before returning; in background mode
    /// this is an in-memory append under a short lock and never fails.
    pub fn enqueue(&self, owner: Arc<SourceAccumulator>, batch_id: u64, chunks: Vec<Chunk>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(
                source_id = owner.source_id(),
                category_id = owner.category_id(),
                batch_id,
                chunks = chunks.len(),
                "writer is shutting down, pending batch not persisted",
            );
            return;
        }

        let count = chunks.len();
        let batch = QueuedBatch {
            owner,
            batch_id,
            chunks,
        };
        self.queue.lock().expect("writer queue lock poisoned").push(batch);
        self.queued_chunks.fetch_add(count, Ordering::SeqCst);

        // Foreground mode drains immediately; a batch left over from an
        // earlier failed persist rides along.
        if self.mode == WriteMode::Foreground {
            self.flush();
        }
    }

    /// Number of chunks currently queued for the next flush.
    pub fn queued_chunk_count(&self) -> usize {
        self.queued_chunks.load(Ordering::SeqCst)
    }

    /// One timer tick: flush when the queue has reached the batch-size
    /// threshold or the last flush is older than the maximum delay.
    pub fn flush_if_due(&self) {
        let queued = self.queued_chunk_count();
        if queued == 0 {
            return;
        }
        let overdue = self
            .last_flush
            .lock()
            .expect("writer clock lock poisoned")
            .elapsed()
            >= self.max_flush_delay;
        if queued >= self.batch_threshold || overdue {
            self.flush();
        }
    }

    /// Drains the queue and bulk-persists it. A flush already in progress
    /// makes this a no-op; a failed persist re-queues the drained batches
    /// at the head for the next cycle (logged, never dropped).
    pub fn flush(&self) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let drained = {
            let mut queue = self.queue.lock().expect("writer queue lock poisoned");
            std::mem::take(&mut *queue)
        };
        if drained.is_empty() {
            self.flushing.store(false, Ordering::SeqCst);
            return;
        }
        let drained_chunks: usize = drained.iter().map(|b| b.chunks.len()).sum();
        self.queued_chunks.fetch_sub(drained_chunks, Ordering::SeqCst);

        self.persist(drained);
        self.flushing.store(false, Ordering::SeqCst);
    }

    fn persist(&self, batches: Vec<QueuedBatch>) {
        let chunks: Vec<Chunk> = batches
            .iter()
            .flat_map(|b| b.chunks.iter().cloned())
            .collect();

        match self.store.bulk_insert(&chunks) {
            Ok(()) => {
                // Acknowledge in the same order the batches were added.
                for batch in &batches {
                    batch.owner.acknowledge(batch.batch_id);
                }
                *self.last_flush.lock().expect("writer clock lock poisoned") = Instant::now();
                debug!(
                    batches = batches.len(),
                    chunks = chunks.len(),
                    "chunk batch persisted",
                );
            }
            Err(e) => {
                error!(
                    batches = batches.len(),
                    chunks = chunks.len(),
                    error = %e,
                    "bulk chunk persist failed, batches remain queued",
                );
                let requeued: usize = batches.iter().map(|b| b.chunks.len()).sum();
                let mut queue = self.queue.lock().expect("writer queue lock poisoned");
                let tail = std::mem::take(&mut *queue);
                *queue = batches.into_iter().chain(tail).collect();
                self.queued_chunks.fetch_add(requeued, Ordering::SeqCst);
            }
        }
    }

    /// Steady-state flush loop; runs until the token is cancelled. The
    /// final drain is driven by [`ChunkWriter::shutdown`].
    pub fn run(self: Arc<Self>, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => self.flush_if_due(),
                }
            }
        })
    }

    /// Stops accepting new work, forces a final flush, and waits until
    /// the queue is empty and no flush is in progress. Cooperative drain:
    /// an in-flight persist is allowed to complete.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            self.flush();
            if self.queued_chunk_count() == 0 && !self.flushing.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        info!("chunk writer drained");
    }
}
