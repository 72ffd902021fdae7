pub mod ledger;
pub mod registry;

use std::sync::Mutex;

use anyhow::Result;

use crate::timeline::chunk::Chunk;

/// Durable chunk persistence boundary. Implementations are called from
/// the writer's flush task only; a bulk insert either lands every chunk
/// or fails as a unit and is retried on the next flush cycle.
pub trait ChunkStore: Send + Sync {
    fn bulk_insert(&self, chunks: &[Chunk]) -> Result<()>;
}

/// In-memory chunk store used in tests and low-volume deployments.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<Vec<Chunk>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything persisted so far.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().expect("chunk store lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().expect("chunk store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkStore for MemoryChunkStore {
    fn bulk_insert(&self, chunks: &[Chunk]) -> Result<()> {
        self.chunks
            .lock()
            .expect("chunk store lock poisoned")
            .extend_from_slice(chunks);
        Ok(())
    }
}
