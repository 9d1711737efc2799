//! Chunk storage adapter
//!
//! Opportunistic key/value cache for produced chunks. No durability
//! guarantee: a store may drop entries at any time, and the engine always
//! treats a miss as "generate it again".

use crate::models::timeline::TimelineChunk;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Cache key for a chunk, stable across sessions
///
/// Content-addressed on the lesson, position, and topic so regenerated
/// lessons with identical inputs hit the same entries.
pub fn chunk_cache_key(lesson_id: &str, chunk_number: u32, topic: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lesson_id.as_bytes());
    hasher.update(chunk_number.to_le_bytes());
    hasher.update(topic.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key/value chunk storage
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<TimelineChunk>;
    async fn set(&self, key: &str, chunk: TimelineChunk);
    async fn remove(&self, key: &str);
    async fn clear(&self);
}

/// Process-local store backed by a map
#[derive(Default)]
pub struct InMemoryChunkStore {
    entries: RwLock<HashMap<String, TimelineChunk>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn get(&self, key: &str) -> Option<TimelineChunk> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, chunk: TimelineChunk) {
        self.entries.write().await.insert(key.to_string(), chunk);
    }

    async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
