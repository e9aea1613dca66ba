#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-store-memory** – In-memory storage driver for Edda.
//!
//! This crate provides a fast, non-persistent store suitable for testing,
//! development, and scenarios where chain durability is not required. All
//! records live in memory and are lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, RwLock};

use edda_store_core::{
    digest, ChainDigest, RecordStream, ReductionRecord, StoreReader, StoreWriter,
};

/// Default buffer size for the live append broadcast channel.
const DEFAULT_BUFFER: usize = 1024;

//─────────────────────────────
//  In-memory store
//─────────────────────────────

/// An in-memory, non-persistent composition chain store.
///
/// Composition records are held in an append-ordered `Vec`; reductions in a
/// digest-keyed map. Clones share the same underlying storage.
///
/// The store also broadcasts the digest of every appended record, allowing
/// subscribers to observe chain growth in real time.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: Arc<RwLock<Vec<Vec<u8>>>>,
    reductions: Arc<RwLock<HashMap<ChainDigest, ReductionRecord>>>,
    broadcast_tx: broadcast::Sender<ChainDigest>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Creates a store with a custom broadcast buffer size.
    ///
    /// The buffer size determines how many append notifications can queue
    /// for slow subscribers before older ones are dropped from the stream.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer_size);
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            reductions: Arc::new(RwLock::new(HashMap::new())),
            broadcast_tx,
        }
    }

    /// Subscribe to the live stream of appended record digests.
    ///
    /// Subscribers that fall behind may miss notifications if the broadcast
    /// buffer overflows.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainDigest> {
        self.broadcast_tx.subscribe()
    }

    /// Number of composition records appended so far.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Number of reductions currently stored.
    pub async fn reduction_count(&self) -> usize {
        self.reductions.read().await.len()
    }

    /// Drop all records and reductions, returning the store to empty.
    pub async fn clear(&self) {
        self.records.write().await.clear();
        self.reductions.write().await.clear();
    }
}

#[async_trait]
impl StoreWriter for MemoryStore {
    async fn append_composition(&self, record_bytes: &[u8]) -> Result<()> {
        self.records.write().await.push(record_bytes.to_vec());

        // Live notification (ignore errors if no subscribers)
        let _ = self.broadcast_tx.send(digest(record_bytes));

        Ok(())
    }

    async fn put_reduction(&self, reduction: &ReductionRecord) -> Result<()> {
        self.reductions
            .write()
            .await
            .insert(reduction.reduced_composition_hash, reduction.clone());
        Ok(())
    }
}

#[async_trait]
impl StoreReader for MemoryStore {
    async fn compositions_reverse(&self) -> Result<RecordStream> {
        // Snapshot under the read lock; the stream itself borrows nothing.
        let snapshot = self.records.read().await.clone();
        Ok(stream::iter(snapshot.into_iter().rev().map(Ok)).boxed())
    }

    async fn reduction(&self, hash: &ChainDigest) -> Result<Option<ReductionRecord>> {
        Ok(self.reductions.read().await.get(hash).cloned())
    }
}
