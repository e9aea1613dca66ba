#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-store-sled** – Sled-based persistent storage driver for Edda.
//!
//! This crate provides a durable, embedded store using the sled database
//! engine. Composition records land in an append-sequenced tree whose
//! reverse key order gives the reverse-chronological enumeration the engine
//! rehydrates from; reductions live in a digest-keyed side tree.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sled::{Db, Tree};
use tokio::sync::broadcast;

use edda_store_core::{
    digest, ChainDigest, RecordStream, ReductionRecord, StoreReader, StoreWriter,
};

/// Default broadcast channel size for live append notifications.
const DEFAULT_BROADCAST_SIZE: usize = 256;

//─────────────────────────────
//  Sled store
//─────────────────────────────

/// A persistent composition chain store backed by the sled embedded database.
///
/// Records are keyed by a monotonically increasing big-endian `u64` append
/// sequence, so reverse key iteration yields strict reverse append order.
/// Appends are flushed to disk before returning; reduction writes are left
/// to sled's background flushing (their loss only costs replay).
#[derive(Debug)]
pub struct SledStore {
    _db: Db, // Kept alive only to hold the sled file open; never read directly
    db_records: Tree,
    db_reductions: Tree,
    next_seq: AtomicU64,
    broadcast_tx: broadcast::Sender<ChainDigest>,
}

impl SledStore {
    /// Opens or creates a sled database at the specified path.
    ///
    /// May perform sled recovery if the database was not closed cleanly.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, sled::Config::default())
    }

    /// Opens a sled database with custom configuration.
    ///
    /// Allows tuning cache size, compression, and other sled parameters.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: sled::Config) -> Result<Self> {
        let db = config.path(path).open()?;
        Self::from_db(db)
    }

    /// Creates a store from an existing sled database instance.
    pub fn from_db(db: Db) -> Result<Self> {
        let db_records = db.open_tree("records")?;
        let db_reductions = db.open_tree("reductions")?;

        // Resume the append sequence after the highest stored key.
        let next_seq = match db_records.last()? {
            Some((key, _)) => {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("malformed record sequence key"))?;
                u64::from_be_bytes(bytes) + 1
            }
            None => 0,
        };

        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);

        Ok(Self {
            _db: db,
            db_records,
            db_reductions,
            next_seq: AtomicU64::new(next_seq),
            broadcast_tx,
        })
    }

    /// Creates a temporary store for testing purposes.
    ///
    /// Backing files are cleaned up when the store is dropped.
    #[cfg(test)]
    pub fn temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    /// Subscribe to the live stream of appended record digests.
    ///
    /// Subscribers that fall behind may miss notifications if the broadcast
    /// buffer overflows.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainDigest> {
        self.broadcast_tx.subscribe()
    }

    /// Number of composition records stored.
    pub fn record_count(&self) -> usize {
        self.db_records.len()
    }

    /// Number of reductions stored.
    pub fn reduction_count(&self) -> usize {
        self.db_reductions.len()
    }

    /// Flush all pending writes to disk, including reductions.
    pub async fn flush(&self) -> Result<()> {
        self.db_records.flush_async().await?;
        self.db_reductions.flush_async().await?;
        Ok(())
    }

    /// On-disk size of the backing database in bytes.
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self._db.size_on_disk()?)
    }
}

#[async_trait]
impl StoreWriter for SledStore {
    async fn append_composition(&self, record_bytes: &[u8]) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.db_records
            .insert(seq.to_be_bytes(), record_bytes)?;

        // The durability contract: the record must survive a crash once this
        // call returns.
        self.db_records.flush_async().await?;

        let _ = self.broadcast_tx.send(digest(record_bytes));

        Ok(())
    }

    async fn put_reduction(&self, reduction: &ReductionRecord) -> Result<()> {
        let bytes = reduction.canonical_bytes()?;
        self.db_reductions
            .insert(reduction.reduced_composition_hash.as_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl StoreReader for SledStore {
    async fn compositions_reverse(&self) -> Result<RecordStream> {
        let iter = self
            .db_records
            .iter()
            .rev()
            .map(|item| match item {
                Ok((_key, value)) => Ok(value.to_vec()),
                Err(e) => Err(anyhow::Error::from(e)),
            });
        Ok(stream::iter(iter).boxed())
    }

    async fn reduction(&self, hash: &ChainDigest) -> Result<Option<ReductionRecord>> {
        match self.db_reductions.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(ReductionRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edda_store_core::{empty_digest, CompositionRecord};

    fn record(parent: ChainDigest, event: &str) -> Vec<u8> {
        CompositionRecord::events(parent, vec![event.to_string()])
            .canonical_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn reverse_enumeration_is_strict_reverse_append_order() {
        let store = SledStore::temporary().unwrap();

        let first = record(empty_digest(), "a");
        let second = record(digest(&first), "b");
        let third = record(digest(&second), "c");

        store.append_composition(&first).await.unwrap();
        store.append_composition(&second).await.unwrap();
        store.append_composition(&third).await.unwrap();

        let mut stream = store.compositions_reverse().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), third);
        assert_eq!(stream.next().await.unwrap().unwrap(), second);
        assert_eq!(stream.next().await.unwrap().unwrap(), first);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reductions_overwrite_by_key() {
        let store = SledStore::temporary().unwrap();
        let key = digest(b"head");

        for value in ["v1", "v2"] {
            store
                .put_reduction(&ReductionRecord {
                    reduced_composition_hash: key,
                    reduced_value: value.into(),
                })
                .await
                .unwrap();
        }

        let got = store.reduction(&key).await.unwrap().unwrap();
        assert_eq!(got.reduced_value, "v2");
        assert_eq!(store.reduction_count(), 1);
        assert!(store
            .reduction(&digest(b"elsewhere"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn records_and_reductions_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("chain.db");

        let first = record(empty_digest(), "a");
        let second = record(digest(&first), "b");
        let reduction = ReductionRecord {
            reduced_composition_hash: digest(&second),
            reduced_value: "ab".into(),
        };

        {
            let store = SledStore::open(&db_path).unwrap();
            store.append_composition(&first).await.unwrap();
            store.append_composition(&second).await.unwrap();
            store.put_reduction(&reduction).await.unwrap();
            store.flush().await.unwrap();
        } // Store dropped, database closed

        let store = SledStore::open(&db_path).unwrap();
        assert_eq!(store.record_count(), 2);

        let mut stream = store.compositions_reverse().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), second);
        assert_eq!(stream.next().await.unwrap().unwrap(), first);

        let got = store
            .reduction(&reduction.reduced_composition_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, reduction);
    }

    #[tokio::test]
    async fn append_sequence_resumes_after_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("chain.db");

        let first = record(empty_digest(), "a");
        {
            let store = SledStore::open(&db_path).unwrap();
            store.append_composition(&first).await.unwrap();
        }

        let store = SledStore::open(&db_path).unwrap();
        let second = record(digest(&first), "b");
        store.append_composition(&second).await.unwrap();

        // The record appended after reopen still enumerates first.
        let mut stream = store.compositions_reverse().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), second);
        assert_eq!(stream.next().await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn live_append_stream() {
        let store = SledStore::temporary().unwrap();
        let mut rx = store.subscribe();

        let bytes = record(empty_digest(), "live");
        store.append_composition(&bytes).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), digest(&bytes));
    }

    #[tokio::test]
    async fn size_on_disk_is_reported() {
        let store = SledStore::temporary().unwrap();
        store
            .append_composition(&record(empty_digest(), "a"))
            .await
            .unwrap();
        assert!(store.size_on_disk().unwrap() > 0);
    }
}
