#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-engine** – Persistent process engine for Edda.
//!
//! [`PersistentProcess`] owns an opaque [`Process`] and the chain head
//! digest. Construction rehydrates both from a store: records are walked
//! reverse-chronologically until a reduction snapshot or the genesis record
//! is reachable, then the suffix is replayed forward. Thereafter every
//! mutation applies events (or a state override) to the process and advances
//! the head to the digest of a freshly materialized composition record.
//!
//! The engine moves through `Rehydrating → Ready → Disposed`; a failed
//! rehydration never yields an engine at all. All public operations
//! serialize behind one coarse lock - process calls are the dominant cost
//! and inherently serial, so finer locking buys nothing.
//!
//! Persisting the materialized records is the caller's job (see the
//! store-binding wrapper in `edda-runtime`); the engine itself only reads
//! storage, during rehydration.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use edda_process::Process;
use edda_store_core::{
    digest, empty_digest, ChainDigest, CodecError, CompositionRecord, ReductionRecord, StoreReader,
};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced by the persistent process engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Reverse iteration exhausted the store without reaching a reduction or
    /// the genesis record for the tentative head.
    #[error("chain incomplete: no reduction or genesis reachable from head {0}")]
    ChainIncomplete(ChainDigest),
    /// A stored byte sequence did not encode or decode as a chain value.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The underlying store failed to read or enumerate.
    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
    /// The opaque process refused an event or a state set.
    #[error("process failure: {0}")]
    Process(#[source] anyhow::Error),
    /// `process_events` was called with no events; stored records never
    /// carry an empty event list.
    #[error("event batch must not be empty")]
    EmptyBatch,
    /// Operation attempted on a disposed engine.
    #[error("engine disposed")]
    Disposed,
}

//─────────────────────────────
//  Committed step
//─────────────────────────────

/// Canonical bytes and digest of a freshly materialized composition record.
///
/// The digest is the post-apply chain head; the bytes are exactly what a
/// store writer must append to make the step durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    /// Canonical byte form of the record.
    pub bytes: Vec<u8>,
    /// Digest of those bytes.
    pub hash: ChainDigest,
}

//─────────────────────────────
//  Engine
//─────────────────────────────

struct Inner {
    process: Box<dyn Process>,
    last_state_hash: ChainDigest,
    disposed: bool,
}

impl Inner {
    fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.disposed {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// The persistent process engine.
///
/// Owns the opaque process exclusively; no other holder may invoke it. All
/// mutations on one engine are totally ordered, so the `parent_hash` of each
/// materialized record equals the digest of the immediately preceding one.
pub struct PersistentProcess {
    inner: Mutex<Inner>,
}

impl core::fmt::Debug for PersistentProcess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PersistentProcess").finish_non_exhaustive()
    }
}

impl PersistentProcess {
    /// Construct an engine by rehydrating `process` from `reader`.
    ///
    /// Walks stored records newest-first until a reduction snapshot or the
    /// genesis record is reachable, restores the process state, and replays
    /// the remaining suffix forward (replay responses are discarded). An
    /// empty store yields the empty-init digest as head and leaves the
    /// process in its default state.
    ///
    /// Rehydration errors are fatal: no engine is returned.
    pub async fn rehydrate(
        mut process: Box<dyn Process>,
        reader: &dyn StoreReader,
    ) -> Result<Self, EngineError> {
        let head = rehydrate_state(process.as_mut(), reader).await?;
        Ok(Self {
            inner: Mutex::new(Inner {
                process,
                last_state_hash: head,
                disposed: false,
            }),
        })
    }

    /// Apply a batch of events and materialize the resulting record.
    ///
    /// Responses align 1:1 and in order with `events`. The events are
    /// applied before the record is materialized, so a process failure
    /// surfaces before any head update and nothing is handed to storage.
    ///
    /// Events within a batch are not atomic: if the process fails on the
    /// k-th event, its in-memory state may already include events `1..k-1`
    /// even though the chain does not advance. Callers that need per-event
    /// atomicity submit single-event batches.
    pub async fn process_events(
        &self,
        events: Vec<String>,
    ) -> Result<(Vec<String>, EncodedRecord), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready()?;
        if events.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let mut responses = Vec::with_capacity(events.len());
        for event in &events {
            let response = inner
                .process
                .process_event(event)
                .await
                .map_err(EngineError::Process)?;
            responses.push(response);
        }

        let record = CompositionRecord::events(inner.last_state_hash, events);
        let encoded = seal(&mut inner, &record)?;
        Ok((responses, encoded))
    }

    /// Override the process state and materialize the resulting record.
    pub async fn set_state(&self, state: &str) -> Result<EncodedRecord, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready()?;

        inner
            .process
            .set_serialized_state(state)
            .await
            .map_err(EngineError::Process)?;

        let record = CompositionRecord::state_override(inner.last_state_hash, state.to_string());
        seal(&mut inner, &record)
    }

    /// Snapshot the current head and serialized state as a reduction.
    pub async fn current_reduction(&self) -> Result<ReductionRecord, EngineError> {
        let inner = self.inner.lock().await;
        inner.ensure_ready()?;

        let reduced_value = inner
            .process
            .serialized_state()
            .await
            .map_err(EngineError::Process)?;
        Ok(ReductionRecord {
            reduced_composition_hash: inner.last_state_hash,
            reduced_value,
        })
    }

    /// Digest of the most recently committed record; the identity of the
    /// current state.
    pub async fn last_state_hash(&self) -> Result<ChainDigest, EngineError> {
        let inner = self.inner.lock().await;
        inner.ensure_ready()?;
        Ok(inner.last_state_hash)
    }

    /// Dispose the engine and its process. Idempotent; every subsequent
    /// operation fails with [`EngineError::Disposed`].
    pub async fn dispose(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return Ok(());
        }
        inner.disposed = true;
        inner
            .process
            .dispose()
            .await
            .map_err(EngineError::Process)?;
        Ok(())
    }
}

/// Encode `record`, advance the head to its digest, and hand it back.
fn seal(inner: &mut Inner, record: &CompositionRecord) -> Result<EncodedRecord, EngineError> {
    let bytes = record.canonical_bytes()?;
    let hash = digest(&bytes);
    inner.last_state_hash = hash;
    debug!(head = %hash, "advanced chain head");
    Ok(EncodedRecord { bytes, hash })
}

//─────────────────────────────
//  Rehydration
//─────────────────────────────

/// Restore `process` to the state implied by the latest stored record and
/// return the chain head.
///
/// The chain stack holds the path from the tentative head (index 0, newest)
/// back through its ancestors (pushed on top, so the stack end is the oldest
/// examined). The pool absorbs streamed records that are not yet - or never
/// will be - on that path; memory is bounded by the distance from head to
/// the nearest reduction.
async fn rehydrate_state(
    process: &mut dyn Process,
    reader: &dyn StoreReader,
) -> Result<ChainDigest, EngineError> {
    let mut stream = reader
        .compositions_reverse()
        .await
        .map_err(EngineError::Store)?;

    let mut stack: Vec<(ChainDigest, CompositionRecord)> = Vec::new();
    let mut pool: HashMap<ChainDigest, CompositionRecord> = HashMap::new();
    let mut scanned = 0usize;

    'fetch: while let Some(item) = stream.next().await {
        let bytes = item.map_err(EngineError::Store)?;
        let record = CompositionRecord::decode(&bytes)?;
        let hash = digest(&bytes);
        scanned += 1;

        if stack.is_empty() {
            stack.push((hash, record));
        } else {
            pool.insert(hash, record);
        }

        // Extend the ancestor path as far as the pool currently allows.
        loop {
            let (top_hash, top_parent) = match stack.last() {
                Some((h, rec)) => (*h, rec.parent_hash),
                None => break 'fetch,
            };

            if let Some(reduction) = reader
                .reduction(&top_hash)
                .await
                .map_err(EngineError::Store)?
            {
                // Snapshot shortcut: the reduction already covers the top
                // record, so it is not replayed.
                stack.pop();
                let replayed = stack.len();
                process
                    .set_serialized_state(&reduction.reduced_value)
                    .await
                    .map_err(EngineError::Process)?;
                let head = replay(process, stack, top_hash).await?;
                info!(head = %head, scanned, replayed, "rehydrated from reduction snapshot");
                return Ok(head);
            }

            if top_parent == empty_digest() {
                // Genesis reached. The default process state is the state
                // *before* genesis, so the genesis record itself is part of
                // the forward replay.
                let replayed = stack.len();
                let head = replay(process, stack, empty_digest()).await?;
                info!(head = %head, scanned, replayed, "rehydrated by full replay from genesis");
                return Ok(head);
            }

            match pool.remove(&top_parent) {
                Some(parent_record) => stack.push((top_parent, parent_record)),
                None => continue 'fetch,
            }
        }
    }

    match stack.first() {
        Some((head, _)) => Err(EngineError::ChainIncomplete(*head)),
        None => {
            info!("store empty; starting from default process state");
            Ok(empty_digest())
        }
    }
}

/// Replay stacked records forward (oldest first), returning the final head.
///
/// Replay responses are discarded; only the state transitions matter.
async fn replay(
    process: &mut dyn Process,
    mut stack: Vec<(ChainDigest, CompositionRecord)>,
    mut head: ChainDigest,
) -> Result<ChainDigest, EngineError> {
    while let Some((hash, record)) = stack.pop() {
        if let Some(state) = &record.set_state {
            process
                .set_serialized_state(state)
                .await
                .map_err(EngineError::Process)?;
        }
        if let Some(events) = &record.appended_events {
            for event in events {
                process
                    .process_event(event)
                    .await
                    .map_err(EngineError::Process)?;
            }
        }
        head = hash;
    }
    Ok(head)
}
