#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-runtime** – Store-binding runtime for Edda.
//!
//! [`DurableProcess`] glues the persistent process engine to a store: each
//! externally submitted mutation runs through the engine, then the resulting
//! composition record is appended and a fresh reduction snapshot is written,
//! in that order. Callers get the adapter-shaped surface (`process_event`,
//! `serialized_state`, `set_serialized_state`) with durability underneath.
//!
//! If a record append fails after the engine has advanced, the in-memory and
//! on-disk heads diverge; the wrapper takes the engine offline (disposes it)
//! and propagates the error. Failed reduction writes are merely logged -
//! reductions are best-effort and replay covers their absence.

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, warn};

use edda_engine::{EncodedRecord, PersistentProcess};
use edda_process::Process;
use edda_store_core::{ChainDigest, StoreReader, StoreWriter};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Write a reduction snapshot after every successful mutation.
    ///
    /// Disabling this trades rehydration time (full replay from genesis) for
    /// storage space; correctness is unaffected.
    pub store_reductions: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_reductions: true,
        }
    }
}

//─────────────────────────────
//  Durable process
//─────────────────────────────

/// A persistent process bound to durable storage.
///
/// An outer lock serializes each mutation end-to-end (engine call, record
/// append, reduction write), so record/reduction pairs from concurrent
/// callers never interleave and the chain stays linear.
pub struct DurableProcess<S> {
    engine: PersistentProcess,
    store: S,
    config: RuntimeConfig,
    commit_lock: Mutex<()>,
}

impl<S> core::fmt::Debug for DurableProcess<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DurableProcess")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> DurableProcess<S>
where
    S: StoreReader + StoreWriter,
{
    /// Rehydrate `process` from `store` and bind it for durable operation.
    pub async fn open(process: Box<dyn Process>, store: S) -> Result<Self> {
        Self::open_with_config(process, store, RuntimeConfig::default()).await
    }

    /// [`open`](Self::open) with explicit configuration.
    pub async fn open_with_config(
        process: Box<dyn Process>,
        store: S,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let engine = PersistentProcess::rehydrate(process, &store)
            .await
            .context("failed to rehydrate persistent process")?;
        Ok(Self {
            engine,
            store,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    /// Apply one event durably and return the process's response.
    pub async fn process_event(&self, event: &str) -> Result<String> {
        let mut responses = self.process_events(vec![event.to_string()]).await?;
        responses
            .pop()
            .ok_or_else(|| anyhow::anyhow!("engine returned no response for a one-event batch"))
    }

    /// Apply a batch of events durably, as a single composition record.
    ///
    /// Responses align 1:1 and in order with `events`. The batch is not
    /// atomic at the process level; see the engine documentation.
    pub async fn process_events(&self, events: Vec<String>) -> Result<Vec<String>> {
        let _guard = self.commit_lock.lock().await;
        let (responses, record) = self.engine.process_events(events).await?;
        self.commit(&record).await?;
        Ok(responses)
    }

    /// Current serialized state of the process.
    pub async fn serialized_state(&self) -> Result<String> {
        Ok(self.engine.current_reduction().await?.reduced_value)
    }

    /// Override the process state durably.
    pub async fn set_serialized_state(&self, state: &str) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let record = self.engine.set_state(state).await?;
        self.commit(&record).await
    }

    /// Digest of the latest committed record; identity of the current state.
    pub async fn last_state_hash(&self) -> Result<ChainDigest> {
        Ok(self.engine.last_state_hash().await?)
    }

    /// Take the process offline. Every subsequent operation fails.
    pub async fn dispose(&self) -> Result<()> {
        self.engine.dispose().await?;
        Ok(())
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a freshly materialized record, then its reduction.
    ///
    /// The record must be durable before the reduction: a reader that sees a
    /// record without its reduction merely pays a replay cost, while the
    /// reverse order could snapshot a head nothing references yet.
    async fn commit(&self, record: &EncodedRecord) -> Result<()> {
        if let Err(e) = self.store.append_composition(&record.bytes).await {
            error!(head = %record.hash, error = %e, "record append failed; taking engine offline");
            let _ = self.engine.dispose().await;
            return Err(e.context("failed to append composition record"));
        }

        if self.config.store_reductions {
            match self.engine.current_reduction().await {
                Ok(reduction) => {
                    if let Err(e) = self.store.put_reduction(&reduction).await {
                        warn!(head = %record.hash, error = %e,
                              "reduction write failed; next rehydration will replay instead");
                    }
                }
                Err(e) => {
                    warn!(head = %record.hash, error = %e,
                          "could not snapshot state for reduction; next rehydration will replay instead");
                }
            }
        }

        Ok(())
    }
}
