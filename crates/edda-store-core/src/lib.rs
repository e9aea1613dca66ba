#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-store-core** – Core storage abstractions for Edda.
//!
//! This crate defines the value types of the composition chain (records,
//! reductions, digests), the canonical byte encoding that digests are
//! computed over, and the reader/writer traits that storage drivers
//! implement. It sits at the bottom of the crate graph and performs no I/O
//! itself.
//!
//! Storage drivers (sled, in-memory, etc.) implement these traits in
//! separate crates that depend on this core abstraction.

use core::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

//─────────────────────────────
//  Chain digests
//─────────────────────────────

/// Width of a chain digest in bytes (blake3 output).
pub const DIGEST_LEN: usize = 32;

/// Blake3 digest identifying one composition record by its canonical bytes.
///
/// Digests render as lowercase hex everywhere: `Display`, `Debug`, and the
/// canonical record encoding. The hash function is part of the on-disk
/// format; changing it invalidates every previously written chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainDigest(pub [u8; DIGEST_LEN]);

impl ChainDigest {
    /// View the digest as a byte slice.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex form, as written into canonical encodings.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest from its lowercase hex form.
    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s).map_err(|_| CodecError::InvalidDigest(s.to_string()))?;
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidDigest(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ChainDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChainDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainDigest({})", self.to_hex())
    }
}

impl FromStr for ChainDigest {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ChainDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Compute the chain digest of a byte sequence.
pub fn digest(bytes: &[u8]) -> ChainDigest {
    ChainDigest(*blake3::hash(bytes).as_bytes())
}

static EMPTY_DIGEST: Lazy<ChainDigest> = Lazy::new(|| digest(&[]));

/// The empty-init digest: `digest` of the empty byte sequence.
///
/// Sentinel `parent_hash` of the genesis record, and the chain head of an
/// empty store.
pub fn empty_digest() -> ChainDigest {
    *EMPTY_DIGEST
}

//─────────────────────────────
//  Composition records
//─────────────────────────────

/// One immutable step in a composition chain.
///
/// A record links to its parent by digest and carries either a batch of
/// opaque event strings or a serialized state override. The engine never
/// produces both in the same record.
///
/// Field order here is load-bearing: the canonical encoding serializes
/// fields in declaration order, and digests are computed over those bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionRecord {
    /// Digest of the previous record, or [`empty_digest`] for genesis.
    pub parent_hash: ChainDigest,
    /// Ordered opaque events applied in this step; non-empty when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub appended_events: Option<Vec<String>>,
    /// Serialized state override, when this step replaces the state wholesale.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub set_state: Option<String>,
}

impl CompositionRecord {
    /// Build an event-application record.
    pub fn events(parent_hash: ChainDigest, events: Vec<String>) -> Self {
        Self {
            parent_hash,
            appended_events: Some(events),
            set_state: None,
        }
    }

    /// Build a state-override record.
    pub fn state_override(parent_hash: ChainDigest, state: String) -> Self {
        Self {
            parent_hash,
            appended_events: None,
            set_state: Some(state),
        }
    }

    /// Whether this record is the genesis step (parent is the empty-init digest).
    pub fn is_genesis(&self) -> bool {
        self.parent_hash == empty_digest()
    }

    /// Canonical byte form: compact JSON, declaration field order, absent
    /// optional fields omitted. Digest input for this record.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    /// Decode a record from its canonical byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

//─────────────────────────────
//  Reduction records
//─────────────────────────────

/// A state snapshot keyed by the record whose application produced it.
///
/// `reduced_value` is the opaque process state serialized *after* the record
/// named by `reduced_composition_hash` was applied. Reductions are the only
/// shortcut that lets rehydration avoid a full replay from genesis; they are
/// best-effort and may be missing or stale without affecting correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionRecord {
    /// Digest of the composition record this snapshot covers.
    pub reduced_composition_hash: ChainDigest,
    /// Serialized process state after that record was applied.
    pub reduced_value: String,
}

impl ReductionRecord {
    /// Canonical byte form, same encoding rules as composition records.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    /// Decode a reduction from its canonical byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

//─────────────────────────────
//  Codec errors
//─────────────────────────────

/// Errors produced while encoding or decoding chain values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value failed to serialize into its canonical form.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
    /// Stored bytes did not parse as the expected record type.
    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),
    /// A digest string was not valid lowercase hex of the right width.
    #[error("invalid digest hex: {0:?}")]
    InvalidDigest(String),
}

//─────────────────────────────
//  Storage traits
//─────────────────────────────

/// Lazy newest-first stream of stored composition record bytes.
///
/// Finite and single-pass; obtain a fresh stream to restart from the newest
/// record.
pub type RecordStream = BoxStream<'static, Result<Vec<u8>>>;

/// Append-only write half of a store.
#[async_trait]
pub trait StoreWriter: Send + Sync {
    /// Append one composition record's canonical bytes.
    ///
    /// Atomic and durable on return: a crash after this call resolves must
    /// preserve the record; a crash before it may leave either nothing or
    /// the whole record, never a torn one. Subsequent reverse enumeration
    /// yields this record first.
    async fn append_composition(&self, record_bytes: &[u8]) -> Result<()>;

    /// Write or overwrite the reduction keyed by its composition hash.
    ///
    /// Best-effort: drivers may defer durability, and a lost reduction only
    /// costs replay time on the next rehydration.
    async fn put_reduction(&self, reduction: &ReductionRecord) -> Result<()>;
}

/// Read half of a store.
#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Enumerate stored composition records newest-first.
    async fn compositions_reverse(&self) -> Result<RecordStream>;

    /// Look up the reduction keyed by `hash`, if one was stored.
    async fn reduction(&self, hash: &ChainDigest) -> Result<Option<ReductionRecord>>;
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        digest, empty_digest, ChainDigest, CodecError, CompositionRecord, RecordStream,
        ReductionRecord, StoreReader, StoreWriter, DIGEST_LEN,
    };
}
