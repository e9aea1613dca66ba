#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **edda-process** – Opaque process abstraction for Edda.
//!
//! The engine drives a black-box state machine through this trait: apply one
//! event and produce a response, export and import the serialized state, and
//! dispose. The real process is an external collaborator; this crate only
//! pins down the contract it must satisfy, plus a deterministic reference
//! stub used throughout the test suites.

use anyhow::Result;
use async_trait::async_trait;

//─────────────────────────────
//  Process trait
//─────────────────────────────

/// An opaque, event-driven state machine with serialization capability.
///
/// Implementations must be deterministic with respect to their serialized
/// state and event sequence: applying the same events to the same starting
/// state yields the same state and the same responses. The engine owns its
/// process exclusively and applies events strictly sequentially.
#[async_trait]
pub trait Process: Send + Sync {
    /// Apply one opaque event and return the process's response to it.
    async fn process_event(&mut self, event: &str) -> Result<String>;

    /// Export the current state in its serialized form.
    async fn serialized_state(&self) -> Result<String>;

    /// Replace the current state wholesale from its serialized form.
    async fn set_serialized_state(&mut self, state: &str) -> Result<()>;

    /// Release any resources held by the process.
    ///
    /// Called exactly once, after which the process receives no further
    /// calls.
    async fn dispose(&mut self) -> Result<()>;
}

//─────────────────────────────
//  Reference stub
//─────────────────────────────

/// Deterministic reference process: state is the concatenation of every
/// applied event, responses echo the event back.
///
/// Starts from the empty string, which doubles as its default (pre-genesis)
/// serialized state.
#[derive(Debug, Default, Clone)]
pub struct EchoProcess {
    state: String,
}

impl EchoProcess {
    /// Creates a stub in its default empty state.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Process for EchoProcess {
    async fn process_event(&mut self, event: &str) -> Result<String> {
        self.state.push_str(event);
        Ok(event.to_string())
    }

    async fn serialized_state(&self) -> Result<String> {
        Ok(self.state.clone())
    }

    async fn set_serialized_state(&mut self, state: &str) -> Result<()> {
        self.state = state.to_string();
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_responses_and_concatenated_state() {
        let mut process = EchoProcess::new();
        assert_eq!(process.process_event("a").await.unwrap(), "a");
        assert_eq!(process.process_event("b").await.unwrap(), "b");
        assert_eq!(process.serialized_state().await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn state_import_replaces_wholesale() {
        let mut process = EchoProcess::new();
        process.process_event("abc").await.unwrap();
        process.set_serialized_state("xyz").await.unwrap();
        assert_eq!(process.serialized_state().await.unwrap(), "xyz");

        // Determinism: same events on same state, same outcome.
        process.process_event("1").await.unwrap();
        assert_eq!(process.serialized_state().await.unwrap(), "xyz1");
    }
}
