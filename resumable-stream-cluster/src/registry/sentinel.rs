//! Sentinel registry
//!
//! One shared value per stream id elects the producer and records completion.
//! The value is a counter while the stream runs and the literal `DONE` after
//! it finished. An increment against `DONE` fails on the backend, and that
//! failure is how joiners learn the stream is over.

use std::sync::Arc;
use std::time::Duration;

use resumable_stream_core::keys::DONE_VALUE;
use resumable_stream_core::{KeyBuilder, Publisher, Result};
use tracing::debug;

/// Result of joining a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Number of sessions that have joined so far, this one included
    Active(i64),
    Done,
}

impl JoinOutcome {
    /// Only the session that created the counter owns the source stream
    #[must_use]
    pub const fn is_producer(self) -> bool {
        matches!(self, Self::Active(1))
    }
}

/// Observed sentinel state, without joining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Absent,
    Active,
    Done,
}

#[derive(Clone)]
pub struct SentinelRegistry {
    publisher: Arc<dyn Publisher>,
    keys: KeyBuilder,
    done_ttl: Duration,
}

impl SentinelRegistry {
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, keys: KeyBuilder, done_ttl: Duration) -> Self {
        Self {
            publisher,
            keys,
            done_ttl,
        }
    }

    /// Atomically join the stream, creating the counter if needed
    pub async fn join(&self, stream_id: &str) -> Result<JoinOutcome> {
        let key = self.keys.sentinel(stream_id);
        match self.publisher.incr(&key).await {
            Ok(count) => {
                debug!(stream_id = %stream_id, count = count, "Joined stream");
                Ok(JoinOutcome::Active(count))
            }
            Err(e) if e.is_not_an_integer() => {
                debug!(stream_id = %stream_id, "Sentinel reads done");
                Ok(JoinOutcome::Done)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the sentinel without changing it
    pub async fn probe(&self, stream_id: &str) -> Result<SentinelState> {
        let value = self.publisher.get(&self.keys.sentinel(stream_id)).await?;
        Ok(match value.as_deref() {
            None => SentinelState::Absent,
            Some(DONE_VALUE) => SentinelState::Done,
            Some(_) => SentinelState::Active,
        })
    }

    /// Record completion. Only the producer calls this, once.
    pub async fn mark_done(&self, stream_id: &str) -> Result<()> {
        debug!(stream_id = %stream_id, "Setting sentinel to done");
        self.publisher
            .set(
                &self.keys.sentinel(stream_id),
                DONE_VALUE,
                Some(self.done_ttl),
            )
            .await
    }

    /// Claim the stream outright, bypassing the join counter
    pub async fn mark_active(&self, stream_id: &str) -> Result<()> {
        self.publisher
            .set(&self.keys.sentinel(stream_id), "1", Some(self.done_ttl))
            .await
    }
}

impl std::fmt::Debug for SentinelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelRegistry")
            .field("prefix", &self.keys.prefix())
            .field("done_ttl", &self.done_ttl)
            .finish()
    }
}
