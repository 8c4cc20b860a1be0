//! Producer and resumer sessions
//!
//! Exactly one producer per stream id owns the source and its transcript.
//! Every other caller runs a resumer that asks the producer (over the request
//! channel) for a replay and then tails live chunks on a private reply channel.

pub mod buffer;
pub mod cancellation;
pub mod keep_alive;
pub mod output;
pub mod producer;
pub mod resumer;

use std::sync::Arc;
use std::time::Duration;

use resumable_stream_core::{KeyBuilder, Publisher, Subscriber};
use serde::{Deserialize, Serialize};

pub use buffer::ChunkBuffer;
pub use cancellation::{CancellationController, ControllerGuard};
pub use keep_alive::{KeepAlive, SpawnKeepAlive, TrackedKeepAlive};
pub use output::ResumableStream;

use crate::registry::SentinelRegistry;

/// Message a resumer publishes on the stream's request channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub listener_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_characters: Option<usize>,
}

/// Everything a session needs from its context
pub(crate) struct SessionContext {
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) subscriber: Arc<dyn Subscriber>,
    pub(crate) keys: KeyBuilder,
    pub(crate) sentinel: SentinelRegistry,
    pub(crate) cancellation: Option<CancellationController>,
    pub(crate) keep_alive: Arc<dyn KeepAlive>,
    pub(crate) ack_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_request_wire_format() {
        let request = JoinRequest {
            listener_id: "abc".to_string(),
            skip_characters: Some(4),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"listenerId":"abc","skipCharacters":4}"#
        );

        let parsed: JoinRequest = serde_json::from_str(r#"{"listenerId":"xyz"}"#).unwrap();
        assert_eq!(parsed.listener_id, "xyz");
        assert_eq!(parsed.skip_characters, None);
    }
}
