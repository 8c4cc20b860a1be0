//! Key and channel naming
//!
//! Every key and channel lives under `{prefix}:rs` so several deployments can
//! share one broker. Layout:
//!
//! | Name                          | Kind    | Purpose                          |
//! |-------------------------------|---------|----------------------------------|
//! | `{p}:rs:sentinel:{stream}`    | String  | join counter, then `DONE`        |
//! | `{p}:rs:request:{stream}`     | Channel | join requests to the producer    |
//! | `{p}:rs:chunk:{listener}`     | Channel | replay and live chunks           |
//! | `{p}:rs:control:{stream}`     | Channel | cancellation broadcast           |
//! | `{p}:rs:control-state:{stream}` | String | persisted cancellation flag     |

use crate::config::StreamConfig;

/// Value written to the sentinel key once the producer finished
pub const DONE_VALUE: &str = "DONE";

/// Reserved payload that ends a reply channel. Never a legitimate chunk.
pub const DONE_MESSAGE: &str = "\n\n\nDONE_SENTINEL_hasdfasudfyge374%$%^$EDSATRTYFtydryrte\n";

/// Message broadcast on the control channel
pub const ABORT_MESSAGE: &str = "ABORT";

/// Value written to the control-state key after a cancellation request
pub const ABORTED_VALUE: &str = "ABORTED";

pub const DEFAULT_KEY_PREFIX: &str = "resumable-stream";

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a `KeyBuilder` for the given user-facing prefix
    pub fn new(prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        let prefix = if prefix.is_empty() {
            DEFAULT_KEY_PREFIX
        } else {
            prefix
        };
        Self {
            prefix: format!("{prefix}:rs"),
        }
    }

    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(&config.key_prefix)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn sentinel(&self, stream_id: &str) -> String {
        format!("{}:sentinel:{}", self.prefix, stream_id)
    }

    #[must_use]
    pub fn request_channel(&self, stream_id: &str) -> String {
        format!("{}:request:{}", self.prefix, stream_id)
    }

    #[must_use]
    pub fn chunk_channel(&self, listener_id: &str) -> String {
        format!("{}:chunk:{}", self.prefix, listener_id)
    }

    #[must_use]
    pub fn control_channel(&self, stream_id: &str) -> String {
        format!("{}:control:{}", self.prefix, stream_id)
    }

    #[must_use]
    pub fn control_state(&self, stream_id: &str) -> String {
        format!("{}:control-state:{}", self.prefix, stream_id)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
