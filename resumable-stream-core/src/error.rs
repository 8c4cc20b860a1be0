use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The key holds a value that cannot be incremented. For a sentinel key
    /// this means the stream has been marked done.
    #[error("Value at {key} is not an integer or out of range")]
    NotAnInteger { key: String },

    #[error("Timeout waiting for ack on stream {stream_id}")]
    AckTimeout { stream_id: String },

    #[error("Source stream error: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether this error reports an increment against a non-numeric value
    #[must_use]
    pub const fn is_not_an_integer(&self) -> bool {
        matches!(self, Self::NotAnInteger { .. })
    }

    #[must_use]
    pub const fn is_ack_timeout(&self) -> bool {
        matches!(self, Self::AckTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
