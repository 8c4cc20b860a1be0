//! Resumable streams shared across processes
//!
//! A stream id has one producer, elected through a sentinel counter. Other
//! callers joining the same id replay what was produced so far and then
//! follow live output. See [`ResumableStreamContext`] for the entry points.

pub mod context;
pub mod registry;
pub mod session;
pub mod transport;

pub use context::{ContextOptions, ExistingStream, ResumableStreamContext};
pub use registry::{JoinOutcome, SentinelRegistry, SentinelState};
pub use session::{
    CancellationController, ControllerGuard, JoinRequest, KeepAlive, ResumableStream,
    SpawnKeepAlive, TrackedKeepAlive,
};
pub use transport::{RedisPublisher, RedisSubscriber};

pub use resumable_stream_core::{Error, LocalTransport, Result};
