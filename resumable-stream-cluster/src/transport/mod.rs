//! Networked transport backends
//!
//! The in-process backend lives in `resumable_stream_core::local`.

pub mod redis;

pub use self::redis::{RedisPublisher, RedisSubscriber};
