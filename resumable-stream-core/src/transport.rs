//! Transport capabilities
//!
//! The coordination protocol only needs a handful of pub/sub and key-value
//! primitives. Any backend offering them (Redis, Valkey, the in-process
//! [`LocalTransport`](crate::local::LocalTransport)) can carry resumable streams.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::Result;

/// Key-value and publish side of a transport
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Publish a message, returning the number of receivers reported by the backend
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically increment a counter, creating it at 1 when missing.
    ///
    /// Implementations must report a non-numeric existing value as
    /// [`Error::NotAnInteger`](crate::Error::NotAnInteger).
    async fn incr(&self, key: &str) -> Result<i64>;
}

/// Subscribe side of a transport
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Start receiving messages published on `channel`, in publish order.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Stop delivery on `channel`. Every open [`Subscription`] for it ends.
    /// Unsubscribing an unknown channel is not an error.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// Sender half kept by transports for each live subscription
pub type MessageSender = mpsc::UnboundedSender<String>;

/// Ordered sequence of messages delivered on one channel
///
/// Ends (yields `None`) once the channel is unsubscribed. Transports that
/// reconnect keep it open across a dropped connection.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Create a subscription and the sender the transport delivers through
    #[must_use]
    pub fn channel(channel: impl Into<String>) -> (MessageSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                channel: channel.into(),
                receiver: rx,
            },
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Receive the next message
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Take a message that has already been delivered, without waiting
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl futures::Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_preserves_order() {
        let (tx, mut sub) = Subscription::channel("ch");
        tx.send("a".to_string()).unwrap();
        tx.send("b".to_string()).unwrap();
        drop(tx);

        assert_eq!(sub.name(), "ch");
        assert_eq!(sub.recv().await.as_deref(), Some("a"));
        assert_eq!(sub.try_recv().as_deref(), Some("b"));
        assert_eq!(sub.recv().await, None);
    }
}
