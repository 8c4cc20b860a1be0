//! In-process transport for single-node deployments
//!
//! Implements both [`Publisher`] and [`Subscriber`] on top of shared maps, so a
//! single `LocalTransport` (and its clones) behaves like one broker. Keys honor
//! their TTL lazily on access.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{MessageSender, Publisher, Subscriber, Subscription};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Broker living inside the current process
#[derive(Clone, Default)]
pub struct LocalTransport {
    /// Map of channel -> senders of open subscriptions
    channels: Arc<DashMap<String, Vec<MessageSender>>>,
    data: Arc<DashMap<String, StoredValue>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with at least one subscription
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Remaining lifetime of a key, `None` when missing or without expiry
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|stored| stored.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("channels", &self.channels.len())
            .field("keys", &self.data.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Publisher for LocalTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut delivered = 0;
        if let Some(mut senders) = self.channels.get_mut(channel) {
            senders.retain(|tx| tx.send(message.to_string()).is_ok());
            delivered = senders.len();
        }
        debug!(channel = %channel, receivers = delivered, "Local publish");
        Ok(delivered)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        // Drop the read guard before a possible removal
        let stored = self.data.get(key).map(|stored| stored.clone());
        match stored {
            Some(stored) if stored.is_expired(now) => {
                self.data.remove_if(key, |_, v| v.is_expired(now));
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        // The entry guard holds the shard lock, which makes read-modify-write atomic
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue {
                        value: "1".to_string(),
                        expires_at: None,
                    });
                    return Ok(1);
                }
                let current: i64 =
                    occupied
                        .get()
                        .value
                        .parse()
                        .map_err(|_| Error::NotAnInteger {
                            key: key.to_string(),
                        })?;
                let next = current.checked_add(1).ok_or_else(|| Error::NotAnInteger {
                    key: key.to_string(),
                })?;
                // INCR keeps an existing expiry
                occupied.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for LocalTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, subscription) = Subscription::channel(channel);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel = %channel, "Local subscribe");
        Ok(subscription)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if self.channels.remove(channel).is_some() {
            debug!(channel = %channel, "Local unsubscribe");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let transport = LocalTransport::new();
        let mut a = transport.subscribe("ch").await.unwrap();
        let mut b = transport.subscribe("ch").await.unwrap();

        assert_eq!(transport.publish("ch", "1").await.unwrap(), 2);
        assert_eq!(transport.publish("ch", "2").await.unwrap(), 2);
        assert_eq!(transport.publish("other", "x").await.unwrap(), 0);

        assert_eq!(a.recv().await.as_deref(), Some("1"));
        assert_eq!(a.recv().await.as_deref(), Some("2"));
        assert_eq!(b.recv().await.as_deref(), Some("1"));
        assert_eq!(b.recv().await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_subscription_and_is_idempotent() {
        let transport = LocalTransport::new();
        let mut sub = transport.subscribe("ch").await.unwrap();
        assert!(transport.is_subscribed("ch"));

        transport.unsubscribe("ch").await.unwrap();
        transport.unsubscribe("ch").await.unwrap();

        assert!(!transport.is_subscribed("ch"));
        assert_eq!(sub.recv().await, None);
        assert_eq!(transport.publish("ch", "late").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned_on_publish() {
        let transport = LocalTransport::new();
        let sub = transport.subscribe("ch").await.unwrap();
        drop(sub);
        assert_eq!(transport.publish("ch", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_counts_and_rejects_non_integers() {
        let transport = LocalTransport::new();
        assert_eq!(transport.incr("k").await.unwrap(), 1);
        assert_eq!(transport.incr("k").await.unwrap(), 2);
        assert_eq!(transport.get("k").await.unwrap().as_deref(), Some("2"));

        transport.set("k", "DONE", None).await.unwrap();
        let err = transport.incr("k").await.unwrap_err();
        assert!(err.is_not_an_integer());
        assert_eq!(transport.get("k").await.unwrap().as_deref(), Some("DONE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let transport = LocalTransport::new();
        transport
            .set("k", "DONE", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(transport.ttl("k").is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(transport.get("k").await.unwrap().as_deref(), Some("DONE"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(transport.get("k").await.unwrap(), None);
        // An expired key is reusable as a fresh counter
        transport
            .set("k", "DONE", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(transport.incr("k").await.unwrap(), 1);
    }
}
