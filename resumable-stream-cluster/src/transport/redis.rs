//! Redis-backed transport
//!
//! The publisher runs every command through a `ConnectionManager`, which
//! re-establishes the connection on its own. The subscriber holds a single
//! dedicated pub/sub connection, routes incoming messages to per-channel
//! handlers, and reconnects with exponential backoff when the connection
//! drops, re-subscribing every channel that still has handlers.
//!
//! Messages published while the subscriber is disconnected are lost.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client, RedisError};
use resumable_stream_core::transport::MessageSender;
use resumable_stream_core::{Error, Publisher, Result, Subscriber, Subscription};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Redis operation timeout
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

const fn next_backoff(backoff_secs: u64) -> u64 {
    let doubled = backoff_secs.saturating_mul(2);
    if doubled > MAX_BACKOFF_SECS {
        MAX_BACKOFF_SECS
    } else {
        doubled
    }
}

fn timed_out(operation: &str) -> Error {
    Error::Timeout(format!("Redis {operation} timed out"))
}

fn map_incr_error(key: &str, e: RedisError) -> Error {
    if e.to_string().contains("not an integer") {
        Error::NotAnInteger {
            key: key.to_string(),
        }
    } else {
        Error::Redis(e)
    }
}

/// Publish and key-value half of the Redis transport
pub struct RedisPublisher {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisPublisher {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(redis_url)?,
            connection: OnceCell::new(),
            timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let conn = timeout(self.timeout, self.client.get_connection_manager())
                    .await
                    .map_err(|_| timed_out("connect"))??;
                info!("Redis publisher connected");
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("connected", &self.connection.initialized())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Publisher for RedisPublisher {
    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let receivers: usize = timeout(self.timeout, conn.publish(channel, message))
            .await
            .map_err(|_| timed_out("PUBLISH"))??;
        Ok(receivers)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let result = match ttl {
            // EX takes whole seconds and rejects zero
            Some(ttl) => {
                let seconds = ttl.as_secs().max(1);
                timeout(self.timeout, conn.set_ex::<_, _, ()>(key, value, seconds)).await
            }
            None => timeout(self.timeout, conn.set::<_, _, ()>(key, value)).await,
        };
        result.map_err(|_| timed_out("SET"))??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timeout(self.timeout, conn.get(key))
            .await
            .map_err(|_| timed_out("GET"))??;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        timeout(self.timeout, conn.incr::<_, _, i64>(key, 1))
            .await
            .map_err(|_| timed_out("INCR"))?
            .map_err(|e| map_incr_error(key, e))
    }
}

/// Handlers for every channel the subscriber connection listens on
type Handlers = Arc<DashMap<String, Vec<MessageSender>>>;

/// Command half of the live pub/sub connection, `None` while reconnecting
type SharedSink = Arc<Mutex<Option<PubSubSink>>>;

async fn open_pubsub(client: &Client, limit: Duration) -> Result<(PubSubSink, PubSubStream)> {
    let pubsub = timeout(limit, client.get_async_pubsub())
        .await
        .map_err(|_| timed_out("pub/sub connect"))??;
    Ok(pubsub.split())
}

/// Subscribe half of the Redis transport
///
/// Subscriptions survive a dropped connection: once the subscriber is back,
/// their channels are subscribed again and delivery resumes.
pub struct RedisSubscriber {
    client: Client,
    started: OnceCell<()>,
    sink: SharedSink,
    handlers: Handlers,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl RedisSubscriber {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(redis_url)?,
            started: OnceCell::new(),
            sink: Arc::new(Mutex::new(None)),
            handlers: Arc::new(DashMap::new()),
            timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Drop for RedisSubscriber {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RedisSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscriber")
            .field("connected", &self.started.initialized())
            .field("channels", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Route messages from the pub/sub connection to their handlers until it ends
async fn dispatch(stream: &mut PubSubStream, handlers: &Handlers) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                continue;
            }
        };

        if let Some(mut senders) = handlers.get_mut(&channel) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        } else {
            debug!(channel = %channel, "Message for channel without handlers");
        }
    }
}

/// Owns the pub/sub message stream and brings the connection back after a drop
struct Supervisor {
    client: Client,
    sink: SharedSink,
    handlers: Handlers,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut stream: PubSubStream) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Redis subscriber shut down");
                    return;
                }
                () = dispatch(&mut stream, &self.handlers) => {}
            }

            *self.sink.lock().await = None;
            error!(
                channels = self.handlers.len(),
                "Redis subscriber connection lost, reconnecting after {}s", INITIAL_BACKOFF_SECS
            );

            match self.reconnect().await {
                Some(next) => stream = next,
                None => {
                    debug!("Redis subscriber shut down during reconnect");
                    return;
                }
            }
        }
    }

    /// Retry with exponential backoff until connected or shut down
    async fn reconnect(&self) -> Option<PubSubStream> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            match self.resubscribe().await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Redis subscriber failed to reconnect, retrying after backoff"
                    );
                    backoff_secs = next_backoff(backoff_secs);
                }
            }
        }
    }

    /// Open a fresh connection and subscribe every channel that has handlers
    async fn resubscribe(&self) -> Result<PubSubStream> {
        let (mut sink, stream) = open_pubsub(&self.client, self.timeout).await?;

        // Snapshot under the lock, so a concurrent subscribe either lands in
        // the snapshot or finds the new sink installed
        let mut slot = self.sink.lock().await;
        let channels: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for channel in &channels {
            timeout(self.timeout, sink.subscribe(channel.as_str()))
                .await
                .map_err(|_| timed_out("SUBSCRIBE"))??;
        }
        *slot = Some(sink);

        info!(channels = channels.len(), "Redis subscriber reconnected");
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Subscriber for RedisSubscriber {
    async fn connect(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                let (sink, stream) = open_pubsub(&self.client, self.timeout).await?;
                *self.sink.lock().await = Some(sink);

                let supervisor = Supervisor {
                    client: self.client.clone(),
                    sink: self.sink.clone(),
                    handlers: self.handlers.clone(),
                    timeout: self.timeout,
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(supervisor.run(stream));
                info!("Redis subscriber connected");
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.connect().await?;
        let (tx, subscription) = Subscription::channel(channel);

        // Handler goes in first so nothing published right after SUBSCRIBE is lost
        let first = {
            let mut senders = self.handlers.entry(channel.to_string()).or_default();
            senders.push(tx);
            senders.len() == 1
        };
        if !first {
            return Ok(subscription);
        }

        let mut slot = self.sink.lock().await;
        let Some(sink) = slot.as_mut() else {
            debug!(channel = %channel, "Subscriber reconnecting, channel joins on reconnect");
            return Ok(subscription);
        };
        let result = timeout(self.timeout, sink.subscribe(channel))
            .await
            .map_err(|_| timed_out("SUBSCRIBE"))
            .and_then(|r| r.map_err(Error::from));
        if let Err(e) = result {
            drop(slot);
            self.handlers.remove(channel);
            return Err(e);
        }
        debug!(channel = %channel, "Subscribed");

        Ok(subscription)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if self.handlers.remove(channel).is_none() {
            return Ok(());
        }

        let mut slot = self.sink.lock().await;
        // Nothing to tell Redis while disconnected; the channel is not
        // re-subscribed since its handlers are gone
        let Some(sink) = slot.as_mut() else {
            return Ok(());
        };
        timeout(self.timeout, sink.unsubscribe(channel))
            .await
            .map_err(|_| timed_out("UNSUBSCRIBE"))??;
        debug!(channel = %channel, "Unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisPublisher::new("not a url").is_err());
        assert!(RedisSubscriber::new("not a url").is_err());
    }

    #[test]
    fn test_unconnected_debug() {
        let publisher = RedisPublisher::new(REDIS_URL).unwrap();
        assert!(format!("{publisher:?}").contains("connected: false"));
        let subscriber = RedisSubscriber::new(REDIS_URL).unwrap();
        assert!(format!("{subscriber:?}").contains("connected: false"));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(next_backoff(u64::MAX), MAX_BACKOFF_SECS);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_incr_on_done_value() {
        let publisher = RedisPublisher::new(REDIS_URL).unwrap();
        let key = format!("test:rs:sentinel:{}", uuid::Uuid::new_v4());

        assert_eq!(publisher.incr(&key).await.unwrap(), 1);
        assert_eq!(publisher.incr(&key).await.unwrap(), 2);

        publisher
            .set(&key, "DONE", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let err = publisher.incr(&key).await.unwrap_err();
        assert!(err.is_not_an_integer());
        assert_eq!(publisher.get(&key).await.unwrap().as_deref(), Some("DONE"));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_subscribe() {
        let publisher = RedisPublisher::new(REDIS_URL).unwrap();
        let subscriber = RedisSubscriber::new(REDIS_URL).unwrap();
        let channel = format!("test:rs:chunk:{}", uuid::Uuid::new_v4());

        let mut subscription = subscriber.subscribe(&channel).await.unwrap();
        assert_eq!(publisher.publish(&channel, "a").await.unwrap(), 1);
        assert_eq!(publisher.publish(&channel, "b").await.unwrap(), 1);

        assert_eq!(subscription.recv().await.as_deref(), Some("a"));
        assert_eq!(subscription.recv().await.as_deref(), Some("b"));

        subscriber.unsubscribe(&channel).await.unwrap();
        assert_eq!(subscription.recv().await, None);
        subscriber.unsubscribe(&channel).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_subscriber_recovers_after_connection_drop() {
        let publisher = RedisPublisher::new(REDIS_URL).unwrap();
        let subscriber = RedisSubscriber::new(REDIS_URL).unwrap();
        let channel = format!("test:rs:chunk:{}", uuid::Uuid::new_v4());
        let mut subscription = subscriber.subscribe(&channel).await.unwrap();

        let mut admin = Client::open(REDIS_URL)
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let killed: i64 = redis::cmd("CLIENT")
            .arg("KILL")
            .arg("TYPE")
            .arg("pubsub")
            .query_async(&mut admin)
            .await
            .unwrap();
        assert!(killed >= 1);

        // The existing subscription is re-subscribed once the connection is back
        tokio::time::timeout(Duration::from_secs(10), async {
            while publisher.publish(&channel, "after").await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("subscriber did not reconnect");
        assert_eq!(subscription.recv().await.as_deref(), Some("after"));

        // New subscriptions work on the new connection
        let other = format!("test:rs:chunk:{}", uuid::Uuid::new_v4());
        let mut fresh = subscriber.subscribe(&other).await.unwrap();
        assert_eq!(publisher.publish(&other, "fresh").await.unwrap(), 1);
        assert_eq!(fresh.recv().await.as_deref(), Some("fresh"));
    }
}
