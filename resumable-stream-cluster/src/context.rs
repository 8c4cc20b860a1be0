//! Public entry point for resumable streams

use std::sync::Arc;
use std::time::Duration;

use resumable_stream_core::config::StreamConfig;
use resumable_stream_core::{
    Config, Error, KeyBuilder, LocalTransport, Publisher, Result, Subscriber,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::registry::{JoinOutcome, SentinelRegistry, SentinelState};
use crate::session::producer::ProducerSession;
use crate::session::{
    resumer, CancellationController, KeepAlive, ResumableStream, SessionContext, SpawnKeepAlive,
};
use crate::transport::{RedisPublisher, RedisSubscriber};

/// Options for a [`ResumableStreamContext`]
#[derive(Clone)]
pub struct ContextOptions {
    /// Namespace for keys and channels; defaults to `resumable-stream`
    pub key_prefix: String,
    pub ack_timeout: Duration,
    pub done_ttl: Duration,
    pub cancellation_enabled: bool,
    pub keep_alive: Arc<dyn KeepAlive>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl ContextOptions {
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            ack_timeout: config.ack_timeout(),
            done_ttl: config.done_ttl(),
            cancellation_enabled: config.cancellation_enabled,
            keep_alive: Arc::new(SpawnKeepAlive),
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Arc<dyn KeepAlive>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

impl std::fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextOptions")
            .field("key_prefix", &self.key_prefix)
            .field("ack_timeout", &self.ack_timeout)
            .field("done_ttl", &self.done_ttl)
            .field("cancellation_enabled", &self.cancellation_enabled)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ResumableStreamContext::resume_existing_stream`]
#[derive(Debug)]
pub enum ExistingStream {
    /// No stream with this id was ever started (or its sentinel expired)
    Absent,
    /// The stream finished; read its final output from durable storage
    Done,
    Live(ResumableStream),
}

/// Creates and resumes streams that outlive the request that started them
#[derive(Clone)]
pub struct ResumableStreamContext {
    ctx: Arc<SessionContext>,
    done_ttl: Duration,
    connected: Arc<OnceCell<()>>,
}

impl ResumableStreamContext {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        options: ContextOptions,
    ) -> Self {
        let keys = KeyBuilder::new(&options.key_prefix);
        let sentinel = SentinelRegistry::new(publisher.clone(), keys.clone(), options.done_ttl);
        let cancellation = options.cancellation_enabled.then(|| {
            CancellationController::new(
                publisher.clone(),
                subscriber.clone(),
                keys.clone(),
                options.done_ttl,
            )
        });

        Self {
            ctx: Arc::new(SessionContext {
                publisher,
                subscriber,
                keys,
                sentinel,
                cancellation,
                keep_alive: options.keep_alive,
                ack_timeout: options.ack_timeout,
            }),
            done_ttl: options.done_ttl,
            connected: Arc::new(OnceCell::new()),
        }
    }

    /// Context backed by an in-process transport, for single-node deployments
    #[must_use]
    pub fn local(transport: LocalTransport, options: ContextOptions) -> Self {
        Self::new(Arc::new(transport.clone()), Arc::new(transport), options)
    }

    /// Build a context from configuration: Redis when a URL is configured,
    /// otherwise the local transport
    pub fn from_config(config: &Config, keep_alive: Arc<dyn KeepAlive>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;
        let options = ContextOptions::from_config(&config.stream).with_keep_alive(keep_alive);
        match config.redis_url() {
            Some(url) => {
                let timeout = Duration::from_secs(config.redis.connect_timeout_seconds);
                info!("Using Redis transport");
                Ok(Self::new(
                    Arc::new(RedisPublisher::new(url)?.with_timeout(timeout)),
                    Arc::new(RedisSubscriber::new(url)?.with_timeout(timeout)),
                    options,
                ))
            }
            None => {
                info!("Redis not configured, using local transport");
                Ok(Self::local(LocalTransport::new(), options))
            }
        }
    }

    /// Validate the id and connect both transport halves once
    async fn prepare(&self, stream_id: &str) -> Result<()> {
        if stream_id.is_empty() {
            return Err(Error::InvalidInput("stream id must not be empty".to_string()));
        }
        self.ensure_connected().await
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.connected
            .get_or_try_init(|| async {
                self.ctx.publisher.connect().await?;
                self.ctx.subscriber.connect().await?;
                debug!("Transport connected");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Join `stream_id`, producing it if nobody else does yet
    ///
    /// `make_source` only runs when this call becomes the producer.
    /// `skip_characters` is the number of characters the caller has already
    /// seen and only applies when joining an existing stream. Returns `None`
    /// if the stream already finished.
    pub async fn resumable_stream<F, S>(
        &self,
        stream_id: &str,
        make_source: F,
        skip_characters: Option<usize>,
    ) -> Result<Option<ResumableStream>>
    where
        F: FnOnce() -> S,
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        self.prepare(stream_id).await?;

        match self.ctx.sentinel.join(stream_id).await? {
            JoinOutcome::Done => Ok(None),
            JoinOutcome::Active(1) => {
                if skip_characters.is_some_and(|skip| skip > 0) {
                    debug!(
                        stream_id = %stream_id,
                        "Ignoring skip_characters for a stream that is not yet in progress"
                    );
                }
                ProducerSession::start(self.ctx.clone(), stream_id, make_source)
                    .await
                    .map(Some)
            }
            JoinOutcome::Active(count) => {
                debug!(stream_id = %stream_id, listeners = count, "Resuming stream");
                resumer::resume(self.ctx.clone(), stream_id, skip_characters).await
            }
        }
    }

    /// Produce `stream_id` without going through the join counter
    ///
    /// Returns `None`, without running `make_source`, if the stream already
    /// finished.
    pub async fn create_new_resumable_stream<F, S>(
        &self,
        stream_id: &str,
        make_source: F,
    ) -> Result<Option<ResumableStream>>
    where
        F: FnOnce() -> S,
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        self.prepare(stream_id).await?;

        if self.ctx.sentinel.probe(stream_id).await? == SentinelState::Done {
            debug!(stream_id = %stream_id, "Refusing to recreate a finished stream");
            return Ok(None);
        }
        self.ctx.sentinel.mark_active(stream_id).await?;
        ProducerSession::start(self.ctx.clone(), stream_id, make_source)
            .await
            .map(Some)
    }

    /// Join a stream that some producer already started
    pub async fn resume_existing_stream(
        &self,
        stream_id: &str,
        skip_characters: Option<usize>,
    ) -> Result<ExistingStream> {
        self.prepare(stream_id).await?;

        match self.ctx.sentinel.probe(stream_id).await? {
            SentinelState::Absent => Ok(ExistingStream::Absent),
            SentinelState::Done => Ok(ExistingStream::Done),
            SentinelState::Active => {
                Ok(
                    match resumer::resume(self.ctx.clone(), stream_id, skip_characters).await? {
                        Some(stream) => ExistingStream::Live(stream),
                        None => ExistingStream::Done,
                    },
                )
            }
        }
    }

    pub async fn has_existing_stream(&self, stream_id: &str) -> Result<SentinelState> {
        self.prepare(stream_id).await?;
        self.ctx.sentinel.probe(stream_id).await
    }

    /// Stop the producer of `stream_id`, wherever it runs
    pub async fn send_cancellation_signal(&self, stream_id: &str) -> Result<()> {
        self.prepare(stream_id).await?;
        let controller = match &self.ctx.cancellation {
            Some(controller) => controller.clone(),
            // Requests are honored by producers elsewhere even if this
            // context does not attach controllers itself
            None => CancellationController::new(
                self.ctx.publisher.clone(),
                self.ctx.subscriber.clone(),
                self.ctx.keys.clone(),
                self.done_ttl,
            ),
        };
        controller.request_cancellation(stream_id).await
    }
}

impl std::fmt::Debug for ResumableStreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableStreamContext")
            .field("prefix", &self.ctx.keys.prefix())
            .field("ack_timeout", &self.ctx.ack_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_source() -> futures::stream::Empty<Result<String>> {
        futures::stream::empty()
    }

    #[tokio::test]
    async fn test_empty_stream_id_is_rejected() {
        let context = ResumableStreamContext::local(LocalTransport::new(), ContextOptions::default());

        let err = context.resumable_stream("", no_source, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(matches!(
            context.has_existing_stream("").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_without_redis_uses_local_transport() {
        let context =
            ResumableStreamContext::from_config(&Config::default(), Arc::new(SpawnKeepAlive))
                .unwrap();
        assert_eq!(
            context.has_existing_stream("missing").await.unwrap(),
            SentinelState::Absent
        );
        assert!(format!("{context:?}").contains("resumable-stream:rs"));
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = Config::default();
        config.stream.ack_timeout_ms = 0;

        let err = ResumableStreamContext::from_config(&config, Arc::new(SpawnKeepAlive))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_options_follow_stream_config() {
        let mut config = StreamConfig::default();
        config.key_prefix = "chat".to_string();
        config.ack_timeout_ms = 250;
        config.cancellation_enabled = false;

        let options = ContextOptions::from_config(&config);
        assert_eq!(options.key_prefix, "chat");
        assert_eq!(options.ack_timeout, Duration::from_millis(250));
        assert!(!options.cancellation_enabled);
    }
}
