//! Cross-process cancellation
//!
//! A cancellation request is both persisted and broadcast, so a producer sees
//! it whether it attached before or after the request was made.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resumable_stream_core::keys::{ABORTED_VALUE, ABORT_MESSAGE};
use resumable_stream_core::{KeyBuilder, Publisher, Result, Subscriber};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct CancellationController {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    keys: KeyBuilder,
    state_ttl: Duration,
}

impl CancellationController {
    #[must_use]
    pub fn new(
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        keys: KeyBuilder,
        state_ttl: Duration,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            keys,
            state_ttl,
        }
    }

    /// Ask whichever process produces `stream_id` to stop
    pub async fn request_cancellation(&self, stream_id: &str) -> Result<()> {
        self.publisher
            .set(
                &self.keys.control_state(stream_id),
                ABORTED_VALUE,
                Some(self.state_ttl),
            )
            .await?;
        let receivers = self
            .publisher
            .publish(&self.keys.control_channel(stream_id), ABORT_MESSAGE)
            .await?;
        info!(
            stream_id = %stream_id,
            receivers = receivers,
            "Cancellation requested"
        );
        Ok(())
    }

    /// Cancel `token` when a cancellation for `stream_id` is requested
    ///
    /// Subscribes first and checks the persisted state second, so a request
    /// racing with the attach is observed through one path or the other.
    pub async fn attach(&self, stream_id: &str, token: CancellationToken) -> Result<ControllerGuard> {
        let channel = self.keys.control_channel(stream_id);
        let mut subscription = self.subscriber.subscribe(&channel).await?;
        let teardown = Teardown::new(self.subscriber.clone(), channel);

        match self.publisher.get(&self.keys.control_state(stream_id)).await {
            Ok(Some(state)) if state == ABORTED_VALUE => {
                info!(stream_id = %stream_id, "Stream was cancelled before attach");
                token.cancel();
                teardown.run();
                return Ok(ControllerGuard { teardown });
            }
            Ok(_) => {}
            Err(e) => {
                teardown.run();
                return Err(e);
            }
        }

        let watcher = teardown.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    message = subscription.recv() => match message {
                        Some(message) if message == ABORT_MESSAGE => {
                            info!(stream_id = %stream_id, "Received cancellation signal");
                            token.cancel();
                            break;
                        }
                        Some(message) => {
                            debug!(
                                stream_id = %stream_id,
                                message = %message,
                                "Ignoring unknown control message"
                            );
                        }
                        None => break,
                    },
                }
            }
            watcher.run();
        });

        Ok(ControllerGuard { teardown })
    }
}

impl std::fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationController")
            .field("prefix", &self.keys.prefix())
            .finish()
    }
}

/// Keeps a control channel subscription; releasing or dropping it unsubscribes
#[derive(Debug)]
pub struct ControllerGuard {
    teardown: Teardown,
}

impl ControllerGuard {
    pub fn release(&self) {
        self.teardown.run();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.teardown.has_run()
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.teardown.run();
    }
}

/// Unsubscribes the control channel exactly once, off the caller's path
#[derive(Clone)]
struct Teardown {
    subscriber: Arc<dyn Subscriber>,
    channel: Arc<str>,
    done: Arc<AtomicBool>,
}

impl Teardown {
    fn new(subscriber: Arc<dyn Subscriber>, channel: String) -> Self {
        Self {
            subscriber,
            channel: channel.into(),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.channel, "No runtime to unsubscribe control channel");
            return;
        };
        let subscriber = self.subscriber.clone();
        let channel = self.channel.clone();
        handle.spawn(async move {
            if let Err(e) = subscriber.unsubscribe(&channel).await {
                warn!(error = %e, channel = %channel, "Failed to unsubscribe control channel");
            }
        });
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("channel", &self.channel)
            .field("done", &self.has_run())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resumable_stream_core::LocalTransport;

    fn controller(transport: &LocalTransport) -> CancellationController {
        CancellationController::new(
            Arc::new(transport.clone()),
            Arc::new(transport.clone()),
            KeyBuilder::new("test"),
            Duration::from_secs(60),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_after_attach_cancels() {
        let transport = LocalTransport::new();
        let controller = controller(&transport);
        let token = CancellationToken::new();

        let guard = controller.attach("s", token.clone()).await.unwrap();
        assert!(!token.is_cancelled());
        assert!(transport.is_subscribed("test:rs:control:s"));

        controller.request_cancellation("s").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();

        settle().await;
        assert!(guard.is_released());
        assert!(!transport.is_subscribed("test:rs:control:s"));
    }

    #[tokio::test]
    async fn test_request_before_attach_cancels_immediately() {
        let transport = LocalTransport::new();
        let controller = controller(&transport);
        controller.request_cancellation("s").await.unwrap();

        let token = CancellationToken::new();
        let guard = controller.attach("s", token.clone()).await.unwrap();
        assert!(token.is_cancelled());
        assert!(guard.is_released());
        assert!(transport.ttl("test:rs:control-state:s").is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let transport = LocalTransport::new();
        let controller = controller(&transport);
        let token = CancellationToken::new();

        let guard = controller.attach("s", token.clone()).await.unwrap();
        guard.release();
        guard.release();
        drop(guard);
        settle().await;

        assert!(!transport.is_subscribed("test:rs:control:s"));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_other_streams_are_unaffected() {
        let transport = LocalTransport::new();
        let controller = controller(&transport);
        let token = CancellationToken::new();

        let _guard = controller.attach("a", token.clone()).await.unwrap();
        controller.request_cancellation("b").await.unwrap();
        settle().await;

        assert!(!token.is_cancelled());
    }
}
