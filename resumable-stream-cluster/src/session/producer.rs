//! Producer session
//!
//! Owns the source stream for one stream id. A single task drives everything:
//! join requests, source chunks and cancellation are handled one at a time by
//! a `select!` loop, so the transcript and the listener list need no locking
//! and a replay is always consistent with the chunks fanned out after it.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use resumable_stream_core::keys::DONE_MESSAGE;
use resumable_stream_core::{Error, Result, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::ChunkBuffer;
use super::cancellation::ControllerGuard;
use super::output::{OutputSender, ResumableStream};
use super::{JoinRequest, SessionContext};

/// Why the source stopped producing
#[derive(Debug)]
enum Termination {
    Completed,
    Cancelled,
    Failed(Error),
}

pub(crate) struct ProducerSession {
    ctx: Arc<SessionContext>,
    stream_id: String,
    buffer: ChunkBuffer,
    /// Listener ids in registration order
    listeners: Vec<String>,
    output: OutputSender,
    local_open: bool,
}

impl ProducerSession {
    /// Become the producer for `stream_id`
    ///
    /// Subscribes to the request channel before the source is created, then
    /// hands the session to the keep-alive hook and returns the caller's view.
    pub(crate) async fn start<S>(
        ctx: Arc<SessionContext>,
        stream_id: &str,
        make_source: impl FnOnce() -> S,
    ) -> Result<ResumableStream>
    where
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        let request_channel = ctx.keys.request_channel(stream_id);
        // Racy if two brand-new joins arrive at the same instant; tolerated.
        let requests = match ctx.subscriber.subscribe(&request_channel).await {
            Ok(requests) => requests,
            Err(e) => {
                Self::abandon(&ctx, stream_id).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let guard = match &ctx.cancellation {
            Some(controller) => match controller.attach(stream_id, cancel.clone()).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    if let Err(unsubscribe_error) = ctx.subscriber.unsubscribe(&request_channel).await {
                        warn!(error = %unsubscribe_error, "Failed to unsubscribe request channel");
                    }
                    Self::abandon(&ctx, stream_id).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let source = make_source().boxed();
        let (output, stream) = ResumableStream::channel();
        let session = Self {
            ctx: ctx.clone(),
            stream_id: stream_id.to_string(),
            buffer: ChunkBuffer::new(),
            listeners: Vec::new(),
            output,
            local_open: true,
        };

        info!(stream_id = %stream_id, "Producer session started");
        ctx.keep_alive
            .wait_until(Box::pin(session.run(source, requests, cancel, guard)));

        Ok(stream)
    }

    /// Finish a stream whose producer never got going, so later joins see
    /// it done instead of waiting on a producer that does not exist
    async fn abandon(ctx: &SessionContext, stream_id: &str) {
        warn!(stream_id = %stream_id, "Producer failed to start, marking stream done");
        if let Err(e) = ctx.sentinel.mark_done(stream_id).await {
            error!(error = %e, stream_id = %stream_id, "Failed to mark stream done");
        }
    }

    async fn run(
        mut self,
        mut source: BoxStream<'static, Result<String>>,
        mut requests: Subscription,
        cancel: CancellationToken,
        guard: Option<ControllerGuard>,
    ) {
        let termination = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break Termination::Cancelled,
                Some(message) = requests.recv() => {
                    self.handle_join_request(&message, false).await;
                }
                next = source.next() => match next {
                    Some(Ok(chunk)) => self.handle_chunk(chunk).await,
                    Some(Err(e)) => break Termination::Failed(e),
                    None => break Termination::Completed,
                },
            }
        };

        // Releases the source reader before the slower cleanup
        drop(source);
        self.finish(termination, requests, guard).await;
    }

    /// Replay the transcript from the requested offset and register the listener
    async fn handle_join_request(&mut self, message: &str, finished: bool) {
        let request: JoinRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    error = %e,
                    stream_id = %self.stream_id,
                    payload = %message,
                    "Failed to parse join request"
                );
                return;
            }
        };

        let channel = self.ctx.keys.chunk_channel(&request.listener_id);
        let replay = self.buffer.tail(request.skip_characters.unwrap_or(0));
        debug!(
            stream_id = %self.stream_id,
            listener_id = %request.listener_id,
            chunks = self.buffer.len(),
            skip_characters = ?request.skip_characters,
            replay_len = replay.len(),
            "Connected to listener"
        );

        // Always publish, even when empty: the first reply is the ack
        if let Err(e) = self.ctx.publisher.publish(&channel, &replay).await {
            warn!(
                error = %e,
                listener_id = %request.listener_id,
                "Failed to send replay to listener"
            );
        }

        if finished {
            if let Err(e) = self.ctx.publisher.publish(&channel, DONE_MESSAGE).await {
                warn!(
                    error = %e,
                    listener_id = %request.listener_id,
                    "Failed to send done message to listener"
                );
            }
        } else {
            self.listeners.push(request.listener_id);
        }
    }

    async fn handle_chunk(&mut self, chunk: String) {
        self.buffer.push(chunk.clone());

        if self.local_open && !self.output.send(chunk.clone()) {
            // The caller's connection is gone; the stream itself goes on
            debug!(stream_id = %self.stream_id, "Local output closed, continuing for listeners");
            self.local_open = false;
        }

        for listener_id in &self.listeners {
            let channel = self.ctx.keys.chunk_channel(listener_id);
            if let Err(e) = self.ctx.publisher.publish(&channel, &chunk).await {
                warn!(
                    error = %e,
                    stream_id = %self.stream_id,
                    listener_id = %listener_id,
                    "Failed to send chunk to listener"
                );
            }
        }
    }

    async fn finish(
        mut self,
        termination: Termination,
        mut requests: Subscription,
        guard: Option<ControllerGuard>,
    ) {
        match &termination {
            Termination::Completed => info!(
                stream_id = %self.stream_id,
                chunks = self.buffer.len(),
                "Stream done"
            ),
            Termination::Cancelled => info!(
                stream_id = %self.stream_id,
                chunks = self.buffer.len(),
                "Stream cancelled"
            ),
            Termination::Failed(e) => warn!(
                error = %e,
                stream_id = %self.stream_id,
                chunks = self.buffer.len(),
                "Source stream failed, finishing with partial output"
            ),
        }

        self.output.close();

        if let Err(e) = self.ctx.sentinel.mark_done(&self.stream_id).await {
            error!(error = %e, stream_id = %self.stream_id, "Failed to mark stream done");
        }

        let request_channel = self.ctx.keys.request_channel(&self.stream_id);
        if let Err(e) = self.ctx.subscriber.unsubscribe(&request_channel).await {
            error!(error = %e, channel = %request_channel, "Failed to unsubscribe request channel");
        }

        for listener_id in &self.listeners {
            debug!(listener_id = %listener_id, "Sending done message");
            let channel = self.ctx.keys.chunk_channel(listener_id);
            if let Err(e) = self.ctx.publisher.publish(&channel, DONE_MESSAGE).await {
                warn!(
                    error = %e,
                    listener_id = %listener_id,
                    "Failed to send done message to listener"
                );
            }
        }

        // Requests delivered before the unsubscribe still get a full answer
        while let Some(message) = requests.try_recv() {
            self.handle_join_request(&message, true).await;
        }

        if let Some(guard) = guard {
            guard.release();
        }

        info!(
            stream_id = %self.stream_id,
            listeners = self.listeners.len(),
            "Producer cleanup done"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use resumable_stream_core::{KeyBuilder, LocalTransport, Subscriber};

    use super::*;
    use crate::registry::{SentinelRegistry, SentinelState};
    use crate::session::SpawnKeepAlive;

    fn session_context(transport: &LocalTransport) -> Arc<SessionContext> {
        let keys = KeyBuilder::new("test");
        let publisher: Arc<LocalTransport> = Arc::new(transport.clone());
        Arc::new(SessionContext {
            publisher: publisher.clone(),
            subscriber: Arc::new(transport.clone()),
            keys: keys.clone(),
            sentinel: SentinelRegistry::new(publisher, keys, Duration::from_secs(60)),
            cancellation: None,
            keep_alive: Arc::new(SpawnKeepAlive),
            ack_timeout: Duration::from_secs(1),
        })
    }

    fn new_session(ctx: &Arc<SessionContext>, stream_id: &str) -> (ProducerSession, ResumableStream) {
        let (output, stream) = ResumableStream::channel();
        let session = ProducerSession {
            ctx: ctx.clone(),
            stream_id: stream_id.to_string(),
            buffer: ChunkBuffer::new(),
            listeners: Vec::new(),
            output,
            local_open: true,
        };
        (session, stream)
    }

    fn join_request(listener_id: &str, skip_characters: Option<usize>) -> String {
        serde_json::to_string(&JoinRequest {
            listener_id: listener_id.to_string(),
            skip_characters,
        })
        .unwrap()
    }

    fn drain(subscription: &mut Subscription) -> Vec<String> {
        std::iter::from_fn(|| subscription.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_request_after_source_ended_gets_replay_and_done() {
        let transport = LocalTransport::new();
        let ctx = session_context(&transport);
        let (mut session, stream) = new_session(&ctx, "s");

        session.handle_chunk("a".to_string()).await;
        session.handle_chunk("b".to_string()).await;

        // Requests still queued when the source ends
        let (tx, requests) = Subscription::channel(ctx.keys.request_channel("s"));
        tx.send(join_request("late", None)).unwrap();
        tx.send(join_request("later", Some(1))).unwrap();
        let mut late = transport.subscribe("test:rs:chunk:late").await.unwrap();
        let mut later = transport.subscribe("test:rs:chunk:later").await.unwrap();

        session.finish(Termination::Completed, requests, None).await;

        assert_eq!(drain(&mut late), vec!["ab".to_string(), DONE_MESSAGE.to_string()]);
        assert_eq!(drain(&mut later), vec!["b".to_string(), DONE_MESSAGE.to_string()]);
        assert_eq!(stream.read_to_string().await.unwrap(), "ab");
        assert_eq!(ctx.sentinel.probe("s").await.unwrap(), SentinelState::Done);
    }

    #[tokio::test]
    async fn test_registered_listener_gets_chunks_then_done_once() {
        let transport = LocalTransport::new();
        let ctx = session_context(&transport);
        let (mut session, _stream) = new_session(&ctx, "s");
        let mut listener = transport.subscribe("test:rs:chunk:l").await.unwrap();

        session.handle_chunk("a".to_string()).await;
        session.handle_join_request(&join_request("l", None), false).await;
        session.handle_chunk("b".to_string()).await;

        let (_tx, requests) = Subscription::channel(ctx.keys.request_channel("s"));
        session.finish(Termination::Completed, requests, None).await;

        assert_eq!(
            drain(&mut listener),
            vec!["a".to_string(), "b".to_string(), DONE_MESSAGE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_ignored() {
        let transport = LocalTransport::new();
        let ctx = session_context(&transport);
        let (mut session, _stream) = new_session(&ctx, "s");

        session.handle_join_request("not json", false).await;
        session.handle_join_request(r#"{"skipCharacters":1}"#, true).await;

        assert!(session.listeners.is_empty());
    }
}
