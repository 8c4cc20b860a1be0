//! Resumer session
//!
//! Joins a stream that another session produces:
//!
//! ```text
//! Joining -> AwaitingAck -> Replaying & Live -> Closed
//!                        \-> TimedOut -> Done | Failed
//! ```
//!
//! The producer always answers a join request with one message, possibly
//! empty, so the first reply doubles as the acknowledgement.

use std::sync::Arc;

use resumable_stream_core::keys::DONE_MESSAGE;
use resumable_stream_core::{Error, Result, Subscription};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::output::{OutputSender, ResumableStream};
use super::{JoinRequest, SessionContext};
use crate::registry::SentinelState;

/// Join `stream_id` as a listener
///
/// Returns `None` when no producer answered but the stream turned out to be
/// finished, and `Error::AckTimeout` when nobody answered and it is not.
pub(crate) async fn resume(
    ctx: Arc<SessionContext>,
    stream_id: &str,
    skip_characters: Option<usize>,
) -> Result<Option<ResumableStream>> {
    let listener_id = Uuid::new_v4().to_string();
    let channel = ctx.keys.chunk_channel(&listener_id);
    debug!(
        stream_id = %stream_id,
        listener_id = %listener_id,
        "Starting resumer session"
    );

    let mut replies = ctx.subscriber.subscribe(&channel).await?;

    let request = serde_json::to_string(&JoinRequest {
        listener_id: listener_id.clone(),
        skip_characters,
    })?;
    if let Err(e) = ctx
        .publisher
        .publish(&ctx.keys.request_channel(stream_id), &request)
        .await
    {
        unsubscribe_quietly(&ctx, &channel).await;
        return Err(e);
    }

    let first = match tokio::time::timeout(ctx.ack_timeout, replies.recv()).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            return Err(Error::Transport(format!(
                "Reply channel {channel} closed before ack"
            )));
        }
        Err(_) => {
            ctx.subscriber.unsubscribe(&channel).await?;
            return match ctx.sentinel.probe(stream_id).await? {
                SentinelState::Done => {
                    info!(
                        stream_id = %stream_id,
                        "No ack but stream is done, nothing to replay"
                    );
                    Ok(None)
                }
                state => {
                    warn!(
                        stream_id = %stream_id,
                        listener_id = %listener_id,
                        state = ?state,
                        "Timeout waiting for ack"
                    );
                    Err(Error::AckTimeout {
                        stream_id: stream_id.to_string(),
                    })
                }
            };
        }
    };

    if first == DONE_MESSAGE {
        ctx.subscriber.unsubscribe(&channel).await?;
        return Ok(Some(ResumableStream::finished()));
    }

    let (output, stream) = ResumableStream::channel();
    let tail = ResumerTail {
        ctx,
        listener_id,
        channel,
        output,
    };
    tokio::spawn(tail.run(first, replies));

    Ok(Some(stream))
}

async fn unsubscribe_quietly(ctx: &SessionContext, channel: &str) {
    if let Err(e) = ctx.subscriber.unsubscribe(channel).await {
        warn!(error = %e, channel = %channel, "Failed to unsubscribe reply channel");
    }
}

/// Replay and live phase, after the ack arrived
struct ResumerTail {
    ctx: Arc<SessionContext>,
    listener_id: String,
    channel: String,
    output: OutputSender,
}

impl ResumerTail {
    async fn run(mut self, first: String, mut replies: Subscription) {
        let mut message = first;
        loop {
            if message == DONE_MESSAGE {
                debug!(listener_id = %self.listener_id, "Received done message");
                break;
            }
            // Empty replies are acknowledgements, not content. Empty source
            // chunks are dropped here too, so a resumer may see fewer chunks
            // than the producer's caller while the text stays the same.
            if !message.is_empty() && !self.output.send(message) {
                debug!(listener_id = %self.listener_id, "Resumer output closed, leaving stream");
                break;
            }

            let next = tokio::select! {
                next = replies.recv() => next,
                () = self.output.closed() => {
                    debug!(listener_id = %self.listener_id, "Resumer output closed, leaving stream");
                    break;
                }
            };
            match next {
                Some(next) => message = next,
                None => {
                    warn!(listener_id = %self.listener_id, "Reply channel closed before done message");
                    self.output.fail(Error::Transport(format!(
                        "Reply channel {} closed before completion",
                        self.channel
                    )));
                    break;
                }
            }
        }

        self.output.close();
        unsubscribe_quietly(&self.ctx, &self.channel).await;
    }
}
