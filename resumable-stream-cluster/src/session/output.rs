use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use resumable_stream_core::{Error, Result};
use tokio::sync::mpsc;

/// Chunks of a resumable stream as seen by one caller
///
/// Yields chunks in emission order and ends when the producer finishes. An
/// `Err` item reports a protocol failure (for example a lost broker
/// connection) and is always the last item.
#[derive(Debug)]
pub struct ResumableStream {
    receiver: mpsc::UnboundedReceiver<Result<String>>,
}

impl ResumableStream {
    pub(crate) fn channel() -> (OutputSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSender { sender: Some(tx) }, Self { receiver: rx })
    }

    /// A stream that is already finished
    pub(crate) fn finished() -> Self {
        let (_, stream) = Self::channel();
        stream
    }

    /// Wait for the next chunk
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        self.receiver.recv().await
    }

    /// Drain the stream and concatenate every chunk
    pub async fn read_to_string(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.receiver.recv().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for ResumableStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Session side of a [`ResumableStream`]
///
/// Failures to enqueue mean the caller went away; sessions keep running.
#[derive(Debug)]
pub(crate) struct OutputSender {
    sender: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl OutputSender {
    /// Enqueue a chunk. Returns `false` once the caller dropped its stream.
    pub(crate) fn send(&self, chunk: String) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(chunk)).is_ok())
    }

    /// Report a terminal error and close
    pub(crate) fn fail(&mut self, error: Error) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(Err(error));
        }
    }

    pub(crate) fn close(&mut self) {
        self.sender = None;
    }

    /// Resolves once the caller dropped its stream
    pub(crate) async fn closed(&self) {
        if let Some(tx) = &self.sender {
            tx.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_to_string_concatenates() {
        let (mut tx, stream) = ResumableStream::channel();
        assert!(tx.send("1\n".to_string()));
        assert!(tx.send("2\n".to_string()));
        tx.close();
        assert!(!tx.send("3\n".to_string()));

        assert_eq!(stream.read_to_string().await.unwrap(), "1\n2\n");
    }

    #[tokio::test]
    async fn test_failure_is_last_item() {
        let (mut tx, mut stream) = ResumableStream::channel();
        assert!(tx.send("1\n".to_string()));
        tx.fail(Error::Transport("connection lost".to_string()));

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "1\n");
        assert!(stream.next_chunk().await.unwrap().is_err());
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_drop_reports_closed() {
        let (tx, stream) = ResumableStream::channel();
        drop(stream);
        tx.closed().await;
        assert!(!tx.send("lost".to_string()));
    }

    #[tokio::test]
    async fn test_finished_stream_is_empty() {
        assert_eq!(
            ResumableStream::finished().read_to_string().await.unwrap(),
            ""
        );
    }
}
