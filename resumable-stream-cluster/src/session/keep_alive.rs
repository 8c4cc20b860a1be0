//! Keep-alive hooks
//!
//! A producer outlives the request that started it. The hook receives the
//! producer's whole lifetime as a future and must keep the host running until
//! it settles.

use futures::future::BoxFuture;
use tokio_util::task::TaskTracker;

pub trait KeepAlive: Send + Sync {
    fn wait_until(&self, work: BoxFuture<'static, ()>);
}

/// Runs the work on the current runtime and forgets about it
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnKeepAlive;

impl KeepAlive for SpawnKeepAlive {
    fn wait_until(&self, work: BoxFuture<'static, ()>) {
        tokio::spawn(work);
    }
}

/// Tracks every producer so shutdown can wait for them
#[derive(Debug, Clone, Default)]
pub struct TrackedKeepAlive {
    tracker: TaskTracker,
}

impl TrackedKeepAlive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of producers still running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every tracked producer finished
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl KeepAlive for TrackedKeepAlive {
    fn wait_until(&self, work: BoxFuture<'static, ()>) {
        self.tracker.spawn(work);
    }
}
