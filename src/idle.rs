//! Idle latch: fires once when nothing has been running for a while.
//!
//! The active-task count is owned by a single task and only changes by
//! signed deltas sent over one channel. Each message restarts the timer;
//! when the delay passes with no message and the count is zero, the
//! callback runs and the latch is done.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

use crate::events::TaskEvent;

/// Cloneable handle for adjusting the count.
#[derive(Clone)]
pub struct IdleHandle {
    tx: mpsc::UnboundedSender<i64>,
}

impl IdleHandle {
    /// Adjust the active count. Ignored once the latch has fired.
    pub fn add(&self, delta: i64) {
        if self.tx.send(delta).is_err() {
            debug!(delta, "idle latch already fired");
        }
    }

    /// Count `create` as +1 and `delete` as -1 until the feed ends.
    pub async fn watch_tasks<S>(&self, feed: S)
    where
        S: Stream<Item = TaskEvent>,
    {
        futures_util::pin_mut!(feed);
        while let Some(event) = feed.next().await {
            self.add(event.delta());
        }
    }
}

pub struct IdleLatch {
    handle: IdleHandle,
    task: JoinHandle<()>,
}

impl IdleLatch {
    /// Start the latch with a count of zero.
    pub fn spawn<F>(delay: Duration, on_idle: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(accumulate(rx, delay, on_idle));
        Self {
            handle: IdleHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> IdleHandle {
        self.handle.clone()
    }

    pub fn add(&self, delta: i64) {
        self.handle.add(delta);
    }

    pub async fn watch_tasks<S>(&self, feed: S)
    where
        S: Stream<Item = TaskEvent>,
    {
        self.handle.watch_tasks(feed).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the latch task to end; an `Err` means it panicked.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

async fn accumulate<F>(mut rx: mpsc::UnboundedReceiver<i64>, delay: Duration, on_idle: F)
where
    F: FnOnce(),
{
    let mut active: i64 = 0;
    loop {
        match tokio::time::timeout(delay, rx.recv()).await {
            Ok(Some(delta)) => {
                active += delta;
                if active < 0 {
                    panic!("idle latch count went negative ({})", active);
                }
                debug!(active, "idle latch count");
            }
            Ok(None) => return,
            Err(_) if active == 0 => {
                info!(?delay, "idle, shutting down");
                on_idle();
                return;
            }
            Err(_) => {}
        }
    }
}
