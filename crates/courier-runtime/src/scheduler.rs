use std::{future::Future, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// Delayed one-shot tasks that are dropped together on cancel.
///
/// A task that has already started its body runs to completion; cancel only
/// discards timers that have not fired yet.
#[derive(Debug, Clone)]
pub struct Scheduler {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// New scheduler whose timers also stop when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn schedule<F>(&self, label: &'static str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = label, "scheduled task cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task scheduled so far has finished or been dropped.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = Scheduler::new(&CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.schedule("tick", Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        scheduler.wait_idle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_timers() {
        let scheduler = Scheduler::new(&CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.schedule("tick", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.cancel();
        scheduler.wait_idle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_reaches_scheduler() {
        let parent = CancellationToken::new();
        let scheduler = Scheduler::new(&parent);
        parent.cancel();
        assert!(scheduler.is_cancelled());
    }
}
