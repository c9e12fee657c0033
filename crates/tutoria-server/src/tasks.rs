use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Background work started on behalf of one connection.
#[derive(Clone, Default)]
pub struct ConnectionTasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ConnectionTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. The token fires if the task outlives the teardown grace.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task(self.cancel.child_token()));
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait up to `grace` for every task, then cancel and join what is left.
    /// Returns true if everything finished inside the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }
        tracing::debug!(remaining = self.tracker.len(), "cancelling connection tasks");
        self.cancel.cancel();
        self.tracker.wait().await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_join_within_grace() {
        let tasks = ConnectionTasks::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        tasks.spawn(move |_| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(tasks.shutdown(Duration::from_secs(1)).await);
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tasks_are_cancelled_after_grace() {
        let tasks = ConnectionTasks::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tasks.spawn(move |cancel| async move {
            tokio::select! {
                () = cancel.cancelled() => flag.store(true, Ordering::SeqCst),
                () = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
        });
        assert!(!tasks.shutdown(Duration::from_secs(2)).await);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }
}
