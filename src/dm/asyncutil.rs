//! Bookkeeping for the master's helper tasks (dialog helpers, delayed
//! re-manage timers, power commands, VT switches).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    active: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks (async or blocking) that have not finished yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn guard(&self) -> TaskGuard {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            counter: Arc::clone(&self.active),
        }
    }

    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard();
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
    }

    /// Waits until every tracked task ended or `limit` passed; returns what is still running.
    pub async fn settle(&self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        while self.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.active()
    }
}

/// Decrements the active count however the task ends (return, panic, abort).
struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_follow_task_lifetimes() {
        let t = TaskTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let h = t.spawn(async move {
            let _ = rx.await;
        });
        let b = t.spawn_blocking(|| 7);
        assert_eq!(b.await.unwrap(), 7);
        assert_eq!(t.spawned(), 2);
        assert_eq!(t.active(), 1);
        assert_eq!(t.settle(Duration::from_millis(100)).await, 1);
        tx.send(()).unwrap();
        h.await.unwrap();
        assert_eq!(t.settle(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn aborted_task_is_not_counted() {
        let t = TaskTracker::new();
        let h = t.spawn(std::future::pending::<()>());
        h.abort();
        let _ = h.await;
        assert_eq!(t.active(), 0);
    }
}
