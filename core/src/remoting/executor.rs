//! Execution contexts for packet handlers and failure callbacks

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs one at a time in submission order.
///
/// Every connection owns one, so packets from a connection are handled in
/// the order they arrived while connections proceed independently.
#[derive(Debug, Clone)]
pub struct OrderedExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl OrderedExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut jobs) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job();
            }
            trace!(executor = %name, "Ordered executor drained");
        });
        Self { sender }
    }

    /// Returns false once the executor has shut down
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Box::new(job)).is_ok()
    }
}

/// Bounded pool for connection-failure callbacks
#[derive(Debug, Clone)]
pub struct CallbackExecutor {
    permits: Arc<Semaphore>,
}

impl CallbackExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.spawn(async move { job() });
    }

    /// At most `workers` submitted futures run at once
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            future.await;
        });
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_ordered_executor_preserves_order() {
        let executor = OrderedExecutor::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            assert!(executor.execute(move || seen.lock().push(i)));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_callback_executor_bounds_concurrency() {
        let executor = CallbackExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            executor.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available(), 2);
    }
}
