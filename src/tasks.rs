//! Background Task Registry
//!
//! Tracks the spawned work of one relay (or the router) so that stopping it
//! cancels accept loops, scan loops and every pending delayed rebroadcast in
//! one step.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TaskRegistry {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `fut`, dropping it at its next suspension point once the
    /// registry shuts down. A no-op after shutdown.
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
                _ = fut => {}
            }
        });

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Run `fut` after `delay` unless the registry shuts down first
    pub fn spawn_after<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_cancellable(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fut.await;
        });
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Tasks spawned and not yet finished
    pub fn active_count(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_spawn_after_runs_after_delay() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        registry.spawn_after(Duration::from_millis(100), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_without_tasks_is_recorded() {
        let registry = TaskRegistry::new();
        registry.shutdown();
        assert!(registry.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_work() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let c = counter.clone();
            registry.spawn_after(Duration::from_millis(200), async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.active_count(), 5);

        registry.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(registry.is_shutdown());

        let c = counter.clone();
        registry.spawn_cancellable(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
