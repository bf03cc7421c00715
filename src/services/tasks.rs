//! Registry of detached background tasks (wake/shutdown confirmation pollers).

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Clone, Default)]
pub struct TaskRegistry {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task without waiting for it. Finished handles are pruned on every spawn.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Abort every outstanding task and wait for all of them to wind down.
    /// Failures other than cancellation are logged, never propagated.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        debug!("Cancelling {} background task(s)", handles.len());
        for handle in &handles {
            handle.abort();
        }

        for handle in handles {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("Background task failed during shutdown: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_cancels_pending_tasks() {
        let registry = TaskRegistry::new();
        registry.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.spawn(async {});

        registry.shutdown().await;
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_escape_shutdown() {
        let registry = TaskRegistry::new();
        registry.spawn(async {
            panic!("poller exploded");
        });
        tokio::task::yield_now().await;

        registry.shutdown().await;
    }
}
