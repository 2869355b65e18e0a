//! Bounded task pool for B2B transaction work

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `task` if a slot is free.
    ///
    /// When the pool is exhausted the task is handed back untouched so the
    /// caller can run it itself.
    pub fn try_spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(tokio::spawn(async move {
                let output = task.await;
                drop(permit);
                output
            })),
            Err(_) => {
                trace!(size = self.size, "Worker pool exhausted");
                Err(task)
            }
        }
    }

    /// Runs `task` on the pool once `delay` has elapsed, waiting for a slot if needed
    pub fn spawn_after<F>(&self, delay: Duration, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _permit = permits.acquire_owned().await;
            task.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn exhausted_pool_hands_the_task_back() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let Ok(busy) = pool.try_spawn(async move {
            let _ = release_rx.await;
        }) else {
            panic!("empty pool refused a task");
        };
        assert_eq!(pool.available(), 0);

        let rejected = pool.try_spawn(async { 7 });
        let task = rejected.err().expect("pool should be full");
        assert_eq!(task.await, 7);

        release_tx.send(()).unwrap();
        busy.await.unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits() {
        let pool = WorkerPool::new(2);
        let start = tokio::time::Instant::now();
        let handle = pool.spawn_after(Duration::from_secs(2), async move { tokio::time::Instant::now() });
        let ran_at = handle.await.unwrap();
        assert!(ran_at - start >= Duration::from_secs(2));
    }
}
