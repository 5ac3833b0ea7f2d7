//! Bounded-parallelism fan-out.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs a worker over many items with at most `max_parallel` in flight.
///
/// Admission is FIFO (tokio's semaphore is fair), every item is run, and a
/// failing item never cancels its siblings. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    max_parallel: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `worker` on every item and return the results in input order.
    ///
    /// Whatever `worker` returns (typically a `Result`) is passed through
    /// untouched; the limiter never short-circuits.
    pub async fn fan_out<I, T, R, F, Fut>(&self, items: I, worker: F) -> Vec<R>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let worker = &worker;
        let tasks = items.into_iter().map(|item| {
            let permits = self.permits.clone();
            async move {
                // The semaphore is owned here and never closed.
                let _permit = permits.acquire_owned().await.ok();
                worker(item).await
            }
        });
        join_all(tasks).await
    }
}
