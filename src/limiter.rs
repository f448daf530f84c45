//! Concurrency bounds for in-flight operations.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Admits at most `limit` concurrently-executing tasks; additional
/// submissions queue in FIFO order and always eventually run.
///
/// Two instances are used by the coordinator: a width-1 limiter that
/// serializes chain deployments (the target node is not stable under
/// concurrent deployment load) and a configurable-width limiter for wallet
/// funding within a chain. Cancellation is not supported.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting `limit` concurrent tasks.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "limiter width must be at least 1");
        Self { semaphore: Arc::new(Semaphore::new(limit)), limit }
    }

    /// Returns the configured width.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Runs `task` once a slot is free, holding the slot for its duration.
    ///
    /// Tokio semaphores are fair, so waiters acquire in submission order.
    pub async fn schedule<T>(&self, task: impl std::future::Future<Output = T>) -> T {
        let _permit =
            self.semaphore.acquire().await.expect("limiter semaphore is never closed");
        task.await
    }
}
