//! Bounded kernel worker pool.
//!
//! A fixed number of permits caps how many kernel invocations run in
//! parallel; each submission waits for a permit, runs its closure on a
//! blocking thread and resolves a typed future. Workers share no mutable
//! state with the caller — arguments move into the closure, the
//! frequency-domain chunk travels as a shared read-only reference.
//!
//! `gather` is fail-fast: the first failed kernel fails the whole batch and
//! the remaining submissions are dropped before they acquire a permit.

use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Semaphore;

use crate::error::{DeltaError, Result};

#[derive(Clone)]
pub struct Executor {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl Executor {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Submits one closure to the pool, returning a future for its result.
    /// The closure starts once a worker permit is free; dropping the future
    /// before that cancels the submission.
    pub fn submit<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permits = self.permits.clone();
        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DeltaError::Kernel("executor is shut down".into()))?;
            match tokio::task::spawn_blocking(f).await {
                Ok(result) => result,
                Err(e) => Err(DeltaError::Kernel(format!("kernel worker panicked: {e}"))),
            }
        }
    }

    /// Waits for all futures, preserving submission order in the output.
    /// Fails fast: the first error cancels the futures that have not yet
    /// acquired a worker.
    pub async fn gather<T, F>(futures: Vec<F>) -> Result<Vec<T>>
    where
        F: Future<Output = Result<T>>,
    {
        try_join_all(futures).await
    }

    /// Waits for all outstanding kernels to finish, then refuses further
    /// submissions.
    pub async fn shutdown(&self) {
        // Claiming every permit is exactly "wait for outstanding work".
        if let Ok(all) = self.permits.acquire_many(self.workers as u32).await {
            all.forget();
        }
        self.permits.close();
    }
}
