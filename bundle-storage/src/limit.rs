//! Bounds the number of storage operations running against bundle archives
//! at once.
//!
//! Registry pulls are highly parallel; every archive read costs a file
//! handle and, for compressed bundles, decompression work. A counting
//! semaphore around each driver operation gives natural backpressure:
//! callers block for a permit instead of being shed.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use bundle_driver::{StorageError, StorageErrorKind};

/// Budget used when no `max_threads` is configured.
pub const DEFAULT_MAX_THREADS: usize = 100;

/// Smallest useful budget; configured values below this are raised to it.
pub const MIN_THREADS: usize = 25;

/// A counting semaphore wrapping every bundle-driver operation.
#[derive(Debug)]
pub struct OperationLimiter {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl OperationLimiter {
    /// Create a limiter from the configured budget, applying the default
    /// and the floor.
    pub fn new(max_threads: Option<usize>) -> Self {
        let limit = max_threads.unwrap_or(DEFAULT_MAX_THREADS).max(MIN_THREADS);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// The effective concurrency budget.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Units of budget currently free; equals [`limit`](Self::limit) when
    /// the limiter is idle.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Acquire one unit of budget, blocking until one is free. The permit
    /// releases itself on drop, success or error, and is owned so it can
    /// outlive the acquiring call and ride along with a streaming transfer.
    pub async fn acquire(&self, engine: &'static str) -> Result<OwnedSemaphorePermit, StorageError> {
        // The semaphore is never closed, so this only fails on a bug.
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(StorageError::with(engine, StorageErrorKind::Other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_applies_when_unset() {
        assert_eq!(OperationLimiter::new(None).limit(), DEFAULT_MAX_THREADS);
    }

    #[test]
    fn low_budgets_are_clamped_to_the_floor() {
        assert_eq!(OperationLimiter::new(Some(1)).limit(), MIN_THREADS);
        assert_eq!(OperationLimiter::new(Some(0)).limit(), MIN_THREADS);
    }

    #[test]
    fn explicit_budgets_above_the_floor_are_kept() {
        assert_eq!(OperationLimiter::new(Some(64)).limit(), 64);
    }

    #[tokio::test]
    async fn budget_is_restored_on_release() {
        let limiter = OperationLimiter::new(Some(MIN_THREADS));

        {
            let _permit = limiter.acquire("bundle").await.unwrap();
            assert_eq!(limiter.available(), MIN_THREADS - 1);
        }

        assert_eq!(limiter.available(), MIN_THREADS);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_rather_than_failing() {
        let limiter = OperationLimiter::new(Some(MIN_THREADS));

        let permits: Vec<_> = futures_all(&limiter, MIN_THREADS).await;
        assert_eq!(limiter.available(), 0);

        // A further acquire is pending, not an error.
        tokio::select! {
            _ = limiter.acquire("bundle") => panic!("acquire should block"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }

        drop(permits);
        assert_eq!(limiter.available(), MIN_THREADS);
    }

    async fn futures_all(
        limiter: &OperationLimiter,
        n: usize,
    ) -> Vec<OwnedSemaphorePermit> {
        let mut permits = Vec::with_capacity(n);
        for _ in 0..n {
            permits.push(limiter.acquire("bundle").await.unwrap());
        }
        permits
    }
}
