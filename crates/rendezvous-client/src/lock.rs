use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutual exclusion used to serialise pool fills and offer rotation.
///
/// Releasing is dropping the guard, so a critical section that returns early or
/// propagates an error still unlocks.
#[derive(Debug, Clone, Default)]
pub struct AsyncLock {
    inner: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct AsyncLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl AsyncLockGuard {
    pub fn release(self) {}
}

impl AsyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock is free. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> AsyncLockGuard {
        AsyncLockGuard {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }

    pub fn try_acquire(&self) -> Option<AsyncLockGuard> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| AsyncLockGuard { _guard: guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Runs `f` with the lock held and releases it however `f` finishes.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn run_serialises_overlapping_sections() {
        let lock = AsyncLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                lock.run(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn lock_released_when_section_errors() {
        let lock = AsyncLock::new();
        let result: Result<(), &str> = lock.run(|| async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(lock.try_acquire().is_some());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn try_acquire_reports_contention() {
        let lock = AsyncLock::new();
        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        guard.release();
        assert!(!lock.is_locked());
    }
}
