//! Cancellable one-shot callbacks on the Tokio clock.
//!
//! Timers sleep on `tokio::time`, so a runtime started with a paused clock advances
//! them deterministically.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId(u64);

/// Handle to a scheduled callback. Dropping the handle cancels it.
#[derive(Debug)]
pub(crate) struct Timer {
    id: TimerId,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Runs the future produced by `callback` after `delay`. The callback receives the
    /// timer's id so it can detach its own slot before doing work.
    pub(crate) fn schedule<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce(TimerId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(id).await;
        });
        Self {
            id,
            handle: Some(handle),
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    /// Forgets the handle without aborting. Used by a firing timer removing itself.
    pub(crate) fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Takes the timer out of `slot` when it is the one identified by `id`.
pub(crate) fn detach_if_current(slot: &mut Option<Timer>, id: TimerId) -> bool {
    if slot.as_ref().map(Timer::id) == Some(id) {
        if let Some(timer) = slot.take() {
            timer.detach();
        }
        true
    } else {
        false
    }
}
