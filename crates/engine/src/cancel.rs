//! Run cancellation
//!
//! Shared by the scheduler and every runner of a run. Cancelling wakes any
//! runner sleeping in `sleep` at once; a runner otherwise notices at its next
//! step boundary. Cancelling never touches locks.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CancelInner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cloneable cancellation flag with interruptible sleep
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: Mutex::new(false),
                wake: Condvar::new(),
            }),
        }
    }

    /// Cancel and wake every sleeper. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    /// True once `cancel` was called
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `true` if the full duration elapsed, `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .wake
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                return !*cancelled;
            }
        }
        false
    }
}
