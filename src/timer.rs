//! Cancellable coroutine timers.
//!
//! Every timed behavior in the crate (CSRF token expiry, WebSocket heartbeat
//! pings and response deadlines) goes through these two helpers so that the
//! owner always holds exactly one [`TimerHandle`] per purpose. Rescheduling is
//! cancel-then-schedule: a cancelled handle makes the pending fire inert, so a
//! stale coroutine waking up after a reschedule is a no-op rather than a
//! duplicate timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handle to a scheduled timer.
///
/// Dropping the handle does NOT cancel the timer; call [`TimerHandle::cancel`]
/// explicitly. This lets fire-and-forget expiry timers outlive the scope that
/// created them.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the timer's callback from running when it fires.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Run `f` once after `delay`, unless the handle is cancelled first.
pub fn after<F>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    may::go!(move || {
        may::coroutine::sleep(delay);
        if !flag.load(Ordering::SeqCst) {
            f();
        }
    });
    TimerHandle { cancelled }
}

/// Run `f` every `interval` until it returns `false` or the handle is
/// cancelled.
pub fn every<F>(interval: Duration, f: F) -> TimerHandle
where
    F: Fn() -> bool + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    may::go!(move || loop {
        may::coroutine::sleep(interval);
        if flag.load(Ordering::SeqCst) {
            break;
        }
        if !f() {
            break;
        }
    });
    TimerHandle { cancelled }
}
