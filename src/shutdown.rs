//! Cooperative shutdown flag
//!
//! A single shared flag checked at the top of each supervisor tick and
//! inside every blocking wait (measurement-interval sleep, flow window
//! collection). Cancellation is cooperative, never preemptive: whoever
//! observes the flag finishes its current step and unwinds through the
//! normal cleanup paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps. Bounds how long shutdown can lag
/// behind the signal while a component is sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Shared cooperative shutdown flag.
///
/// Cloning is cheap; all clones observe the same flag. Owned by the
/// process entry point and handed to the supervisor, the signal handler
/// and the flow integrator.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent; safe to call from a signal handler
    /// context.
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early if shutdown is requested.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the sleep
    /// was cut short by the flag.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_tripped() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}
