//! Consecutive-fault tracking
//!
//! One `FaultTracker` per fault class (degenerate-distance,
//! degenerate-light, publish-failure, ...). Each tick feeds every tracker
//! a boolean "fault observed" in a fixed order; a single clean tick fully
//! clears the streak. The `Exceeded` transition is reported exactly once
//! per streak, on the tick the count first reaches the threshold, so the
//! recovery controller is never double-invoked for one streak.

use tracing::{debug, warn};

/// Observable state of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    Ok,
    Degraded(u32),
    Exceeded,
}

/// Consecutive-occurrence counter for one fault class.
#[derive(Debug)]
pub struct FaultTracker {
    class: String,
    threshold: u32,
    count: u32,
}

impl FaultTracker {
    /// `threshold` must be non-zero; config validation enforces this
    /// before any tracker is built.
    pub fn new(class: impl Into<String>, threshold: u32) -> Self {
        debug_assert!(threshold > 0);
        Self {
            class: class.into(),
            threshold,
            count: 0,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn state(&self) -> FaultState {
        if self.count == 0 {
            FaultState::Ok
        } else if self.count < self.threshold {
            FaultState::Degraded(self.count)
        } else {
            FaultState::Exceeded
        }
    }

    /// Record this tick's outcome for the class.
    ///
    /// Returns `true` exactly when the streak first reaches the threshold.
    /// Further faulted ticks keep the state at `Exceeded` without firing
    /// again; a clean tick resets the count to zero immediately.
    pub fn record(&mut self, faulted: bool) -> bool {
        if !faulted {
            if self.count > 0 {
                debug!(class = %self.class, streak = self.count, "fault streak cleared");
            }
            self.count = 0;
            return false;
        }

        self.count = self.count.saturating_add(1);
        warn!(
            class = %self.class,
            count = self.count,
            threshold = self.threshold,
            "fault observed"
        );
        self.count == self.threshold
    }

    /// Reset after a handled recovery so a fresh full streak is required
    /// before the class fires again.
    pub fn force_reset(&mut self) {
        self.count = 0;
    }
}
