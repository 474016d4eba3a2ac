//! Tiered fault recovery
//!
//! Driven only by `Exceeded` transitions from the fault trackers. Tier
//! one (soft) closes and reopens every sensor after a short pause; tier
//! two (hard) reboots the device, and only runs when soft recovery
//! failed or is disabled for the class. Which tiers a fault class gets is
//! per-class configuration: in the shipped defaults degenerate-distance
//! escalates to reboot, degenerate-light stops at re-initialization, and
//! publish failures only log.
//!
//! The reboot side effect is injected through `RebootAction` so the
//! escalation logic is testable without rebooting anything.

use std::io;
use std::process::Command;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::FaultPolicy;
use crate::sensor::SensorPool;
use crate::shutdown::ShutdownFlag;

/// Escalation level currently in effect. At most one transition is in
/// flight at a time; recovery blocks the supervisor until it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Normal,
    Reinitializing,
    Rebooting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Every sensor reopened; the triggering tracker must be reset and
    /// the loop continues from the next tick.
    Recovered,
    /// The reboot command was invoked; the loop must terminate.
    RebootIssued,
    /// No enabled tier resolved the fault; the node continues degraded.
    Unresolved,
}

/// Injectable device-reboot capability.
pub trait RebootAction {
    fn reboot(&mut self) -> io::Result<()>;
}

/// Production reboot via the init system.
pub struct SystemReboot;

impl RebootAction for SystemReboot {
    fn reboot(&mut self) -> io::Result<()> {
        let status = Command::new("systemctl").arg("reboot").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("reboot command exited with {status}"),
            ))
        }
    }
}

pub struct RecoveryController<R: RebootAction> {
    reboot: R,
    /// Pause between closing and reopening sensors during soft recovery,
    /// giving wedged hardware time to settle.
    reinit_pause: Duration,
}

impl<R: RebootAction> RecoveryController<R> {
    pub fn new(reboot: R, reinit_pause: Duration) -> Self {
        Self {
            reboot,
            reinit_pause,
        }
    }

    /// Run the escalation for one exceeded fault class. Synchronous: the
    /// caller's tick blocks until this resolves.
    pub fn run(
        &mut self,
        class: &str,
        policy: &FaultPolicy,
        pool: &mut SensorPool,
        shutdown: &ShutdownFlag,
    ) -> RecoveryOutcome {
        if policy.soft_recovery {
            warn!(class, "attempting sensor re-initialization");
            pool.close_all();
            shutdown.sleep(self.reinit_pause);
            let failed = pool.open_all();
            if failed == 0 && pool.all_open() {
                info!(class, "sensor re-initialization successful");
                return RecoveryOutcome::Recovered;
            }
            error!(class, failed, "sensor re-initialization failed");
        }

        if policy.hard_recovery {
            return self.hard(class, pool);
        }

        warn!(class, "fault unresolved and reboot not enabled for this class; continuing");
        RecoveryOutcome::Unresolved
    }

    fn hard(&mut self, class: &str, pool: &mut SensorPool) -> RecoveryOutcome {
        error!(class, "repeated faults unresolved by re-initialization; rebooting device");
        // All handles released before the reboot command runs.
        pool.close_all();
        match self.reboot.reboot() {
            Ok(()) => info!("reboot command issued"),
            Err(e) => error!(error = %e, "failed to execute reboot command"),
        }
        RecoveryOutcome::RebootIssued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::sensor::SensorDriver;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyDriver {
        open: bool,
        fail_reopen: bool,
    }

    impl SensorDriver for FlakyDriver {
        fn id(&self) -> &str {
            "flaky"
        }
        fn group(&self) -> &str {
            "g"
        }
        fn metric(&self) -> &str {
            "m"
        }
        fn unit(&self) -> &str {
            ""
        }
        fn open(&mut self) -> Result<(), DriverError> {
            if self.fail_reopen {
                return Err(DriverError::Unavailable {
                    sensor: "flaky".into(),
                    reason: "stuck".into(),
                });
            }
            self.open = true;
            Ok(())
        }
        fn read(&mut self) -> Result<f64, DriverError> {
            Ok(0.0)
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[derive(Clone, Default)]
    struct CountingReboot(Arc<AtomicU32>);

    impl RebootAction for CountingReboot {
        fn reboot(&mut self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(fail_reopen: bool) -> SensorPool {
        SensorPool::new(vec![Box::new(FlakyDriver {
            open: true,
            fail_reopen,
        })])
    }

    fn policy(soft: bool, hard: bool) -> FaultPolicy {
        FaultPolicy {
            threshold: 10,
            soft_recovery: soft,
            hard_recovery: hard,
        }
    }

    #[test]
    fn soft_recovery_success() {
        let reboots = CountingReboot::default();
        let mut ctl = RecoveryController::new(reboots.clone(), Duration::ZERO);
        let mut p = pool(false);
        let outcome = ctl.run(
            "degenerate-distance",
            &policy(true, true),
            &mut p,
            &ShutdownFlag::new(),
        );
        assert_eq!(outcome, RecoveryOutcome::Recovered);
        assert!(p.all_open());
        assert_eq!(reboots.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_reopen_escalates_to_reboot_with_handles_closed() {
        let reboots = CountingReboot::default();
        let mut ctl = RecoveryController::new(reboots.clone(), Duration::ZERO);
        let mut p = pool(true);
        let outcome = ctl.run(
            "degenerate-distance",
            &policy(true, true),
            &mut p,
            &ShutdownFlag::new(),
        );
        assert_eq!(outcome, RecoveryOutcome::RebootIssued);
        assert!(!p.any_open());
        assert_eq!(reboots.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn soft_only_class_never_reboots() {
        let reboots = CountingReboot::default();
        let mut ctl = RecoveryController::new(reboots.clone(), Duration::ZERO);
        let mut p = pool(true);
        let outcome = ctl.run(
            "degenerate-light",
            &policy(true, false),
            &mut p,
            &ShutdownFlag::new(),
        );
        assert_eq!(outcome, RecoveryOutcome::Unresolved);
        assert_eq!(reboots.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_only_class_does_nothing() {
        let reboots = CountingReboot::default();
        let mut ctl = RecoveryController::new(reboots.clone(), Duration::ZERO);
        let mut p = pool(false);
        let outcome = ctl.run(
            "publish-failure",
            &policy(false, false),
            &mut p,
            &ShutdownFlag::new(),
        );
        assert_eq!(outcome, RecoveryOutcome::Unresolved);
        // Sensors untouched by a log-only policy.
        assert!(p.all_open());
    }
}
