//! Measurement loop
//!
//! Single-threaded cooperative scheduler tying the drivers, validators,
//! fault trackers, recovery controller and publisher together. One tick:
//! read every sensor, validate and flag degeneracy, feed the trackers in
//! fixed config order, run recovery synchronously if a class fired, then
//! publish if at least one reading is valid and sleep out the
//! measurement interval. The interval sleep is the loop's only yield
//! point; recovery blocks the tick on purpose, because publishing while
//! the hardware is being reinitialized would produce misleading
//! telemetry.

use chrono::Local;
use tracing::{debug, info, warn};

use std::time::Duration;

use crate::config::{ConstantMetric, FaultPolicy};
use crate::error::ConfigError;
use crate::fault::FaultTracker;
use crate::publish::{MessageSink, Publisher, Telemetry, INVALID_METRIC};
use crate::recovery::{RebootAction, RecoveryController, RecoveryOutcome, RecoveryState};
use crate::sensor::{Reading, SensorPool};
use crate::shutdown::ShutdownFlag;
use crate::validate::{self, Bounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Cooperative shutdown; resources released, process exits cleanly.
    Shutdown,
    /// Hard recovery issued a device reboot; the process must exit now.
    Reboot,
}

/// Per-sensor validation and fault settings, parallel to pool order.
pub struct SensorCheck {
    pub bounds: Bounds,
    pub degenerate_sentinel: Option<f64>,
    /// Policy for the sensor's degenerate fault class; `None` disables
    /// tracking for this sensor.
    pub fault: Option<FaultPolicy>,
}

pub struct SupervisorOptions {
    pub lab_id: u32,
    pub sublab_id: u32,
    pub measurement_interval: Duration,
    pub constant_metrics: Vec<ConstantMetric>,
}

struct TrackedClass {
    tracker: FaultTracker,
    policy: FaultPolicy,
}

pub struct Supervisor<S: MessageSink, R: RebootAction> {
    opts: SupervisorOptions,
    pool: SensorPool,
    checks: Vec<SensorCheck>,
    /// One slot per sensor, config order; `None` where tracking is off.
    trackers: Vec<Option<TrackedClass>>,
    publish_tracker: FaultTracker,
    publish_policy: FaultPolicy,
    publisher: Publisher<S>,
    recovery: RecoveryController<R>,
    state: SupervisorState,
    recovery_state: RecoveryState,
    shutdown: ShutdownFlag,
}

impl<S: MessageSink, R: RebootAction> Supervisor<S, R> {
    pub fn new(
        opts: SupervisorOptions,
        pool: SensorPool,
        checks: Vec<SensorCheck>,
        publish_policy: FaultPolicy,
        publisher: Publisher<S>,
        recovery: RecoveryController<R>,
        shutdown: ShutdownFlag,
    ) -> Result<Self, ConfigError> {
        if checks.len() != pool.len() {
            return Err(ConfigError::invalid(
                "exactly one sensor check per pooled sensor is required",
            ));
        }
        let trackers = pool
            .iter()
            .zip(&checks)
            .map(|(sensor, check)| {
                check.fault.map(|policy| TrackedClass {
                    tracker: FaultTracker::new(
                        format!("degenerate-{}", sensor.id()),
                        policy.threshold,
                    ),
                    policy,
                })
            })
            .collect();
        let publish_tracker = FaultTracker::new("publish-failure", publish_policy.threshold);

        Ok(Self {
            opts,
            pool,
            checks,
            trackers,
            publish_tracker,
            publish_policy,
            publisher,
            recovery,
            state: SupervisorState::Running,
            recovery_state: RecoveryState::Normal,
            shutdown,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run until shutdown or reboot. Sensor handles are closed on every
    /// exit path before this returns.
    pub fn run(&mut self) -> LoopOutcome {
        self.state = SupervisorState::Running;
        info!("measurement loop starting");

        let outcome = self.run_loop();

        self.state = SupervisorState::ShuttingDown;
        info!("leaving measurement loop; releasing sensors");
        self.pool.close_all();
        self.state = SupervisorState::Terminated;
        info!("supervisor terminated");
        outcome
    }

    fn run_loop(&mut self) -> LoopOutcome {
        let mut tick: u64 = 0;
        loop {
            if self.shutdown.is_tripped() {
                info!("shutdown requested; finishing after current tick");
                return LoopOutcome::Shutdown;
            }
            tick += 1;
            debug!(tick, "measurement tick");

            let readings = self.sample_all();
            self.log_readings(&readings);

            // Fault evaluation in fixed config order, so escalation never
            // depends on evaluation-order variance.
            let mut recovered_this_tick = false;
            let mut reboot = false;
            for (i, reading) in readings.iter().enumerate() {
                if let Some(tc) = self.trackers[i].as_mut() {
                    if !tc.tracker.record(reading.degenerate) {
                        continue;
                    }
                    let class = tc.tracker.class().to_string();
                    let policy = tc.policy;
                    self.recovery_state = RecoveryState::Reinitializing;
                    warn!(class = %class, "fault threshold exceeded; invoking recovery");
                    match self
                        .recovery
                        .run(&class, &policy, &mut self.pool, &self.shutdown)
                    {
                        RecoveryOutcome::Recovered => {
                            tc.tracker.force_reset();
                            self.recovery_state = RecoveryState::Normal;
                            recovered_this_tick = true;
                        }
                        RecoveryOutcome::Unresolved => {
                            tc.tracker.force_reset();
                            self.recovery_state = RecoveryState::Normal;
                        }
                        RecoveryOutcome::RebootIssued => {
                            self.recovery_state = RecoveryState::Rebooting;
                            reboot = true;
                        }
                    }
                    if recovered_this_tick || reboot {
                        break;
                    }
                }
            }
            if reboot {
                return LoopOutcome::Reboot;
            }

            if recovered_this_tick {
                // Fresh handles; this tick's readings predate them, so
                // skip publishing and measure again next tick.
                debug!("recovery succeeded; skipping publish for this tick");
            } else {
                if readings.iter().any(|r| r.valid) {
                    self.recovery_state = RecoveryState::Normal;
                }
                let publish_faulted = self.publish_tick(&readings);
                if self.publish_tracker.record(publish_faulted) && self.handle_publish_exceeded() {
                    return LoopOutcome::Reboot;
                }
            }

            if !self.shutdown.sleep(self.opts.measurement_interval) {
                info!("shutdown requested during interval sleep");
                return LoopOutcome::Shutdown;
            }
        }
    }

    fn sample_all(&mut self) -> Vec<Reading> {
        let captured_at = Local::now();
        let mut readings = Vec::with_capacity(self.pool.len());
        for i in 0..self.checks.len() {
            let check = &self.checks[i];
            let Some(sensor) = self.pool.get_mut(i) else {
                continue;
            };
            let (value, read_ok) = match sensor.read() {
                Ok(v) => (v, true),
                Err(e) => {
                    warn!(sensor = sensor.id(), error = %e, "sensor read failed");
                    (f64::NAN, false)
                }
            };
            let valid = read_ok && validate::check(sensor.id(), value, &check.bounds);
            let degenerate = read_ok
                && check
                    .degenerate_sentinel
                    .is_some_and(|sentinel| validate::is_degenerate(value, sentinel));
            readings.push(Reading {
                sensor_id: sensor.id().to_string(),
                group: sensor.group().to_string(),
                metric: sensor.metric().to_string(),
                unit: sensor.unit().to_string(),
                value,
                captured_at,
                valid,
                degenerate,
            });
        }
        readings
    }

    fn log_readings(&self, readings: &[Reading]) {
        for r in readings {
            if r.valid {
                info!(
                    sensor = %r.sensor_id,
                    value = r.value,
                    unit = %r.unit,
                    degenerate = r.degenerate,
                    "reading"
                );
            } else {
                info!(sensor = %r.sensor_id, "reading invalid this tick");
            }
        }
    }

    /// Publish the tick's readings. Returns whether this tick counts as a
    /// publish-side fault.
    fn publish_tick(&mut self, readings: &[Reading]) -> bool {
        if !readings.iter().any(|r| r.valid) {
            warn!("no valid sensor readings available; skipping publish");
            return true;
        }
        let message = self.build_message(readings);
        match self.publisher.publish(&message) {
            Ok(()) => false,
            Err(e) => {
                warn!(error = %e, "telemetry dropped for this tick");
                true
            }
        }
    }

    fn build_message(&self, readings: &[Reading]) -> Telemetry {
        let timestamp = readings
            .first()
            .map(|r| r.captured_at)
            .unwrap_or_else(Local::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let mut message = Telemetry::new(self.opts.lab_id, self.opts.sublab_id, timestamp);
        for r in readings {
            let value = if r.valid && !r.degenerate {
                r.value
            } else {
                INVALID_METRIC
            };
            message.insert(&r.group, &r.metric, value);
        }
        for c in &self.opts.constant_metrics {
            message.insert(&c.group, &c.metric, c.value);
        }
        message
    }

    /// The publish-failure class fired. Returns true when the loop must
    /// terminate for a reboot.
    fn handle_publish_exceeded(&mut self) -> bool {
        let policy = self.publish_policy;
        if !policy.soft_recovery && !policy.hard_recovery {
            // Expected transient: warn loudly and start a fresh streak,
            // as rebooting over a broker outage would only make it worse.
            warn!(
                count = policy.threshold,
                "too many consecutive publish failures; check sensor connections and the broker"
            );
            self.publish_tracker.force_reset();
            return false;
        }

        self.recovery_state = RecoveryState::Reinitializing;
        match self
            .recovery
            .run("publish-failure", &policy, &mut self.pool, &self.shutdown)
        {
            RecoveryOutcome::Recovered | RecoveryOutcome::Unresolved => {
                self.publish_tracker.force_reset();
                self.recovery_state = RecoveryState::Normal;
                false
            }
            RecoveryOutcome::RebootIssued => {
                self.recovery_state = RecoveryState::Rebooting;
                true
            }
        }
    }
}
