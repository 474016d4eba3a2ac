//! Sensor drivers
//!
//! Hardware access sits behind the three-call `SensorDriver` capability
//! (`open`, `read`, `close`); nothing else about a sensor leaks into the
//! core. Drivers own their handle state exclusively and a failed `open`
//! leaves the driver fully closed, so callers always re-`open` after
//! `close` and never resume a half-open handle.
//!
//! `SensorPool` owns the boxed drivers in config order. Dropping the pool
//! closes whatever is still open, which is what guarantees release on
//! every exit path, including early returns out of an in-flight recovery.

pub mod flowmeter;
pub mod iio;

use chrono::{DateTime, Local};
use tracing::{debug, error, info};

use crate::error::DriverError;

pub use flowmeter::FlowMeterDriver;
pub use iio::IioDriver;

/// Capability contract for one physical sensor.
pub trait SensorDriver: Send {
    fn id(&self) -> &str;
    /// Sensor group key in the outbound message (e.g. "fumehood").
    fn group(&self) -> &str;
    /// Metric key within the group (e.g. "distance").
    fn metric(&self) -> &str;
    fn unit(&self) -> &str;

    /// Acquire the hardware resource. Must leave no partially-initialized
    /// state observable when it fails.
    fn open(&mut self) -> Result<(), DriverError>;

    /// Sample the sensor. Bounded by a per-sensor timeout; exceeding it is
    /// `DriverError::Timeout`, handled like any other read error.
    fn read(&mut self) -> Result<f64, DriverError>;

    /// Release the hardware resource. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// One sampled sensor value. Created each tick, consumed immediately by
/// the publisher; never persisted by this core.
#[derive(Debug, Clone)]
pub struct Reading {
    pub sensor_id: String,
    pub group: String,
    pub metric: String,
    pub unit: String,
    /// NaN when the read itself failed.
    pub value: f64,
    pub captured_at: DateTime<Local>,
    pub valid: bool,
    pub degenerate: bool,
}

/// Exclusive owner of all sensor drivers, in deterministic config order.
pub struct SensorPool {
    sensors: Vec<Box<dyn SensorDriver>>,
}

impl SensorPool {
    pub fn new(sensors: Vec<Box<dyn SensorDriver>>) -> Self {
        Self { sensors }
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn SensorDriver + 'static)> {
        self.sensors.get_mut(index).map(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SensorDriver> {
        self.sensors.iter().map(|s| s.as_ref())
    }

    /// Open every closed sensor, logging individual failures.
    ///
    /// Returns the number of sensors that failed to open. Startup
    /// tolerates partial success (at least one open sensor keeps the node
    /// useful); recovery requires zero failures.
    pub fn open_all(&mut self) -> usize {
        let mut failed = 0;
        for sensor in &mut self.sensors {
            if sensor.is_open() {
                continue;
            }
            match sensor.open() {
                Ok(()) => info!(sensor = sensor.id(), "sensor opened"),
                Err(e) => {
                    error!(sensor = sensor.id(), error = %e, "failed to open sensor");
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn all_open(&self) -> bool {
        self.sensors.iter().all(|s| s.is_open())
    }

    pub fn any_open(&self) -> bool {
        self.sensors.iter().any(|s| s.is_open())
    }

    pub fn close_all(&mut self) {
        for sensor in &mut self.sensors {
            if sensor.is_open() {
                sensor.close();
                debug!(sensor = sensor.id(), "sensor closed");
            }
        }
    }
}

impl Drop for SensorPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
