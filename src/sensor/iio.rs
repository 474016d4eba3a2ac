//! Sysfs/IIO channel driver
//!
//! The distance ranger (VL53L1X class) and the ambient light sensor
//! (LTR-559 class) both surface as Linux IIO channels: a value file under
//! `/sys/bus/iio/devices/iio:deviceN/` that reads back one number. The
//! driver is the same for both; the config points it at the right channel
//! file and applies the channel's scale.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::DriverError;
use crate::sensor::SensorDriver;

pub struct IioDriver {
    id: String,
    group: String,
    metric: String,
    unit: String,
    path: PathBuf,
    scale: f64,
    timeout: Duration,
    open: bool,
}

impl IioDriver {
    pub fn new(
        id: impl Into<String>,
        group: impl Into<String>,
        metric: impl Into<String>,
        unit: impl Into<String>,
        path: PathBuf,
        scale: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            metric: metric.into(),
            unit: unit.into(),
            path,
            scale,
            timeout,
            open: false,
        }
    }

    /// Read the channel file, enforcing the configured deadline. The read
    /// runs on a helper thread because a wedged I2C adapter can stall the
    /// VFS call indefinitely and the measurement loop must not stall with
    /// it; at the deadline the caller gets `Timeout` and the straggler
    /// finishes (or never does) on its own.
    fn read_raw(&self) -> Result<String, DriverError> {
        let (tx, rx) = mpsc::channel();
        let path = self.path.clone();
        thread::spawn(move || {
            let _ = tx.send(fs::read_to_string(&path));
        });
        match rx.recv_timeout(self.timeout) {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => Err(match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => DriverError::Unavailable {
                    sensor: self.id.clone(),
                    reason: format!("{}: {}", self.path.display(), e),
                },
                _ => DriverError::Io {
                    sensor: self.id.clone(),
                    source: e,
                },
            }),
            Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout {
                sensor: self.id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Unavailable {
                sensor: self.id.clone(),
                reason: "channel reader terminated".to_string(),
            }),
        }
    }

    fn read_channel(&self) -> Result<f64, DriverError> {
        let raw = self.read_raw()?;
        let trimmed = raw.trim();
        let value: f64 = trimmed.parse().map_err(|_| DriverError::Parse {
            sensor: self.id.clone(),
            raw: trimmed.to_string(),
        })?;
        Ok(value * self.scale)
    }
}

impl SensorDriver for IioDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn metric(&self) -> &str {
        &self.metric
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn open(&mut self) -> Result<(), DriverError> {
        self.open = false;
        // Probe read: proves the channel exists and answers before the
        // loop depends on it.
        let probe = self.read_channel()?;
        debug!(sensor = %self.id, probe, "IIO channel probe ok");
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<f64, DriverError> {
        if !self.open {
            return Err(DriverError::NotOpen {
                sensor: self.id.clone(),
            });
        }
        self.read_channel()
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
