//! Unified error types for the sensor node
//!
//! One thiserror enum per failure surface, with named fields so log lines
//! and tests can see what actually went wrong. Per-tick errors are recovered
//! locally by the supervisor; only `ConfigError` (at startup) and a hard
//! recovery terminate the process.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by a hardware sensor driver.
///
/// All variants are treated identically by the supervisor (the reading is
/// invalid for this tick); the distinctions exist for logging.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("sensor {sensor}: device not available: {reason}")]
    Unavailable { sensor: String, reason: String },

    #[error("sensor {sensor}: read timed out after {timeout_ms} ms")]
    Timeout { sensor: String, timeout_ms: u64 },

    #[error("sensor {sensor}: I/O error: {source}")]
    Io {
        sensor: String,
        #[source]
        source: io::Error,
    },

    #[error("sensor {sensor}: unparseable reading {raw:?}")]
    Parse { sensor: String, raw: String },

    #[error("sensor {sensor}: not open")]
    NotOpen { sensor: String },
}

/// Errors from a single delivery attempt on the message bus.
///
/// The publisher folds all of these into one "attempt failed" signal for
/// retry purposes but logs the distinguishing detail.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("connection refused by broker")]
    ConnectionRefused,

    #[error("timed out waiting for broker acknowledgement")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors from a full publish call (all retries included).
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize telemetry message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("all {attempts} publish attempts failed")]
    Exhausted { attempts: u32 },
}

/// Configuration errors. Always fatal, always before the loop starts.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}
