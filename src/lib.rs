//! Labsense sensor node core
//!
//! The telemetry and fault-recovery loop that runs on each embedded lab
//! monitoring node (fumehood distance/light monitor, water-flow monitor).
//! It samples unreliable hardware sensors, validates readings, publishes
//! them over an unreliable message bus, and escalates degraded hardware
//! through sensor re-initialization up to a full device reboot, all
//! without human intervention.
//!
//! # Module structure
//!
//! - `sensor/` - driver capability trait, concrete IIO/flow drivers, pool
//! - `flow` - pulse counting and windowed-rate integration
//! - `validate` - range checks and degenerate-sentinel flags
//! - `fault` - consecutive-fault streak tracking per class
//! - `recovery` - soft (reinit) / hard (reboot) escalation
//! - `publish` - wire message, retrying publisher, MQTT sink
//! - `supervisor` - the measurement loop itself
//! - `config` - JSON configuration, validated at startup
//!
//! The `labsensed` binary wires these together from the config file.

pub mod config;
pub mod error;
pub mod fault;
pub mod flow;
pub mod publish;
pub mod recovery;
pub mod sensor;
pub mod shutdown;
pub mod supervisor;
pub mod validate;

pub use config::{FaultPolicy, NodeConfig};
pub use error::{ConfigError, DriverError, PublishError, SinkError};
pub use fault::{FaultState, FaultTracker};
pub use publish::{MessageSink, MqttSink, Publisher, Telemetry, INVALID_METRIC};
pub use recovery::{RebootAction, RecoveryController, RecoveryOutcome, RecoveryState, SystemReboot};
pub use sensor::{Reading, SensorDriver, SensorPool};
pub use shutdown::ShutdownFlag;
pub use supervisor::{LoopOutcome, SensorCheck, Supervisor, SupervisorOptions, SupervisorState};
