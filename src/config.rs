//! Node configuration
//!
//! JSON file, loaded once at startup. Anything inconsistent is fatal
//! before the loop starts; the supervisor itself never sees a bad value.
//! Defaults mirror the long-standing deployment values (30 s interval,
//! 3 publish attempts with a 2 s backoff, 2 s re-initialization pause,
//! flow calibration factor 5).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::validate::Bounds;

/// Default config location; override with `-c`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/labsense/config.json";

/// Per-fault-class escalation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultPolicy {
    /// Consecutive occurrences before the class fires.
    pub threshold: u32,
    #[serde(default = "default_true")]
    pub soft_recovery: bool,
    #[serde(default)]
    pub hard_recovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Per-attempt delivery timeout; deliberately shorter than the retry
    /// backoff.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Distance,
    Light,
    Flow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    /// GPIO value files whose falling edges all feed one pulse counter
    /// (one per tap).
    pub gpio_value_paths: Vec<PathBuf>,
    #[serde(default = "default_rate_factor")]
    pub rate_factor: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub id: String,
    pub kind: SensorKind,
    /// Sensor group key in the outbound message.
    pub group: String,
    /// Metric key within the group.
    pub metric: String,
    #[serde(default)]
    pub unit: String,
    /// IIO channel value file (distance/light kinds).
    #[serde(default)]
    pub device: Option<PathBuf>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub bounds: Bounds,
    /// Known-invalid sentinel; readings equal to it count toward the
    /// sensor's degenerate fault class.
    #[serde(default)]
    pub degenerate_sentinel: Option<f64>,
    /// Escalation for the sensor's degenerate class; omit to disable
    /// tracking for this sensor.
    #[serde(default)]
    pub fault: Option<FaultPolicy>,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Flow-kind settings.
    #[serde(default)]
    pub flow: Option<FlowConfig>,
}

/// Placeholder metric merged into a group's readings every tick (the
/// fumehood nodes report a constant airflow until that sensor lands).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantMetric {
    pub group: String,
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub lab_id: u32,
    pub sublab_id: u32,
    #[serde(default = "default_interval_secs")]
    pub measurement_interval_secs: u64,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub publish: RetryConfig,
    #[serde(default = "default_publish_fault")]
    pub publish_fault: FaultPolicy,
    #[serde(default = "default_reinit_pause_secs")]
    pub soft_recovery_pause_secs: u64,
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub constant_metrics: Vec<ConstantMetric>,
}

fn default_true() -> bool {
    true
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "labsense-node".to_string()
}
fn default_keepalive_secs() -> u64 {
    10
}
fn default_attempt_timeout_secs() -> u64 {
    5
}
fn default_rate_factor() -> f64 {
    5.0
}
fn default_window_secs() -> u32 {
    5
}
fn default_scale() -> f64 {
    1.0
}
fn default_read_timeout_ms() -> u64 {
    500
}
fn default_interval_secs() -> u64 {
    30
}
fn default_reinit_pause_secs() -> u64 {
    2
}
fn default_publish_fault() -> FaultPolicy {
    // Publish failures are expected transients: warn loudly, never
    // recover hardware for them.
    FaultPolicy {
        threshold: 5,
        soft_recovery: false,
        hard_recovery: false,
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: NodeConfig = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.measurement_interval_secs == 0 {
            return Err(ConfigError::invalid("measurement_interval_secs must be > 0"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host must not be empty"));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.topic must not be empty"));
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::invalid("publish.max_attempts must be > 0"));
        }
        if self.publish_fault.threshold == 0 {
            return Err(ConfigError::invalid("publish_fault.threshold must be > 0"));
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::invalid("at least one sensor must be configured"));
        }

        let mut seen_ids = HashSet::new();
        for sensor in &self.sensors {
            if !seen_ids.insert(sensor.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate sensor id {:?}",
                    sensor.id
                )));
            }
            if !sensor.bounds.min.is_finite()
                || !sensor.bounds.max.is_finite()
                || sensor.bounds.min > sensor.bounds.max
            {
                return Err(ConfigError::invalid(format!(
                    "sensor {:?}: bounds [{}, {}] are not a valid range",
                    sensor.id, sensor.bounds.min, sensor.bounds.max
                )));
            }
            if let Some(policy) = &sensor.fault {
                if policy.threshold == 0 {
                    return Err(ConfigError::invalid(format!(
                        "sensor {:?}: fault.threshold must be > 0",
                        sensor.id
                    )));
                }
            }
            match sensor.kind {
                SensorKind::Distance | SensorKind::Light => {
                    if sensor.device.is_none() {
                        return Err(ConfigError::invalid(format!(
                            "sensor {:?}: {:?} sensors need a device path",
                            sensor.id, sensor.kind
                        )));
                    }
                }
                SensorKind::Flow => {
                    let flow = sensor.flow.as_ref().ok_or_else(|| {
                        ConfigError::invalid(format!(
                            "sensor {:?}: flow sensors need a flow section",
                            sensor.id
                        ))
                    })?;
                    if flow.gpio_value_paths.is_empty() {
                        return Err(ConfigError::invalid(format!(
                            "sensor {:?}: flow.gpio_value_paths must not be empty",
                            sensor.id
                        )));
                    }
                    if !(flow.rate_factor > 0.0) {
                        return Err(ConfigError::invalid(format!(
                            "sensor {:?}: flow.rate_factor must be > 0",
                            sensor.id
                        )));
                    }
                    if flow.window_secs == 0 {
                        return Err(ConfigError::invalid(format!(
                            "sensor {:?}: flow.window_secs must be > 0",
                            sensor.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn measurement_interval(&self) -> Duration {
        Duration::from_secs(self.measurement_interval_secs)
    }

    pub fn soft_recovery_pause(&self) -> Duration {
        Duration::from_secs(self.soft_recovery_pause_secs)
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_secs(self.publish.backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "lab_id": 1,
            "sublab_id": 3,
            "measurement_interval_secs": 30,
            "mqtt": { "host": "broker.lab", "topic": "fumehood" },
            "sensors": [
                {
                    "id": "distance",
                    "kind": "distance",
                    "group": "fumehood",
                    "metric": "distance",
                    "unit": "mm",
                    "device": "/sys/bus/iio/devices/iio:device0/in_distance_raw",
                    "bounds": { "min": 0.0, "max": 4000.0 },
                    "degenerate_sentinel": 0.0,
                    "fault": { "threshold": 10, "soft_recovery": true, "hard_recovery": true }
                },
                {
                    "id": "light",
                    "kind": "light",
                    "group": "fumehood",
                    "metric": "light",
                    "unit": "lux",
                    "device": "/sys/bus/iio/devices/iio:device1/in_illuminance_input",
                    "bounds": { "min": 0.0, "max": 200000.0 },
                    "degenerate_sentinel": 0.0,
                    "fault": { "threshold": 5, "soft_recovery": true }
                },
                {
                    "id": "water",
                    "kind": "flow",
                    "group": "water",
                    "metric": "water",
                    "unit": "mL",
                    "bounds": { "min": 0.0, "max": 100000.0 },
                    "flow": {
                        "gpio_value_paths": ["/sys/class/gpio/gpio4/value", "/sys/class/gpio/gpio17/value"],
                        "rate_factor": 5.0,
                        "window_secs": 5
                    }
                }
            ],
            "constant_metrics": [
                { "group": "fumehood", "metric": "airflow", "value": 0.0 }
            ]
        })
    }

    fn parse(value: serde_json::Value) -> Result<NodeConfig, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config = parse(sample_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.measurement_interval(), Duration::from_secs(30));
        assert_eq!(config.publish.max_attempts, 3);
        assert_eq!(config.publish_fault.threshold, 5);
        assert!(!config.publish_fault.hard_recovery);
        // Light sensor policy defaults hard_recovery to false.
        assert!(!config.sensors[1].fault.unwrap().hard_recovery);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value = sample_json();
        value["surprise"] = serde_json::json!(true);
        assert!(parse(value).is_err());
    }

    #[test]
    fn inverted_bounds_are_fatal() {
        let mut value = sample_json();
        value["sensors"][0]["bounds"] = serde_json::json!({ "min": 10.0, "max": 1.0 });
        let config = parse(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_threshold_is_fatal() {
        let mut value = sample_json();
        value["sensors"][0]["fault"]["threshold"] = serde_json::json!(0);
        let config = parse(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn flow_sensor_without_flow_section_is_fatal() {
        let mut value = sample_json();
        value["sensors"][2]
            .as_object_mut()
            .unwrap()
            .remove("flow");
        let config = parse(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_sensor_ids_are_fatal() {
        let mut value = sample_json();
        value["sensors"][1]["id"] = serde_json::json!("distance");
        let config = parse(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_validates_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{}", sample_json()).unwrap();
        NodeConfig::load(&path).unwrap();

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            NodeConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
