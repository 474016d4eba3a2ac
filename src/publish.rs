//! Telemetry message and bus publisher
//!
//! The wire schema is shared by every Labsense node and consumed by the
//! database inserter and the dashboards downstream:
//!
//! ```json
//! {
//!   "labId": 1,
//!   "sublabId": 3,
//!   "sensorReadings": { "fumehood": { "distance": 1243.0, "light": 81.2 } },
//!   "measureTimestamp": "2026-08-28 14:05:30"
//! }
//! ```
//!
//! Invalid or degenerate metrics are published as `-1.0` rather than
//! omitted, so consumers can tell "sensor present but invalid this tick"
//! from "sensor absent".
//!
//! Delivery goes through the `MessageSink` seam: one attempt per call,
//! transport-specific. The `Publisher` adds bounded retry with a fixed
//! backoff on top; exhausting the retries is an expected transient
//! condition surfaced to the supervisor, never a panic.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

use rumqttc::{Client, ConnectionError, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{PublishError, SinkError};
use crate::shutdown::ShutdownFlag;

/// Wire value for a metric whose reading was invalid or degenerate this
/// tick.
pub const INVALID_METRIC: f64 = -1.0;

/// Outbound telemetry payload. Constructed per publish attempt from the
/// tick's readings; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub lab_id: u32,
    pub sublab_id: u32,
    /// group -> metric -> value. BTreeMaps keep serialization order
    /// deterministic.
    pub sensor_readings: BTreeMap<String, BTreeMap<String, f64>>,
    /// `YYYY-MM-DD HH:MM:SS`, node-local time.
    pub measure_timestamp: String,
}

impl Telemetry {
    pub fn new(lab_id: u32, sublab_id: u32, measure_timestamp: String) -> Self {
        Self {
            lab_id,
            sublab_id,
            sensor_readings: BTreeMap::new(),
            measure_timestamp,
        }
    }

    pub fn insert(&mut self, group: &str, metric: &str, value: f64) {
        self.sensor_readings
            .entry(group.to_string())
            .or_default()
            .insert(metric.to_string(), value);
    }
}

/// One delivery attempt to the message bus. Implementations carry their
/// own per-attempt timeout, shorter than the publisher's retry backoff.
pub trait MessageSink {
    fn deliver(&mut self, topic: &str, payload: &[u8]) -> Result<(), SinkError>;
}

/// Bounded-retry publisher over any `MessageSink`.
pub struct Publisher<S: MessageSink> {
    sink: S,
    topic: String,
    max_attempts: u32,
    backoff: Duration,
    shutdown: ShutdownFlag,
}

impl<S: MessageSink> Publisher<S> {
    pub fn new(
        sink: S,
        topic: impl Into<String>,
        max_attempts: u32,
        backoff: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        debug_assert!(max_attempts > 0);
        Self {
            sink,
            topic: topic.into(),
            max_attempts,
            backoff,
            shutdown,
        }
    }

    /// Serialize and deliver, retrying up to the configured attempt count
    /// with a fixed delay between attempts. Distinct transport errors are
    /// logged with their detail but all count the same toward exhaustion.
    /// The backoff is shutdown-aware: a trip mid-backoff abandons the
    /// remaining attempts instead of sleeping them out.
    pub fn publish(&mut self, message: &Telemetry) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;

        for attempt in 1..=self.max_attempts {
            match self.sink.deliver(&self.topic, &payload) {
                Ok(()) => {
                    info!(topic = %self.topic, attempt, "telemetry published");
                    return Ok(());
                }
                Err(SinkError::ConnectionRefused) => {
                    error!(
                        attempt,
                        max = self.max_attempts,
                        "broker refused connection; check that it is running"
                    );
                }
                Err(SinkError::Timeout) => {
                    error!(
                        attempt,
                        max = self.max_attempts,
                        "broker not responding within the attempt timeout"
                    );
                }
                Err(e) => {
                    error!(attempt, max = self.max_attempts, error = %e, "publish attempt failed");
                }
            }
            if attempt < self.max_attempts && !self.shutdown.sleep(self.backoff) {
                warn!(attempt, "shutdown requested during publish backoff; abandoning retries");
                return Err(PublishError::Exhausted { attempts: attempt });
            }
        }

        warn!(
            attempts = self.max_attempts,
            topic = %self.topic,
            "publish retries exhausted; dropping reading"
        );
        Err(PublishError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

/// MQTT delivery: connect, publish QoS 1, wait for the ack, disconnect.
/// One short-lived session per attempt, matching how the nodes have
/// always talked to the broker.
pub struct MqttSink {
    host: String,
    port: u16,
    client_id: String,
    keepalive: Duration,
    attempt_timeout: Duration,
}

impl MqttSink {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        keepalive: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keepalive,
            attempt_timeout,
        }
    }
}

impl MessageSink for MqttSink {
    fn deliver(&mut self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);

        let (client, mut connection) = Client::new(options, 10);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| SinkError::Protocol(e.to_string()))?;

        // Drive the connection until the broker acks the publish or the
        // attempt deadline passes.
        let deadline = Instant::now() + self.attempt_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SinkError::Timeout);
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => {
                    let _ = client.disconnect();
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(classify(e)),
                Err(_) => return Err(SinkError::Timeout),
            }
        }
    }
}

fn classify(e: ConnectionError) -> SinkError {
    match e {
        ConnectionError::Io(io) => match io.kind() {
            ErrorKind::ConnectionRefused => SinkError::ConnectionRefused,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => SinkError::Timeout,
            _ => SinkError::Io(io),
        },
        other => SinkError::Protocol(other.to_string()),
    }
}
