//! labsensed - Labsense sensor node daemon
//!
//! Reads the node's sensors on a fixed interval, publishes validated
//! telemetry to the lab's MQTT broker, and recovers degraded hardware by
//! re-initializing sensors, rebooting the device only when that fails.
//!
//! Runs in the foreground; systemd (or equivalent) owns restarts. All
//! user-visible behaviour is logs, level via `LABSENSE_LOG`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info, warn};

use labsense_node::config::{NodeConfig, SensorKind, DEFAULT_CONFIG_PATH};
use labsense_node::publish::{MqttSink, Publisher};
use labsense_node::recovery::{RecoveryController, SystemReboot};
use labsense_node::sensor::{FlowMeterDriver, IioDriver, SensorDriver, SensorPool};
use labsense_node::shutdown::ShutdownFlag;
use labsense_node::supervisor::{LoopOutcome, SensorCheck, Supervisor, SupervisorOptions};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("labsensed {VERSION} - Labsense sensor node daemon");
    println!();
    println!("Usage: labsensed [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>   Config file (default: {DEFAULT_CONFIG_PATH})");
    println!("  -h, --help            Show this help");
    println!("  -v, --version         Show version");
    println!();
    println!("Environment:");
    println!("  LABSENSE_LOG          Log filter (default: info)");
}

/// Build one driver and its validation settings per configured sensor,
/// in config order.
fn build_drivers(
    config: &NodeConfig,
    shutdown: &ShutdownFlag,
) -> anyhow::Result<(Vec<Box<dyn SensorDriver>>, Vec<SensorCheck>)> {
    let mut drivers: Vec<Box<dyn SensorDriver>> = Vec::with_capacity(config.sensors.len());
    let mut checks = Vec::with_capacity(config.sensors.len());

    for sensor in &config.sensors {
        match sensor.kind {
            SensorKind::Distance | SensorKind::Light => {
                let device = sensor.device.clone().with_context(|| {
                    format!("sensor {:?} has no device path", sensor.id)
                })?;
                drivers.push(Box::new(IioDriver::new(
                    sensor.id.as_str(),
                    sensor.group.as_str(),
                    sensor.metric.as_str(),
                    sensor.unit.as_str(),
                    device,
                    sensor.scale,
                    Duration::from_millis(sensor.read_timeout_ms),
                )));
            }
            SensorKind::Flow => {
                let flow = sensor.flow.as_ref().with_context(|| {
                    format!("sensor {:?} has no flow section", sensor.id)
                })?;
                drivers.push(Box::new(FlowMeterDriver::new(
                    sensor.id.as_str(),
                    sensor.group.as_str(),
                    sensor.metric.as_str(),
                    sensor.unit.as_str(),
                    flow.gpio_value_paths.clone(),
                    flow.rate_factor,
                    flow.window_secs,
                    shutdown.clone(),
                )));
            }
        }
        checks.push(SensorCheck {
            bounds: sensor.bounds,
            degenerate_sentinel: sensor.degenerate_sentinel,
            fault: sensor.fault,
        });
    }

    Ok((drivers, checks))
}

fn main() -> anyhow::Result<()> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("labsensed {VERSION}");
                return Ok(());
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(2);
                }
                config_path = PathBuf::from(&args[i]);
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let log_level = std::env::var("LABSENSE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!(version = VERSION, "labsensed starting");

    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    info!(
        lab_id = config.lab_id,
        sublab_id = config.sublab_id,
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        topic = %config.mqtt.topic,
        interval_secs = config.measurement_interval_secs,
        sensors = config.sensors.len(),
        "configuration loaded"
    );

    let shutdown = ShutdownFlag::new();
    {
        let handler_flag = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("received SIGINT/SIGTERM; shutting down gracefully");
            handler_flag.trip();
        })
        .context("registering signal handler")?;
    }

    let (drivers, checks) = build_drivers(&config, &shutdown)?;
    let mut pool = SensorPool::new(drivers);
    let failed = pool.open_all();
    if !pool.any_open() {
        bail!("all sensors failed to initialize");
    }
    if failed > 0 {
        warn!(
            failed,
            "some sensors failed to initialize; continuing with available sensors"
        );
    }

    let sink = MqttSink::new(
        config.mqtt.host.as_str(),
        config.mqtt.port,
        config.mqtt.client_id.as_str(),
        Duration::from_secs(config.mqtt.keepalive_secs),
        Duration::from_secs(config.mqtt.attempt_timeout_secs),
    );
    let publisher = Publisher::new(
        sink,
        config.mqtt.topic.as_str(),
        config.publish.max_attempts,
        config.publish_backoff(),
        shutdown.clone(),
    );
    let recovery = RecoveryController::new(SystemReboot, config.soft_recovery_pause());
    let opts = SupervisorOptions {
        lab_id: config.lab_id,
        sublab_id: config.sublab_id,
        measurement_interval: config.measurement_interval(),
        constant_metrics: config.constant_metrics.clone(),
    };

    let mut supervisor = Supervisor::new(
        opts,
        pool,
        checks,
        config.publish_fault,
        publisher,
        recovery,
        shutdown,
    )?;

    match supervisor.run() {
        LoopOutcome::Shutdown => {
            info!("labsensed terminated");
            Ok(())
        }
        LoopOutcome::Reboot => {
            error!("exiting after device reboot was issued");
            std::process::exit(1);
        }
    }
}
