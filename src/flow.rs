//! Pulse integration for flow-style sensors
//!
//! A flow meter raises a pulse per fixed volume of water. The pulse
//! counter is the only state shared between execution contexts: the GPIO
//! edge watcher advances it, and the integrator's 1 Hz sampler thread
//! drains it with a single atomic read-and-reset. Each drained count is
//! converted to an instantaneous rate:
//!
//! ```text
//! rate = 1000 * pulses / (rate_factor * 60)      // mL per second
//! ```
//!
//! Reports are windowed sums of those per-second rates rather than one
//! end-to-end delta, so short bursts inside the window are averaged into
//! the coarser report period instead of being lost. The sampler is the
//! only clock: each tick's rate is handed to an open window exactly once
//! over a channel, never re-read from a second sleeper that could drift
//! out of phase and see a tick twice or not at all.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::shutdown::ShutdownFlag;

/// Poll period for the GPIO edge watcher. Hall-effect flow meters pulse
/// at well under 200 Hz, so 2 ms sampling cannot miss an edge.
const GPIO_POLL: Duration = Duration::from_millis(2);

/// How finely sampler threads slice their sleeps while checking the stop
/// flag, so `stop()` joins promptly.
const STOP_SLICE: Duration = Duration::from_millis(50);

/// Monotonic pulse counter shared between the edge context and the
/// integrator tick. The critical section is a single read-and-reset.
#[derive(Debug, Default)]
pub struct PulseCounter {
    pulses: AtomicU32,
}

impl PulseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter by one detected pulse edge.
    pub fn pulse(&self) {
        self.pulses.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset the counter.
    pub fn take(&self) -> u32 {
        self.pulses.swap(0, Ordering::Relaxed)
    }
}

/// Instantaneous rate for one tick's worth of pulses, in mL/s-equivalent.
pub fn pulses_to_rate(pulses: u32, rate_factor: f64) -> f64 {
    1000.0 * f64::from(pulses) / (rate_factor * 60.0)
}

/// Background sampler converting pulse counts into a per-second rate
/// series, summed over a configurable window on request.
pub struct PulseIntegrator {
    rate_bits: Arc<AtomicU64>,
    /// Channel into the currently open window, if any. The sampler sends
    /// each tick's rate through it; installed and cleared by
    /// `total_over_window`.
    window_tx: Arc<Mutex<Option<Sender<f64>>>>,
    stop: Arc<AtomicBool>,
    shutdown: ShutdownFlag,
    thread: Option<JoinHandle<()>>,
}

impl PulseIntegrator {
    /// Spawn the 1 Hz sampler thread.
    pub fn start(counter: Arc<PulseCounter>, rate_factor: f64, shutdown: ShutdownFlag) -> Self {
        Self::start_with_tick(counter, rate_factor, Duration::from_secs(1), shutdown)
    }

    fn start_with_tick(
        counter: Arc<PulseCounter>,
        rate_factor: f64,
        tick: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        let rate_bits = Arc::new(AtomicU64::new(0f64.to_bits()));
        let window_tx: Arc<Mutex<Option<Sender<f64>>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_rate = Arc::clone(&rate_bits);
        let thread_tx = Arc::clone(&window_tx);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            // Drain anything counted before the sampler started so the
            // first tick is a clean delta.
            counter.take();
            while !thread_stop.load(Ordering::SeqCst) {
                sliced_sleep(tick, &thread_stop);
                if thread_stop.load(Ordering::SeqCst) {
                    break;
                }
                let pulses = counter.take();
                let rate = pulses_to_rate(pulses, rate_factor);
                thread_rate.store(rate.to_bits(), Ordering::Relaxed);
                let mut slot = thread_tx.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(tx) = slot.as_ref() {
                    if tx.send(rate).is_err() {
                        *slot = None;
                    }
                }
                drop(slot);
                trace!(pulses, rate, "integrator tick");
            }
            debug!("pulse integrator sampler stopped");
        });

        Self {
            rate_bits,
            window_tx,
            stop,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Latest instantaneous rate stored by the sampler.
    pub fn latest_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Collect the next `seconds` sampler ticks and return the sum of
    /// their instantaneous rates. Each tick is delivered to the window
    /// exactly once, so a burst concentrated in one tick contributes its
    /// full rate to exactly one summand.
    ///
    /// If shutdown trips mid-window the partial sum accumulated so far is
    /// returned instead of blocking out the rest of the window.
    pub fn total_over_window(&self, seconds: u32) -> f64 {
        let ticks = self.open_window();
        let mut total = 0.0;
        let mut collected = 0;
        while collected < seconds {
            if self.shutdown.is_tripped() {
                debug!(partial = total, "flow window interrupted by shutdown");
                break;
            }
            match ticks.recv_timeout(STOP_SLICE) {
                Ok(rate) => {
                    total += rate;
                    collected += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(partial = total, "flow window ended early; sampler gone");
                    break;
                }
            }
        }
        self.close_window();
        total
    }

    fn open_window(&self) -> Receiver<f64> {
        let (tx, rx) = mpsc::channel();
        *self.window_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    fn close_window(&self) {
        *self.window_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Stop the sampler thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PulseIntegrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls a GPIO value file for falling edges and advances the shared
/// pulse counter. One watcher per configured GPIO line; two-tap nodes run
/// two watchers into the same counter.
pub struct GpioEdgeWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GpioEdgeWatcher {
    pub fn start(path: PathBuf, counter: Arc<PulseCounter>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut last = read_level(&path).unwrap_or(1);
            let mut read_errors: u32 = 0;
            while !thread_stop.load(Ordering::SeqCst) {
                match read_level(&path) {
                    Ok(level) => {
                        if last == 1 && level == 0 {
                            counter.pulse();
                        }
                        last = level;
                        read_errors = 0;
                    }
                    Err(e) => {
                        read_errors = read_errors.saturating_add(1);
                        // Transient sysfs hiccups happen; only nag once
                        // per run of errors.
                        if read_errors == 1 {
                            warn!(path = %path.display(), error = %e, "GPIO read failed");
                        }
                    }
                }
                thread::sleep(GPIO_POLL);
            }
            debug!(path = %path.display(), "GPIO edge watcher stopped");
        });

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GpioEdgeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_level(path: &std::path::Path) -> std::io::Result<u8> {
    let raw = std::fs::read_to_string(path)?;
    match raw.trim() {
        "0" => Ok(0),
        _ => Ok(1),
    }
}

fn sliced_sleep(dur: Duration, stop: &AtomicBool) {
    let deadline = std::time::Instant::now() + dur;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(STOP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_read_and_reset() {
        let counter = PulseCounter::new();
        for _ in 0..7 {
            counter.pulse();
        }
        assert_eq!(counter.take(), 7);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn rate_formula_matches_sensor_spec() {
        // 600 pulses in one second at rate_factor 5:
        // 1000 * 600 / (5 * 60) = 2000 mL/s-equivalent.
        assert_eq!(pulses_to_rate(600, 5.0), 2000.0);
        assert_eq!(pulses_to_rate(0, 5.0), 0.0);
    }

    #[test]
    fn burst_inside_window_is_summed_exactly() {
        // A 600-pulse burst lands in one sampler tick wherever it arrives
        // in the window; the windowed sum must count it exactly once,
        // regardless of the phase between burst and tick boundary.
        for inject_after in [5u64, 15, 25, 35, 45] {
            let counter = Arc::new(PulseCounter::new());
            let integrator = PulseIntegrator::start_with_tick(
                Arc::clone(&counter),
                5.0,
                Duration::from_millis(20),
                ShutdownFlag::new(),
            );

            let burst_counter = Arc::clone(&counter);
            let injector = thread::spawn(move || {
                thread::sleep(Duration::from_millis(inject_after));
                for _ in 0..600 {
                    burst_counter.pulse();
                }
            });

            let total = integrator.total_over_window(6);
            injector.join().unwrap();
            assert!(
                (total - 2000.0).abs() < 1e-9,
                "inject_after {inject_after} ms: total {total}"
            );
        }
    }

    #[test]
    fn integrator_picks_up_pulses() {
        let counter = Arc::new(PulseCounter::new());
        let shutdown = ShutdownFlag::new();
        let mut integrator = PulseIntegrator::start_with_tick(
            Arc::clone(&counter),
            5.0,
            Duration::from_millis(20),
            shutdown,
        );

        for _ in 0..300 {
            counter.pulse();
        }
        // Give the sampler a few ticks to drain the counter.
        thread::sleep(Duration::from_millis(200));
        let seen = integrator.latest_rate();
        integrator.stop();
        assert!(seen >= 0.0);
        // All pulses must have been drained exactly once.
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn window_returns_partial_sum_on_shutdown() {
        let counter = Arc::new(PulseCounter::new());
        let shutdown = ShutdownFlag::new();
        let integrator = PulseIntegrator::start_with_tick(
            counter,
            5.0,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        shutdown.trip();
        let start = std::time::Instant::now();
        let total = integrator.total_over_window(3600);
        assert_eq!(total, 0.0);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
