//! Reading validation
//!
//! Range checking against per-sensor bounds, plus the orthogonal
//! degenerate-sentinel flag. Validity and degeneracy are independent
//! signals: a reading of exactly the sentinel (0.0 for the distance and
//! light sensors) passes the range check but still counts toward the
//! sensor's fault streak, because a locked-up sensor reports it forever.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Inclusive validity bounds for one sensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Range-check a reading. Pure apart from a log entry on rejection.
///
/// Non-finite values (NaN, infinities) are never valid.
pub fn check(sensor: &str, value: f64, bounds: &Bounds) -> bool {
    if !value.is_finite() {
        warn!(sensor, value, "reading is not a finite number");
        return false;
    }
    if value < bounds.min || value > bounds.max {
        warn!(
            sensor,
            value,
            min = bounds.min,
            max = bounds.max,
            "reading outside valid range"
        );
        return false;
    }
    true
}

/// Whether a reading equals the sensor's known-invalid sentinel.
///
/// Exact comparison is intentional: the sentinel is a value the hardware
/// emits verbatim when locked up, not a measurement subject to noise.
pub fn is_degenerate(value: f64, sentinel: f64) -> bool {
    value == sentinel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_is_valid() {
        let bounds = Bounds::new(0.0, 4000.0);
        assert!(check("distance", 1200.0, &bounds));
        assert!(check("distance", 0.0, &bounds));
        assert!(check("distance", 4000.0, &bounds));
    }

    #[test]
    fn out_of_range_is_invalid() {
        let bounds = Bounds::new(0.0, 4000.0);
        assert!(!check("distance", -1.0, &bounds));
        assert!(!check("distance", 4000.1, &bounds));
    }

    #[test]
    fn non_finite_is_invalid() {
        let bounds = Bounds::new(0.0, 200_000.0);
        assert!(!check("light", f64::NAN, &bounds));
        assert!(!check("light", f64::INFINITY, &bounds));
    }

    #[test]
    fn check_is_idempotent() {
        let bounds = Bounds::new(0.0, 100.0);
        for _ in 0..3 {
            assert!(check("x", 50.0, &bounds));
            assert!(!check("x", 200.0, &bounds));
        }
    }

    #[test]
    fn degeneracy_is_orthogonal_to_validity() {
        let bounds = Bounds::new(0.0, 4000.0);
        // Sentinel 0.0 is range-valid but degenerate.
        assert!(check("distance", 0.0, &bounds));
        assert!(is_degenerate(0.0, 0.0));
        assert!(!is_degenerate(0.1, 0.0));
    }
}
