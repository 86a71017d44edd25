//! CR2032 battery classification.
//!
//! Breakpoints and the percentage interpolation are shared with the
//! manufacturing records downstream and must not drift.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower bound of the NEW band (mV).
pub const NEW_MIN_MV: i32 = 3000;
/// Voltage reported as 100% (mV).
pub const NEW_MAX_MV: i32 = 3300;
/// Lower bound of the GOOD band (mV).
pub const GOOD_MIN_MV: i32 = 2900;
/// Lower bound of the LOW band (mV).
pub const LOW_MIN_MV: i32 = 2800;

/// Battery condition category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    New,
    Good,
    Low,
    Dead,
    /// The device never produced a reading.
    NoData,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::New => "NEW",
            Category::Good => "GOOD",
            Category::Low => "LOW",
            Category::Dead => "DEAD",
            Category::NoData => "NO_DATA",
        })
    }
}

/// Test verdict attached to a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Pass => "PASS",
            Status::Warn => "WARN",
            Status::Fail => "FAIL",
        })
    }
}

/// Classification of a single voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub status: Status,
    /// Estimated remaining capacity, always within 0..=100.
    pub percentage: f64,
    pub advice: String,
}

impl Classification {
    /// `true` only for [`Status::Pass`].
    pub fn pass_fail(&self) -> bool {
        self.status == Status::Pass
    }

    /// Synthetic classification for a target that never reported.
    pub fn no_data() -> Self {
        Classification {
            category: Category::NoData,
            status: Status::Fail,
            percentage: 0.0,
            advice: "No data obtained".to_string(),
        }
    }
}

/// Classify a voltage in millivolts. Total over all inputs.
///
/// # Example
/// ```
/// use ble_battery_batch::battery::{classify, Category, Status};
///
/// let c = classify(2950);
/// assert_eq!(c.category, Category::Good);
/// assert_eq!(c.status, Status::Pass);
/// assert_eq!(c.percentage, 75.0);
/// ```
pub fn classify(voltage_mv: i32) -> Classification {
    let v = f64::from(voltage_mv);

    let (category, status, percentage, advice) = if voltage_mv >= NEW_MIN_MV {
        let span = f64::from(NEW_MAX_MV - NEW_MIN_MV);
        (
            Category::New,
            Status::Pass,
            (v - f64::from(NEW_MIN_MV)) / span * 100.0,
            "New battery - continue use",
        )
    } else if voltage_mv >= GOOD_MIN_MV {
        (
            Category::Good,
            Status::Pass,
            80.0 - (f64::from(NEW_MIN_MV) - v) / 10.0,
            "Good battery - continue use",
        )
    } else if voltage_mv >= LOW_MIN_MV {
        (
            Category::Low,
            Status::Warn,
            20.0 - (f64::from(GOOD_MIN_MV) - v) / 5.0,
            "Low battery - monitor closely",
        )
    } else {
        (
            Category::Dead,
            Status::Fail,
            0.0,
            "Dead battery - replace immediately",
        )
    };

    Classification {
        category,
        status,
        percentage: percentage.clamp(0.0, 100.0),
        advice: advice.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries_are_closed_below() {
        assert_eq!(classify(3000).category, Category::New);
        assert_eq!(classify(2999).category, Category::Good);
        assert_eq!(classify(2900).category, Category::Good);
        assert_eq!(classify(2899).category, Category::Low);
        assert_eq!(classify(2800).category, Category::Low);
        assert_eq!(classify(2799).category, Category::Dead);
    }

    #[test]
    fn test_statuses() {
        assert_eq!(classify(3300).status, Status::Pass);
        assert_eq!(classify(2950).status, Status::Pass);
        assert_eq!(classify(2850).status, Status::Warn);
        assert_eq!(classify(2700).status, Status::Fail);

        assert!(classify(3100).pass_fail());
        assert!(classify(2900).pass_fail());
        assert!(!classify(2899).pass_fail());
        assert!(!classify(0).pass_fail());
    }

    #[test]
    fn test_percentages() {
        assert_eq!(classify(3000).percentage, 0.0);
        assert_eq!(classify(3150).percentage, 50.0);
        assert_eq!(classify(3300).percentage, 100.0);
        assert_eq!(classify(2990).percentage, 79.0);
        assert_eq!(classify(2900).percentage, 70.0);
        assert_eq!(classify(2850).percentage, 10.0);
        assert_eq!(classify(2800).percentage, 0.0);
        assert_eq!(classify(2000).percentage, 0.0);
    }

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(classify(5000).percentage, 100.0);
        assert_eq!(classify(i32::MAX).percentage, 100.0);
        assert_eq!(classify(i32::MIN).percentage, 0.0);
        assert_eq!(classify(-1).category, Category::Dead);
    }

    #[test]
    fn test_percentage_monotonic_within_bands() {
        for (low, high) in [(3000, 3400), (2900, 2999), (2800, 2899), (2000, 2799)] {
            let mut previous = classify(low).percentage;
            for v in low + 1..=high {
                let current = classify(v).percentage;
                assert!(current >= previous, "{v} mV: {current} < {previous}");
                previous = current;
            }
        }
    }

    #[test]
    fn test_no_data_classification() {
        let c = Classification::no_data();
        assert_eq!(c.category, Category::NoData);
        assert_eq!(c.status, Status::Fail);
        assert!(!c.pass_fail());
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&Category::NoData).unwrap(),
            "\"NO_DATA\""
        );
        assert_eq!(serde_json::to_string(&Status::Warn).unwrap(), "\"WARN\"");
        assert_eq!(Category::Good.to_string(), "GOOD");
    }
}
