//! Readings, per-device records and the batch report document.

use crate::address::RadioAddress;
use crate::battery::{Classification, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The first successful voltage decode for an address within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageReading {
    pub address: RadioAddress,
    pub voltage_mv: i32,
    /// Signal strength at capture time (dBm)
    pub rssi: i16,
    pub timestamp: DateTime<Utc>,
}

impl VoltageReading {
    pub fn volts(&self) -> f64 {
        f64::from(self.voltage_mv) / 1000.0
    }

    /// Operator-facing comment, flagged when under the warning threshold.
    pub fn comment(&self, threshold_mv: i32) -> String {
        let mut comment = format!("RSSI {} | Battery {}V", self.rssi, self.volts());
        if self.voltage_mv < threshold_mv {
            comment.push_str(" | below threshold");
        }
        comment
    }
}

/// A reading paired with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReading {
    pub reading: VoltageReading,
    pub classification: Classification,
}

/// Outcome for one target in a single-pass batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// External identifier when known, otherwise the address.
    pub identifier: String,
    pub address: RadioAddress,
    /// `None` means the device was not found.
    pub reading: Option<VoltageReading>,
    pub classification: Classification,
    pub comment: String,
}

impl DeviceRecord {
    pub fn found(identifier: String, phase: PhaseReading, comment: String) -> Self {
        DeviceRecord {
            identifier,
            address: phase.reading.address,
            reading: Some(phase.reading),
            classification: phase.classification,
            comment,
        }
    }

    pub fn not_found(identifier: String, address: RadioAddress) -> Self {
        DeviceRecord {
            identifier,
            address,
            reading: None,
            classification: Classification::no_data(),
            comment: "No data obtained".to_string(),
        }
    }

    pub fn passed(&self) -> bool {
        self.classification.pass_fail()
    }
}

/// Outcome for one target in a pre/post batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialRecord {
    pub identifier: String,
    pub address: RadioAddress,
    pub pre: Option<PhaseReading>,
    pub post: Option<PhaseReading>,
    /// `post - pre` in mV; `None` when neither phase produced a reading.
    pub delta_mv: Option<i32>,
    pub final_status: Status,
}

/// Aggregate counters for a batch or a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub processed: usize,
    /// Unset on checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<usize>,
    /// Entries whose identifier could not be resolved to an address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<usize>,
    pub elapsed_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_pre_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_post_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl BatchMetrics {
    pub fn is_checkpoint(&self) -> bool {
        self.checkpoint.unwrap_or(false)
    }
}

/// Per-device results, one variant per batch mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Results {
    Single(Vec<DeviceRecord>),
    Differential(Vec<DifferentialRecord>),
}

impl Results {
    pub fn len(&self) -> usize {
        match self {
            Results::Single(records) => records.len(),
            Results::Differential(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The persisted batch document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metrics: BatchMetrics,
    pub results: Results,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{Category, classify};
    use crate::test_utils::{TEST_ADDRESS, reading};

    #[test]
    fn test_not_found_record_fails() {
        let record = DeviceRecord::not_found("QR-1".into(), TEST_ADDRESS);
        assert!(record.reading.is_none());
        assert_eq!(record.classification.category, Category::NoData);
        assert!(!record.passed());
    }

    #[test]
    fn test_found_record_takes_address_from_reading() {
        let phase = PhaseReading {
            reading: reading(TEST_ADDRESS, 3100, -60),
            classification: classify(3100),
        };
        let record = DeviceRecord::found("QR-1".into(), phase, String::new());
        assert_eq!(record.address, TEST_ADDRESS);
        assert!(record.passed());
        assert_eq!(record.reading.unwrap().volts(), 3.1);
    }

    #[test]
    fn test_reading_comment() {
        let ok = reading(TEST_ADDRESS, 2950, -61);
        assert_eq!(ok.comment(2850), "RSSI -61 | Battery 2.95V");
        let low = reading(TEST_ADDRESS, 2800, -70);
        assert_eq!(low.comment(2850), "RSSI -70 | Battery 2.8V | below threshold");
    }

    #[test]
    fn test_checkpoint_metrics_omit_failed() {
        let metrics = BatchMetrics {
            total: 1000,
            processed: 300,
            checkpoint: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["processed"], 300);
        assert_eq!(json["checkpoint"], true);
        assert!(json.get("failed").is_none());
        assert!(metrics.is_checkpoint());
    }

    #[test]
    fn test_report_json_shape() {
        let report = Report {
            metrics: BatchMetrics {
                total: 1,
                processed: 0,
                failed: Some(1),
                ..Default::default()
            },
            results: Results::Single(vec![DeviceRecord::not_found(
                TEST_ADDRESS.to_string(),
                TEST_ADDRESS,
            )]),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metrics"]["failed"], 1);
        assert_eq!(json["results"][0]["classification"]["category"], "NO_DATA");
        assert!(json["results"][0]["reading"].is_null());
        assert_eq!(report.results.len(), 1);
    }
}
