//! Manufacturing-system collaborators: identifier resolution, pass/fail
//! events and remote comment updates.
//!
//! Every HTTP call is a single attempt; a non-2xx status is a failure.
//! Callers log failures and carry on, the batch never stops for telemetry.

use crate::address::{ParseAddressError, RadioAddress};
use crate::battery::Status;
use crate::record::{BatchMetrics, DeviceRecord, DifferentialRecord};
use crate::report::csv::{format_header, format_row};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for the `notes` field of an event.
pub const NOTES_LIMIT: usize = 7900;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no address known for {0}")]
    NotFound(String),
    #[error("resolving {id} failed with HTTP {status}")]
    Status { id: String, status: u16 },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver returned an invalid address: {0}")]
    InvalidAddress(#[from] ParseAddressError),
    #[error("identifier resolution is disabled")]
    Disabled,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered HTTP {0}")]
    Status(u16),
}

/// Failure code attached to a manufacturing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    #[serde(rename = "ALL-PASS-000")]
    AllPass,
    #[serde(rename = "ALL-FAIL-000")]
    AllFail,
    #[serde(rename = "SCAN-FAIL-001")]
    ScanFail,
}

impl FailureCode {
    pub fn for_record(record: &DeviceRecord) -> Self {
        match (&record.reading, record.passed()) {
            (None, _) => FailureCode::ScanFail,
            (Some(_), true) => FailureCode::AllPass,
            (Some(_), false) => FailureCode::AllFail,
        }
    }

    /// A differential device is judged on its post reading and final status.
    pub fn for_differential(record: &DifferentialRecord) -> Self {
        match (&record.post, record.final_status) {
            (None, _) => FailureCode::ScanFail,
            (Some(_), Status::Pass) => FailureCode::AllPass,
            (Some(_), _) => FailureCode::AllFail,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureCode::AllPass => "ALL-PASS-000",
            FailureCode::AllFail => "ALL-FAIL-000",
            FailureCode::ScanFail => "SCAN-FAIL-001",
        })
    }
}

/// One manufacturing event, serialized as the form the API expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManufEvent {
    #[serde(rename = "currQr")]
    pub identifier: String,
    #[serde(rename = "stationID")]
    pub station_id: String,
    #[serde(rename = "operatorID")]
    pub operator_id: String,
    #[serde(rename = "failureCode")]
    pub failure_code: FailureCode,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "endTime")]
    pub end_time: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Event endpoint; events are skipped when unset.
    pub manuf_api_url: Option<String>,
    /// Identifier lookup and comment endpoint.
    pub resolver_url: Option<String>,
    pub station_id: String,
    pub operator_id: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            manuf_api_url: None,
            resolver_url: None,
            station_id: "269".to_string(),
            operator_id: "Pilot".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn event(
        &self,
        identifier: impl Into<String>,
        failure_code: FailureCode,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        notes: String,
    ) -> ManufEvent {
        ManufEvent {
            identifier: identifier.into(),
            station_id: self.station_id.clone(),
            operator_id: self.operator_id.clone(),
            failure_code,
            start_time: format_ts(&start),
            end_time: format_ts(&end),
            notes,
        }
    }
}

/// Maps an external identifier to a radio address.
pub trait IdentifierResolver: Send + Sync {
    fn resolve<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<RadioAddress, ResolveError>>;
}

/// Reports results to the manufacturing system.
pub trait EventReporter: Send + Sync {
    fn post_event<'a>(&'a self, event: &'a ManufEvent) -> BoxFuture<'a, Result<(), TelemetryError>>;

    /// Append `comment` to the device's remote comment.
    fn append_comment<'a>(
        &'a self,
        identifier: &'a str,
        comment: &'a str,
    ) -> BoxFuture<'a, Result<(), TelemetryError>>;
}

/// `YYYY-MM-DD HH:MM:SS.fff`
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Cut `notes` to [`NOTES_LIMIT`] characters and append `marker` if it was longer.
pub fn truncate_notes(notes: String, marker: &str) -> String {
    match notes.char_indices().nth(NOTES_LIMIT) {
        Some((cut, _)) => {
            let mut truncated = notes[..cut].to_string();
            truncated.push_str(marker);
            truncated
        }
        None => notes,
    }
}

/// Notes for a per-device event: CSV header and row, or `No data obtained`.
pub fn device_notes(record: &DeviceRecord) -> String {
    if record.reading.is_none() {
        return record.comment.clone();
    }
    let notes = format!(
        "{}\n{}",
        format_header::<DeviceRecord>(),
        format_row(record)
    );
    truncate_notes(notes, "\n... (truncated)")
}

/// Notes for a differential device: CSV header and row, both phases included.
pub fn differential_notes(record: &DifferentialRecord) -> String {
    let notes = format!(
        "{}\n{}",
        format_header::<DifferentialRecord>(),
        format_row(record)
    );
    truncate_notes(notes, "\n... (truncated)")
}

/// Compact JSON notes for the batch summary event.
pub fn build_summary_notes(run_id: &str, metrics: &BatchMetrics, csv_path: &str) -> String {
    let notes = serde_json::json!({
        "run_id": run_id,
        "totals": {
            "total": metrics.total,
            "processed": metrics.processed,
            "passed": metrics.passed,
            "failed": metrics.failed,
            "unresolved": metrics.unresolved,
        },
        "csv_path": csv_path,
        "app_version": env!("CARGO_PKG_VERSION"),
        "tz": "UTC",
    });
    truncate_notes(notes.to_string(), "...")
}

#[derive(Deserialize)]
struct AddressLookup {
    #[serde(rename = "macAddress", default)]
    mac_address: String,
}

#[derive(Deserialize)]
struct CommentLookup {
    #[serde(default)]
    comment: String,
}

#[derive(Serialize)]
struct CommentUpdate<'a> {
    #[serde(rename = "qrCode")]
    qr_code: &'a str,
    comment: String,
}

/// `reqwest`-backed resolver and reporter.
pub struct HttpTelemetry {
    client: reqwest::Client,
    config: TelemetryConfig,
}

impl HttpTelemetry {
    pub fn new(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response, TelemetryError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(TelemetryError::Status(status.as_u16()))
        }
    }
}

impl IdentifierResolver for HttpTelemetry {
    fn resolve<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<RadioAddress, ResolveError>> {
        Box::pin(async move {
            let url = self
                .config
                .resolver_url
                .as_deref()
                .ok_or(ResolveError::Disabled)?;
            let response = self
                .client
                .get(url)
                .query(&[("qrCode", identifier)])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(ResolveError::Status {
                    id: identifier.to_string(),
                    status: status.as_u16(),
                });
            }

            let lookup: AddressLookup = response.json().await?;
            if lookup.mac_address.trim().is_empty() {
                return Err(ResolveError::NotFound(identifier.to_string()));
            }
            Ok(lookup.mac_address.parse()?)
        })
    }
}

impl EventReporter for HttpTelemetry {
    fn post_event<'a>(&'a self, event: &'a ManufEvent) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async move {
            let Some(url) = self.config.manuf_api_url.as_deref() else {
                log::debug!("No event endpoint configured, skipping {}", event.identifier);
                return Ok(());
            };
            let response = self.client.post(url).form(event).send().await?;
            Self::check(response)?;
            log::debug!("Event {} posted for {}", event.failure_code, event.identifier);
            Ok(())
        })
    }

    fn append_comment<'a>(
        &'a self,
        identifier: &'a str,
        comment: &'a str,
    ) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async move {
            let Some(url) = self.config.resolver_url.as_deref() else {
                return Ok(());
            };

            let response = self
                .client
                .get(url)
                .query(&[("qrCode", identifier)])
                .send()
                .await?;
            let existing: CommentLookup = Self::check(response)?.json().await?;

            let comment = if existing.comment.is_empty() {
                comment.to_string()
            } else {
                format!("{} | {comment}", existing.comment)
            };
            let update = CommentUpdate {
                qr_code: identifier,
                comment,
            };
            Self::check(self.client.put(url).json(&update).send().await?)?;
            log::debug!("Comment updated for {identifier}");
            Ok(())
        })
    }
}

/// Stand-in for `--offline`: nothing resolves, nothing is sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

impl IdentifierResolver for Offline {
    fn resolve<'a>(&'a self, _identifier: &'a str) -> BoxFuture<'a, Result<RadioAddress, ResolveError>> {
        Box::pin(async { Err(ResolveError::Disabled) })
    }
}

impl EventReporter for Offline {
    fn post_event<'a>(&'a self, _event: &'a ManufEvent) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async { Ok(()) })
    }

    fn append_comment<'a>(
        &'a self,
        _identifier: &'a str,
        _comment: &'a str,
    ) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async { Ok(()) })
    }
}
