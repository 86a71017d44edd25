//! Command-line and environment configuration.
//!
//! Every setting has a CLI flag; station-level settings can also come from the
//! environment (or a `.env` file loaded by the binary before parsing).

use crate::orchestrator::BatchConfig;
use crate::report::FileReportSink;
use crate::session::SessionConfig;
use crate::source::Backend;
use crate::telemetry::TelemetryConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Radio addresses or device identifiers (QR codes) to test.
    #[arg(value_name = "ENTRY")]
    pub entries: Vec<String>,

    /// Read entries from a file: one per line, CSV lines use the first column.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Test every device heard during a discovery sweep of this length.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, conflicts_with = "input")]
    pub discover: Option<Duration>,

    /// Ignore devices weaker than this during discovery (dBm).
    #[arg(long, allow_negative_numbers = true)]
    pub min_rssi: Option<i16>,

    /// Bluetooth backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Adapter to scan on.
    #[arg(long, env = "BLE_PORT", default_value = "hci0")]
    pub port: String,

    /// Run a pre/post differential test instead of a single pass.
    #[arg(long, env = "POST_TEST_ENABLED")]
    pub differential: bool,

    /// Length of each differential phase.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h; bare numbers are seconds.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub phase_duration: Duration,

    /// Wait for ENTER between the differential phases.
    #[arg(long)]
    pub confirm_post: bool,

    /// Fail a device whose voltage drops more than this between phases (mV).
    #[arg(long, env = "DELTA_VOLTAGE_FAIL", default_value_t = 100)]
    pub delta_fail_mv: i32,

    /// Stop a single-pass batch after this long. Unbounded by default.
    #[arg(long, value_parser = parse_duration)]
    pub batch_timeout: Option<Duration>,

    /// Flag readings below this voltage in logs and comments (mV).
    #[arg(long, env = "BATTERY_THRESHOLD", default_value_t = 2850)]
    pub battery_threshold: i32,

    /// Maximum number of entries read from the input file.
    #[arg(long, env = "MAX_QR_BATCH", default_value_t = 10_000)]
    pub max_batch: usize,

    #[arg(long, default_value = "results/battery_results.json")]
    pub json_output: PathBuf,

    #[arg(long, default_value = "results/battery_results.csv")]
    pub csv_output: PathBuf,

    #[arg(long, env = "STATION_ID", default_value = "269")]
    pub station_id: String,

    #[arg(long, env = "OPERATOR_ID", default_value = "Pilot")]
    pub operator_id: String,

    /// Endpoint receiving manufacturing events.
    #[arg(long, env = "MANUF_API_URL")]
    pub manuf_api_url: Option<String>,

    /// Endpoint resolving identifiers to addresses and holding device comments.
    #[arg(long, env = "RESOLVER_URL")]
    pub resolver_url: Option<String>,

    /// Do not contact any server. Identifiers cannot be resolved.
    #[arg(long)]
    pub offline: bool,

    /// Debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            port: self.port.clone(),
            battery_threshold_mv: self.battery_threshold,
            ..Default::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            manuf_api_url: self.manuf_api_url.clone(),
            resolver_url: self.resolver_url.clone(),
            station_id: self.station_id.clone(),
            operator_id: self.operator_id.clone(),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            session: self.session_config(),
            batch_timeout: self.batch_timeout,
            differential: self.differential,
            phase_duration: self.phase_duration,
            delta_fail_mv: self.delta_fail_mv,
            telemetry: self.telemetry_config(),
            csv_path: self.csv_output.display().to_string(),
        }
    }

    pub fn report_sink(&self) -> FileReportSink {
        FileReportSink::new(&self.json_output, &self.csv_output)
    }
}

/// Parse `500ms`, `3s`, `1m`, `2h`, or a bare number of seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    const UNITS: [(&str, &str, fn(u64) -> Duration); 4] = [
        ("ms", "milliseconds", Duration::from_millis),
        ("h", "hours", |n| Duration::from_secs(n * 3600)),
        ("m", "minutes", |n| Duration::from_secs(n * 60)),
        ("s", "seconds", Duration::from_secs),
    ];

    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit, to_duration) = UNITS
        .iter()
        .find_map(|(suffix, unit, f)| src.strip_suffix(suffix).map(|num| (num, *unit, *f)))
        .unwrap_or((src, "seconds", Duration::from_secs as fn(u64) -> Duration));

    num.trim()
        .parse::<u64>()
        .map(to_duration)
        .map_err(|_| format!("invalid {unit}: {num}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration(" 3 s ").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert_eq!(parse_duration("xm").unwrap_err(), "invalid minutes: x");
    }

    #[test]
    fn test_defaults() {
        let options = Options::try_parse_from(["ble-battery-batch", "QR-1"]).unwrap();
        assert_eq!(options.entries, vec!["QR-1"]);
        assert_eq!(options.phase_duration, Duration::from_secs(10));
        assert_eq!(options.batch_timeout, None);
        assert_eq!(options.json_output, PathBuf::from("results/battery_results.json"));

        let batch = options.batch_config();
        assert!(!batch.differential);
        assert_eq!(batch.csv_path, "results/battery_results.csv");
        assert_eq!(batch.session.timeout, None);
    }

    #[test]
    fn test_differential_options() {
        let options = Options::try_parse_from([
            "ble-battery-batch",
            "--differential",
            "--phase-duration",
            "30s",
            "--delta-fail-mv",
            "150",
            "--station-id",
            "12",
            "AABBCCDDEEFF",
        ])
        .unwrap();

        let batch = options.batch_config();
        assert!(batch.differential);
        assert_eq!(batch.phase_duration, Duration::from_secs(30));
        assert_eq!(batch.delta_fail_mv, 150);
        assert_eq!(batch.telemetry.station_id, "12");
    }

    #[test]
    fn test_discover_with_negative_rssi() {
        let options = Options::try_parse_from([
            "ble-battery-batch",
            "--discover",
            "15s",
            "--min-rssi",
            "-70",
        ])
        .unwrap();
        assert_eq!(options.discover, Some(Duration::from_secs(15)));
        assert_eq!(options.min_rssi, Some(-70));
    }

    #[test]
    fn test_discover_conflicts_with_input() {
        assert!(
            Options::try_parse_from([
                "ble-battery-batch",
                "--discover",
                "15s",
                "--input",
                "batch.txt",
            ])
            .is_err()
        );
    }
}
