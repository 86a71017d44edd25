//! Report persistence.
//!
//! A [`ReportSink`] receives the final batch report and, for large batches,
//! checkpoint snapshots taken while scanning. The file sink writes a JSON
//! document and a CSV table side by side.

pub mod csv;

use crate::record::Report;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reports with more results than this are written as compact JSON.
const PRETTY_JSON_LIMIT: usize = 1000;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for batch reports and checkpoints.
pub trait ReportSink: Send + Sync {
    fn persist(&self, report: &Report) -> Result<(), PersistenceError>;
}

/// Writes `report.json`/`report.csv`; checkpoints go to
/// `report_checkpoint.json`/`report_checkpoint.csv`.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    json_path: PathBuf,
    csv_path: PathBuf,
}

impl FileReportSink {
    pub fn new(json_path: impl Into<PathBuf>, csv_path: impl Into<PathBuf>) -> Self {
        Self {
            json_path: json_path.into(),
            csv_path: csv_path.into(),
        }
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// `dir/name.ext` → `dir/name_checkpoint.ext`
    pub fn checkpoint_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}_checkpoint.{}", ext.to_string_lossy()),
            None => format!("{stem}_checkpoint"),
        };
        path.with_file_name(name)
    }

    fn paths_for(&self, report: &Report) -> (PathBuf, PathBuf) {
        if report.metrics.is_checkpoint() {
            (
                Self::checkpoint_path(&self.json_path),
                Self::checkpoint_path(&self.csv_path),
            )
        } else {
            (self.json_path.clone(), self.csv_path.clone())
        }
    }
}

/// Write through a temporary file so readers never see a partial report.
fn write_replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

impl ReportSink for FileReportSink {
    fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        let (json_path, csv_path) = self.paths_for(report);

        let json = if report.results.len() <= PRETTY_JSON_LIMIT {
            serde_json::to_vec_pretty(report)?
        } else {
            serde_json::to_vec(report)?
        };
        write_replace(&json_path, &json)?;
        write_replace(&csv_path, csv::format_results(&report.results).as_bytes())?;

        log::debug!(
            "Report written to {} and {}",
            json_path.display(),
            csv_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BatchMetrics, DeviceRecord, Results};
    use crate::test_utils::TEST_ADDRESS;

    fn report(checkpoint: bool) -> Report {
        Report {
            metrics: BatchMetrics {
                total: 1,
                processed: 0,
                failed: (!checkpoint).then_some(1),
                checkpoint: checkpoint.then_some(true),
                ..Default::default()
            },
            results: Results::Single(vec![DeviceRecord::not_found(
                "QR-1".into(),
                TEST_ADDRESS,
            )]),
        }
    }

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(
            FileReportSink::checkpoint_path(Path::new("results/battery.json")),
            PathBuf::from("results/battery_checkpoint.json")
        );
        assert_eq!(
            FileReportSink::checkpoint_path(Path::new("out")),
            PathBuf::from("out_checkpoint")
        );
    }

    #[test]
    fn test_persist_writes_json_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileReportSink::new(
            dir.path().join("nested/results.json"),
            dir.path().join("nested/results.csv"),
        );

        sink.persist(&report(false)).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(sink.json_path()).unwrap()).unwrap();
        assert_eq!(json["metrics"]["failed"], 1);
        assert_eq!(json["results"][0]["identifier"], "QR-1");

        let csv = fs::read_to_string(sink.csv_path()).unwrap();
        assert!(csv.starts_with("qr_or_mac,"));
        assert!(csv.contains("QR-1,,,NO_DATA,FAIL"));
    }

    #[test]
    fn test_checkpoint_does_not_clobber_final_report() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("results.json");
        let sink = FileReportSink::new(&json_path, dir.path().join("results.csv"));

        sink.persist(&report(true)).unwrap();
        assert!(!json_path.exists());
        assert!(dir.path().join("results_checkpoint.json").exists());
        assert!(dir.path().join("results_checkpoint.csv").exists());

        let saved: Report = serde_json::from_str(
            &fs::read_to_string(dir.path().join("results_checkpoint.json")).unwrap(),
        )
        .unwrap();
        assert!(saved.metrics.is_checkpoint());
        assert_eq!(saved.metrics.failed, None);
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let sink = FileReportSink::new(blocker.join("r.json"), blocker.join("r.csv"));
        assert!(matches!(
            sink.persist(&report(false)),
            Err(PersistenceError::Io(_))
        ));
    }
}
