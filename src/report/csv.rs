//! Tabular report output, one row per device.

use crate::record::{DeviceRecord, DifferentialRecord, PhaseReading, Results};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// A single CSV cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Int(i64),
    Float(f64),
    /// Percentages, one decimal.
    Percent(f64),
    Bool(bool),
    Empty,
}

impl Cell {
    fn text(value: impl ToString) -> Self {
        Cell::Text(value.to_string())
    }

    fn timestamp(ts: &DateTime<Utc>) -> Self {
        Cell::Text(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cell::Text(s) if s.contains([',', '"', '\n', '\r']) => {
                write!(f, "\"{}\"", s.replace('"', "\"\""))
            }
            Cell::Text(s) => f.write_str(s),
            Cell::Int(n) => write!(f, "{n}"),
            Cell::Float(n) => write!(f, "{n}"),
            Cell::Percent(n) => write!(f, "{n:.1}"),
            Cell::Bool(true) => f.write_str("True"),
            Cell::Bool(false) => f.write_str("False"),
            Cell::Empty => Ok(()),
        }
    }
}

/// A record that renders as one CSV row under a fixed header.
pub trait CsvRecord {
    const HEADER: &'static [&'static str];

    fn cells(&self) -> Vec<Cell>;
}

impl CsvRecord for DeviceRecord {
    const HEADER: &'static [&'static str] = &[
        "qr_or_mac",
        "voltage_v",
        "voltage_mv",
        "category",
        "status",
        "percentage_estimate",
        "pass_fail",
        "rssi",
        "comment",
        "timestamp",
    ];

    fn cells(&self) -> Vec<Cell> {
        let c = &self.classification;
        let (volts, millivolts, rssi, timestamp) = match &self.reading {
            Some(r) => (
                Cell::Float(r.volts()),
                Cell::Int(i64::from(r.voltage_mv)),
                Cell::Int(i64::from(r.rssi)),
                Cell::timestamp(&r.timestamp),
            ),
            None => (Cell::Empty, Cell::Empty, Cell::Empty, Cell::Empty),
        };

        vec![
            Cell::text(&self.identifier),
            volts,
            millivolts,
            Cell::text(c.category),
            Cell::text(c.status),
            Cell::Percent(c.percentage),
            Cell::Bool(c.pass_fail()),
            rssi,
            Cell::text(&self.comment),
            timestamp,
        ]
    }
}

fn phase_cells(phase: Option<&PhaseReading>) -> [Cell; 4] {
    match phase {
        Some(p) => [
            Cell::Int(i64::from(p.reading.voltage_mv)),
            Cell::text(p.classification.status),
            Cell::Int(i64::from(p.reading.rssi)),
            Cell::timestamp(&p.reading.timestamp),
        ],
        None => [Cell::Empty, Cell::Empty, Cell::Empty, Cell::Empty],
    }
}

impl CsvRecord for DifferentialRecord {
    const HEADER: &'static [&'static str] = &[
        "macid",
        "qr",
        "pre_voltage_mv",
        "pre_status",
        "pre_rssi",
        "pre_timestamp",
        "post_voltage_mv",
        "post_status",
        "post_rssi",
        "post_timestamp",
        "delta_voltage_mv",
        "final_status",
    ];

    fn cells(&self) -> Vec<Cell> {
        let mut cells = vec![Cell::text(self.address), Cell::text(&self.identifier)];
        cells.extend(phase_cells(self.pre.as_ref()));
        cells.extend(phase_cells(self.post.as_ref()));
        cells.push(self.delta_mv.map_or(Cell::Empty, |d| Cell::Int(i64::from(d))));
        cells.push(Cell::text(self.final_status));
        cells
    }
}

pub fn format_header<R: CsvRecord>() -> String {
    R::HEADER.join(",")
}

pub fn format_row<R: CsvRecord>(record: &R) -> String {
    record
        .cells()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Header plus one line per record, newline-terminated.
pub fn format_table<R: CsvRecord>(records: &[R]) -> String {
    let mut out = format_header::<R>();
    out.push('\n');
    for record in records {
        out.push_str(&format_row(record));
        out.push('\n');
    }
    out
}

pub fn format_results(results: &Results) -> String {
    match results {
        Results::Single(records) => format_table(records),
        Results::Differential(records) => format_table(records),
    }
}
