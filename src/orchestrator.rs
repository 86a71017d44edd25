//! Batch orchestration.
//!
//! Resolves batch entries to radio addresses, drives one session (single
//! pass) or two (pre/post differential), builds the final per-device records,
//! reports them to the manufacturing system and persists the batch report.
//!
//! Like the session, the orchestrator is decoupled from CLI parsing and from
//! the process: the radio, the HTTP collaborators, the report sink and the
//! summary output are all injected.

use crate::battery::Status;
use crate::record::{
    BatchMetrics, DeviceRecord, DifferentialRecord, PhaseReading, Report, Results,
};
use crate::registry::TargetRegistry;
use crate::report::ReportSink;
use crate::session::{ScanSession, SessionConfig, SessionOutcome};
use crate::source::EventSource;
use crate::target::{Entry, LoadError, TargetSpec, classify_entry, dedup};
use crate::telemetry::{
    EventReporter, FailureCode, IdentifierResolver, TelemetryConfig, build_summary_notes,
    device_notes, differential_notes,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;

/// Errors returned by a batch run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Base settings shared by every session of the batch.
    pub session: SessionConfig,
    /// Single-pass bound; `None` scans until every target reports or the run is stopped.
    pub batch_timeout: Option<Duration>,
    pub differential: bool,
    /// Length of each differential phase.
    pub phase_duration: Duration,
    /// Largest tolerated pre → post voltage drop (mV).
    pub delta_fail_mv: i32,
    pub telemetry: TelemetryConfig,
    /// CSV location quoted in the batch summary event.
    pub csv_path: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            batch_timeout: None,
            differential: false,
            phase_duration: Duration::from_secs(10),
            delta_fail_mv: 100,
            telemetry: TelemetryConfig::default(),
            csv_path: "results/battery_results.csv".to_string(),
        }
    }
}

/// Pause between differential phases.
pub trait PhaseGate: Send + Sync {
    fn wait<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, ()>;
}

/// Continue without waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Proceed;

impl PhaseGate for Proceed {
    fn wait<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Wait for the operator to press ENTER.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinGate;

impl PhaseGate for StdinGate {
    fn wait<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            println!("{prompt}");
            let mut line = String::new();
            let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = stdin.read_line(&mut line).await {
                log::warn!("Could not read confirmation, continuing: {e}");
            }
        })
    }
}

static PROCEED: Proceed = Proceed;

/// Targets ready to scan, and the entries that could not be resolved.
#[derive(Debug, Default)]
pub struct Resolution {
    pub targets: Vec<TargetSpec>,
    pub unresolved: Vec<String>,
}

/// Verdict for one device of a differential run: `(delta_mv, final_status)`.
///
/// The delta is `post - pre` when both phases read the device, `0` with only
/// a post reading, and `-pre` with only a pre reading. The device fails
/// without a post reading, when the post reading itself fails, or when the
/// drop `pre - post` exceeds `threshold_mv`.
///
/// # Example
/// ```
/// use ble_battery_batch::battery::Status;
/// use ble_battery_batch::orchestrator::differential_outcome;
///
/// assert_eq!(differential_outcome(Some(3000), Some((2950, Status::Pass)), 100), (Some(-50), Status::Pass));
/// assert_eq!(differential_outcome(Some(3000), Some((2850, Status::Warn)), 100), (Some(-150), Status::Fail));
/// ```
pub fn differential_outcome(
    pre_mv: Option<i32>,
    post: Option<(i32, Status)>,
    threshold_mv: i32,
) -> (Option<i32>, Status) {
    let post_mv = post.map(|(mv, _)| mv);
    let delta = match (pre_mv, post_mv) {
        (Some(pre), Some(post)) => Some(post - pre),
        (None, Some(_)) => Some(0),
        (Some(pre), None) => Some(-pre),
        (None, None) => None,
    };

    let status = match (pre_mv, post) {
        (_, None) => Status::Fail,
        (_, Some((_, Status::Fail))) => Status::Fail,
        (Some(pre), Some((post, _))) if pre - post > threshold_mv => Status::Fail,
        _ => Status::Pass,
    };

    (delta, status)
}

pub struct Orchestrator<'a> {
    source: &'a dyn EventSource,
    resolver: &'a dyn IdentifierResolver,
    reporter: &'a dyn EventReporter,
    sink: Arc<dyn ReportSink>,
    gate: &'a dyn PhaseGate,
    config: BatchConfig,
    shutdown: watch::Receiver<bool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        source: &'a dyn EventSource,
        resolver: &'a dyn IdentifierResolver,
        reporter: &'a dyn EventReporter,
        sink: Arc<dyn ReportSink>,
        config: BatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            resolver,
            reporter,
            sink,
            gate: &PROCEED,
            config,
            shutdown,
        }
    }

    /// Pause between differential phases with `gate`.
    pub fn with_gate(mut self, gate: &'a dyn PhaseGate) -> Self {
        self.gate = gate;
        self
    }

    fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Turn raw batch entries into targets, resolving identifiers.
    ///
    /// A failed lookup drops that entry only.
    pub async fn resolve_targets(&self, entries: &[String]) -> Resolution {
        let mut resolution = Resolution::default();

        for entry in entries {
            match classify_entry(entry) {
                Entry::Address(address) => resolution.targets.push(TargetSpec::new(address, None)),
                Entry::Identifier(id) => match self.resolver.resolve(&id).await {
                    Ok(address) => {
                        log::debug!("Resolved {id} to {address}");
                        resolution.targets.push(TargetSpec::new(address, Some(id)));
                    }
                    Err(e) => {
                        log::warn!("Failed to resolve {id}: {e}");
                        resolution.unresolved.push(id);
                    }
                },
            }
        }

        resolution.targets = dedup(resolution.targets);
        resolution
    }

    /// Run the batch in the configured mode and return the final report.
    pub async fn run(&self, entries: &[String], out: &mut dyn Write) -> Result<Report, RunError> {
        let resolution = self.resolve_targets(entries).await;
        if !resolution.unresolved.is_empty() {
            log::warn!(
                "{} entries could not be resolved and are excluded",
                resolution.unresolved.len()
            );
        }

        if self.config.differential {
            self.run_differential(resolution, out).await
        } else {
            self.run_single(resolution, out).await
        }
    }

    async fn scan(
        &self,
        registry: &Arc<TargetRegistry>,
        config: SessionConfig,
        checkpoints: bool,
    ) -> SessionOutcome {
        let mut session = ScanSession::new(
            self.source,
            Arc::clone(registry),
            config,
            self.shutdown.clone(),
        );
        if checkpoints {
            session = session.with_checkpoints(Arc::clone(&self.sink));
        }

        match session.run().await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Scan session could not start: {e}");
                SessionOutcome::aborted(registry, e)
            }
        }
    }

    /// One unbounded (or `batch_timeout`-bounded) session over all targets.
    pub async fn run_single(
        &self,
        resolution: Resolution,
        out: &mut dyn Write,
    ) -> Result<Report, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let registry = Arc::new(TargetRegistry::new(resolution.targets));

        let outcome = if registry.total() == 0 {
            log::warn!("No devices to scan");
            None
        } else {
            let config = SessionConfig {
                timeout: self.config.batch_timeout,
                label: "scan".to_string(),
                ..self.config.session.clone()
            };
            Some(self.scan(&registry, config, true).await)
        };

        let threshold = self.config.session.battery_threshold_mv;
        let records: Vec<DeviceRecord> = registry
            .targets()
            .iter()
            .map(|target| {
                match outcome
                    .as_ref()
                    .and_then(|o| o.store.get(&target.address))
                {
                    Some(phase) => DeviceRecord::found(
                        target.label(),
                        phase.clone(),
                        phase.reading.comment(threshold),
                    ),
                    None => DeviceRecord::not_found(target.label(), target.address),
                }
            })
            .collect();

        let not_found = records.iter().filter(|r| r.reading.is_none()).count();
        let passed = records.iter().filter(|r| r.passed()).count();
        if not_found > 0 {
            log::warn!("{not_found} devices produced no data");
        }

        self.report_devices(registry.targets(), &records, started_at)
            .await;

        let metrics = BatchMetrics {
            total: records.len(),
            processed: records.len() - not_found,
            failed: Some(not_found),
            passed: Some(passed),
            unresolved: Some(resolution.unresolved.len()),
            elapsed_s: started.elapsed().as_secs_f64(),
            ..Default::default()
        };
        let report = Report {
            metrics,
            results: Results::Single(records),
        };
        self.finish(&report, started_at).await;

        writeln!(out, "Batch processing complete")?;
        writeln!(out, "Total: {}", report.metrics.total)?;
        writeln!(out, "Processed: {}", report.metrics.processed)?;
        writeln!(out, "Passed: {passed}")?;
        writeln!(out, "Failed: {not_found}")?;
        if !resolution.unresolved.is_empty() {
            writeln!(out, "Unresolved: {}", resolution.unresolved.len())?;
        }
        writeln!(out, "Elapsed: {:.1}s", report.metrics.elapsed_s)?;

        Ok(report)
    }

    /// Two bounded sessions around a physical change, compared per device.
    pub async fn run_differential(
        &self,
        resolution: Resolution,
        out: &mut dyn Write,
    ) -> Result<Report, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let registry = Arc::new(TargetRegistry::new(resolution.targets.clone()));
        let total = registry.total();

        let phase_config = |label: &str| SessionConfig {
            timeout: Some(self.config.phase_duration),
            label: label.to_string(),
            ..self.config.session.clone()
        };

        let (pre, post) = if total == 0 {
            log::warn!("No devices to scan");
            (None, None)
        } else {
            log::info!("Starting pre-test scan for {total} units");
            let pre = self.scan(&registry, phase_config("pre"), false).await;
            for target in registry.targets() {
                log_phase("PRE-TEST", target, pre.store.get(&target.address));
            }

            if !self.stopped() {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = self.gate.wait("Pre-test complete. Place units in chamber. Press ENTER when ready for post-test.") => {}
                    _ = async move {
                        if shutdown.wait_for(|stop| *stop).await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    } => {}
                }
            }

            let post = if self.stopped() {
                log::warn!("Run stopped, skipping post-test scan");
                None
            } else {
                // Fresh registry: every target is pending again.
                let registry = Arc::new(TargetRegistry::new(resolution.targets.clone()));
                log::info!("Starting post-test scan for {total} units");
                Some(self.scan(&registry, phase_config("post"), false).await)
            };
            (Some(pre), post)
        };

        let reading = |outcome: &Option<SessionOutcome>, target: &TargetSpec| {
            outcome
                .as_ref()
                .and_then(|o| o.store.get(&target.address))
                .cloned()
        };

        let records: Vec<DifferentialRecord> = registry
            .targets()
            .iter()
            .map(|target| {
                let pre = reading(&pre, target);
                let post = reading(&post, target);
                let (delta_mv, final_status) = differential_outcome(
                    pre.as_ref().map(|p| p.reading.voltage_mv),
                    post.as_ref()
                        .map(|p| (p.reading.voltage_mv, p.classification.status)),
                    self.config.delta_fail_mv,
                );
                log_phase("POST-TEST", target, post.as_ref());
                if let Some(delta) = delta_mv {
                    log::info!("[POST-TEST] {} delta {delta} mV -> {final_status}", target.label());
                }
                DifferentialRecord {
                    identifier: target.label(),
                    address: target.address,
                    pre,
                    post,
                    delta_mv,
                    final_status,
                }
            })
            .collect();

        self.report_differential(registry.targets(), &records, started_at)
            .await;

        let passed = records
            .iter()
            .filter(|r| r.final_status == Status::Pass)
            .count();
        let failed = records.len() - passed;

        let metrics = BatchMetrics {
            total,
            processed: total,
            failed: Some(failed),
            passed: Some(passed),
            unresolved: Some(resolution.unresolved.len()),
            elapsed_s: started.elapsed().as_secs_f64(),
            elapsed_pre_s: pre.as_ref().map(|o| o.elapsed.as_secs_f64()),
            elapsed_post_s: post.as_ref().map(|o| o.elapsed.as_secs_f64()),
            ..Default::default()
        };
        let report = Report {
            metrics,
            results: Results::Differential(records),
        };
        self.finish(&report, started_at).await;

        writeln!(out, "SUMMARY:")?;
        writeln!(out, "Total Units: {total}")?;
        writeln!(out, "Pass: {passed}")?;
        writeln!(out, "Fail: {failed}")?;

        Ok(report)
    }

    /// One event per identified device, plus a comment for those with a reading.
    async fn report_devices(
        &self,
        targets: &[TargetSpec],
        records: &[DeviceRecord],
        started_at: DateTime<Utc>,
    ) {
        for (target, record) in targets.iter().zip(records) {
            let comment = record.reading.is_some().then(|| record.comment.clone());
            self.report_device(
                target,
                FailureCode::for_record(record),
                device_notes(record),
                comment,
                started_at,
            )
            .await;
        }
    }

    /// Differential flavour: judged on the final status, commented from the post reading.
    async fn report_differential(
        &self,
        targets: &[TargetSpec],
        records: &[DifferentialRecord],
        started_at: DateTime<Utc>,
    ) {
        let threshold = self.config.session.battery_threshold_mv;
        for (target, record) in targets.iter().zip(records) {
            let comment = record
                .post
                .as_ref()
                .map(|post| post.reading.comment(threshold));
            self.report_device(
                target,
                FailureCode::for_differential(record),
                differential_notes(record),
                comment,
                started_at,
            )
            .await;
        }
    }

    async fn report_device(
        &self,
        target: &TargetSpec,
        code: FailureCode,
        notes: String,
        comment: Option<String>,
        started_at: DateTime<Utc>,
    ) {
        let Some(identifier) = target.identifier.as_deref() else {
            return;
        };

        let event = self
            .config
            .telemetry
            .event(identifier, code, started_at, Utc::now(), notes);
        if let Err(e) = self.reporter.post_event(&event).await {
            log::warn!("Event for {identifier} failed: {e}");
        }

        if let Some(comment) = comment
            && let Err(e) = self.reporter.append_comment(identifier, &comment).await
        {
            log::warn!("Comment update for {identifier} failed: {e}");
        }
    }

    /// Persist the report and post the batch summary event.
    async fn finish(&self, report: &Report, started_at: DateTime<Utc>) {
        if let Err(e) = self.sink.persist(report) {
            log::error!("Failed to save the batch report: {e}");
        }

        let run_id = format!("BATCH-{}", uuid::Uuid::new_v4());
        let notes = build_summary_notes(&run_id, &report.metrics, &self.config.csv_path);
        let event =
            self.config
                .telemetry
                .event(&run_id, FailureCode::AllPass, started_at, Utc::now(), notes);
        match self.reporter.post_event(&event).await {
            Ok(()) => log::info!("Batch summary posted as {run_id}"),
            Err(e) => log::warn!("Batch summary event failed: {e}"),
        }
    }
}

fn log_phase(phase: &str, target: &TargetSpec, reading: Option<&PhaseReading>) {
    match reading {
        Some(p) => log::info!(
            "[{phase}] {} -> {} mV, {}",
            target.label(),
            p.reading.voltage_mv,
            p.classification.status
        ),
        None => log::info!("[{phase}] {} -> No data, {}", target.label(), Status::Fail),
    }
}
