//! Scan session: one exclusive radio connection driven until every target
//! has reported, a deadline passes, or the operator stops the run.
//!
//! The driver pushes [`AdvertisementEvent`]s into a channel and this module
//! is their only consumer, so the registry and the result store have a single
//! writer. A poll tick bounds how long the loop can go without checking the
//! deadline and emitting progress.

use crate::address::RadioAddress;
use crate::battery::classify;
use crate::decoder::decode;
use crate::record::{BatchMetrics, DeviceRecord, PhaseReading, Report, Results, VoltageReading};
use crate::registry::TargetRegistry;
use crate::report::ReportSink;
use crate::source::{AdvertisementEvent, Connection, EventSource, ScanError, ScanParams};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Batches larger than this get the slower progress cadence.
const LARGE_BATCH: usize = 1000;

/// When and how often partial reports are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Batches of this size or smaller are never checkpointed.
    pub min_batch: usize,
    /// Smallest number of new readings between two checkpoints.
    pub min_step: usize,
    /// A checkpoint every `1/fraction` of the batch, if larger than `min_step`.
    pub fraction: usize,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            min_batch: 500,
            min_step: 100,
            fraction: 50,
        }
    }
}

impl CheckpointPolicy {
    /// Readings between checkpoints for a batch of `total`, `None` if disabled.
    pub fn step(&self, total: usize) -> Option<usize> {
        (total > self.min_batch).then(|| self.min_step.max(total / self.fraction.max(1)))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: String,
    pub scan: ScanParams,
    /// `None` waits until every target reports or the run is stopped.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// `None` picks 5s, or 10s for batches over 1000 targets.
    pub progress_interval: Option<Duration>,
    pub checkpoint: CheckpointPolicy,
    /// Readings below this are logged as warnings (mV).
    pub battery_threshold_mv: i32,
    /// Prefix for log lines, e.g. `pre` or `post`.
    pub label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: "hci0".to_string(),
            scan: ScanParams::default(),
            timeout: None,
            poll_interval: Duration::from_millis(500),
            progress_interval: None,
            checkpoint: CheckpointPolicy::default(),
            battery_threshold_mv: 2850,
            label: "scan".to_string(),
        }
    }
}

impl SessionConfig {
    fn progress_interval_for(&self, total: usize) -> Duration {
        self.progress_interval.unwrap_or(if total > LARGE_BATCH {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(5)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    /// Every target reported.
    Complete,
    /// The deadline passed with targets outstanding.
    TimedOut,
    /// Shutdown was requested.
    Stopped,
    /// The event source failed.
    Aborted,
}

/// Readings captured in one session. The first reading for an address wins.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    readings: HashMap<RadioAddress, PhaseReading>,
}

impl ResultStore {
    /// Store a reading; returns `false` and keeps the old one if present.
    pub fn insert(&mut self, phase: PhaseReading) -> bool {
        use std::collections::hash_map::Entry;
        match self.readings.entry(phase.reading.address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(phase);
                true
            }
        }
    }

    pub fn get(&self, address: &RadioAddress) -> Option<&PhaseReading> {
        self.readings.get(address)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseReading> {
        self.readings.values()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Advertisements received.
    pub events: u64,
    /// Advertisements from addresses still pending.
    pub target_events: u64,
    /// Target advertisements no format could decode.
    pub undecoded: u64,
    pub decoded: u64,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub store: ResultStore,
    /// Targets without a reading when the session ended.
    pub pending: HashSet<RadioAddress>,
    pub elapsed: Duration,
    pub stats: SessionStats,
    /// Set when the event source failed mid-session.
    pub error: Option<ScanError>,
}

impl SessionOutcome {
    /// Outcome for a session that never got to scan.
    pub fn aborted(registry: &TargetRegistry, error: ScanError) -> Self {
        Self {
            state: SessionState::Aborted,
            store: ResultStore::default(),
            pending: registry.snapshot_pending(),
            elapsed: Duration::ZERO,
            stats: SessionStats::default(),
            error: Some(error),
        }
    }
}

/// Feeds snapshots to the sink off the event path. Only the newest pending
/// snapshot is written.
struct CheckpointWriter {
    tx: watch::Sender<Option<Report>>,
    task: JoinHandle<()>,
    step: usize,
    next_at: usize,
}

impl CheckpointWriter {
    fn spawn(sink: Arc<dyn ReportSink>, step: usize) -> Self {
        let (tx, mut rx) = watch::channel::<Option<Report>>(None);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(report) = rx.borrow_and_update().clone() else {
                    continue;
                };
                let sink = Arc::clone(&sink);
                let processed = report.metrics.processed;
                match tokio::task::spawn_blocking(move || sink.persist(&report)).await {
                    Ok(Ok(())) => log::info!("Checkpoint saved: {processed} devices processed"),
                    Ok(Err(e)) => log::warn!("Checkpoint write failed: {e}"),
                    Err(e) => log::warn!("Checkpoint task failed: {e}"),
                }
            }
        });

        Self {
            tx,
            task,
            step,
            next_at: step,
        }
    }

    fn due(&self, processed: usize) -> bool {
        processed >= self.next_at
    }

    fn submit(&mut self, report: Report) {
        self.next_at = report.metrics.processed + self.step;
        // Fails only if the writer task is gone, which it logged.
        let _ = self.tx.send(Some(report));
    }

    async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            log::warn!("Checkpoint writer failed: {e}");
        }
    }
}

pub struct ScanSession<'a> {
    source: &'a dyn EventSource,
    registry: Arc<TargetRegistry>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
    checkpoints: Option<Arc<dyn ReportSink>>,
    state: SessionState,
    store: ResultStore,
    stats: SessionStats,
}

impl<'a> ScanSession<'a> {
    pub fn new(
        source: &'a dyn EventSource,
        registry: Arc<TargetRegistry>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            registry,
            config,
            shutdown,
            checkpoints: None,
            state: SessionState::Idle,
            store: ResultStore::default(),
            stats: SessionStats::default(),
        }
    }

    /// Persist partial reports to `sink` while scanning large batches.
    pub fn with_checkpoints(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state.
    ///
    /// Returns `Err` only when the radio cannot be opened or scanning cannot
    /// start. Once scanning, the connection is stopped and closed on every
    /// exit path and failures of the stream are reported in the outcome.
    pub async fn run(&mut self) -> Result<SessionOutcome, ScanError> {
        let started = Instant::now();
        let label = self.config.label.clone();

        let mut connection = match self.source.open(&self.config.port).await {
            Ok(connection) => connection,
            Err(e) => {
                self.state = SessionState::Aborted;
                return Err(e);
            }
        };

        let mut events = match connection.start_scan(self.config.scan).await {
            Ok(events) => events,
            Err(e) => {
                self.state = SessionState::Aborted;
                close(connection, &label).await;
                return Err(e);
            }
        };

        self.state = SessionState::Scanning;
        log::info!(
            "[{label}] Scanning for {} devices on {}",
            self.registry.total(),
            self.config.port
        );

        let mut writer = self.checkpoints.as_ref().and_then(|sink| {
            self.config
                .checkpoint
                .step(self.registry.total())
                .map(|step| CheckpointWriter::spawn(Arc::clone(sink), step))
        });

        let (state, error) = self.pump(&mut events, started, writer.as_mut()).await;
        self.state = state;
        drop(events);

        if let Err(e) = connection.stop_scan().await {
            log::warn!("[{label}] Failed to stop scanning: {e}");
        }
        close(connection, &label).await;

        if let Some(writer) = writer {
            writer.finish().await;
        }

        let elapsed = started.elapsed();
        let stats = self.stats;
        log::info!(
            "[{label}] Session {:?} after {:.1}s: {}/{} devices, {} events ({} from targets, {} undecoded)",
            state,
            elapsed.as_secs_f64(),
            self.registry.processed(),
            self.registry.total(),
            stats.events,
            stats.target_events,
            stats.undecoded
        );
        if let Some(e) = &error {
            log::error!("[{label}] Session aborted: {e}");
        }

        Ok(SessionOutcome {
            state,
            store: std::mem::take(&mut self.store),
            pending: self.registry.snapshot_pending(),
            elapsed,
            stats,
            error,
        })
    }

    async fn pump(
        &mut self,
        events: &mut mpsc::Receiver<AdvertisementEvent>,
        started: Instant,
        mut writer: Option<&mut CheckpointWriter>,
    ) -> (SessionState, Option<ScanError>) {
        let deadline = self.config.timeout.map(|timeout| started + timeout);
        let progress_interval = self.config.progress_interval_for(self.registry.total());
        let mut last_progress = started;

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown.clone();
        let mut shutdown_open = true;

        loop {
            if self.registry.pending_len() == 0 {
                return (SessionState::Complete, None);
            }
            if *shutdown.borrow() {
                return (SessionState::Stopped, None);
            }

            tokio::select! {
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        // Nobody can stop us any more; rely on the deadline.
                        shutdown_open = false;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event)
                            && let Some(writer) = writer.as_deref_mut()
                            && writer.due(self.registry.processed())
                        {
                            writer.submit(self.checkpoint_report(started.elapsed()));
                        }
                    }
                    None => return (SessionState::Aborted, Some(ScanError::StreamClosed)),
                },
                _ = poll.tick() => {
                    let now = Instant::now();
                    if deadline.is_some_and(|deadline| now >= deadline) {
                        return (SessionState::TimedOut, None);
                    }
                    if now.duration_since(last_progress) >= progress_interval {
                        self.log_progress(now.duration_since(started));
                        last_progress = now;
                    }
                }
            }
        }
    }

    /// Process one advertisement; returns whether it resolved a target.
    fn handle_event(&mut self, event: AdvertisementEvent) -> bool {
        self.stats.events += 1;

        if !self.registry.is_pending(&event.address) {
            log::trace!("Ignoring {} (not pending)", event.address);
            return false;
        }
        self.stats.target_events += 1;

        let Some(voltage_mv) = decode(&event.payload).millivolts() else {
            self.stats.undecoded += 1;
            log::debug!(
                "No voltage in {} byte payload from {}",
                event.payload.len(),
                event.address
            );
            return false;
        };

        if !self.registry.mark_resolved(&event.address) {
            return false;
        }
        self.stats.decoded += 1;

        let reading = VoltageReading {
            address: event.address,
            voltage_mv,
            rssi: event.rssi,
            timestamp: Utc::now(),
        };
        let classification = classify(voltage_mv);
        let label = self
            .registry
            .identifier(&event.address)
            .map(str::to_string)
            .unwrap_or_else(|| event.address.to_string());

        if voltage_mv < self.config.battery_threshold_mv {
            log::warn!(
                "[{}] {label}: {:.2}V {} ({}) below threshold, RSSI {}",
                self.config.label,
                reading.volts(),
                classification.category,
                classification.status,
                reading.rssi
            );
        } else {
            log::info!(
                "[{}] {label}: {:.2}V {} ({}), RSSI {}",
                self.config.label,
                reading.volts(),
                classification.category,
                classification.status,
                reading.rssi
            );
        }

        self.store.insert(PhaseReading {
            reading,
            classification,
        })
    }

    fn log_progress(&self, elapsed: Duration) {
        let total = self.registry.total();
        let processed = self.registry.processed();
        let percent = if total == 0 {
            100.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        log::info!(
            "[{}] Processing: {processed}/{total} ({percent:.1}%) - Elapsed: {:.1}s",
            self.config.label,
            elapsed.as_secs_f64()
        );
        log::info!(
            "[{}] Remaining devices: {}",
            self.config.label,
            total - processed
        );
    }

    /// Snapshot of the readings captured so far, in batch order.
    fn checkpoint_report(&self, elapsed: Duration) -> Report {
        let records = self
            .registry
            .targets()
            .iter()
            .filter_map(|target| {
                self.store.get(&target.address).map(|phase| {
                    DeviceRecord::found(
                        target.label(),
                        phase.clone(),
                        phase.reading.comment(self.config.battery_threshold_mv),
                    )
                })
            })
            .collect();

        Report {
            metrics: BatchMetrics {
                total: self.registry.total(),
                processed: self.registry.processed(),
                elapsed_s: elapsed.as_secs_f64(),
                checkpoint: Some(true),
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
            results: Results::Single(records),
        }
    }
}

async fn close(connection: Box<dyn Connection>, label: &str) {
    if let Err(e) = connection.close().await {
        log::warn!("[{label}] Failed to close the radio: {e}");
    }
}
