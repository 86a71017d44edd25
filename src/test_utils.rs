use crate::address::RadioAddress;
use crate::record::{Report, VoltageReading};
use crate::report::{PersistenceError, ReportSink};
use crate::source::{AdvertisementEvent, Connection, EventSource, ScanError, ScanParams};
use crate::telemetry::{EventReporter, IdentifierResolver, ManufEvent, ResolveError, TelemetryError};
use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A stable address for unit tests.
pub const TEST_ADDRESS: RadioAddress = RadioAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Distinct addresses for larger batches.
pub fn address(n: u32) -> RadioAddress {
    let [_, a, b, c] = n.to_be_bytes();
    RadioAddress([0x10, 0x20, 0x30, a, b, c])
}

/// A reading with a fixed timestamp.
pub fn reading(address: RadioAddress, voltage_mv: i32, rssi: i16) -> VoltageReading {
    VoltageReading {
        address,
        voltage_mv,
        rssi,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

pub fn event(address: RadioAddress, rssi: i16, payload: Vec<u8>) -> AdvertisementEvent {
    AdvertisementEvent {
        address,
        rssi,
        payload,
        sequence: 0,
    }
}

/// Simple-format payload carrying `tenths` of a volt.
pub fn simple_payload(tenths: u8) -> Vec<u8> {
    vec![0x59, 0x00, tenths]
}

/// Complex-format payload carrying `volts.hundredths`.
pub fn complex_payload(volts: u8, hundredths: u8) -> Vec<u8> {
    let mut payload = vec![0x02; 22];
    payload.extend_from_slice(&[hundredths, 255, 179, volts]);
    payload
}

/// What one `open` call of [`FakeEventSource`] does.
#[derive(Default)]
pub struct Script {
    pub events: Vec<AdvertisementEvent>,
    pub fail_open: bool,
    pub fail_start: bool,
    /// Drop the sender once all events are consumed.
    pub close_stream: bool,
    /// Signal shutdown once all events are consumed.
    pub then_shutdown: Option<Arc<watch::Sender<bool>>>,
    /// Pause before each event.
    pub delay: Duration,
}

impl Script {
    pub fn events(events: Vec<AdvertisementEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }
}

/// Scripted event source; each `open` consumes the next [`Script`].
#[derive(Default)]
pub struct FakeEventSource {
    scripts: Mutex<VecDeque<Script>>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeEventSource {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl EventSource for FakeEventSource {
    fn open<'a>(&'a self, _port: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>, ScanError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            if script.fail_open {
                return Err(ScanError::Bluetooth("no such adapter".into()));
            }
            let connection: Box<dyn Connection> = Box::new(FakeConnection {
                script: Some(script),
                closes: Arc::clone(&self.closes),
                feeder: None,
            });
            Ok(connection)
        })
    }
}

struct FakeConnection {
    script: Option<Script>,
    closes: Arc<AtomicUsize>,
    feeder: Option<JoinHandle<()>>,
}

async fn wait_drained(tx: &mpsc::Sender<AdvertisementEvent>) {
    while tx.capacity() < tx.max_capacity() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

impl Connection for FakeConnection {
    fn start_scan(
        &mut self,
        _params: ScanParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementEvent>, ScanError>> {
        Box::pin(async move {
            let script = self.script.take().unwrap_or_default();
            if script.fail_start {
                return Err(ScanError::Bluetooth("scan refused".into()));
            }

            let (tx, rx) = mpsc::channel(64);
            self.feeder = Some(tokio::spawn(async move {
                for (sequence, mut event) in script.events.into_iter().enumerate() {
                    if !script.delay.is_zero() {
                        tokio::time::sleep(script.delay).await;
                    }
                    event.sequence = sequence as u64;
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                wait_drained(&tx).await;
                if let Some(shutdown) = script.then_shutdown {
                    let _ = shutdown.send(true);
                }
                if script.close_stream {
                    return;
                }
                // Keep the stream open until stopped.
                std::future::pending::<()>().await;
                drop(tx);
            }));
            Ok(rx)
        })
    }

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(feeder) = self.feeder.take() {
                feeder.abort();
            }
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(feeder) = &self.feeder {
                feeder.abort();
            }
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Sink keeping every persisted report in memory.
#[derive(Default)]
pub struct MemorySink {
    pub reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn checkpoints(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.metrics.is_checkpoint())
            .cloned()
            .collect()
    }

    pub fn finals(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.metrics.is_checkpoint())
            .cloned()
            .collect()
    }
}

impl ReportSink for MemorySink {
    fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Sink that always fails.
pub struct FailingSink;

impl ReportSink for FailingSink {
    fn persist(&self, _report: &Report) -> Result<(), PersistenceError> {
        Err(PersistenceError::Io(std::io::Error::other("disk full")))
    }
}

/// Sink that blocks its thread on every write, keeping what it wrote.
#[derive(Default)]
pub struct SlowSink {
    pub delay: Duration,
    pub reports: Mutex<Vec<Report>>,
}

impl ReportSink for SlowSink {
    fn persist(&self, report: &Report) -> Result<(), PersistenceError> {
        std::thread::sleep(self.delay);
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Resolver backed by a fixed map.
#[derive(Default)]
pub struct MapResolver {
    pub map: HashMap<String, RadioAddress>,
}

impl MapResolver {
    pub fn new(entries: &[(&str, RadioAddress)]) -> Self {
        Self {
            map: entries
                .iter()
                .map(|(id, addr)| (id.to_string(), *addr))
                .collect(),
        }
    }
}

impl IdentifierResolver for MapResolver {
    fn resolve<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<RadioAddress, ResolveError>> {
        Box::pin(async move {
            self.map
                .get(identifier)
                .copied()
                .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))
        })
    }
}

/// Reporter recording every call.
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Mutex<Vec<ManufEvent>>,
    pub comments: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ManufEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.comments.lock().unwrap().clone()
    }
}

impl EventReporter for RecordingReporter {
    fn post_event<'a>(&'a self, event: &'a ManufEvent) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async move {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        })
    }

    fn append_comment<'a>(
        &'a self,
        identifier: &'a str,
        comment: &'a str,
    ) -> BoxFuture<'a, Result<(), TelemetryError>> {
        Box::pin(async move {
            self.comments
                .lock()
                .unwrap()
                .push((identifier.to_string(), comment.to_string()));
            Ok(())
        })
    }
}
