//! Advertisement event sources.
//!
//! The radio is reached through a [`Connection`] obtained from an
//! [`EventSource`]. Once scanning starts, the driver side pushes every
//! received advertisement into a bounded `mpsc` channel; the scan session is
//! the only consumer. Backends are compiled in through cargo features.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::address::RadioAddress;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel buffer size for advertisement events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 1024;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// One broadcast packet received by the passive scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementEvent {
    pub address: RadioAddress,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Manufacturer-specific data, company ID included. Empty when absent.
    pub payload: Vec<u8>,
    /// Arrival order within the connection.
    pub sequence: u64,
}

/// Passive scan parameters handed to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub interval: Duration,
    pub window: Duration,
    /// `None` scans until stopped.
    pub timeout: Option<Duration>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            window: Duration::from_millis(50),
            timeout: None,
        }
    }
}

/// Error type for event source operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The port/adapter name could not be interpreted
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
    /// The driver stopped delivering events
    #[error("Advertisement stream closed by the driver")]
    StreamClosed,
}

/// Factory for radio connections.
pub trait EventSource: Send + Sync {
    /// Open the radio behind `port` (an adapter name such as `hci0`).
    fn open<'a>(&'a self, port: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>, ScanError>>;
}

/// One exclusive, open radio connection.
pub trait Connection: Send {
    /// Start passive scanning and return the event channel.
    fn start_scan(
        &mut self,
        params: ScanParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementEvent>, ScanError>>;

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<(), ScanError>>;

    /// Release the radio. Always called, whatever the session outcome.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), ScanError>>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// The real radio, dispatching to the selected backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct RadioSource {
    backend: Backend,
}

impl RadioSource {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl EventSource for RadioSource {
    fn open<'a>(&'a self, port: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>, ScanError>> {
        Box::pin(async move {
            log::info!("Opening {} radio on {port}", self.backend);
            let connection: Box<dyn Connection> = match self.backend {
                #[cfg(feature = "bluer")]
                Backend::Bluer => Box::new(bluer::BluerConnection::open(port).await?),
                #[cfg(feature = "hci")]
                Backend::Hci => Box::new(hci::HciConnection::open(port).await?),
            };
            Ok(connection)
        })
    }
}
