//! `ble-battery-batch` library.
//!
//! The binary (`src/main.rs`) owns process concerns: `.env` loading, logging,
//! exit codes and Ctrl-C. Everything else lives here so it can be tested with
//! an injected event source, injected HTTP collaborators and an in-memory
//! report sink.

pub mod address;
pub mod battery;
pub mod config;
pub mod decoder;
pub mod discovery;
pub mod orchestrator;
pub mod record;
pub mod registry;
pub mod report;
pub mod session;
pub mod source;
pub mod target;
pub mod telemetry;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use address::{ParseAddressError, RadioAddress};
pub use battery::{Category, Classification, Status, classify};
pub use decoder::{Decoded, decode};
pub use orchestrator::{BatchConfig, Orchestrator, RunError};
pub use record::{DeviceRecord, Report};
pub use session::{ScanSession, SessionConfig, SessionOutcome, SessionState};
pub use source::{AdvertisementEvent, Backend, EventSource, ScanError};
