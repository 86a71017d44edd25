//! BlueZ D-Bus backend.
//!
//! Uses the `bluer` crate to talk to the BlueZ daemon, which must be running.
//! Discovery is configured for LE with duplicate reporting so that repeated
//! advertisements from the same device keep arriving.

use super::{AdvertisementEvent, Connection, EVENT_CHANNEL_BUFFER_SIZE, ScanError, ScanParams};
use crate::address::RadioAddress;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Flatten BlueZ's manufacturer map into the raw AD payload.
///
/// BlueZ strips the company ID; it is restored little-endian in front of the
/// data. With several entries the lowest company ID wins.
fn manufacturer_payload(data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
    data.iter()
        .min_by_key(|(id, _)| **id)
        .map(|(id, bytes)| {
            let mut payload = id.to_le_bytes().to_vec();
            payload.extend_from_slice(bytes);
            payload
        })
        .unwrap_or_default()
}

async fn read_event(
    adapter: &Adapter,
    address: Address,
    sequence: u64,
) -> Result<Option<AdvertisementEvent>, ScanError> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        // Cached device, not currently advertising
        return Ok(None);
    };
    let payload = device
        .manufacturer_data()
        .await?
        .map(|data| manufacturer_payload(&data))
        .unwrap_or_default();

    Ok(Some(AdvertisementEvent {
        address: RadioAddress::from(address),
        rssi,
        payload,
        sequence,
    }))
}

pub struct BluerConnection {
    _session: Session,
    adapter: Adapter,
    task: Option<JoinHandle<()>>,
}

impl BluerConnection {
    /// Open `port` by adapter name; an empty name or `default` picks the
    /// system default adapter.
    pub async fn open(port: &str) -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = match port.trim() {
            "" | "default" => session.default_adapter().await?,
            name => session.adapter(name)?,
        };
        adapter.set_powered(true).await?;
        log::debug!("Using adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            task: None,
        })
    }
}

impl Connection for BluerConnection {
    fn start_scan(
        &mut self,
        _params: ScanParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementEvent>, ScanError>> {
        // BlueZ owns interval and window; they are not configurable over D-Bus.
        Box::pin(async move {
            self.adapter
                .set_discovery_filter(DiscoveryFilter {
                    transport: DiscoveryTransport::Le,
                    duplicate_data: true,
                    ..Default::default()
                })
                .await?;

            let discovery = self.adapter.discover_devices_with_changes().await?;
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            let adapter = self.adapter.clone();

            self.task = Some(tokio::spawn(async move {
                let mut discovery = Box::pin(discovery);
                let mut sequence = 0u64;

                while let Some(event) = discovery.next().await {
                    let AdapterEvent::DeviceAdded(address) = event else {
                        continue;
                    };
                    match read_event(&adapter, address, sequence).await {
                        Ok(Some(event)) => {
                            sequence += 1;
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::debug!("Skipping {address}: {e}"),
                    }
                }
                log::warn!("BlueZ discovery stream ended");
            }));

            Ok(rx)
        })
    }

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            // Dropping the discovery stream ends discovery in BlueZ.
            if let Some(task) = self.task.take() {
                task.abort();
            }
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(task) = &self.task {
                task.abort();
            }
            log::debug!("Releasing adapter {}", self.adapter.name());
            drop(self);
            Ok(())
        })
    }
}
