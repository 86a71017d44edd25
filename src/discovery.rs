//! Discovery sweep: listen for a while and list every device heard.
//!
//! Used for "test everything on the bench" runs where the operator has no
//! target list. Each address is kept with its first sighting only.

use crate::address::RadioAddress;
use crate::decoder::decode;
use crate::source::{EventSource, ScanError, ScanParams};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub address: RadioAddress,
    pub rssi: i16,
    /// Voltage from the first sighting, if its payload decoded.
    pub voltage_mv: Option<i32>,
}

/// Scan `port` for `duration` and return every address heard, strongest
/// signal first. Sightings weaker than `min_rssi` are skipped.
pub async fn discover(
    source: &dyn EventSource,
    port: &str,
    duration: Duration,
    min_rssi: Option<i16>,
) -> Result<Vec<Discovered>, ScanError> {
    log::info!("Discovering devices for {:.0}s", duration.as_secs_f64());

    let mut connection = source.open(port).await?;
    let mut events = match connection
        .start_scan(ScanParams {
            timeout: Some(duration),
            ..Default::default()
        })
        .await
    {
        Ok(events) => events,
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                log::warn!("Failed to close the radio: {close_err}");
            }
            return Err(e);
        }
    };

    let deadline = Instant::now() + duration;
    let mut seen: HashMap<RadioAddress, Discovered> = HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => {
                let Some(event) = event else {
                    log::warn!("Advertisement stream closed during discovery");
                    break;
                };
                if min_rssi.is_some_and(|min| event.rssi < min) {
                    continue;
                }
                seen.entry(event.address).or_insert_with(|| {
                    let voltage_mv = decode(&event.payload).millivolts();
                    log::debug!("Found {} (RSSI {})", event.address, event.rssi);
                    Discovered {
                        address: event.address,
                        rssi: event.rssi,
                        voltage_mv,
                    }
                });
            }
        }
    }
    drop(events);

    if let Err(e) = connection.stop_scan().await {
        log::warn!("Failed to stop scanning: {e}");
    }
    if let Err(e) = connection.close().await {
        log::warn!("Failed to close the radio: {e}");
    }

    let mut devices: Vec<Discovered> = seen.into_values().collect();
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then(a.address.cmp(&b.address)));
    log::info!("Discovery found {} devices", devices.len());
    Ok(devices)
}
