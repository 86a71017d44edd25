//! Raw HCI socket backend.
//!
//! Talks to the controller through raw Linux HCI sockets without the BlueZ
//! daemon. Requires CAP_NET_RAW and CAP_NET_ADMIN or root privileges.

use super::{
    AdvertisementEvent, Connection, EVENT_CHANNEL_BUFFER_SIZE, MANUFACTURER_DATA_TYPE, ScanError,
    ScanParams,
};
use crate::address::RadioAddress;
use futures::future::BoxFuture;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

const HCI_EVENT_PKT: u8 = 0x04;
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Scan interval/window unit.
const SLOT_MICROS: u128 = 625;
/// Valid range for interval and window, in slots.
const MIN_SLOTS: u16 = 0x0004;
const MAX_SLOTS: u16 = 0x4000;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Interpret `hciN` or a bare `N` as a controller index.
fn parse_port(port: &str) -> Result<u16, ScanError> {
    let port = port.trim();
    let digits = port.strip_prefix("hci").unwrap_or(port);
    digits
        .parse()
        .map_err(|_| ScanError::InvalidPort(port.to_string()))
}

/// Convert a duration to 0.625 ms controller slots.
fn to_slots(duration: Duration) -> u16 {
    let slots = duration.as_micros() / SLOT_MICROS;
    slots.clamp(u128::from(MIN_SLOTS), u128::from(MAX_SLOTS)) as u16
}

fn scan_parameters(params: &ScanParams) -> [u8; 7] {
    let interval = to_slots(params.interval).to_le_bytes();
    // Window may not exceed the interval.
    let window = to_slots(params.window.min(params.interval)).to_le_bytes();
    [
        LE_SCAN_PASSIVE,
        interval[0],
        interval[1],
        window[0],
        window[1],
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // command packet
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error(&format!("Failed to bind HCI socket to hci{dev_id}")));
    }

    Ok(())
}

fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }

    Ok(())
}

fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    // Duplicates are not filtered: every advertisement is delivered.
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[enable as u8, 0x00]);
    send_hci_command(fd, &packet)
}

/// Extract the manufacturer-specific AD structure, company ID included.
fn manufacturer_data(ad_data: &[u8]) -> Vec<u8> {
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }
        if ad_data[offset + 1] == MANUFACTURER_DATA_TYPE {
            return ad_data[offset + 2..offset + 1 + len].to_vec();
        }
        offset += 1 + len;
    }
    Vec::new()
}

/// Parse the first report of an LE advertising report event.
fn parse_advertising_report(data: &[u8], sequence: u64) -> Option<AdvertisementEvent> {
    // packet type, event code, param len, subevent
    let report = data.get(4..)?;

    let num_reports = *report.first()?;
    if num_reports == 0 || report.len() < 10 {
        return None;
    }

    // num_reports(1) + event_type(1) + addr_type(1), then a little-endian address
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);
    addr.reverse();

    let data_len = report[9] as usize;
    let ad_data = report.get(10..10 + data_len)?;
    let rssi = *report.get(10 + data_len)? as i8;

    Some(AdvertisementEvent {
        address: RadioAddress(addr),
        rssi: i16::from(rssi),
        payload: manufacturer_data(ad_data),
        sequence,
    })
}

/// What the reader does after one `read` on the event socket.
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Packet(usize),
    /// Interrupted by a signal, read again.
    Retry,
    /// Nothing buffered, wait for readiness.
    Wait,
    /// End of stream or a hard error such as the adapter going away.
    Closed(String),
}

fn classify_read(result: io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Closed("end of stream".to_string()),
        Ok(n) => ReadOutcome::Packet(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Wait,
        Err(e) => ReadOutcome::Closed(e.to_string()),
    }
}

/// Connection over a pair of raw HCI sockets: one for commands, one for events.
pub struct HciConnection {
    dev_id: u16,
    cmd_fd: OwnedFd,
    reader: Option<JoinHandle<()>>,
}

impl HciConnection {
    pub async fn open(port: &str) -> Result<Self, ScanError> {
        let dev_id = parse_port(port)?;
        let cmd_fd = open_hci_socket()?;
        bind_hci_socket(&cmd_fd, dev_id)?;
        log::debug!("HCI command socket bound to hci{dev_id}");

        Ok(Self {
            dev_id,
            cmd_fd,
            reader: None,
        })
    }

    fn spawn_reader(
        &self,
        tx: mpsc::Sender<AdvertisementEvent>,
    ) -> Result<JoinHandle<()>, ScanError> {
        let fd = open_hci_socket()?;
        bind_hci_socket(&fd, self.dev_id)?;
        set_hci_filter(&fd)?;

        let async_fd = AsyncFd::new(fd)
            .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

        Ok(tokio::spawn(async move {
            let mut buf = [0u8; 258]; // max HCI event size
            let mut sequence = 0u64;

            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        log::error!("HCI socket failed: {e}");
                        return;
                    }
                };

                // Drain all available packets before waiting again
                loop {
                    let result = match guard.try_io(|inner| {
                        let ret = unsafe {
                            libc::read(
                                inner.as_raw_fd(),
                                buf.as_mut_ptr() as *mut c_void,
                                buf.len(),
                            )
                        };
                        if ret < 0 {
                            Err(io::Error::last_os_error())
                        } else {
                            Ok(ret as usize)
                        }
                    }) {
                        Ok(result) => result,
                        Err(_would_block) => break,
                    };

                    let n = match classify_read(result) {
                        ReadOutcome::Packet(n) => n,
                        ReadOutcome::Retry => continue,
                        ReadOutcome::Wait => break,
                        ReadOutcome::Closed(reason) => {
                            // Dropping `tx` closes the stream and aborts the session.
                            log::error!("HCI socket closed: {reason}");
                            return;
                        }
                    };

                    if n >= 4
                        && buf[0] == HCI_EVENT_PKT
                        && buf[1] == EVT_LE_META_EVENT
                        && buf[3] == EVT_LE_ADVERTISING_REPORT
                        && let Some(event) = parse_advertising_report(&buf[..n], sequence)
                    {
                        sequence += 1;
                        if tx.send(event).await.is_err() {
                            // Receiver dropped: the session is over.
                            return;
                        }
                    }
                }
            }
        }))
    }
}

impl Connection for HciConnection {
    fn start_scan(
        &mut self,
        params: ScanParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementEvent>, ScanError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            self.reader = Some(self.spawn_reader(tx)?);

            let packet = hci_command_packet(
                OGF_LE_CTL,
                OCF_LE_SET_SCAN_PARAMETERS,
                &scan_parameters(&params),
            );
            send_hci_command(&self.cmd_fd, &packet)?;
            set_scan_enable(&self.cmd_fd, true)?;

            log::debug!(
                "Passive scan started on hci{} (interval {:?}, window {:?})",
                self.dev_id,
                params.interval,
                params.window
            );
            Ok(rx)
        })
    }

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            set_scan_enable(&self.cmd_fd, false)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(reader) = &self.reader {
                reader.abort();
            }
            log::debug!("Closing hci{}", self.dev_id);
            drop(self);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_outcomes() {
        assert_eq!(classify_read(Ok(42)), ReadOutcome::Packet(42));
        assert_eq!(
            classify_read(Err(io::ErrorKind::Interrupted.into())),
            ReadOutcome::Retry
        );
        assert_eq!(
            classify_read(Err(io::ErrorKind::WouldBlock.into())),
            ReadOutcome::Wait
        );
        assert!(matches!(classify_read(Ok(0)), ReadOutcome::Closed(_)));
        // ENODEV: adapter unplugged
        assert!(matches!(
            classify_read(Err(io::Error::from_raw_os_error(libc::ENODEV))),
            ReadOutcome::Closed(_)
        ));
    }

    #[test]
    fn test_hci_filter_setup() {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_scan_enable_packet() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x00, 0x00]);
        assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("hci0").unwrap(), 0);
        assert_eq!(parse_port("hci2").unwrap(), 2);
        assert_eq!(parse_port("1").unwrap(), 1);
        assert!(matches!(parse_port("usb0"), Err(ScanError::InvalidPort(_))));
    }

    #[test]
    fn test_scan_parameters_in_slots() {
        let bytes = scan_parameters(&ScanParams::default());
        // 100 ms = 160 slots, 50 ms = 80 slots
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 160);
        assert_eq!(u16::from_le_bytes([bytes[3], bytes[4]]), 80);
        assert_eq!(bytes[0], LE_SCAN_PASSIVE);

        assert_eq!(to_slots(Duration::ZERO), MIN_SLOTS);
        assert_eq!(to_slots(Duration::from_secs(60)), MAX_SLOTS);
    }

    #[test]
    fn test_parse_advertising_report() {
        let ad = [0x05, 0xFF, 0x59, 0x00, 0x01, 0x1F];
        let mut packet = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, 0x00, EVT_LE_ADVERTISING_REPORT];
        packet.extend_from_slice(&[0x01, 0x00, 0x00]);
        packet.extend_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        packet.push(ad.len() as u8);
        packet.extend_from_slice(&ad);
        packet.push((-58i8) as u8);

        let event = parse_advertising_report(&packet, 7).unwrap();
        assert_eq!(
            event.address,
            RadioAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
        );
        assert_eq!(event.rssi, -58);
        assert_eq!(event.payload, vec![0x59, 0x00, 0x01, 0x1F]);
        assert_eq!(event.sequence, 7);
    }

    #[test]
    fn test_parse_truncated_report() {
        let packet = [HCI_EVENT_PKT, EVT_LE_META_EVENT, 0x00, EVT_LE_ADVERTISING_REPORT, 0x01];
        assert!(parse_advertising_report(&packet, 0).is_none());
    }

    #[test]
    fn test_report_without_manufacturer_data_has_empty_payload() {
        assert!(manufacturer_data(&[0x02, 0x01, 0x06]).is_empty());
    }
}
