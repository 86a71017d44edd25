//! Battery voltage decoding from manufacturer-specific advertisement data.
//!
//! The device population mixes two firmware generations that encode the
//! battery voltage differently. Neither carries an explicit device-type flag,
//! so formats are told apart by shape: each [`PayloadFormat`] checks its own
//! guard and the first one that matches decodes the payload.

/// Result of running a payload through the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// No format recognised the payload.
    NoReading,
    /// Battery voltage in millivolts.
    Reading(i32),
}

impl Decoded {
    pub fn millivolts(self) -> Option<i32> {
        match self {
            Decoded::Reading(mv) => Some(mv),
            Decoded::NoReading => None,
        }
    }
}

/// A single advertisement encoding.
pub trait PayloadFormat: Send + Sync {
    /// Short name used in debug logging.
    fn name(&self) -> &'static str;

    /// Decode the voltage, or `None` if the payload does not have this shape.
    fn decode(&self, payload: &[u8]) -> Option<i32>;
}

/// Complex format: 26 bytes, `[.., fraction, 0xFF, 0xB3, volts]`.
///
/// Volts are split into an integer byte (last) and a hundredths byte
/// (fourth from last), with two discriminator bytes in between.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComplexFormat;

impl ComplexFormat {
    pub const LENGTH: usize = 26;
    pub const MARKER_HIGH: u8 = 255;
    pub const MARKER_LOW: u8 = 179;
}

impl PayloadFormat for ComplexFormat {
    fn name(&self) -> &'static str {
        "complex"
    }

    fn decode(&self, payload: &[u8]) -> Option<i32> {
        let len = payload.len();
        if len != Self::LENGTH
            || payload[len - 2] != Self::MARKER_LOW
            || payload[len - 3] != Self::MARKER_HIGH
        {
            return None;
        }

        let volts = i32::from(payload[len - 1]);
        let hundredths = i32::from(payload[len - 4]);
        Some(volts * 1000 + hundredths * 10)
    }
}

/// Simple format: at least two bytes, last byte is tenths of a volt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFormat;

impl SimpleFormat {
    pub const MIN_LENGTH: usize = 2;
}

impl PayloadFormat for SimpleFormat {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn decode(&self, payload: &[u8]) -> Option<i32> {
        if payload.len() < Self::MIN_LENGTH {
            return None;
        }
        payload.last().map(|tenths| i32::from(*tenths) * 100)
    }
}

/// Formats in the order they are attempted.
pub static FORMATS: [&dyn PayloadFormat; 2] = [&ComplexFormat, &SimpleFormat];

/// Decode a payload against the built-in formats.
///
/// # Example
/// ```
/// use ble_battery_batch::decoder::{decode, Decoded};
///
/// assert_eq!(decode(&[0x01, 31]), Decoded::Reading(3100));
/// assert_eq!(decode(&[0x01]), Decoded::NoReading);
/// ```
pub fn decode(payload: &[u8]) -> Decoded {
    decode_with(&FORMATS, payload)
}

/// Decode a payload against an explicit, ordered list of formats.
pub fn decode_with(formats: &[&dyn PayloadFormat], payload: &[u8]) -> Decoded {
    for format in formats {
        if let Some(mv) = format.decode(payload) {
            log::trace!("payload decoded as {} format: {mv} mV", format.name());
            return Decoded::Reading(mv);
        }
    }
    Decoded::NoReading
}
