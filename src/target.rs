//! Batch targets: what the operator asked to test.
//!
//! A batch entry is either a radio address typed or scanned directly, or an
//! external identifier (a product QR code) that must be resolved to an
//! address before scanning.

use crate::address::RadioAddress;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A device the batch intends to measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub address: RadioAddress,
    pub identifier: Option<String>,
}

impl TargetSpec {
    pub fn new(address: RadioAddress, identifier: Option<String>) -> Self {
        Self {
            address,
            identifier,
        }
    }

    /// The identifier if known, otherwise the address.
    pub fn label(&self) -> String {
        self.identifier
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

/// A raw batch entry after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Address(RadioAddress),
    Identifier(String),
}

/// Decide whether an entry is an address or an identifier.
///
/// Anything with address separators, or exactly 12 characters, is tried as
/// an address first; if that fails to parse it is kept as an identifier.
///
/// # Example
/// ```
/// use ble_battery_batch::target::{classify_entry, Entry};
///
/// assert!(matches!(classify_entry("aa:bb:cc:dd:ee:ff"), Entry::Address(_)));
/// assert_eq!(classify_entry("QR-0042"), Entry::Identifier("QR-0042".into()));
/// ```
pub fn classify_entry(entry: &str) -> Entry {
    let entry = entry.trim();
    let looks_like_address = entry.contains(':') || entry.len() == 12 || entry.len() == 17;

    if looks_like_address && let Ok(address) = entry.parse::<RadioAddress>() {
        return Entry::Address(address);
    }
    Entry::Identifier(entry.to_string())
}

/// Collapse duplicate addresses, keeping first-seen order.
///
/// A later entry for the same address replaces the identifier only when it
/// carries one; a bare address entry never erases a known identifier.
pub fn dedup(specs: impl IntoIterator<Item = TargetSpec>) -> Vec<TargetSpec> {
    let mut out: Vec<TargetSpec> = Vec::new();
    let mut index: HashMap<RadioAddress, usize> = HashMap::new();

    for spec in specs {
        match index.get(&spec.address) {
            Some(&i) => {
                if spec.identifier.is_some() {
                    out[i].identifier = spec.identifier;
                }
            }
            None => {
                index.insert(spec.address, out.len());
                out.push(spec);
            }
        }
    }

    out
}

/// Errors returned when loading a batch file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read batch file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parse batch entries from text: one per line, CSV lines use the first column.
///
/// Entries are trimmed and upper-cased, blanks and duplicates are dropped, and
/// at most `max` entries are returned.
pub fn parse_entries(text: &str, max: usize) -> Vec<String> {
    let mut entries = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for line in text.lines() {
        let token = line.split(',').next().unwrap_or_default().trim();
        if token.is_empty() {
            continue;
        }
        let token = token.to_uppercase();
        if seen.contains(&token) {
            continue;
        }
        if entries.len() >= max {
            log::warn!("Batch capped at {max} entries");
            break;
        }
        seen.insert(token.clone());
        entries.push(token);
    }

    entries
}

/// Load batch entries from a file, see [`parse_entries`].
pub fn load_entries(path: &Path, max: usize) -> Result<Vec<String>, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_entries(&text, max))
}
