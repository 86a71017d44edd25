//! Target registry for one scan session.
//!
//! Holds the address → identifier map and the set of addresses still waiting
//! for a reading. The session's event path is the only writer; progress
//! reporting may read it from anywhere through a shared `Arc`.

use crate::address::RadioAddress;
use crate::target::TargetSpec;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

#[derive(Debug)]
pub struct TargetRegistry {
    targets: Vec<TargetSpec>,
    index: HashMap<RadioAddress, usize>,
    pending: RwLock<HashSet<RadioAddress>>,
}

impl TargetRegistry {
    /// Build a registry with every target pending. Duplicate addresses collapse.
    pub fn new(targets: Vec<TargetSpec>) -> Self {
        let targets = crate::target::dedup(targets);
        let index = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.address, i))
            .collect();
        let pending = targets.iter().map(|t| t.address).collect();

        Self {
            targets,
            index,
            pending: RwLock::new(pending),
        }
    }

    /// Remove an address from the pending set.
    ///
    /// Returns whether it was pending; resolving twice is a no-op.
    pub fn mark_resolved(&self, address: &RadioAddress) -> bool {
        self.pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
    }

    pub fn is_pending(&self, address: &RadioAddress) -> bool {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
    }

    pub fn snapshot_pending(&self) -> HashSet<RadioAddress> {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn total(&self) -> usize {
        self.targets.len()
    }

    pub fn processed(&self) -> usize {
        self.total() - self.pending_len()
    }

    pub fn targets(&self) -> &[TargetSpec] {
        &self.targets
    }

    pub fn target(&self, address: &RadioAddress) -> Option<&TargetSpec> {
        self.index.get(address).map(|&i| &self.targets[i])
    }

    pub fn identifier(&self, address: &RadioAddress) -> Option<&str> {
        self.target(address).and_then(|t| t.identifier.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(last: u8) -> RadioAddress {
        RadioAddress([0x10, 0x20, 0x30, 0x40, 0x50, last])
    }

    fn registry(n: u8) -> TargetRegistry {
        TargetRegistry::new(
            (0..n)
                .map(|i| TargetSpec::new(addr(i), Some(format!("QR-{i}"))))
                .collect(),
        )
    }

    #[test]
    fn test_all_targets_start_pending() {
        let registry = registry(3);
        assert_eq!(registry.total(), 3);
        assert_eq!(registry.pending_len(), 3);
        assert_eq!(registry.processed(), 0);
        assert!(registry.is_pending(&addr(2)));
        assert!(!registry.is_pending(&addr(9)));
    }

    #[test]
    fn test_mark_resolved_is_idempotent() {
        let registry = registry(2);
        assert!(registry.mark_resolved(&addr(0)));
        assert!(!registry.mark_resolved(&addr(0)));
        assert!(!registry.mark_resolved(&addr(7)));
        assert!(!registry.is_pending(&addr(0)));
        assert_eq!(registry.processed(), 1);
    }

    #[test]
    fn test_resolved_and_pending_cover_all_targets() {
        let registry = registry(5);
        registry.mark_resolved(&addr(1));
        registry.mark_resolved(&addr(3));

        let pending = registry.snapshot_pending();
        let resolved: HashSet<_> = registry
            .targets()
            .iter()
            .map(|t| t.address)
            .filter(|a| !pending.contains(a))
            .collect();

        assert_eq!(resolved, HashSet::from([addr(1), addr(3)]));
        assert_eq!(pending.len() + resolved.len(), registry.total());
    }

    #[test]
    fn test_duplicates_collapse() {
        let registry = TargetRegistry::new(vec![
            TargetSpec::new(addr(1), Some("old".into())),
            TargetSpec::new(addr(1), Some("new".into())),
        ]);
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.identifier(&addr(1)), Some("new"));
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let registry = Arc::new(registry(200));

        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut last = registry.pending_len();
                for _ in 0..1000 {
                    let now = registry.pending_len();
                    assert!(now <= last, "pending set grew");
                    last = now;
                }
            })
        };

        for i in 0..200 {
            registry.mark_resolved(&addr(i));
        }
        reader.join().unwrap();
        assert_eq!(registry.pending_len(), 0);
    }
}
