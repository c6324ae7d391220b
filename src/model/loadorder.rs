//! Loadorder entries and conflict groups (§3).

use serde::{Deserialize, Serialize};

/// One `(mod-id, enabled)` pair in an ordered per-`(deployer, profile)`
/// sequence. Position in the sequence is the deploy priority: later
/// entries override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadorderEntry {
    pub id: u64,
    pub enabled: bool,
}

impl LoadorderEntry {
    pub fn new(id: u64, enabled: bool) -> Self {
        Self { id, enabled }
    }
}

/// A partition of the current loadorder into equivalence classes, where
/// two mods are in the same class iff some file path is present in both
/// mods' payloads. The final group collects mods with no conflicts.
pub type ConflictGroup = Vec<u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadorder_entry_is_copy() {
        let a = LoadorderEntry::new(3, true);
        let b = a;
        assert_eq!(a, b);
    }
}
