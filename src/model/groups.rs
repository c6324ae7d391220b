//! Mutually-exclusive mod groups (§3 "Group").

use serde::{Deserialize, Serialize};

/// A set of at least two mod-ids considered alternative versions, with
/// exactly one active member at a time. When a group has active member
/// `A`, every non-active member is absent from every non-autonomous
/// deployer's loadorder; `A` occupies their former positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub active_member: u64,
    pub members: Vec<u64>,
}

impl Group {
    pub fn new(a: u64, b: u64) -> Self {
        Self {
            active_member: a,
            members: vec![a, b],
        }
    }

    pub fn contains(&self, mod_id: u64) -> bool {
        self.members.contains(&mod_id)
    }

    pub fn non_active_members(&self) -> impl Iterator<Item = &u64> {
        self.members.iter().filter(move |&&m| m != self.active_member)
    }
}
