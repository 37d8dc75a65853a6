//! Quorum tracker entries.

use crate::log_entry::EntryDecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The payload of a quorum tracker node.
///
/// The node exists while a quorum write is in flight: the inserting replica
/// creates it listing itself, every replica that fetches the part adds its
/// name, and whichever replica completes the quorum deletes the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumEntry {
    /// The part the quorum is tracked for.
    pub part_name: String,
    /// How many acknowledgements are required.
    pub required_number_of_replicas: usize,
    /// Replicas that hold the part so far.
    pub replicas: BTreeSet<String>,
}

impl QuorumEntry {
    /// Tracker for a freshly committed part, acknowledged only by its source.
    pub fn new(
        part_name: impl Into<String>,
        required_number_of_replicas: usize,
        source_replica: impl Into<String>,
    ) -> Self {
        Self {
            part_name: part_name.into(),
            required_number_of_replicas,
            replicas: BTreeSet::from([source_replica.into()]),
        }
    }

    /// Whether enough replicas have acknowledged.
    pub fn is_satisfied(&self) -> bool {
        self.replicas.len() >= self.required_number_of_replicas
    }

    /// Encode for storage in a coordinator node.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("quorum entry is always serializable")
    }

    /// Decode a coordinator node payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntryDecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfaction() {
        let mut entry = QuorumEntry::new("all_0_0_0", 2, "r1");
        assert!(!entry.is_satisfied());

        entry.replicas.insert("r2".into());
        assert!(entry.is_satisfied());

        let decoded = QuorumEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }
}
