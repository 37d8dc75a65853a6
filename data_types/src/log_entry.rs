//! Replication log entries.
//!
//! A log entry is the unit peers replay to learn about a newly committed
//! part. It is stored as a text record under a sequential `log/log-` node in
//! the coordinator; the field set is the contract between replicas, the byte
//! layout is convention.

use crate::PartFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure decoding a coordinator node payload.
#[derive(Debug, Error)]
#[error("unable to decode entry")]
pub struct EntryDecodeError(#[from] serde_json::Error);

/// What a replica should do with the named part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryType {
    /// Fetch the part from the source replica.
    GetPart,
    /// Attach an already materialized part; verified against the recorded
    /// checksum.
    AttachPart,
}

/// One replication log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry discriminator.
    pub entry_type: LogEntryType,
    /// Seconds since the unix epoch at entry creation.
    pub create_time: u64,
    /// The replica that created the part.
    pub source_replica: String,
    /// Canonical name of the committed part.
    pub new_part_name: String,
    /// Number of replicas that must acknowledge the part, 0 when quorum is
    /// disabled.
    pub quorum: u64,
    /// On-disk format of the part.
    pub new_part_format: PartFormat,
    /// Deduplication id of the part. Synchronous inserts only; asynchronous
    /// inserts reserve their ids as individual coordinator nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Content checksum, present for [`LogEntryType::AttachPart`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_checksum: Option<String>,
}

impl LogEntry {
    /// Encode for storage in a coordinator node.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("log entry is always serializable")
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
    fn test_round_trip() {
        let entry = LogEntry {
            entry_type: LogEntryType::GetPart,
            create_time: 1700000000,
            source_replica: "r1".into(),
            new_part_name: "all_0_0_0".into(),
            quorum: 2,
            new_part_format: PartFormat::Compact,
            block_id: Some("all_123_456".into()),
            part_checksum: None,
        };

        let decoded = LogEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let entry = LogEntry {
            entry_type: LogEntryType::AttachPart,
            create_time: 0,
            source_replica: "r1".into(),
            new_part_name: "all_0_0_0".into(),
            quorum: 0,
            new_part_format: PartFormat::Wide,
            block_id: None,
            part_checksum: Some("deadbeef".into()),
        };

        let text = String::from_utf8(entry.to_bytes()).unwrap();
        assert!(!text.contains("block_id"));
        assert!(text.contains("part_checksum"));
    }
}
