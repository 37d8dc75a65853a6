//! Types describing immutable on-disk data parts.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Errors parsing a canonical part name back into a [`PartInfo`].
#[derive(Debug, Error)]
pub enum PartInfoError {
    /// The name does not have the `partition_min_max_level[_mutation]` shape.
    #[error("unexpected part name format: {name}")]
    InvalidFormat {
        /// The offending name.
        name: String,
    },

    /// A numeric component failed to parse.
    #[error("invalid number in part name {name}")]
    InvalidNumber {
        /// The offending name.
        name: String,
        /// The underlying parse failure.
        #[source]
        source: std::num::ParseIntError,
    },
}

/// The identity of an on-disk part.
///
/// The canonical name is `{partition}_{min}_{max}_{level}`, with
/// `_{mutation}` appended only for mutated parts. Partition identifiers never
/// contain underscores, which keeps the name parseable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    /// Identifier of the partition this part belongs to.
    pub partition_id: String,
    /// Smallest block number covered by this part.
    pub min_block: i64,
    /// Largest block number covered by this part.
    pub max_block: i64,
    /// Merge depth: freshly inserted parts are level 0.
    pub level: u32,
    /// Mutation version, 0 for unmutated parts.
    pub mutation: i64,
}

impl PartInfo {
    /// Info for a freshly inserted (level 0, unmutated) part holding a single
    /// block number.
    pub fn new_zero_level(partition_id: impl Into<String>, block_number: i64) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block: block_number,
            max_block: block_number,
            level: 0,
            mutation: 0,
        }
    }

    /// The canonical part name.
    pub fn name(&self) -> String {
        match self.mutation {
            0 => format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            ),
            m => format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, m
            ),
        }
    }

    /// Parse a canonical part name.
    pub fn parse(name: &str) -> Result<Self, PartInfoError> {
        let tokens: Vec<_> = name.split('_').collect();
        if tokens.len() != 4 && tokens.len() != 5 {
            return Err(PartInfoError::InvalidFormat { name: name.into() });
        }

        let number = |s: &str| {
            s.parse().map_err(|source| PartInfoError::InvalidNumber {
                name: name.into(),
                source,
            })
        };

        Ok(Self {
            partition_id: tokens[0].into(),
            min_block: number(tokens[1])?,
            max_block: number(tokens[2])?,
            level: number(tokens[3])? as u32,
            mutation: if tokens.len() == 5 {
                number(tokens[4])?
            } else {
                0
            },
        })
    }

    /// Whether this part covers every block of `other`.
    pub fn contains(&self, other: &Self) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && self.mutation >= other.mutation
    }
}

impl Display for PartInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// On-disk layout family of a part, carried in log entries so peers know how
/// to materialize a fetched part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartFormat {
    /// One file per column stream.
    Wide,
    /// All columns in a single file.
    Compact,
}

impl Display for PartFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wide => write!(f, "Wide"),
            Self::Compact => write!(f, "Compact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let info = PartInfo::new_zero_level("20240101", 42);
        assert_eq!(info.name(), "20240101_42_42_0");
        assert_eq!(PartInfo::parse("20240101_42_42_0").unwrap(), info);

        let mutated = PartInfo {
            mutation: 7,
            ..info.clone()
        };
        assert_eq!(mutated.name(), "20240101_42_42_0_7");
        assert_eq!(PartInfo::parse("20240101_42_42_0_7").unwrap(), mutated);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            PartInfo::parse("all"),
            Err(PartInfoError::InvalidFormat { .. })
        ));
        assert!(matches!(
            PartInfo::parse("all_1_2"),
            Err(PartInfoError::InvalidFormat { .. })
        ));
        assert!(matches!(
            PartInfo::parse("all_a_2_0"),
            Err(PartInfoError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_contains() {
        let merged = PartInfo {
            partition_id: "all".into(),
            min_block: 0,
            max_block: 10,
            level: 1,
            mutation: 0,
        };
        let single = PartInfo::new_zero_level("all", 3);
        let other_partition = PartInfo::new_zero_level("p2", 3);

        assert!(merged.contains(&single));
        assert!(merged.contains(&merged));
        assert!(!single.contains(&merged));
        assert!(!merged.contains(&other_partition));
    }
}
