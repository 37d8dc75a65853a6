//! The coordinator path layout of one replicated table.

/// Builds the coordinator paths under a table's root.
///
/// The logical layout:
///
/// | path | contents |
/// |---|---|
/// | `replicas/{r}/is_active` | ephemeral liveness marker |
/// | `replicas/{r}/host` | endpoint, version-checked during commit |
/// | `replicas/{r}/parts/{name}` | replica `r` owns this part |
/// | `blocks/{block_id}` | dedup record mapping to a part name |
/// | `async_blocks/{block_id}` | same, async lane |
/// | `log/log-NNNN` | sequential replication log |
/// | `block_numbers/{partition}/block-NNNN` | block-number lock |
/// | `quorum/status` | serial quorum tracker |
/// | `quorum/parallel/{part}` | per-part quorum tracker |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    /// Paths rooted at `root` (e.g. `/tables/db/events`).
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    /// The table root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `replicas`
    pub fn replicas(&self) -> String {
        format!("{}/replicas", self.root)
    }

    /// `replicas/{replica}`
    pub fn replica(&self, replica: &str) -> String {
        format!("{}/replicas/{replica}", self.root)
    }

    /// `replicas/{replica}/is_active`
    pub fn is_active(&self, replica: &str) -> String {
        format!("{}/is_active", self.replica(replica))
    }

    /// `replicas/{replica}/host`
    pub fn host(&self, replica: &str) -> String {
        format!("{}/host", self.replica(replica))
    }

    /// `replicas/{replica}/parts`
    pub fn replica_parts(&self, replica: &str) -> String {
        format!("{}/parts", self.replica(replica))
    }

    /// `replicas/{replica}/parts/{part}`
    pub fn replica_part(&self, replica: &str, part: &str) -> String {
        format!("{}/parts/{part}", self.replica(replica))
    }

    /// `blocks`
    pub fn blocks(&self) -> String {
        format!("{}/blocks", self.root)
    }

    /// `blocks/{block_id}`
    pub fn block(&self, block_id: &str) -> String {
        format!("{}/blocks/{block_id}", self.root)
    }

    /// `async_blocks`
    pub fn async_blocks(&self) -> String {
        format!("{}/async_blocks", self.root)
    }

    /// `async_blocks/{block_id}`
    pub fn async_block(&self, block_id: &str) -> String {
        format!("{}/async_blocks/{block_id}", self.root)
    }

    /// `log`
    pub fn log(&self) -> String {
        format!("{}/log", self.root)
    }

    /// `log/log-`, the sequential creation prefix of log entries
    pub fn log_entry_prefix(&self) -> String {
        format!("{}/log/log-", self.root)
    }

    /// `block_numbers`
    pub fn block_numbers(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    /// `block_numbers/{partition}`
    pub fn partition_block_numbers(&self, partition_id: &str) -> String {
        format!("{}/block_numbers/{partition_id}", self.root)
    }

    /// `block_numbers/{partition}/block-`, the sequential creation prefix of
    /// block-number locks
    pub fn block_number_prefix(&self, partition_id: &str) -> String {
        format!("{}/block-", self.partition_block_numbers(partition_id))
    }

    /// `quorum`
    pub fn quorum(&self) -> String {
        format!("{}/quorum", self.root)
    }

    /// `quorum/status`, the serial quorum tracker
    pub fn quorum_status(&self) -> String {
        format!("{}/quorum/status", self.root)
    }

    /// `quorum/parallel`
    pub fn quorum_parallel(&self) -> String {
        format!("{}/quorum/parallel", self.root)
    }

    /// `quorum/parallel/{part}`, the per-part quorum tracker
    pub fn quorum_parallel_part(&self, part: &str) -> String {
        format!("{}/quorum/parallel/{part}", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = TablePaths::new("/tables/db/events/");
        assert_eq!(paths.root(), "/tables/db/events");
        assert_eq!(paths.is_active("r1"), "/tables/db/events/replicas/r1/is_active");
        assert_eq!(paths.replica_part("r1", "all_0_0_0"), "/tables/db/events/replicas/r1/parts/all_0_0_0");
        assert_eq!(paths.block("all_1_2"), "/tables/db/events/blocks/all_1_2");
        assert_eq!(paths.log_entry_prefix(), "/tables/db/events/log/log-");
        assert_eq!(paths.block_number_prefix("all"), "/tables/db/events/block_numbers/all/block-");
        assert_eq!(paths.quorum_status(), "/tables/db/events/quorum/status");
        assert_eq!(paths.quorum_parallel_part("all_0_0_0"), "/tables/db/events/quorum/parallel/all_0_0_0");
    }
}
