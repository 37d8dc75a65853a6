//! Quorum configuration, the insert precondition, and the post-commit
//! quorum wait.

use crate::{
    CoordinatorSnafu, EntryDecodeSnafu, NoActiveReplicasSnafu, ReadonlySnafu, Result,
    TablePaths, TimeoutExceededSnafu, TooFewLiveReplicasSnafu, UnknownStatusOfInsertSnafu,
    UnsatisfiedPreviousQuorumSnafu,
};
use coordinator::{Client, Event};
use data_types::QuorumEntry;
use observability_deps::tracing::{debug, info, trace};
use snafu::ResultExt;
use std::time::Duration;

/// How many replicas must acknowledge a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    /// No quorum tracking.
    Disabled,
    /// A fixed replica count (at least 2; 0 and 1 normalize to disabled).
    Count(usize),
    /// `floor(replicas/2) + 1`, computed at check time.
    Majority,
}

/// Quorum behavior of a sink.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Required acknowledgement count.
    pub quorum: Quorum,
    /// Parallel quorum inserts use per-part tracker nodes instead of the
    /// serializing `quorum/status` node.
    pub parallel: bool,
    /// How long the post-commit wait may block.
    pub timeout: Duration,
}

impl QuorumConfig {
    /// No quorum tracking.
    pub fn disabled() -> Self {
        Self {
            quorum: Quorum::Disabled,
            parallel: false,
            timeout: Duration::from_secs(600),
        }
    }

    /// A fixed quorum size. The value 1 means the write is durable once the
    /// local replica holds it, which is exactly the untracked behavior, so 0
    /// and 1 normalize to disabled.
    pub fn count(n: usize) -> Self {
        Self {
            quorum: if n <= 1 { Quorum::Disabled } else { Quorum::Count(n) },
            ..Self::disabled()
        }
    }

    /// Majority quorum, sized at check time.
    pub fn majority() -> Self {
        Self {
            quorum: Quorum::Majority,
            ..Self::disabled()
        }
    }

    /// Whether any quorum checking is configured at all.
    pub fn is_configured(&self) -> bool {
        !matches!(self.quorum, Quorum::Disabled)
    }

    /// The required acknowledgement count against a cluster of
    /// `replicas_num` replicas, or `None` when tracking is (effectively)
    /// disabled. A majority of a 1-replica cluster is 1, hence disabled.
    pub fn effective_size(&self, replicas_num: usize) -> Option<usize> {
        match self.quorum {
            Quorum::Disabled => None,
            Quorum::Count(n) => Some(n),
            Quorum::Majority => {
                let majority = replicas_num / 2 + 1;
                (majority > 1).then_some(majority)
            }
        }
    }
}

/// The outcome of [`check_quorum_precondition`], carried into the commit
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumPrecondition {
    /// No quorum tracking for this insert.
    Disabled,
    /// Quorum is on; the captured versions are re-checked by the commit
    /// transaction.
    Enabled {
        /// Number of replicas of the table at check time.
        replicas_num: usize,
        /// Required acknowledgement count.
        quorum_size: usize,
        /// Version of this replica's `is_active` node.
        is_active_version: i32,
        /// Version of this replica's `host` node.
        host_version: i32,
    },
}

impl QuorumPrecondition {
    /// Replica count observed by the check; 0 when quorum is disabled.
    pub fn replicas_num(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Enabled { replicas_num, .. } => *replicas_num,
        }
    }

    /// Required acknowledgement count; 0 when quorum is disabled.
    pub fn quorum_size(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Enabled { quorum_size, .. } => *quorum_size,
        }
    }
}

/// Check that enough replicas are alive for a quorum write, that no serial
/// quorum write is already in flight, and capture this replica's liveness
/// versions for the commit transaction.
pub fn check_quorum_precondition(
    client: &dyn Client,
    paths: &TablePaths,
    replica_name: &str,
    config: &QuorumConfig,
) -> Result<QuorumPrecondition> {
    if !config.is_configured() {
        return Ok(QuorumPrecondition::Disabled);
    }

    let replicas = client.get_children(&paths.replicas()).context(CoordinatorSnafu)?;
    let other_active: Vec<_> = replicas
        .iter()
        .filter(|r| r.as_str() != replica_name)
        .map(|r| paths.is_active(r))
        .collect();

    let exists = client.exists_many(&other_active).context(CoordinatorSnafu)?;
    let own_is_active = client
        .try_get(&paths.is_active(replica_name))
        .context(CoordinatorSnafu)?;
    let own_host = client
        .try_get(&paths.host(replica_name))
        .context(CoordinatorSnafu)?;

    // assume the current replica is active; its own nodes are checked below
    let alive = 1 + exists.iter().filter(|stat| stat.is_some()).count();
    let replicas_num = replicas.len();

    let Some(quorum_size) = config.effective_size(replicas_num) else {
        debug!(replicas_num, "quorum effectively disabled for this cluster size");
        return Ok(QuorumPrecondition::Disabled);
    };

    if alive < quorum_size {
        return TooFewLiveReplicasSnafu {
            alive,
            required: quorum_size,
            replicas: replicas_num,
        }
        .fail();
    }

    // Writes of all parts with a serial quorum are linearly ordered: at any
    // time at most one part may have a pending quorum, tracked in
    // `quorum/status`. The node is deleted once the quorum is reached.
    if !config.parallel {
        if let Some((status, _)) = client
            .try_get(&paths.quorum_status())
            .context(CoordinatorSnafu)?
        {
            return UnsatisfiedPreviousQuorumSnafu {
                status: String::from_utf8_lossy(&status).to_string(),
            }
            .fail();
        }
    }

    let (Some((_, is_active_stat)), Some((_, host_stat))) = (own_is_active, own_host) else {
        return ReadonlySnafu.fail();
    };

    Ok(QuorumPrecondition::Enabled {
        replicas_num,
        quorum_size,
        is_active_version: is_active_stat.version,
        host_version: host_stat.version,
    })
}

/// Block until the quorum tracker at `quorum_path` no longer tracks
/// `part_name`, then verify this replica stayed active the whole time.
///
/// Timeouts surface as `TimeoutExceeded` and a lost `is_active` as
/// `NoActiveReplicas`; any other failure means the insert's fate is unknown
/// to this caller and surfaces as `UnknownStatusOfInsert`.
pub fn wait_for_quorum(
    client: &dyn Client,
    paths: &TablePaths,
    replica_name: &str,
    part_name: &str,
    quorum_path: &str,
    is_active_version: i32,
    timeout: Duration,
) -> Result<()> {
    trace!(quorum_path, part_name, "waiting for quorum");

    let unknown = |reason: String| {
        UnknownStatusOfInsertSnafu {
            part_name,
            reason,
        }
        .build()
    };

    loop {
        let event = Event::new();
        let Some((data, _)) = client
            .try_get_watch(quorum_path, &event)
            .map_err(|e| unknown(e.to_string()))?
        else {
            break;
        };

        let entry = QuorumEntry::from_bytes(&data)
            .context(EntryDecodeSnafu)
            .map_err(|e| unknown(e.to_string()))?;

        // the node may have disappeared and reappeared for the next insert
        if entry.part_name != part_name {
            break;
        }

        trace!(quorum_path, "quorum tracker still present, waiting for updates");
        if !event.wait_timeout(timeout) {
            return TimeoutExceededSnafu { part_name }.fail();
        }
    }

    // the quorum may have been aborted because this replica went inactive
    match client
        .try_get(&paths.is_active(replica_name))
        .map_err(|e| unknown(e.to_string()))?
    {
        Some((_, stat)) if stat.version == is_active_version => {}
        _ => return NoActiveReplicasSnafu.fail(),
    }

    trace!(quorum_path, part_name, "quorum satisfied");
    Ok(())
}

/// Acknowledge `part_name` in its quorum tracker on behalf of this replica,
/// deleting the tracker if that satisfies the quorum.
///
/// Used when an insert found its part already committed: the replica holds
/// the data without fetching, so it counts toward the quorum.
pub fn update_quorum(
    client: &dyn Client,
    paths: &TablePaths,
    replica_name: &str,
    part_name: &str,
    parallel: bool,
) -> Result<()> {
    let quorum_path = if parallel {
        paths.quorum_parallel_part(part_name)
    } else {
        paths.quorum_status()
    };

    loop {
        let Some((data, stat)) = client.try_get(&quorum_path).context(CoordinatorSnafu)? else {
            return Ok(());
        };
        let mut entry = QuorumEntry::from_bytes(&data).context(EntryDecodeSnafu)?;
        if entry.part_name != part_name {
            return Ok(());
        }

        entry.replicas.insert(replica_name.to_owned());
        let result = if entry.is_satisfied() {
            info!(part_name, "quorum satisfied, removing tracker");
            client.delete(&quorum_path, Some(stat.version))
        } else {
            client
                .set_data(&quorum_path, entry.to_bytes(), Some(stat.version))
                .map(|_| ())
        };

        match result {
            Ok(()) => return Ok(()),
            // lost the update race, re-read and retry
            Err(e) if matches!(e.kind, coordinator::ErrorKind::BadVersion | coordinator::ErrorKind::NoNode) => {
                continue
            }
            Err(e) => return Err(e).context(CoordinatorSnafu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_normalization() {
        assert!(!QuorumConfig::count(0).is_configured());
        assert!(!QuorumConfig::count(1).is_configured());
        assert!(QuorumConfig::count(2).is_configured());
    }

    #[test]
    fn test_effective_size() {
        assert_eq!(QuorumConfig::disabled().effective_size(5), None);
        assert_eq!(QuorumConfig::count(2).effective_size(5), Some(2));
        assert_eq!(QuorumConfig::majority().effective_size(5), Some(3));
        assert_eq!(QuorumConfig::majority().effective_size(2), Some(2));
        // a majority of one replica is satisfied by the local write alone
        assert_eq!(QuorumConfig::majority().effective_size(1), None);
        assert_eq!(QuorumConfig::majority().effective_size(0), None);
    }
}
