//! Per-replica table state shared by sinks, plus coordinator bootstrap
//! helpers.

use crate::{
    parts::{PartCheckQueue, PartStore},
    writer::MetadataSnapshot,
    CoordinatorSnafu, Result, TablePaths,
};
use coordinator::{create_ancestors, Client, CreateMode, ErrorKind, Session};
use metric::U64Counter;
use observability_deps::tracing::info;
use snafu::ResultExt;
use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Debug)]
pub(crate) struct TableMetrics {
    pub(crate) duplicated_inserts: U64Counter,
    pub(crate) committed_parts: U64Counter,
}

impl TableMetrics {
    fn new(registry: &metric::Registry, table: &str) -> Self {
        let mut attributes = metric::Attributes::default();
        attributes.insert("table", table.to_owned());
        Self {
            duplicated_inserts: registry
                .register_metric::<U64Counter>(
                    "replicated_write_duplicated_inserts",
                    "Inserts dropped because their block id was already committed",
                )
                .recorder(attributes.clone()),
            committed_parts: registry
                .register_metric::<U64Counter>(
                    "replicated_write_committed_parts",
                    "Parts committed through the coordinator",
                )
                .recorder(attributes),
        }
    }
}

/// The state one replica of one replicated table shares across sinks: the
/// coordinator layout, the local part store, the session handle, metadata
/// and the background part-check queue.
#[derive(Debug)]
pub struct TableReplica {
    paths: TablePaths,
    replica_name: String,
    metadata: MetadataSnapshot,
    session: Session,
    store: PartStore,
    part_check_queue: PartCheckQueue,
    is_readonly: AtomicBool,
    shutdown_called: AtomicBool,
    metrics: TableMetrics,
}

impl TableReplica {
    /// Assemble the replica state; `store_root` is created if missing.
    pub fn new(
        paths: TablePaths,
        replica_name: impl Into<String>,
        metadata: MetadataSnapshot,
        session: Session,
        store_root: impl Into<PathBuf>,
        registry: &metric::Registry,
    ) -> Result<Self> {
        let replica_name = replica_name.into();
        let metrics = TableMetrics::new(registry, paths.root());
        Ok(Self {
            paths,
            replica_name,
            metadata,
            session,
            store: PartStore::new(store_root)?,
            part_check_queue: PartCheckQueue::new(),
            is_readonly: AtomicBool::new(false),
            shutdown_called: AtomicBool::new(false),
            metrics,
        })
    }

    /// The coordinator layout of this table.
    pub fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// This replica's name.
    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// The metadata snapshot the write path works against.
    pub fn metadata(&self) -> &MetadataSnapshot {
        &self.metadata
    }

    /// The coordinator session handle.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The local part store.
    pub fn store(&self) -> &PartStore {
        &self.store
    }

    /// Parts awaiting the background consistency checker.
    pub fn part_check_queue(&self) -> &PartCheckQueue {
        &self.part_check_queue
    }

    /// Whether the replica currently rejects writes.
    pub fn is_readonly(&self) -> bool {
        self.is_readonly.load(Ordering::SeqCst)
    }

    /// Switch the readonly state.
    pub fn set_readonly(&self, readonly: bool) {
        self.is_readonly.store(readonly, Ordering::SeqCst);
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }

    /// Mark shutdown; pending retries stop with `TableReadonly`.
    pub fn set_shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
        self.is_readonly.store(true, Ordering::SeqCst);
    }

    pub(crate) fn metrics(&self) -> &TableMetrics {
        &self.metrics
    }
}

/// Create the coordinator skeleton of a table: the subtrees every insert
/// assumes to exist.
pub fn create_table_skeleton(client: &dyn Client, paths: &TablePaths) -> Result<()> {
    create_ancestors(client, &format!("{}/x", paths.root())).context(CoordinatorSnafu)?;
    for path in [
        paths.replicas(),
        paths.blocks(),
        paths.async_blocks(),
        paths.log(),
        paths.block_numbers(),
        paths.quorum(),
        paths.quorum_parallel(),
    ] {
        match client.create(&path, vec![], CreateMode::Persistent) {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::NodeExists => {}
            Err(e) => return Err(e).context(CoordinatorSnafu),
        }
    }
    info!(root = paths.root(), "created table skeleton");
    Ok(())
}

/// Register `replica` and mark it alive: persistent `host` and `parts`
/// nodes plus the ephemeral `is_active` marker.
pub fn activate_replica(
    client: &dyn Client,
    paths: &TablePaths,
    replica: &str,
    host: &str,
) -> Result<()> {
    for path in [paths.replica(replica), paths.replica_parts(replica)] {
        match client.create(&path, vec![], CreateMode::Persistent) {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::NodeExists => {}
            Err(e) => return Err(e).context(CoordinatorSnafu),
        }
    }

    let host_path = paths.host(replica);
    match client.create(&host_path, host.as_bytes().to_vec(), CreateMode::Persistent) {
        Ok(_) => {}
        Err(e) if e.kind == ErrorKind::NodeExists => {
            client
                .set_data(&host_path, host.as_bytes().to_vec(), None)
                .context(CoordinatorSnafu)?;
        }
        Err(e) => return Err(e).context(CoordinatorSnafu),
    }

    client
        .create(&paths.is_active(replica), vec![], CreateMode::Ephemeral)
        .context(CoordinatorSnafu)?;
    info!(replica, "replica activated");
    Ok(())
}

/// Drop the liveness marker of `replica`.
pub fn deactivate_replica(client: &dyn Client, paths: &TablePaths, replica: &str) -> Result<()> {
    match client.delete(&paths.is_active(replica), None) {
        Ok(()) => Ok(()),
        Err(e) if e.kind == ErrorKind::NoNode => Ok(()),
        Err(e) => Err(e).context(CoordinatorSnafu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator::mem::MemCoordinator;
    use std::sync::Arc;

    #[test]
    fn test_bootstrap() {
        let coordinator = Arc::new(MemCoordinator::new());
        let paths = TablePaths::new("/tables/db/events");

        create_table_skeleton(coordinator.as_ref(), &paths).unwrap();
        // idempotent
        create_table_skeleton(coordinator.as_ref(), &paths).unwrap();

        activate_replica(coordinator.as_ref(), &paths, "r1", "host1:9000").unwrap();
        assert!(coordinator
            .exists(&paths.is_active("r1"))
            .unwrap()
            .unwrap()
            .ephemeral);
        assert_eq!(
            coordinator.get(&paths.host("r1")).unwrap().0,
            b"host1:9000"
        );

        // re-activation refreshes the host value
        deactivate_replica(coordinator.as_ref(), &paths, "r1").unwrap();
        activate_replica(coordinator.as_ref(), &paths, "r1", "host1:9001").unwrap();
        assert_eq!(
            coordinator.get(&paths.host("r1")).unwrap().0,
            b"host1:9001"
        );

        deactivate_replica(coordinator.as_ref(), &paths, "r1").unwrap();
        deactivate_replica(coordinator.as_ref(), &paths, "r1").unwrap();
        assert!(coordinator.exists(&paths.is_active("r1")).unwrap().is_none());
    }
}
