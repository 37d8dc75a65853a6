//! The deduplication and block-id layer.
//!
//! Synchronous inserts carry at most one block id per part; asynchronous
//! inserts carry one id per sub-block plus a cached recent-ids view that is
//! consulted before the coordinator transaction.

use crate::TablePaths;
use cache_system::{Cache, Lru, UnitWeigher};
use coordinator::{Client, Session};
use data_types::{block_hasher, content_block_id};
use mutable_batch::Batch;
use observability_deps::tracing::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

/// Deduplication intent of one prepared part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockIds {
    /// Deduplication disabled.
    None,
    /// Synchronous insert: one id for the whole part.
    Sync(String),
    /// Asynchronous insert: one id per sub-block.
    Async(Vec<String>),
}

impl BlockIds {
    /// Whether the commit transaction must guard these ids.
    pub fn dedup_enabled(&self) -> bool {
        match self {
            Self::None => false,
            Self::Sync(_) => true,
            Self::Async(ids) => !ids.is_empty(),
        }
    }

    /// The ids, if any.
    pub fn ids(&self) -> &[String] {
        match self {
            Self::None => &[],
            Self::Sync(id) => std::slice::from_ref(id),
            Self::Async(ids) => ids,
        }
    }
}

/// Content-addressed id of the given row range.
pub fn content_id(partition_id: &str, batch: &Batch, rows: std::ops::Range<usize>) -> String {
    let mut hasher = block_hasher();
    batch.hash_rows(rows, &mut hasher);
    content_block_id(partition_id, hasher)
}

/// One content-addressed id per sub-block.
pub fn async_block_ids(partition_id: &str, batch: &Batch, offsets: &[usize]) -> Vec<String> {
    let mut start = 0;
    offsets
        .iter()
        .map(|&end| {
            let id = content_id(partition_id, batch, start..end);
            start = end;
            id
        })
        .collect()
}

/// A bounded in-memory view of recently committed async block ids.
///
/// The view is refreshed from the coordinator's `async_blocks` children and
/// carries a monotonically increasing version. A conflict probe that already
/// saw the current version blocks (bounded) for a newer snapshot first, so a
/// retry after a reported conflict works against fresh data rather than the
/// same stale cutoff.
///
/// The view is advisory: ids may be evicted from the bounded cache, and the
/// authoritative check remains the block-id guard in the commit transaction.
#[derive(Debug)]
pub struct AsyncBlockIdsCache {
    path: String,
    ids: Cache<String, ()>,
    version: Mutex<u64>,
    version_changed: Condvar,
    update_wait: Duration,
}

impl AsyncBlockIdsCache {
    /// A cache over the table's async-blocks subtree holding at most
    /// `max_entries` ids.
    pub fn new(paths: &TablePaths, max_entries: usize, update_wait: Duration) -> Self {
        Self {
            path: paths.async_blocks(),
            ids: Cache::new(Box::new(Lru::new(0, max_entries, Arc::new(UnitWeigher)))),
            version: Mutex::new(0),
            version_changed: Condvar::new(),
            update_wait,
        }
    }

    /// Like [`new`](Self::new), reporting cache hits/misses to `registry`.
    pub fn new_with_metrics(
        paths: &TablePaths,
        max_entries: usize,
        update_wait: Duration,
        registry: &metric::Registry,
    ) -> Self {
        let mut cache = Self::new(paths, max_entries, update_wait);
        cache.ids = Cache::new(Box::new(Lru::new(0, max_entries, Arc::new(UnitWeigher))))
            .with_metrics("async_block_ids", registry);
        cache
    }

    /// Pull the current id set from the coordinator and publish a new
    /// version.
    pub fn refresh(&self, client: &dyn Client) -> coordinator::Result<usize> {
        let children = client.get_children(&self.path)?;
        let count = children.len();
        for id in children {
            if self.ids.get(&id).is_none() {
                self.ids.set(id, ());
            }
        }

        let mut version = self.version.lock();
        *version += 1;
        self.version_changed.notify_all();
        Ok(count)
    }

    /// The current snapshot version.
    pub fn version(&self) -> u64 {
        *self.version.lock()
    }

    /// Ids of `ids` that the view already shows as committed.
    ///
    /// `last_version` carries the version this caller saw on its previous
    /// probe; it MUST be reset to zero at the start of every partition. On
    /// return it holds the version this probe was answered from.
    pub fn detect_conflicts(&self, ids: &[String], last_version: &mut u64) -> Vec<String> {
        let mut version = self.version.lock();
        if *last_version != 0 && *version <= *last_version {
            // the last probe was answered from this same snapshot; wait for
            // the updater before re-deciding
            self.version_changed.wait_for(&mut version, self.update_wait);
        }
        *last_version = *version;
        drop(version);

        ids.iter()
            .filter(|id| self.ids.get(id).is_some())
            .cloned()
            .collect()
    }
}

/// Periodically refreshes an [`AsyncBlockIdsCache`] until dropped.
#[derive(Debug)]
pub struct CacheUpdater {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheUpdater {
    /// Refresh `cache` through `session` every `interval`.
    pub fn spawn(cache: Arc<AsyncBlockIdsCache>, session: Session, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_captured = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_captured.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                let Ok(client) = session.client() else {
                    continue;
                };
                match cache.refresh(client.as_ref()) {
                    Ok(count) => debug!(count, "refreshed async block ids cache"),
                    Err(e) => warn!(%e, "unable to refresh async block ids cache"),
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for CacheUpdater {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator::{create_ancestors, mem::MemCoordinator, CreateMode};
    use mutable_batch::{Column, ColumnData};

    fn batch(values: &[i64]) -> Batch {
        Batch::new(vec![Column::new("a", ColumnData::I64(values.to_vec()))]).unwrap()
    }

    #[test]
    fn test_async_ids_are_per_sub_block() {
        let rows = batch(&[1, 2, 1, 2, 9, 9]);
        let ids = async_block_ids("all", &rows, &[2, 4, 6]);

        assert_eq!(ids.len(), 3);
        // identical sub-block content yields identical ids
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        // ids carry the partition prefix
        assert!(ids.iter().all(|id| id.starts_with("all_")));
    }

    fn seeded_cache() -> (Arc<MemCoordinator>, TablePaths, AsyncBlockIdsCache) {
        let coordinator = Arc::new(MemCoordinator::new());
        let paths = TablePaths::new("/t");
        create_ancestors(coordinator.as_ref(), &format!("{}/x", paths.async_blocks())).unwrap();
        (
            coordinator,
            paths.clone(),
            AsyncBlockIdsCache::new(&paths, 1000, Duration::from_millis(20)),
        )
    }

    #[test]
    fn test_detect_conflicts() {
        let (coordinator, paths, cache) = seeded_cache();
        coordinator
            .create(&paths.async_block("all_1_1"), vec![], CreateMode::Persistent)
            .unwrap();
        cache.refresh(coordinator.as_ref()).unwrap();

        let ids = vec!["all_1_1".to_owned(), "all_2_2".to_owned()];
        let mut last_version = 0;
        assert_eq!(cache.detect_conflicts(&ids, &mut last_version), vec!["all_1_1"]);
        assert_eq!(last_version, 1);
    }

    #[test]
    fn test_repeat_probe_waits_for_new_version() {
        let (coordinator, _paths, cache) = seeded_cache();
        cache.refresh(coordinator.as_ref()).unwrap();

        let ids = vec!["all_1_1".to_owned()];
        let mut last_version = 0;
        cache.detect_conflicts(&ids, &mut last_version);
        assert_eq!(last_version, 1);

        // same version: the probe blocks for up to update_wait and returns
        // answered from the same snapshot
        let start = std::time::Instant::now();
        cache.detect_conflicts(&ids, &mut last_version);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(last_version, 1);

        // a zeroed version (new partition) does not wait
        let start = std::time::Instant::now();
        let mut fresh = 0;
        cache.detect_conflicts(&ids, &mut fresh);
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
