//! The local part set: temp-part lifecycle, renames into and out of the
//! active set, covering-part lookups and the background part-check queue.

use crate::{PartWriteSnafu, Result, SharedDataLockSnafu};
use coordinator::Event;
use data_types::PartInfo;
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use snafu::ResultExt;
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use uuid::Uuid;

/// An immutable on-disk artifact holding one partition of a batch, not yet
/// part of the active set.
#[derive(Debug)]
pub struct TempPart {
    info: PartInfo,
    checksum: String,
    streams: usize,
    dir: PathBuf,
}

impl TempPart {
    pub(crate) fn new(info: PartInfo, checksum: String, streams: usize, dir: PathBuf) -> Self {
        Self {
            info,
            checksum,
            streams,
            dir,
        }
    }

    /// The identity this part will be committed under.
    pub fn info(&self) -> &PartInfo {
        &self.info
    }

    pub(crate) fn set_info(&mut self, info: PartInfo) {
        self.info = info;
    }

    /// Hex content checksum of the part data.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Number of write streams this part required; used for the delayed
    /// streams admission cap.
    pub fn streams(&self) -> usize {
        self.streams
    }

    /// The directory currently backing this part.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush part data durably to disk.
    pub fn finalize(&self) -> Result<()> {
        let data = self.dir.join(crate::writer::DATA_FILE_NAME);
        fs::File::open(&data)
            .and_then(|f| f.sync_all())
            .context(PartWriteSnafu { path: data })
    }

    /// Delete the backing directory. Errors are logged, not surfaced; the
    /// background GC sweeps leftovers.
    pub fn remove(self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), %e, "unable to remove discarded temp part");
        }
    }
}

#[derive(Debug, Default)]
struct ActiveParts {
    by_name: BTreeMap<String, PartInfo>,
    shared_locks: HashSet<String>,
}

/// The on-disk part set of one replica.
///
/// Guards the *parts lock*: renames into and out of the active set are
/// serialized here and nowhere else.
#[derive(Debug)]
pub struct PartStore {
    root: PathBuf,
    state: Mutex<ActiveParts>,
    merge_event: Event,
    fail_next_shared_lock: AtomicBool,
}

impl PartStore {
    /// A store rooted at `root`, created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context(PartWriteSnafu { path: &root })?;
        Ok(Self {
            root,
            state: Mutex::new(ActiveParts::default()),
            merge_event: Event::new(),
            fail_next_shared_lock: AtomicBool::new(false),
        })
    }

    /// A fresh directory path for a temporary part.
    pub(crate) fn temp_path(&self) -> PathBuf {
        self.root.join(format!("tmp_insert_{}", Uuid::new_v4()))
    }

    /// The directory of an active part.
    pub fn part_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Names of all active parts.
    pub fn active_parts(&self) -> Vec<String> {
        self.state.lock().by_name.keys().cloned().collect()
    }

    /// Whether `name` is in the active set.
    pub fn contains_active(&self, name: &str) -> bool {
        self.state.lock().by_name.contains_key(name)
    }

    /// Name of an active part covering every block of `info`, if any.
    pub fn active_containing_part(&self, info: &PartInfo) -> Option<String> {
        self.state
            .lock()
            .by_name
            .iter()
            .find(|(_, active)| active.contains(info))
            .map(|(name, _)| name.clone())
    }

    /// Rename `part` into the active set under its committed name.
    ///
    /// Returns false without touching anything when the name is already
    /// taken (a concurrent request or fetch won the race).
    pub(crate) fn rename_temp_and_add(
        &self,
        part: &mut TempPart,
        txn: &mut PartTransaction<'_>,
    ) -> Result<bool> {
        let name = part.info().name();
        let mut state = self.state.lock();

        if state.by_name.contains_key(&name) {
            return Ok(false);
        }
        let target = self.part_path(&name);
        if target.exists() {
            return Ok(false);
        }

        fs::rename(&part.dir, &target).context(PartWriteSnafu { path: &target })?;
        part.dir = target;
        state.by_name.insert(name.clone(), part.info().clone());
        txn.added = Some(name);
        Ok(true)
    }

    /// Undo [`rename_temp_and_add`](Self::rename_temp_and_add): take the
    /// part out of the active set and move its directory back under a
    /// temporary name, to be swept by the background GC.
    pub(crate) fn rename_to_temporary(&self, part: &mut TempPart, txn: &mut PartTransaction<'_>) {
        txn.rollback();
        let temp = self.temp_path();
        match fs::rename(&part.dir, &temp) {
            Ok(()) => part.dir = temp,
            Err(e) => warn!(
                dir = %part.dir.display(),
                %e,
                "unable to rename part back to temporary"
            ),
        }
    }

    /// Take the shared-data locks required before publishing `name`.
    pub(crate) fn lock_shared_data(&self, name: &str) -> Result<()> {
        if self.fail_next_shared_lock.swap(false, Ordering::SeqCst) {
            return SharedDataLockSnafu { part_name: name }.fail();
        }
        self.state.lock().shared_locks.insert(name.to_owned());
        Ok(())
    }

    /// Release the shared-data locks of `name`, if held.
    pub(crate) fn unlock_shared_data(&self, name: &str) {
        self.state.lock().shared_locks.remove(name);
    }

    /// Whether the shared-data locks of `name` are held.
    pub fn holds_shared_data_lock(&self, name: &str) -> bool {
        self.state.lock().shared_locks.contains(name)
    }

    /// Make the next [`lock_shared_data`](Self::lock_shared_data) fail.
    /// Test instrumentation for the rename-revert path.
    pub fn fail_next_shared_data_lock(&self) {
        self.fail_next_shared_lock.store(true, Ordering::SeqCst);
    }

    /// Signalled whenever a commit adds a part, nudging merge selection.
    pub fn merge_selection_event(&self) -> &Event {
        &self.merge_event
    }

    pub(crate) fn notify_merge_selection(&self) {
        self.merge_event.notify();
    }

    #[cfg(test)]
    pub(crate) fn insert_active_for_test(&self, info: PartInfo) {
        self.state.lock().by_name.insert(info.name(), info);
    }
}

/// Scoped registration of one part in the active set.
///
/// If the coordinator transaction does not go through, dropping the
/// transaction takes the part out of the active set again; the files are
/// left for the background GC.
#[derive(Debug)]
pub(crate) struct PartTransaction<'a> {
    store: &'a PartStore,
    added: Option<String>,
    committed: bool,
}

impl<'a> PartTransaction<'a> {
    pub(crate) fn new(store: &'a PartStore) -> Self {
        Self {
            store,
            added: None,
            committed: false,
        }
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }

    pub(crate) fn rollback(&mut self) {
        if let Some(name) = self.added.take() {
            debug!(part_name = %name, "rolling back local part registration");
            self.store.state.lock().by_name.remove(&name);
        }
        self.committed = true;
    }
}

impl Drop for PartTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

/// Parts queued for the background consistency checker.
///
/// A part lands here when its commit transaction ended in an unknown state:
/// the checker later reconciles the local part against the coordinator.
#[derive(Debug, Clone, Default)]
pub struct PartCheckQueue(Arc<Mutex<VecDeque<String>>>);

impl PartCheckQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `part_name` for checking.
    pub fn enqueue(&self, part_name: &str) {
        debug!(part_name, "enqueueing part for background check");
        self.0.lock().push_back(part_name.to_owned());
    }

    /// Drain all queued part names.
    pub fn drain(&self) -> Vec<String> {
        self.0.lock().drain(..).collect()
    }

    /// Number of queued parts.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_part_in(store: &PartStore, info: PartInfo) -> TempPart {
        let dir = store.temp_path();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(crate::writer::DATA_FILE_NAME), b"data").unwrap();
        TempPart::new(info, "00000000".into(), 1, dir)
    }

    #[test]
    fn test_rename_and_rollback() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let store = PartStore::new(tmp.path().join("parts")).unwrap();
        let mut part = temp_part_in(&store, PartInfo::new_zero_level("all", 0));

        let mut txn = PartTransaction::new(&store);
        assert!(store.rename_temp_and_add(&mut part, &mut txn).unwrap());
        assert!(store.contains_active("all_0_0_0"));
        assert!(store.part_path("all_0_0_0").exists());

        // dropping without commit reverts the registration
        drop(txn);
        assert!(!store.contains_active("all_0_0_0"));

        let mut txn = PartTransaction::new(&store);
        assert!(!store.rename_temp_and_add(&mut part, &mut txn).unwrap());
    }

    #[test]
    fn test_commit_keeps_registration() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let store = PartStore::new(tmp.path().join("parts")).unwrap();
        let mut part = temp_part_in(&store, PartInfo::new_zero_level("all", 1));

        let mut txn = PartTransaction::new(&store);
        assert!(store.rename_temp_and_add(&mut part, &mut txn).unwrap());
        txn.commit();
        assert!(store.contains_active("all_1_1_0"));
    }

    #[test]
    fn test_rename_to_temporary() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let store = PartStore::new(tmp.path().join("parts")).unwrap();
        let mut part = temp_part_in(&store, PartInfo::new_zero_level("all", 2));

        let mut txn = PartTransaction::new(&store);
        assert!(store.rename_temp_and_add(&mut part, &mut txn).unwrap());
        store.rename_to_temporary(&mut part, &mut txn);

        assert!(!store.contains_active("all_2_2_0"));
        assert!(!store.part_path("all_2_2_0").exists());
        assert!(part.dir().exists());
        assert!(part
            .dir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tmp_insert_"));
    }

    #[test]
    fn test_active_containing_part() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let store = PartStore::new(tmp.path().join("parts")).unwrap();
        store.insert_active_for_test(PartInfo {
            partition_id: "all".into(),
            min_block: 0,
            max_block: 5,
            level: 1,
            mutation: 0,
        });

        assert_eq!(
            store.active_containing_part(&PartInfo::new_zero_level("all", 3)),
            Some("all_0_5_1".to_owned())
        );
        assert_eq!(
            store.active_containing_part(&PartInfo::new_zero_level("all", 6)),
            None
        );
        assert_eq!(
            store.active_containing_part(&PartInfo::new_zero_level("p2", 3)),
            None
        );
    }

    #[test]
    fn test_part_check_queue() {
        let queue = PartCheckQueue::new();
        assert!(queue.is_empty());
        queue.enqueue("all_0_0_0");
        queue.enqueue("all_1_1_0");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), vec!["all_0_0_0", "all_1_1_0"]);
        assert!(queue.is_empty());
    }
}
