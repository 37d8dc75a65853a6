//! The replicated commit engine.
//!
//! For each prepared part: allocate a block number, assemble the multi-op
//! coordinator transaction (log entry, block-number unlock, dedup records,
//! quorum tracker, part registration), rename the temp part into the active
//! set, submit, and interpret the outcome, all under bounded retry with
//! partial-failure recovery.

use crate::{
    dedup::{AsyncBlockIdsCache, BlockIds},
    parts::{PartTransaction, TempPart},
    quorum::{update_quorum, wait_for_quorum, QuorumConfig, QuorumPrecondition},
    table::TableReplica,
    CancellationToken, CoordinatorSnafu, DuplicateDataPartSnafu, Error, LogicSnafu,
    NoCoordinatorSessionSnafu, PartNameSnafu, QueryWasCancelledSnafu, Result, TableReadonlySnafu,
    TablePaths, UnexpectedCoordinatorSnafu, UnknownStatusOfInsertSnafu,
    UnsatisfiedPreviousQuorumSnafu,
};
use coordinator::{
    retries::{retry_loop, Attempts, RetryConfig, Verdict},
    Client, CreateMode, ErrorKind, MultiError, Op, OpResponse,
};
use data_types::{LogEntry, LogEntryType, PartInfo, QuorumEntry};
use observability_deps::tracing::{debug, info};
use snafu::ResultExt;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// The sync dedup loop gives up after this many consecutive id collisions.
const MAX_DEDUP_LOOP_ITERATIONS: usize = 10;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// What a commit collision means for the caller.
pub(crate) enum Collision {
    /// Sync insert: re-run the allocation, the existing-id short circuit
    /// takes over.
    RetryLoop,
    /// Async insert: hand the conflicting ids back for re-filtering.
    Conflicts(Vec<String>),
}

/// Mode-specific half of the dedup contract used by the shared commit
/// engine.
pub(crate) trait DedupStrategy {
    /// Consult the recent-ids view before touching the coordinator; a
    /// non-empty result short-circuits the commit with those conflicts.
    fn prefilter(&mut self, ids: &BlockIds) -> Vec<String>;

    /// Interpret a block-id guard collision reported by the commit
    /// transaction.
    fn on_commit_collision(&mut self, conflict_id: String) -> Collision;
}

/// Synchronous inserts: no prefilter, collisions loop back into allocation.
#[derive(Debug)]
pub(crate) struct SyncDedup;

impl DedupStrategy for SyncDedup {
    fn prefilter(&mut self, _ids: &BlockIds) -> Vec<String> {
        vec![]
    }

    fn on_commit_collision(&mut self, _conflict_id: String) -> Collision {
        Collision::RetryLoop
    }
}

/// Asynchronous inserts: prefilter through the recent-ids cache, collisions
/// short-circuit to the caller's conflict loop.
#[derive(Debug)]
pub(crate) struct AsyncDedup<'a> {
    pub(crate) cache: &'a AsyncBlockIdsCache,
    /// The snapshot version the previous probe of this partition saw; reset
    /// to zero at the start of every partition.
    pub(crate) cache_version: &'a mut u64,
}

impl DedupStrategy for AsyncDedup<'_> {
    fn prefilter(&mut self, ids: &BlockIds) -> Vec<String> {
        let BlockIds::Async(ids) = ids else {
            return vec![];
        };
        let conflicts = self.cache.detect_conflicts(ids, self.cache_version);
        if !conflicts.is_empty() {
            *self.cache_version = 0;
        }
        conflicts
    }

    fn on_commit_collision(&mut self, conflict_id: String) -> Collision {
        Collision::Conflicts(vec![conflict_id])
    }
}

/// A held block-number lock: the sequential node under
/// `block_numbers/{partition}` whose number names the part.
///
/// The commit transaction deletes the node; if the lock is dropped without
/// the transaction going through, the node is deleted here so the number is
/// not left abandoned.
#[derive(Debug)]
pub(crate) struct BlockNumberLock {
    client: Arc<dyn Client>,
    path: String,
    number: i64,
    unlocked: bool,
}

impl BlockNumberLock {
    pub(crate) fn number(&self) -> i64 {
        self.number
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Append the unlock op, returning its index within `ops`.
    pub(crate) fn add_unlock_op(&self, ops: &mut Vec<Op>) -> usize {
        ops.push(Op::Delete {
            path: self.path.clone(),
            version: None,
        });
        ops.len() - 1
    }

    /// The commit transaction took care of the unlock.
    pub(crate) fn assume_unlocked(&mut self) {
        self.unlocked = true;
    }
}

impl Drop for BlockNumberLock {
    fn drop(&mut self) {
        if !self.unlocked {
            // releases the abandoned number; the node may already be gone
            self.client.delete(&self.path, None).ok();
        }
    }
}

/// Outcome of block-number allocation.
pub(crate) enum Allocation {
    /// Number allocated, dedup guards passed.
    Locked(BlockNumberLock),
    /// Sync insert: the block id already has a committed part.
    ExistingId(String),
    /// Async insert: one of the block ids already has a committed part.
    Conflict(String),
}

/// Allocate a block number for `partition_id` while checking every dedup
/// guard in the same transaction.
fn allocate_block_number(
    client: &Arc<dyn Client>,
    paths: &TablePaths,
    partition_id: &str,
    ids: &BlockIds,
) -> Result<Allocation> {
    // the partition's number subtree is created lazily
    match client.create(
        &paths.partition_block_numbers(partition_id),
        vec![],
        CreateMode::Persistent,
    ) {
        Ok(_) => {}
        Err(e) if e.kind == ErrorKind::NodeExists => {}
        Err(e) => return Err(e).context(CoordinatorSnafu),
    }

    let guards: Vec<(&String, String)> = match ids {
        BlockIds::None => vec![],
        BlockIds::Sync(id) => vec![(id, paths.block(id))],
        BlockIds::Async(list) => list.iter().map(|id| (id, paths.async_block(id))).collect(),
    };

    // each guard is a create/delete pair: the id must not exist, yet no
    // empty dedup record survives a failed commit
    let mut ops = Vec::with_capacity(guards.len() * 2 + 1);
    for (_, path) in &guards {
        ops.push(Op::Create {
            path: path.clone(),
            data: vec![],
            mode: CreateMode::Persistent,
        });
        ops.push(Op::Delete {
            path: path.clone(),
            version: None,
        });
    }
    let prefix = paths.block_number_prefix(partition_id);
    ops.push(Op::Create {
        path: prefix.clone(),
        data: vec![],
        mode: CreateMode::PersistentSequential,
    });

    match client.multi(ops) {
        Ok(responses) => {
            let Some(OpResponse::Created { path }) = responses.last() else {
                return LogicSnafu {
                    message: "block-number allocation yielded no created node",
                }
                .fail();
            };
            let number = path
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<i64>().ok())
                .ok_or_else(|| Error::Logic {
                    message: format!("unparseable block-number node {path}"),
                })?;
            Ok(Allocation::Locked(BlockNumberLock {
                client: Arc::clone(client),
                path: path.clone(),
                number,
                unlocked: false,
            }))
        }
        Err(MultiError {
            source,
            failed_op_index: Some(index),
        }) if source.kind == ErrorKind::NodeExists && index / 2 < guards.len() && index % 2 == 0 => {
            let conflict_id = guards[index / 2].0.clone();
            match ids {
                BlockIds::Sync(_) => Ok(Allocation::ExistingId(conflict_id)),
                BlockIds::Async(_) => Ok(Allocation::Conflict(conflict_id)),
                BlockIds::None => LogicSnafu {
                    message: "dedup guard failed without dedup ids",
                }
                .fail(),
            }
        }
        Err(MultiError { source, .. }) => Err(source).context(CoordinatorSnafu),
    }
}

/// The id whose guard record is at `failed_path`, if any.
fn guard_conflict_id(ids: &BlockIds, paths: &TablePaths, failed_path: &str) -> Option<String> {
    match ids {
        BlockIds::None => None,
        BlockIds::Sync(id) => (paths.block(id) == failed_path).then(|| id.clone()),
        BlockIds::Async(list) => list
            .iter()
            .find(|id| paths.async_block(id) == failed_path)
            .cloned(),
    }
}

/// Per-part result of [`Committer::commit_part`].
#[derive(Debug, Default)]
pub(crate) struct CommitOutcome {
    /// The part was a duplicate of already-committed data; nothing new was
    /// published.
    pub(crate) deduplicated: bool,
    /// Async inserts only: ids that collided with committed data. The
    /// caller filters the affected sub-blocks and retries; nothing was
    /// committed.
    pub(crate) conflicts: Vec<String>,
}

impl CommitOutcome {
    fn committed(deduplicated: bool) -> Self {
        Self {
            deduplicated,
            conflicts: vec![],
        }
    }

    fn conflicting(conflicts: Vec<String>) -> Self {
        Self {
            deduplicated: false,
            conflicts,
        }
    }
}

/// Borrowed context for committing the parts of one sink invocation.
#[derive(Debug)]
pub(crate) struct Committer<'a> {
    pub(crate) table: &'a TableReplica,
    pub(crate) retries: &'a RetryConfig,
    pub(crate) quorum: &'a QuorumConfig,
    pub(crate) is_attach: bool,
    pub(crate) writing_existing_part: bool,
    pub(crate) cancel: &'a CancellationToken,
}

impl Committer<'_> {
    /// Commit one prepared part.
    pub(crate) fn commit_part(
        &self,
        part: &mut TempPart,
        ids: &BlockIds,
        precondition: &QuorumPrecondition,
        strategy: &mut dyn DedupStrategy,
    ) -> Result<CommitOutcome> {
        let paths = self.table.paths();
        let store = self.table.store();
        let replica = self.table.replica_name();

        let mut attempts = Attempts::new("commit_part", self.retries);
        let mut dedup_loop_counter = 0usize;
        let mut committed_locally_unknown = false;
        let mut check_hook_registered = false;
        let mut last_hardware_error: Option<coordinator::Error> = None;
        let mut is_existing_part = false;
        let mut committed_part_name: Option<String> = None;

        while let Some(attempt) = attempts.next() {
            if self.cancel.is_cancelled() {
                return QueryWasCancelledSnafu {
                    reason: "cancellation requested between retry iterations",
                }
                .fail();
            }

            let client = self
                .table
                .session()
                .client()
                .context(NoCoordinatorSessionSnafu)?;

            if self.table.is_readonly() {
                // attaching existing parts is allowed in readonly mode, e.g.
                // while restoring a replica
                if self.table.is_shutdown() || !self.writing_existing_part {
                    return TableReadonlySnafu {
                        replica_path: paths.replica(replica),
                    }
                    .fail();
                }
            }

            if attempt.index > 0 && committed_locally_unknown {
                // The previous iteration hit a transport fault after the
                // local commit. Resolve what the coordinator actually did
                // before anything else; this is the only tolerated partial
                // success.
                let part_name = part.info().name();
                match client.exists(&paths.replica_part(replica, &part_name)) {
                    Ok(Some(_)) => {
                        debug!(part_name, "part was committed on a previous iteration");
                        committed_part_name = Some(part_name);
                        break;
                    }
                    Ok(None) => {
                        attempts.exhausted();
                        return UnknownStatusOfInsertSnafu {
                            part_name,
                            reason: last_hardware_error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "transaction outcome unknown".to_owned()),
                        }
                        .fail();
                    }
                    Err(e) if e.is_hardware() => {
                        last_hardware_error = Some(e);
                        if attempt.is_last {
                            attempts.exhausted();
                            return UnknownStatusOfInsertSnafu {
                                part_name,
                                reason: last_hardware_error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_default(),
                            }
                            .fail();
                        }
                        continue;
                    }
                    Err(e) => return Err(e).context(UnexpectedCoordinatorSnafu),
                }
            }

            let prefiltered = strategy.prefilter(ids);
            if !prefiltered.is_empty() {
                debug!(conflicts = prefiltered.len(), "recent-ids cache reported conflicts");
                return Ok(CommitOutcome::conflicting(prefiltered));
            }

            let allocation =
                match allocate_block_number(&client, paths, &part.info().partition_id, ids) {
                    Ok(allocation) => allocation,
                    Err(Error::Coordinator { source }) if source.is_hardware() => {
                        if attempt.is_last {
                            attempts.exhausted();
                            return Err(Error::Coordinator { source });
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                };

            let mut ops = Vec::new();
            let mut lock = None;
            let mut block_unlock_op_idx = None;
            let mut quorum_status_path = None;

            match allocation {
                Allocation::Conflict(id) => {
                    debug!(conflict_id = %id, "block id exists, reporting conflict");
                    return Ok(CommitOutcome::conflicting(vec![id]));
                }

                Allocation::ExistingId(block_id) => {
                    is_existing_part = true;

                    // This block was already committed somewhere. Learn the
                    // part name it ended up under.
                    let existing_name = match client.get(&paths.block(&block_id)) {
                        Ok((data, _)) => String::from_utf8_lossy(&data).to_string(),
                        Err(e) if e.is_hardware() => {
                            if attempt.is_last {
                                attempts.exhausted();
                                return Err(Error::Coordinator { source: e });
                            }
                            continue;
                        }
                        // racing a drop-partition; the record just vanished
                        Err(e) => return Err(e).context(UnexpectedCoordinatorSnafu),
                    };
                    let existing_info =
                        PartInfo::parse(&existing_name).context(PartNameSnafu)?;

                    if let Some(covering) = store.active_containing_part(&existing_info) {
                        info!(
                            block_id,
                            existing_name,
                            covering,
                            "block already exists locally; ignoring it"
                        );
                        self.table.metrics().duplicated_inserts.inc(1);
                        if let QuorumPrecondition::Enabled {
                            is_active_version, ..
                        } = precondition
                        {
                            let quorum_path = if self.quorum.parallel {
                                paths.quorum_parallel_part(&existing_name)
                            } else {
                                paths.quorum_status()
                            };
                            wait_for_quorum(
                                client.as_ref(),
                                paths,
                                replica,
                                &existing_name,
                                &quorum_path,
                                *is_active_version,
                                self.quorum.timeout,
                            )?;
                        }
                        return Ok(CommitOutcome::committed(true));
                    }

                    info!(
                        block_id,
                        existing_name,
                        "block exists on another replica; writing it locally under that name"
                    );
                    part.set_info(existing_info);
                    // the id is already reserved, commit only the local copy
                }

                Allocation::Locked(number_lock) => {
                    part.set_info(PartInfo::new_zero_level(
                        part.info().partition_id.clone(),
                        number_lock.number(),
                    ));
                    let part_name = part.info().name();

                    let entry = LogEntry {
                        entry_type: if self.is_attach {
                            LogEntryType::AttachPart
                        } else {
                            LogEntryType::GetPart
                        },
                        create_time: now_secs(),
                        source_replica: replica.to_owned(),
                        new_part_name: part_name.clone(),
                        quorum: precondition.quorum_size() as u64,
                        new_part_format: self.table.metadata().part_format,
                        block_id: match ids {
                            BlockIds::Sync(id) => Some(id.clone()),
                            _ => None,
                        },
                        part_checksum: self
                            .is_attach
                            .then(|| part.checksum().to_owned()),
                    };
                    ops.push(Op::Create {
                        path: paths.log_entry_prefix(),
                        data: entry.to_bytes(),
                        mode: CreateMode::PersistentSequential,
                    });

                    block_unlock_op_idx = Some(number_lock.add_unlock_op(&mut ops));

                    if let QuorumPrecondition::Enabled {
                        quorum_size,
                        is_active_version,
                        host_version,
                        ..
                    } = precondition
                    {
                        // If the tracker exists, someone started another
                        // quorum write that has not completed; creating it
                        // here is what serializes quorum inserts.
                        let status_path = if self.quorum.parallel {
                            paths.quorum_parallel_part(&part_name)
                        } else {
                            paths.quorum_status()
                        };
                        let quorum_entry = QuorumEntry::new(&part_name, *quorum_size, replica);
                        ops.push(Op::Create {
                            path: status_path.clone(),
                            data: quorum_entry.to_bytes(),
                            mode: CreateMode::Persistent,
                        });
                        quorum_status_path = Some(status_path);

                        // The replica must not have been reinitialized or
                        // deactivated since the precondition. `is_active`
                        // can be recreated at the same version, but then
                        // `host` changes with it.
                        ops.push(Op::CheckVersion {
                            path: paths.is_active(replica),
                            version: *is_active_version,
                        });
                        ops.push(Op::CheckVersion {
                            path: paths.host(replica),
                            version: *host_version,
                        });
                    }

                    // durable dedup records, one per id
                    let part_name_bytes = part_name.as_bytes().to_vec();
                    match ids {
                        BlockIds::None => {}
                        BlockIds::Sync(id) => ops.push(Op::Create {
                            path: paths.block(id),
                            data: part_name_bytes.clone(),
                            mode: CreateMode::Persistent,
                        }),
                        BlockIds::Async(list) => {
                            for id in list {
                                ops.push(Op::Create {
                                    path: paths.async_block(id),
                                    data: part_name_bytes.clone(),
                                    mode: CreateMode::Persistent,
                                });
                            }
                        }
                    }

                    lock = Some(number_lock);
                }
            }

            // registration of the part in this replica's subtree
            ops.push(Op::Create {
                path: paths.replica_part(replica, &part.info().name()),
                data: part.checksum().as_bytes().to_vec(),
                mode: CreateMode::Persistent,
            });

            let mut txn = PartTransaction::new(store);
            let renamed = store.rename_temp_and_add(part, &mut txn)?;
            if !renamed {
                if is_existing_part {
                    info!(
                        part_name = %part.info().name(),
                        "part already written by a concurrent request or fetched; ignoring"
                    );
                    self.table.metrics().duplicated_inserts.inc(1);
                    return Ok(CommitOutcome::committed(true));
                }
                return LogicSnafu {
                    message: format!(
                        "part {} is already written by a concurrent request; unique names are \
                         assigned to non-duplicate parts",
                        part.info().name()
                    ),
                }
                .fail();
            }

            if let Err(e) = store.lock_shared_data(&part.info().name()) {
                store.rename_to_temporary(part, &mut txn);
                return Err(e);
            }

            match client.multi(ops.clone()) {
                Ok(_) => {
                    txn.commit();
                    store.notify_merge_selection();
                    if let Some(mut lock) = lock {
                        lock.assume_unlocked();
                    }
                    committed_part_name = Some(part.info().name());
                    break;
                }

                Err(MultiError {
                    source,
                    failed_op_index,
                }) if source.kind == ErrorKind::NoNode
                    && failed_op_index.is_some()
                    && failed_op_index == block_unlock_op_idx =>
                {
                    // the block-number lock vanished under us: a concurrent
                    // partition operation cancelled this insert
                    let lock_path = lock
                        .as_ref()
                        .map(|l| l.path().to_owned())
                        .unwrap_or_default();
                    if let Some(mut lock) = lock {
                        lock.assume_unlocked();
                    }
                    return QueryWasCancelledSnafu {
                        reason: format!(
                            "block number lock {lock_path} was removed by a concurrent partition \
                             operation"
                        ),
                    }
                    .fail();
                }

                Err(MultiError { source, .. }) if source.is_hardware() => {
                    // The connection broke and the transaction may have
                    // applied: the block may already be in `blocks/`, so the
                    // local part cannot be dropped. Keep it and resolve on
                    // the next iteration.
                    txn.commit();
                    committed_locally_unknown = true;
                    if !check_hook_registered {
                        let queue = self.table.part_check_queue().clone();
                        let part_name = part.info().name();
                        attempts.on_last_failure(move || queue.enqueue(&part_name));
                        check_hook_registered = true;
                    }
                    last_hardware_error = Some(source);
                    // drop the lock handle without assuming: if the
                    // transaction did not apply, this releases the number
                    drop(lock);
                    if attempt.is_last {
                        attempts.exhausted();
                        return UnknownStatusOfInsertSnafu {
                            part_name: part.info().name(),
                            reason: last_hardware_error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_default(),
                        }
                        .fail();
                    }
                    continue;
                }

                Err(MultiError {
                    source,
                    failed_op_index,
                }) => {
                    let failed_path = failed_op_index
                        .map(|index| ops[index].path().to_owned())
                        .unwrap_or_default();

                    if source.kind == ErrorKind::NodeExists && ids.dedup_enabled() {
                        if let Some(conflict_id) = guard_conflict_id(ids, paths, &failed_path) {
                            // the id appeared between our guard check and
                            // the commit; the part goes back to temporary
                            info!(
                                conflict_id = %conflict_id,
                                part_name = %part.info().name(),
                                "block id appeared concurrently; renaming part back and retrying"
                            );
                            store.rename_to_temporary(part, &mut txn);
                            drop(lock);

                            match strategy.on_commit_collision(conflict_id) {
                                Collision::Conflicts(conflicts) => {
                                    return Ok(CommitOutcome::conflicting(conflicts));
                                }
                                Collision::RetryLoop => {
                                    dedup_loop_counter += 1;
                                    if dedup_loop_counter >= MAX_DEDUP_LOOP_ITERATIONS {
                                        self.table.metrics().duplicated_inserts.inc(1);
                                        return DuplicateDataPartSnafu {
                                            part_name: part.info().name(),
                                        }
                                        .fail();
                                    }
                                    attempts.grant_extra_attempt();
                                    continue;
                                }
                            }
                        }
                    }

                    if source.kind == ErrorKind::NodeExists
                        && quorum_status_path.as_deref() == Some(failed_path.as_str())
                    {
                        // another quorum insert started between our
                        // precondition and the commit
                        store.unlock_shared_data(&part.info().name());
                        store.rename_to_temporary(part, &mut txn);
                        drop(lock);
                        return UnsatisfiedPreviousQuorumSnafu {
                            status: "another quorum insert has already been started".to_owned(),
                        }
                        .fail();
                    }

                    store.unlock_shared_data(&part.info().name());
                    txn.rollback();
                    drop(lock);
                    return Err(source).context(UnexpectedCoordinatorSnafu);
                }
            }
        }

        let Some(part_name) = committed_part_name else {
            return LogicSnafu {
                message: "commit retry loop ended without an outcome",
            }
            .fail();
        };
        self.table.metrics().committed_parts.inc(1);

        if let QuorumPrecondition::Enabled {
            is_active_version, ..
        } = precondition
        {
            self.wait_for_commit_quorum(&part_name, *is_active_version, is_existing_part)?;
        }

        Ok(CommitOutcome::committed(false))
    }

    /// The post-commit quorum wait, retried against transient coordinator
    /// faults.
    fn wait_for_commit_quorum(
        &self,
        part_name: &str,
        is_active_version: i32,
        is_existing_part: bool,
    ) -> Result<()> {
        let paths = self.table.paths();
        let replica = self.table.replica_name();
        let quorum_path = if self.quorum.parallel {
            paths.quorum_parallel_part(part_name)
        } else {
            paths.quorum_status()
        };

        retry_loop("wait_for_quorum", self.retries, |_attempt| {
            if self.table.is_readonly() {
                return Verdict::Fatal(Error::TableReadonly {
                    replica_path: paths.replica(replica),
                });
            }
            let client = match self.table.session().client() {
                Ok(client) => client,
                Err(source) => return Verdict::Fatal(Error::NoCoordinatorSession { source }),
            };

            if is_existing_part {
                // we hold a duplicate without fetching, so we count toward
                // the quorum; the tracker may be parallel or serial
                let update = match client.exists(&paths.quorum_parallel_part(part_name)) {
                    Ok(Some(_)) => {
                        update_quorum(client.as_ref(), paths, replica, part_name, true)
                    }
                    Ok(None) => match client.exists(&paths.quorum_status()) {
                        Ok(Some(_)) => {
                            update_quorum(client.as_ref(), paths, replica, part_name, false)
                        }
                        Ok(None) => Ok(()),
                        Err(e) if e.is_hardware() => {
                            return Verdict::Retry(Error::Coordinator { source: e })
                        }
                        Err(e) => {
                            return Verdict::Fatal(Error::UnexpectedCoordinatorError { source: e })
                        }
                    },
                    Err(e) if e.is_hardware() => {
                        return Verdict::Retry(Error::Coordinator { source: e })
                    }
                    Err(e) => {
                        return Verdict::Fatal(Error::UnexpectedCoordinatorError { source: e })
                    }
                };
                match update {
                    Ok(()) => {}
                    Err(Error::Coordinator { source }) if source.is_hardware() => {
                        return Verdict::Retry(Error::Coordinator { source })
                    }
                    Err(e) => return Verdict::Fatal(e),
                }
            }

            match wait_for_quorum(
                client.as_ref(),
                paths,
                replica,
                part_name,
                &quorum_path,
                is_active_version,
                self.quorum.timeout,
            ) {
                Ok(()) => Verdict::Done(()),
                Err(e) => Verdict::Fatal(e),
            }
        })
    }
}
