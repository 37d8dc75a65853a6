//! The replicated insert sink.
//!
//! One sink instance serves a stream of batches for one table replica. A
//! sink is not itself safe against parallel invocation; callers serialize
//! their writes, and ordering across sinks is whatever the coordinator's
//! sequential log provides.

use crate::{
    commit::{AsyncDedup, Committer, SyncDedup},
    dedup::{async_block_ids, content_id, AsyncBlockIdsCache, BlockIds},
    parts::{PartStore, TempPart},
    quorum::{check_quorum_precondition, QuorumConfig, QuorumPrecondition},
    table::TableReplica,
    writer::{
        split_into_partition_blocks, write_temp_part, MetadataSnapshot, PartitionBlock,
    },
    BatchSnafu, CancellationToken, Error, LogicSnafu, NoCoordinatorSessionSnafu, Result,
};
use coordinator::retries::{retry_loop, RetryConfig, Verdict};
use data_types::token_block_id;
use mutable_batch::{Batch, ChunkOffsets};
use observability_deps::tracing::{debug, trace};
use snafu::ResultExt;
use std::{collections::HashMap, sync::Arc};

/// Behavior knobs of one sink instance.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Quorum behavior.
    pub quorum: QuorumConfig,
    /// Retry budget of every coordinator-touching phase.
    pub retries: RetryConfig,
    /// At most this many distinct partitions per batch; zero lifts the
    /// limit.
    pub max_parts_per_block: usize,
    /// Flush queued partitions early once their accumulated write streams
    /// exceed this cap.
    pub max_delayed_streams: usize,
    /// Master switch for synchronous deduplication.
    pub deduplicate: bool,
    /// Overrides content hashing as the dedup key: each block gets the id
    /// `token_seqnum`. `Some("")` disables deduplication for the statement.
    pub dedup_token: Option<String>,
    /// Hold prepared partitions until [`ReplicatedSink::finish`] instead of
    /// committing within [`ReplicatedSink::write`]; lets callers observe
    /// duplicate status before dependent replay.
    pub defer_commit: bool,
    /// Log `AttachPart` entries (carrying checksums) instead of `GetPart`.
    pub is_attach: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            quorum: QuorumConfig::disabled(),
            retries: RetryConfig::default(),
            max_parts_per_block: 100,
            max_delayed_streams: 1000,
            deduplicate: true,
            dedup_token: None,
            defer_commit: false,
            is_attach: false,
        }
    }
}

/// What one [`ReplicatedSink::write`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Number of partition parts prepared from the batch.
    pub produced: usize,
    /// Replica count observed by the quorum precondition; 0 when quorum is
    /// disabled.
    pub replicas_num: usize,
}

/// A prepared partition awaiting commit.
#[derive(Debug)]
struct DelayedPartition {
    temp_part: TempPart,
    batch: Batch,
    /// Sub-block boundaries; empty in sync mode.
    offsets: Vec<usize>,
    ids: BlockIds,
}

impl DelayedPartition {
    /// Drop all but one member of every group of sub-blocks sharing an id.
    /// Returns whether anything was dropped, in which case the temp part
    /// must be rewritten from the filtered rows.
    fn filter_self_duplicates(&mut self) -> Result<bool> {
        let BlockIds::Async(ids) = &self.ids else {
            return Ok(false);
        };

        let mut counts: HashMap<&String, usize> = HashMap::new();
        for id in ids {
            *counts.entry(id).or_default() += 1;
        }
        let duplicate_ids: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id.clone())
            .collect();
        if duplicate_ids.is_empty() {
            return Ok(false);
        }

        self.filter_sub_blocks(&duplicate_ids, true)?;
        Ok(true)
    }

    /// Remove the sub-blocks whose ids are listed, rebuilding rows, offsets
    /// and ids.
    ///
    /// With `self_dedup` the first member of each listed group is kept: the
    /// coordinator may or may not already hold the id, so one member must
    /// survive to find out. Without it every member goes, the id is known
    /// committed.
    fn filter_sub_blocks(&mut self, drop_ids: &[String], self_dedup: bool) -> Result<()> {
        let BlockIds::Async(ids) = &self.ids else {
            return LogicSnafu {
                message: "sub-block filtering requires async dedup ids",
            }
            .fail();
        };

        let mut groups: HashMap<&String, Vec<usize>> = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            groups.entry(id).or_default().push(index);
        }

        let mut drop_indexes: Vec<usize> = Vec::new();
        for id in drop_ids {
            let Some(indexes) = groups.get(id) else {
                return LogicSnafu {
                    message: format!("unknown conflicting block id {id}"),
                }
                .fail();
            };
            drop_indexes.extend(indexes.iter().copied().skip(self_dedup as usize));
        }
        drop_indexes.sort_unstable();
        drop_indexes.dedup();

        let mut keep = vec![true; self.batch.rows()];
        let mut new_ids = Vec::new();
        let mut new_offsets = Vec::new();
        let mut removed_rows = 0;
        let mut drop_iter = drop_indexes.iter().peekable();
        let mut start = 0;
        for (index, &end) in self.offsets.iter().enumerate() {
            if drop_iter.peek() == Some(&&index) {
                drop_iter.next();
                for row in start..end {
                    keep[row] = false;
                }
                removed_rows += end - start;
            } else {
                new_offsets.push(end - removed_rows);
                new_ids.push(ids[index].clone());
            }
            start = end;
        }

        trace!(
            new_size = new_offsets.len(),
            "filtered sub-blocks, new offsets: {new_offsets:?}"
        );

        self.batch = self.batch.filter(&keep).context(BatchSnafu)?;
        self.offsets = new_offsets;
        self.ids = BlockIds::Async(new_ids);
        Ok(())
    }
}

#[derive(Debug)]
enum SinkMode {
    Sync {
        /// Ordinal appended to the caller's dedup token, one per block
        /// produced from this statement.
        dedup_seqnum: u64,
    },
    Async {
        ids_cache: Arc<AsyncBlockIdsCache>,
    },
}

/// Ingests batches for one replicated table, committing each produced part
/// through the coordinator.
#[derive(Debug)]
pub struct ReplicatedSink {
    table: Arc<TableReplica>,
    config: SinkConfig,
    mode: SinkMode,
    delayed: Vec<DelayedPartition>,
    delayed_precondition: Option<QuorumPrecondition>,
    last_block_is_duplicate: bool,
    cancel: CancellationToken,
}

impl ReplicatedSink {
    /// A sink for synchronous inserts.
    pub fn new_sync(table: Arc<TableReplica>, config: SinkConfig) -> Self {
        Self {
            table,
            config,
            mode: SinkMode::Sync { dedup_seqnum: 0 },
            delayed: Vec::new(),
            delayed_precondition: None,
            last_block_is_duplicate: false,
            cancel: CancellationToken::new(),
        }
    }

    /// A sink for asynchronous inserts, prefiltering against `ids_cache`.
    pub fn new_async(
        table: Arc<TableReplica>,
        config: SinkConfig,
        ids_cache: Arc<AsyncBlockIdsCache>,
    ) -> Self {
        Self {
            table,
            config,
            mode: SinkMode::Async { ids_cache },
            delayed: Vec::new(),
            delayed_precondition: None,
            last_block_is_duplicate: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the most recently committed batch ended in a duplicate
    /// block. Dependent-view replay keys off this.
    pub fn last_block_is_duplicate(&self) -> bool {
        self.last_block_is_duplicate
    }

    /// A token cancelling this sink between retry iterations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ingest one batch: check the quorum precondition, split by partition,
    /// write temp parts, compute dedup ids and (unless deferred) commit.
    ///
    /// Async sinks must pass the batch's sub-block boundaries; sync sinks
    /// must not.
    pub fn write(&mut self, batch: Batch, offsets: Option<ChunkOffsets>) -> Result<WriteOutcome> {
        self.table
            .session()
            .live_client()
            .context(NoCoordinatorSessionSnafu)?;

        match (&self.mode, &offsets) {
            (SinkMode::Async { .. }, None) => {
                return LogicSnafu {
                    message: "async inserts require chunk offsets",
                }
                .fail()
            }
            (SinkMode::Sync { .. }, Some(_)) => {
                return LogicSnafu {
                    message: "sync inserts do not carry chunk offsets",
                }
                .fail()
            }
            _ => {}
        }

        let precondition = self.check_precondition()?;

        let blocks = split_into_partition_blocks(
            &batch,
            offsets.as_ref(),
            self.table.metadata(),
            self.config.max_parts_per_block,
        )?;

        let mut produced = 0;
        let mut streams = 0;
        for block in blocks {
            let temp_part = write_temp_part(self.table.store(), &block, self.table.metadata())?;
            let ids = self.assign_block_ids(&block);

            match &ids {
                BlockIds::Sync(id) => debug!(
                    block_id = %id,
                    rows = block.batch.rows(),
                    "wrote block"
                ),
                BlockIds::Async(ids) => trace!(
                    partition_id = %block.partition_id,
                    ids = ids.len(),
                    offsets = block.offsets.len(),
                    "wrote async block"
                ),
                BlockIds::None => debug!(rows = block.batch.rows(), "wrote block"),
            }

            // bound the temp-part disk and stream footprint of this batch
            streams += temp_part.streams();
            if streams > self.config.max_delayed_streams && !self.delayed.is_empty() {
                debug!(streams, "delayed stream cap exceeded, committing early");
                self.flush_delayed(&precondition)?;
                streams = temp_part.streams();
            }

            self.delayed.push(DelayedPartition {
                temp_part,
                batch: block.batch,
                offsets: block.offsets,
                ids,
            });
            produced += 1;
        }

        if self.config.defer_commit {
            self.delayed_precondition = Some(precondition.clone());
        } else {
            self.flush_delayed(&precondition)?;
        }

        Ok(WriteOutcome {
            produced,
            replicas_num: precondition.replicas_num(),
        })
    }

    /// Commit whatever [`write`](Self::write) deferred.
    pub fn finish(&mut self) -> Result<()> {
        if self.delayed.is_empty() {
            return Ok(());
        }
        self.table
            .session()
            .live_client()
            .context(NoCoordinatorSessionSnafu)?;

        let precondition = match self.delayed_precondition.take() {
            Some(precondition) => precondition,
            None => self.check_precondition()?,
        };
        self.flush_delayed(&precondition)
    }

    /// Commit an already materialized part, e.g. while attaching or
    /// restoring. No deduplication, no delay; tolerated in readonly mode.
    pub fn write_existing_part(&mut self, mut part: TempPart) -> Result<()> {
        let client = self
            .table
            .session()
            .live_client()
            .context(NoCoordinatorSessionSnafu)?;

        let precondition = check_quorum_precondition(
            client.as_ref(),
            self.table.paths(),
            self.table.replica_name(),
            &self.config.quorum,
        )?;

        let committer = Committer {
            table: self.table.as_ref(),
            retries: &self.config.retries,
            quorum: &self.config.quorum,
            is_attach: true,
            writing_existing_part: true,
            cancel: &self.cancel,
        };
        let outcome =
            committer.commit_part(&mut part, &BlockIds::None, &precondition, &mut SyncDedup)?;
        self.last_block_is_duplicate = outcome.deduplicated;
        Ok(())
    }

    fn check_precondition(&self) -> Result<QuorumPrecondition> {
        retry_loop(
            "check_quorum_precondition",
            &self.config.retries,
            |_attempt| {
                let client = match self.table.session().client() {
                    Ok(client) => client,
                    Err(source) => return Verdict::Fatal(Error::NoCoordinatorSession { source }),
                };
                match check_quorum_precondition(
                    client.as_ref(),
                    self.table.paths(),
                    self.table.replica_name(),
                    &self.config.quorum,
                ) {
                    Ok(precondition) => Verdict::Done(precondition),
                    Err(Error::Coordinator { source }) if source.is_hardware() => {
                        Verdict::Retry(Error::Coordinator { source })
                    }
                    Err(e) => Verdict::Fatal(e),
                }
            },
        )
    }

    fn assign_block_ids(&mut self, block: &PartitionBlock) -> BlockIds {
        match &mut self.mode {
            SinkMode::Async { .. } => BlockIds::Async(async_block_ids(
                &block.partition_id,
                &block.batch,
                &block.offsets,
            )),
            SinkMode::Sync { dedup_seqnum } => {
                if !self.config.deduplicate {
                    return BlockIds::None;
                }
                match self.config.dedup_token.as_deref() {
                    // an empty token disables dedup for the statement
                    Some("") => BlockIds::None,
                    Some(token) => {
                        // multiple blocks can come out of one statement; the
                        // ordinal keeps their ids distinct
                        let id =
                            token_block_id(&block.partition_id, &format!("{token}_{dedup_seqnum}"));
                        *dedup_seqnum += 1;
                        BlockIds::Sync(id)
                    }
                    None => BlockIds::Sync(content_id(
                        &block.partition_id,
                        &block.batch,
                        0..block.batch.rows(),
                    )),
                }
            }
        }
    }

    fn flush_delayed(&mut self, precondition: &QuorumPrecondition) -> Result<()> {
        if self.delayed.is_empty() {
            return Ok(());
        }
        self.last_block_is_duplicate = false;
        let partitions = std::mem::take(&mut self.delayed);

        let committer = Committer {
            table: self.table.as_ref(),
            retries: &self.config.retries,
            quorum: &self.config.quorum,
            is_attach: self.config.is_attach,
            writing_existing_part: false,
            cancel: &self.cancel,
        };
        let store = self.table.store();
        let metadata = self.table.metadata();

        match &mut self.mode {
            SinkMode::Sync { .. } => {
                for mut partition in partitions {
                    partition.temp_part.finalize()?;
                    let outcome = committer.commit_part(
                        &mut partition.temp_part,
                        &partition.ids,
                        precondition,
                        &mut SyncDedup,
                    )?;
                    self.last_block_is_duplicate |= outcome.deduplicated;
                    if outcome.deduplicated {
                        partition.temp_part.remove();
                    }
                }
            }

            SinkMode::Async { ids_cache } => {
                for mut partition in partitions {
                    // users often submit identical inserts back to back;
                    // purging them up front saves a coordinator round trip
                    if partition.filter_self_duplicates()? {
                        trace!("found duplicated inserts in the block");
                        rewrite_temp_part(store, metadata, &mut partition)?;
                    }

                    // the recent-ids snapshot version carries across the
                    // retries of this partition only
                    let mut cache_version = 0u64;
                    let mut retry_times = 0;
                    loop {
                        partition.temp_part.finalize()?;
                        let mut strategy = AsyncDedup {
                            cache: ids_cache.as_ref(),
                            cache_version: &mut cache_version,
                        };
                        let outcome = committer.commit_part(
                            &mut partition.temp_part,
                            &partition.ids,
                            precondition,
                            &mut strategy,
                        )?;
                        if outcome.conflicts.is_empty() {
                            break;
                        }

                        retry_times += 1;
                        debug!(
                            conflicts = outcome.conflicts.len(),
                            retry_times, "found duplicate block ids, filtering and retrying"
                        );
                        partition.filter_sub_blocks(&outcome.conflicts, false)?;
                        if partition.ids.ids().is_empty() {
                            partition.temp_part.remove();
                            break;
                        }
                        rewrite_temp_part(store, metadata, &mut partition)?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Rewrite a partition's temp part from its (filtered) rows, discarding the
/// previous on-disk artifact.
fn rewrite_temp_part(
    store: &PartStore,
    metadata: &MetadataSnapshot,
    partition: &mut DelayedPartition,
) -> Result<()> {
    let block = PartitionBlock {
        partition_id: partition.temp_part.info().partition_id.clone(),
        batch: partition.batch.clone(),
        offsets: partition.offsets.clone(),
    };
    let rewritten = write_temp_part(store, &block, metadata)?;
    let old = std::mem::replace(&mut partition.temp_part, rewritten);
    old.remove();
    Ok(())
}
