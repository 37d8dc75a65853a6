//! The replicated write path: ingest a batch of rows for a replicated table,
//! materialize it as an on-disk part, and commit its existence atomically
//! through the coordination service so that every replica eventually holds
//! the same part under the same name.
//!
//! The pieces, in data-flow order:
//!
//! - [`writer`]: splits a batch by partition and writes each partition to a
//!   temporary on-disk part.
//! - [`dedup`]: computes content-addressed block ids, filters self-duplicate
//!   sub-blocks and prefilters against a cached recent-ids view.
//! - [`commit`] (internal): allocates the block number, assembles and
//!   submits the multi-op coordinator transaction, and drives bounded retry
//!   with partial-failure recovery.
//! - [`quorum`]: the quorum precondition and the post-commit quorum wait.
//! - [`sink`]: the public [`ReplicatedSink`](sink::ReplicatedSink) tying it
//!   together per batch.
//!
//! [`table::TableReplica`] carries the per-replica state all of the above
//! share: coordinator paths, the local part store, the session handle and
//! the background part-check queue.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

mod commit;
pub mod dedup;
mod paths;
pub mod parts;
pub mod quorum;
pub mod sink;
pub mod table;
pub mod writer;

pub use paths::TablePaths;

/// Errors of the replicated write path.
#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "Number of alive replicas ({alive}) is less than requested quorum ({required}/{replicas})"
    ))]
    TooFewLiveReplicas {
        alive: usize,
        required: usize,
        replicas: usize,
    },

    #[snafu(display("Quorum for previous write has not been satisfied yet. Status: {status}"))]
    UnsatisfiedPreviousQuorum { status: String },

    #[snafu(display("Replica is not active right now"))]
    Readonly,

    #[snafu(display("Table is in readonly mode: replica_path={replica_path}"))]
    TableReadonly { replica_path: String },

    #[snafu(display("No coordinator session: {source}"))]
    NoCoordinatorSession { source: coordinator::Error },

    #[snafu(display(
        "Unknown status of insert for part {part_name}, client must retry. Reason: {reason}"
    ))]
    UnknownStatusOfInsert { part_name: String, reason: String },

    #[snafu(display("Timeout while waiting for quorum on part {part_name}"))]
    TimeoutExceeded { part_name: String },

    #[snafu(display("Replica became inactive while waiting for quorum"))]
    NoActiveReplicas,

    #[snafu(display("Insert was cancelled: {reason}"))]
    QueryWasCancelled { reason: String },

    #[snafu(display(
        "Too many transaction retries while committing part {part_name}, block id collided repeatedly"
    ))]
    DuplicateDataPart { part_name: String },

    #[snafu(display("Unexpected coordinator error while committing: {source}"))]
    UnexpectedCoordinatorError { source: coordinator::Error },

    #[snafu(display("Coordinator unavailable: {source}"))]
    Coordinator { source: coordinator::Error },

    #[snafu(display("Logic error: {message}"))]
    Logic { message: String },

    #[snafu(display("Batch covers {partitions} partitions, more than the allowed {max}"))]
    TooManyPartitions { partitions: usize, max: usize },

    #[snafu(display("Partition column {column} is unusable for partitioning: {reason}"))]
    PartitionColumn { column: String, reason: String },

    #[snafu(display("Unable to write part data at {}: {source}", path.display()))]
    PartWrite {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("Unable to read part data at {}: {source}", path.display()))]
    PartRead {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("Part data at {} is corrupt: {reason}", path.display()))]
    PartCorrupt { path: PathBuf, reason: String },

    #[snafu(display("Invalid batch: {source}"))]
    Batch { source: mutable_batch::Error },

    #[snafu(display("Invalid part name: {source}"))]
    PartName { source: data_types::PartInfoError },

    #[snafu(display("Undecodable coordinator record: {source}"))]
    EntryDecode { source: data_types::EntryDecodeError },

    #[snafu(display("Unable to lock shared data for part {part_name}"))]
    SharedDataLock { part_name: String },
}

/// A specialized `Result` for write-path errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requests cancellation of a sink invocation.
///
/// Cancellation is honored between retry iterations only; a pending temp
/// part is reverted to a temporary name for the background GC.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token with no cancellation requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
