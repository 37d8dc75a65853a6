//! Shared data types for the replicated write path: part names, block
//! identifiers, replication log entries and quorum tracker entries.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod block_id;
mod log_entry;
mod part;
mod quorum;

pub use block_id::{block_hasher, content_block_id, format_block_id, token_block_id};
pub use log_entry::{EntryDecodeError, LogEntry, LogEntryType};
pub use part::{PartFormat, PartInfo, PartInfoError};
pub use quorum::QuorumEntry;
