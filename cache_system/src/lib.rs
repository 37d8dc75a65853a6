//! Bounded, concurrent, associative cache.
//!
//! Used across the engine for mark files, uncompressed blocks, query results
//! and index pages. Two pieces compose:
//!
//! - [`Cache`]: the thread-safe front-end. [`Cache::get_or_build`] gives the
//!   at-most-one-build guarantee under concurrent misses (the "stampede"
//!   guarantee) via per-key insert tokens.
//! - [`policy`]: pluggable storage + eviction behind the front-end, with
//!   plain LRU and segmented LRU implementations and caller-supplied entry
//!   weighing.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod cache;
pub mod policy;

pub use cache::{Cache, CacheStats};
pub use policy::{
    lru::Lru,
    slru::{Slru, SlruConfig},
    CachePolicy, OnWeightLoss, UnitWeigher, Weigher,
};
