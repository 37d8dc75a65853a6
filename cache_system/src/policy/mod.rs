//! Eviction policies that keep and manage cached entries.
//!
//! A policy is only ever called under the cache lock, so implementations are
//! single-threaded and take `&mut self`.

use std::{fmt::Debug, sync::Arc};

pub mod lru;
pub mod slru;

/// Declares the weight of a value. The weight of a cached value MUST NOT
/// change while it is cached.
pub trait Weigher<K, V>: Debug + Send + Sync + 'static {
    /// The weight of `v` stored under `k`.
    fn weigh(&self, k: &K, v: &V) -> u64;
}

/// Weighs every entry as 1, turning the size limit into an entry-count limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitWeigher;

impl<K, V> Weigher<K, V> for UnitWeigher {
    fn weigh(&self, _k: &K, _v: &V) -> u64 {
        1
    }
}

/// Callback invoked with the total weight of entries dropped by an eviction
/// pass.
pub type OnWeightLoss = Box<dyn Fn(u64) + Send + 'static>;

/// Storage + eviction capability behind the cache.
///
/// Limits of zero mean "unbounded" for both weight and count.
pub trait CachePolicy<K, V>: Debug + Send + 'static {
    /// Get the value for `k`, marking it as used.
    fn get(&mut self, k: &K) -> Option<Arc<V>>;

    /// Like [`get`](Self::get) but also returns the stored key.
    fn get_with_key(&mut self, k: &K) -> Option<(K, Arc<V>)>;

    /// Insert or replace `k`. May evict other entries, or even `v` itself if
    /// it alone exceeds the configured size.
    fn set(&mut self, k: K, v: Arc<V>);

    /// Remove `k` if present.
    fn remove(&mut self, k: &K);

    /// Drop all entries.
    fn reset(&mut self);

    /// All entries, least recently used first.
    fn dump(&self) -> Vec<(K, Arc<V>)>;

    /// Total weight of all entries.
    fn weight(&self) -> u64;

    /// Number of entries.
    fn count(&self) -> usize;

    /// The configured weight limit.
    fn max_size(&self) -> u64;

    /// Change the weight limit, evicting as needed.
    fn set_max_size(&mut self, max_size: u64);

    /// Change the entry-count limit, evicting as needed.
    fn set_max_count(&mut self, max_count: usize);
}
