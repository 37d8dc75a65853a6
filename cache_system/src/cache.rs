//! The concurrent cache front-end, see [`Cache`].

use crate::policy::CachePolicy;
use hashbrown::HashMap;
use metric::U64Counter;
use observability_deps::tracing::trace;
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

/// Hit/miss counters of a [`Cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of gets answered from the cache.
    pub hits: u64,
    /// Number of gets that found nothing, including every get-or-build that
    /// ran its build closure.
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: Option<U64Counter>,
    misses: Option<U64Counter>,
}

/// A pending insertion attempt for one key.
///
/// Exists only while at least one caller is trying to build a value for the
/// key. The token's own mutex serializes the builders; the reference count is
/// only ever touched under the cache lock.
#[derive(Debug)]
struct InsertToken<V> {
    state: Mutex<TokenState<V>>,
    refcount: AtomicUsize,
}

impl<V> InsertToken<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(TokenState {
                value: None,
                cleaned_up: false,
            }),
            refcount: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
struct TokenState<V> {
    value: Option<Arc<V>>,
    cleaned_up: bool,
}

#[derive(Debug)]
struct CacheState<K, V> {
    policy: Box<dyn CachePolicy<K, V>>,
    pending: HashMap<K, Arc<InsertToken<V>>>,
}

/// Thread-safe associative cache with stampede-safe value production.
///
/// Values are owned by the cache and handed out as shared read-only handles
/// that stay valid after the slot is evicted. The eviction policy is
/// pluggable, see [`crate::policy`].
///
/// # Lock ordering
///
/// The cache lock is never held while acquiring a token lock; a token lock
/// may be held while acquiring the cache lock.
#[derive(Debug)]
pub struct Cache<K, V> {
    state: Mutex<CacheState<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: CacheMetrics,
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Debug + Send + Sync + 'static,
{
    /// Create a cache evicting through `policy`.
    pub fn new(policy: Box<dyn CachePolicy<K, V>>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                policy,
                pending: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: CacheMetrics::default(),
        }
    }

    /// Additionally report hits and misses to `registry`, attributed to
    /// `name`.
    pub fn with_metrics(mut self, name: &'static str, registry: &metric::Registry) -> Self {
        let hits = registry
            .register_metric::<U64Counter>("cache_hits", "cache gets answered from the cache")
            .recorder(&[("name", name)]);
        let misses = registry
            .register_metric::<U64Counter>("cache_misses", "cache gets that found nothing")
            .recorder(&[("name", name)]);
        self.metrics = CacheMetrics {
            hits: Some(hits),
            misses: Some(misses),
        };
        self
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.metrics.hits {
            counter.inc(1);
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.metrics.misses {
            counter.inc(1);
        }
    }

    /// Get the cached value for `key`, if any. Never builds.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let res = self.state.lock().policy.get(key);
        match &res {
            Some(_) => self.record_hit(),
            None => self.record_miss(),
        }
        res
    }

    /// Like [`get`](Self::get) but also returns the stored key.
    pub fn get_with_key(&self, key: &K) -> Option<(K, Arc<V>)> {
        let res = self.state.lock().policy.get_with_key(key);
        match &res {
            Some(_) => self.record_hit(),
            None => self.record_miss(),
        }
        res
    }

    /// Insert or replace `key`. May trigger eviction.
    pub fn set(&self, key: K, value: V) {
        self.state.lock().policy.set(key, Arc::new(value));
    }

    /// If a value for `key` is cached, return it. Otherwise call `build` to
    /// produce it, cache the result and return it.
    ///
    /// Among concurrent callers for the same key, only one runs its `build`;
    /// the others block on the key's insert token and reuse the produced
    /// value. Build failures propagate to their own caller only: the next
    /// waiter retries with its own `build`.
    ///
    /// The returned flag is true iff this call's `build` produced the value
    /// that got cached.
    pub fn get_or_build<E>(
        &self,
        key: K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<(Arc<V>, bool), E> {
        let token = {
            let mut state = self.state.lock();
            if let Some(v) = state.policy.get(&key) {
                self.record_hit();
                return Ok((v, false));
            }

            let token = Arc::clone(
                state
                    .pending
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(InsertToken::new())),
            );
            // protected by the cache lock held here
            token.refcount.fetch_add(1, Ordering::Relaxed);
            token
        };

        let mut holder = TokenHolder {
            cache: self,
            key: &key,
            token: &token,
            cleaned_up: false,
        };

        let mut token_state = token.state.lock();
        holder.cleaned_up = token_state.cleaned_up;

        if let Some(v) = &token_state.value {
            // another caller produced the value while we waited for the token
            let v = Arc::clone(v);
            drop(token_state);
            self.record_hit();
            return Ok((v, false));
        }

        self.record_miss();
        trace!(?key, "cache miss, building value");

        let value = match build() {
            Ok(v) => Arc::new(v),
            Err(e) => {
                // leave the token empty so the next waiter retries its build
                drop(token_state);
                return Err(e);
            }
        };
        token_state.value = Some(Arc::clone(&value));

        let mut state = self.state.lock();

        // Insert only if the token is still the registered one for the key; a
        // concurrent reset() may have cleared the pending map.
        let produced = match state.pending.get(&key) {
            Some(current) if Arc::ptr_eq(current, &token) => {
                state.policy.set(key.clone(), Arc::clone(&value));
                true
            }
            _ => false,
        };

        if !token_state.cleaned_up {
            holder.detach(&mut state, &mut token_state);
        }
        drop(state);
        drop(token_state);

        Ok((value, produced))
    }

    /// Remove `key` if present. Does not abort an in-flight build for the
    /// key.
    pub fn remove(&self, key: &K) {
        self.state.lock().policy.remove(key);
    }

    /// Drop all entries, pending insert tokens and counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.policy.reset();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Total weight of all entries.
    pub fn weight(&self) -> u64 {
        self.state.lock().policy.weight()
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.state.lock().policy.count()
    }

    /// The configured weight limit.
    pub fn max_size(&self) -> u64 {
        self.state.lock().policy.max_size()
    }

    /// Change the weight limit, evicting as needed.
    pub fn set_max_size(&self, max_size: u64) {
        self.state.lock().policy.set_max_size(max_size);
    }

    /// Change the entry-count limit, evicting as needed.
    pub fn set_max_count(&self, max_count: usize) {
        self.state.lock().policy.set_max_count(max_count);
    }

    /// All entries, least recently used first.
    pub fn dump(&self) -> Vec<(K, Arc<V>)> {
        self.state.lock().policy.dump()
    }

    /// Hit/miss counters since construction or the last [`reset`](Self::reset).
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Joint owner of the cache handle and one insert-token reference.
///
/// Among several concurrent builders the first successful one detaches the
/// token from the pending map; if all of them fail, the last one to leave
/// does. Either way the token never outlives its builders, and it holds no
/// back-reference to the cache.
struct TokenHolder<'a, K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Debug + Send + Sync + 'static,
{
    cache: &'a Cache<K, V>,
    key: &'a K,
    token: &'a Arc<InsertToken<V>>,
    cleaned_up: bool,
}

impl<K, V> TokenHolder<'_, K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Debug + Send + Sync + 'static,
{
    /// Remove the token from the pending map. Both locks must be held.
    fn detach(&mut self, state: &mut CacheState<K, V>, token_state: &mut TokenState<V>) {
        if let Some(current) = state.pending.get(self.key) {
            if Arc::ptr_eq(current, self.token) {
                state.pending.remove(self.key);
            }
        }
        token_state.cleaned_up = true;
        self.cleaned_up = true;
    }
}

impl<K, V> Drop for TokenHolder<'_, K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }

        let mut token_state = self.token.state.lock();
        if token_state.cleaned_up {
            return;
        }

        let mut state = self.cache.state.lock();
        // protected by the cache lock held here; the count can only reach
        // zero while both locks are held
        if self.token.refcount.fetch_sub(1, Ordering::Relaxed) == 1 {
            if let Some(current) = state.pending.get(self.key) {
                if Arc::ptr_eq(current, self.token) {
                    state.pending.remove(self.key);
                }
            }
            token_state.cleaned_up = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{lru::Lru, UnitWeigher};

    fn unbounded() -> Cache<u8, String> {
        Cache::new(Box::new(Lru::new(0, 0, Arc::new(UnitWeigher))))
    }

    #[test]
    fn test_get_set() {
        let cache = unbounded();

        assert!(cache.get(&1).is_none());
        cache.set(1, "one".to_owned());
        assert_eq!(cache.get(&1).as_deref(), Some(&"one".to_owned()));

        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_get_or_build_caches() {
        let cache = unbounded();

        let (v, produced) = cache
            .get_or_build(1, || Ok::<_, ()>("one".to_owned()))
            .unwrap();
        assert_eq!(*v, "one");
        assert!(produced);

        let (v, produced) = cache
            .get_or_build(1, || -> Result<String, ()> { panic!("must not build again") })
            .unwrap();
        assert_eq!(*v, "one");
        assert!(!produced);
    }

    #[test]
    fn test_build_failure_is_not_cached() {
        let cache = unbounded();

        let err = cache
            .get_or_build(1, || Err::<String, _>("boom"))
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.get(&1).is_none());
        assert!(cache.state.lock().pending.is_empty());

        // the next caller builds anew
        let (v, produced) = cache
            .get_or_build(1, || Ok::<_, &str>("one".to_owned()))
            .unwrap();
        assert_eq!(*v, "one");
        assert!(produced);
    }

    #[test]
    fn test_reset_discards_build_result() {
        let cache = unbounded();

        let (v, produced) = cache
            .get_or_build(1, || {
                cache.reset();
                Ok::<_, ()>("one".to_owned())
            })
            .unwrap();

        assert_eq!(*v, "one");
        assert!(!produced);
        assert!(cache.get(&1).is_none());
        assert!(cache.state.lock().pending.is_empty());
    }

    #[test]
    fn test_remove_does_not_abort_build() {
        let cache = unbounded();
        cache.set(1, "stale".to_owned());

        let (v, produced) = cache
            .get_or_build(2, || {
                cache.remove(&1);
                Ok::<_, ()>("two".to_owned())
            })
            .unwrap();

        assert!(produced);
        assert_eq!(*v, "two");
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn test_metrics() {
        let registry = metric::Registry::new();
        let cache = unbounded().with_metrics("test", &registry);

        cache.set(1, "one".to_owned());
        cache.get(&1);
        cache.get(&2);
        cache.get(&2);

        let mut reporter = metric::RawReporter::default();
        registry.report(&mut reporter);
        let hits = reporter.metric("cache_hits").unwrap();
        assert_eq!(
            hits.observation(&metric::Attributes::from(&[("name", "test")])),
            Some(&metric::Observation::U64Counter(1))
        );
        let misses = reporter.metric("cache_misses").unwrap();
        assert_eq!(
            misses.observation(&metric::Attributes::from(&[("name", "test")])),
            Some(&metric::Observation::U64Counter(2))
        );
    }
}
