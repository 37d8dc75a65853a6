//! Segmented least-recently-used eviction.
//!
//! Entries start in a *probationary* queue; a hit promotes them to the MRU
//! end of a *protected* queue sized by `size_ratio`. Protected overflow
//! demotes its LRU entry back to the MRU end of probationary, and real
//! eviction always drains the probationary LRU end. One-shot entries
//! therefore cannot wash frequently used entries out of the protected
//! segment.

use super::{CachePolicy, OnWeightLoss, Weigher};
use hashbrown::HashMap;
use std::{collections::BTreeMap, fmt::Debug, hash::Hash, sync::Arc};

struct Entry<V> {
    value: Arc<V>,
    weight: u64,
    tick: u64,
    protected: bool,
}

/// Configuration of an [`Slru`] policy.
#[derive(Debug, Clone, Copy)]
pub struct SlruConfig {
    /// Weight limit over both segments; zero means unbounded.
    pub max_size: u64,
    /// Entry-count limit over both segments; zero means unbounded.
    pub max_count: usize,
    /// Fraction of `max_size` reserved for the protected segment, in (0, 1).
    pub size_ratio: f64,
}

/// A two-segment LRU.
pub struct Slru<K, V> {
    max_size: u64,
    max_protected_size: u64,
    max_count: usize,
    size_ratio: f64,
    current_weight: u64,
    current_protected_weight: u64,
    tick: u64,
    entries: HashMap<K, Entry<V>>,
    probationary: BTreeMap<u64, K>,
    protected: BTreeMap<u64, K>,
    weigher: Arc<dyn Weigher<K, V>>,
    on_weight_loss: Option<OnWeightLoss>,
}

impl<K, V> Debug for Slru<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slru")
            .field("max_size", &self.max_size)
            .field("max_protected_size", &self.max_protected_size)
            .field("max_count", &self.max_count)
            .field("current_weight", &self.current_weight)
            .field("current_protected_weight", &self.current_protected_weight)
            .field("count", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Slru<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Create a policy from `config`.
    ///
    /// # Panics
    ///
    /// Panics unless `0.0 < size_ratio < 1.0`.
    pub fn new(config: SlruConfig, weigher: Arc<dyn Weigher<K, V>>) -> Self {
        assert!(
            config.size_ratio > 0.0 && config.size_ratio < 1.0,
            "SLRU size_ratio must be in (0, 1), got {}",
            config.size_ratio
        );

        Self {
            max_size: config.max_size,
            max_protected_size: protected_limit(config.max_size, config.size_ratio),
            max_count: config.max_count,
            size_ratio: config.size_ratio,
            current_weight: 0,
            current_protected_weight: 0,
            tick: 0,
            entries: HashMap::new(),
            probationary: BTreeMap::new(),
            protected: BTreeMap::new(),
            weigher,
            on_weight_loss: None,
        }
    }

    /// Register a hook receiving the total weight removed by each eviction
    /// pass. Demotions between segments do not count as losses.
    pub fn with_on_weight_loss(mut self, hook: OnWeightLoss) -> Self {
        self.on_weight_loss = Some(hook);
        self
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Move the protected LRU entries back to probationary until the
    /// protected segment fits.
    fn demote_overflow(&mut self) {
        while self.max_size > 0 && self.current_protected_weight > self.max_protected_size {
            let Some((_, key)) = self.protected.pop_first() else {
                break;
            };
            let tick = self.next_tick();
            let entry = self.entries.get_mut(&key).expect("queues and map in sync");
            entry.protected = false;
            entry.tick = tick;
            self.current_protected_weight -= entry.weight;
            self.probationary.insert(tick, key);
        }
    }

    fn over_limits(&self) -> bool {
        (self.max_size > 0 && self.current_weight > self.max_size)
            || (self.max_count > 0 && self.entries.len() > self.max_count)
    }

    /// Evict from the probationary LRU end (and, should probationary run
    /// dry, from the protected LRU end) until the limits hold.
    fn evict_overflow(&mut self) {
        let mut weight_loss = 0;
        while self.over_limits() {
            let (from_protected, key) = match self.probationary.pop_first() {
                Some((_, key)) => (false, key),
                None => match self.protected.pop_first() {
                    Some((_, key)) => (true, key),
                    None => break,
                },
            };
            let entry = self.entries.remove(&key).expect("queues and map in sync");
            self.current_weight -= entry.weight;
            if from_protected {
                self.current_protected_weight -= entry.weight;
            }
            weight_loss += entry.weight;
        }

        if weight_loss > 0 {
            if let Some(hook) = &self.on_weight_loss {
                hook(weight_loss);
            }
        }
    }

    fn touch(&mut self, k: &K) -> Option<Arc<V>> {
        let tick = self.next_tick();
        let (value, old_tick, was_protected, weight) = {
            let entry = self.entries.get_mut(k)?;
            let old = std::mem::replace(&mut entry.tick, tick);
            let was_protected = std::mem::replace(&mut entry.protected, true);
            (Arc::clone(&entry.value), old, was_protected, entry.weight)
        };

        if was_protected {
            self.protected.remove(&old_tick);
        } else {
            self.probationary.remove(&old_tick);
            self.current_protected_weight += weight;
        }
        self.protected.insert(tick, k.clone());
        self.demote_overflow();

        Some(value)
    }
}

fn protected_limit(max_size: u64, size_ratio: f64) -> u64 {
    (max_size as f64 * size_ratio) as u64
}

impl<K, V> CachePolicy<K, V> for Slru<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
{
    fn get(&mut self, k: &K) -> Option<Arc<V>> {
        self.touch(k)
    }

    fn get_with_key(&mut self, k: &K) -> Option<(K, Arc<V>)> {
        let value = self.touch(k)?;
        let (key, _) = self.entries.get_key_value(k).expect("entry just touched");
        Some((key.clone(), value))
    }

    fn set(&mut self, k: K, v: Arc<V>) {
        let weight = self.weigher.weigh(&k, &v);
        self.remove(&k);

        let tick = self.next_tick();
        self.probationary.insert(tick, k.clone());
        self.entries.insert(
            k,
            Entry {
                value: v,
                weight,
                tick,
                protected: false,
            },
        );
        self.current_weight += weight;

        self.evict_overflow();
    }

    fn remove(&mut self, k: &K) {
        if let Some(entry) = self.entries.remove(k) {
            self.current_weight -= entry.weight;
            if entry.protected {
                self.current_protected_weight -= entry.weight;
                self.protected.remove(&entry.tick);
            } else {
                self.probationary.remove(&entry.tick);
            }
        }
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.probationary.clear();
        self.protected.clear();
        self.current_weight = 0;
        self.current_protected_weight = 0;
    }

    fn dump(&self) -> Vec<(K, Arc<V>)> {
        // probationary entries are the first eviction candidates, report them
        // LRU-first ahead of the protected segment
        self.probationary
            .values()
            .chain(self.protected.values())
            .map(|k| {
                let entry = self.entries.get(k).expect("queues and map in sync");
                (k.clone(), Arc::clone(&entry.value))
            })
            .collect()
    }

    fn weight(&self) -> u64 {
        self.current_weight
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn max_size(&self) -> u64 {
        self.max_size
    }

    fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
        self.max_protected_size = protected_limit(max_size, self.size_ratio);
        self.demote_overflow();
        self.evict_overflow();
    }

    fn set_max_count(&mut self, max_count: usize) {
        self.max_count = max_count;
        self.evict_overflow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct StrLen;

    impl Weigher<&'static str, String> for StrLen {
        fn weigh(&self, _k: &&'static str, v: &String) -> u64 {
            v.len() as u64
        }
    }

    fn slru(max_size: u64, max_count: usize) -> Slru<&'static str, String> {
        Slru::new(
            SlruConfig {
                max_size,
                max_count,
                size_ratio: 0.5,
            },
            Arc::new(StrLen),
        )
    }

    fn set(policy: &mut Slru<&'static str, String>, k: &'static str, v: &str) {
        policy.set(k, Arc::new(v.to_owned()));
    }

    #[test]
    fn test_hit_promotes_and_protects() {
        let mut cache = slru(8, 0);

        set(&mut cache, "hot", "xxxx");
        assert!(cache.get(&"hot").is_some()); // promoted

        // a burst of one-shot entries evicts probationary entries only
        set(&mut cache, "b", "xxxx");
        set(&mut cache, "c", "xxxx");

        assert!(cache.get(&"hot").is_some());
        assert!(cache.get(&"b").is_none());
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn test_first_insert_is_probationary() {
        let mut cache = slru(8, 0);

        set(&mut cache, "a", "xxxx");
        set(&mut cache, "b", "xxxx");
        // neither was hit, so the older one is evicted
        set(&mut cache, "c", "xxxx");

        assert!(cache.get(&"a").is_none());
        assert!(cache.get(&"b").is_some());
    }

    #[test]
    fn test_protected_overflow_demotes() {
        let mut cache = slru(8, 0); // protected limit: 4

        set(&mut cache, "a", "xxxx");
        assert!(cache.get(&"a").is_some()); // fills protected
        set(&mut cache, "b", "xxxx");
        assert!(cache.get(&"b").is_some()); // demotes "a" to probationary

        // a new insert now evicts the demoted "a" first
        set(&mut cache, "c", "xxxx");
        assert!(cache.get(&"a").is_none());
        assert!(cache.get(&"b").is_some());
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn test_weight_loss_hook_ignores_demotions() {
        let lost = Arc::new(AtomicU64::new(0));
        let captured = Arc::clone(&lost);
        let mut cache = Slru::new(
            SlruConfig {
                max_size: 8,
                max_count: 0,
                size_ratio: 0.5,
            },
            Arc::new(StrLen),
        )
        .with_on_weight_loss(Box::new(move |w| {
            captured.fetch_add(w, Ordering::Relaxed);
        }));

        set(&mut cache, "a", "xxxx");
        assert!(cache.get(&"a").is_some());
        set(&mut cache, "b", "xxxx");
        assert!(cache.get(&"b").is_some()); // demotion, no loss
        assert_eq!(lost.load(Ordering::Relaxed), 0);

        set(&mut cache, "c", "xxxx"); // 12 > 8, evicts the demoted "a"
        assert_eq!(lost.load(Ordering::Relaxed), 4);
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn test_shrink_demotes_then_evicts() {
        let mut cache = slru(20, 0);
        set(&mut cache, "a", "xxxx");
        assert!(cache.get(&"a").is_some());
        set(&mut cache, "b", "xxxx");

        cache.set_max_size(4);
        assert!(cache.weight() <= 4);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_max_count() {
        let mut cache = slru(0, 2);
        set(&mut cache, "a", "x");
        set(&mut cache, "b", "x");
        set(&mut cache, "c", "x");
        assert_eq!(cache.count(), 2);
        assert!(cache.get(&"a").is_none());
    }
}
