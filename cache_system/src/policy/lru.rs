//! Plain least-recently-used eviction.

use super::{CachePolicy, OnWeightLoss, Weigher};
use hashbrown::HashMap;
use std::{collections::BTreeMap, fmt::Debug, hash::Hash, sync::Arc};

struct Entry<V> {
    value: Arc<V>,
    weight: u64,
    tick: u64,
}

/// A single recency queue; eviction removes least-recently-used entries
/// until the weight and count limits hold.
pub struct Lru<K, V> {
    max_size: u64,
    max_count: usize,
    current_weight: u64,
    tick: u64,
    entries: HashMap<K, Entry<V>>,
    /// Recency order: smallest tick is the LRU end. Ticks are unique.
    queue: BTreeMap<u64, K>,
    weigher: Arc<dyn Weigher<K, V>>,
    on_weight_loss: Option<OnWeightLoss>,
}

impl<K, V> Debug for Lru<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lru")
            .field("max_size", &self.max_size)
            .field("max_count", &self.max_count)
            .field("current_weight", &self.current_weight)
            .field("count", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Lru<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Create a policy with the given limits; zero means unbounded.
    pub fn new(max_size: u64, max_count: usize, weigher: Arc<dyn Weigher<K, V>>) -> Self {
        Self {
            max_size,
            max_count,
            current_weight: 0,
            tick: 0,
            entries: HashMap::new(),
            queue: BTreeMap::new(),
            weigher,
            on_weight_loss: None,
        }
    }

    /// Register a hook receiving the total weight removed by each eviction
    /// pass.
    pub fn with_on_weight_loss(mut self, hook: OnWeightLoss) -> Self {
        self.on_weight_loss = Some(hook);
        self
    }

    fn touch(&mut self, k: &K) -> Option<&Entry<V>> {
        self.tick += 1;
        let tick = self.tick;
        let old_tick = {
            let entry = self.entries.get_mut(k)?;
            std::mem::replace(&mut entry.tick, tick)
        };
        self.queue.remove(&old_tick);
        self.queue.insert(tick, k.clone());
        self.entries.get(k)
    }

    fn remove_overflow(&mut self) {
        let mut weight_loss = 0;
        while (self.max_size > 0 && self.current_weight > self.max_size)
            || (self.max_count > 0 && self.entries.len() > self.max_count)
        {
            let Some((_, key)) = self.queue.pop_first() else {
                break;
            };
            let entry = self.entries.remove(&key).expect("queue and map in sync");
            self.current_weight -= entry.weight;
            weight_loss += entry.weight;
        }

        if weight_loss > 0 {
            if let Some(hook) = &self.on_weight_loss {
                hook(weight_loss);
            }
        }
    }
}

impl<K, V> CachePolicy<K, V> for Lru<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
{
    fn get(&mut self, k: &K) -> Option<Arc<V>> {
        self.touch(k).map(|e| Arc::clone(&e.value))
    }

    fn get_with_key(&mut self, k: &K) -> Option<(K, Arc<V>)> {
        let value = self.touch(k).map(|e| Arc::clone(&e.value))?;
        let (key, _) = self.entries.get_key_value(k).expect("entry just touched");
        Some((key.clone(), value))
    }

    fn set(&mut self, k: K, v: Arc<V>) {
        let weight = self.weigher.weigh(&k, &v);
        self.remove(&k);

        self.tick += 1;
        self.queue.insert(self.tick, k.clone());
        self.entries.insert(
            k,
            Entry {
                value: v,
                weight,
                tick: self.tick,
            },
        );
        self.current_weight += weight;

        self.remove_overflow();
    }

    fn remove(&mut self, k: &K) {
        if let Some(entry) = self.entries.remove(k) {
            self.queue.remove(&entry.tick);
            self.current_weight -= entry.weight;
        }
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.queue.clear();
        self.current_weight = 0;
    }

    fn dump(&self) -> Vec<(K, Arc<V>)> {
        self.queue
            .values()
            .map(|k| {
                let entry = self.entries.get(k).expect("queue and map in sync");
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
        self.remove_overflow();
    }

    fn set_max_count(&mut self, max_count: usize) {
        self.max_count = max_count;
        self.remove_overflow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::UnitWeigher;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct StrLen;

    impl Weigher<&'static str, String> for StrLen {
        fn weigh(&self, _k: &&'static str, v: &String) -> u64 {
            v.len() as u64
        }
    }

    fn set(policy: &mut dyn CachePolicy<&'static str, String>, k: &'static str, v: &str) {
        policy.set(k, Arc::new(v.to_owned()));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = Lru::new(10, 0, Arc::new(StrLen));

        set(&mut lru, "a", "xxxx");
        set(&mut lru, "b", "xxxx");
        assert_eq!(lru.weight(), 8);

        // touch "a" so "b" is the eviction victim
        assert!(lru.get(&"a").is_some());
        set(&mut lru, "c", "xxxx");

        assert!(lru.get(&"a").is_some());
        assert!(lru.get(&"b").is_none());
        assert!(lru.get(&"c").is_some());
        assert_eq!(lru.weight(), 8);
        assert_eq!(lru.count(), 2);
    }

    #[test]
    fn test_max_count() {
        let mut lru = Lru::new(0, 2, Arc::new(UnitWeigher));
        lru.set(1, Arc::new(1));
        lru.set(2, Arc::new(2));
        lru.set(3, Arc::new(3));

        assert_eq!(lru.count(), 2);
        assert!(lru.get(&1).is_none());
    }

    #[test]
    fn test_replace_updates_weight() {
        let mut lru = Lru::new(10, 0, Arc::new(StrLen));
        set(&mut lru, "a", "xx");
        set(&mut lru, "a", "xxxxx");
        assert_eq!(lru.weight(), 5);
        assert_eq!(lru.count(), 1);
    }

    #[test]
    fn test_weight_loss_hook() {
        let lost = Arc::new(AtomicU64::new(0));
        let captured = Arc::clone(&lost);
        let mut lru = Lru::new(4, 0, Arc::new(StrLen))
            .with_on_weight_loss(Box::new(move |w| {
                captured.fetch_add(w, Ordering::Relaxed);
            }));

        set(&mut lru, "a", "xxx");
        set(&mut lru, "b", "xxx");

        assert_eq!(lost.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_shrink_evicts() {
        let mut lru = Lru::new(10, 0, Arc::new(StrLen));
        set(&mut lru, "a", "xxxx");
        set(&mut lru, "b", "xxxx");

        lru.set_max_size(4);
        assert_eq!(lru.count(), 1);
        assert!(lru.get(&"b").is_some());
    }

    #[test]
    fn test_dump_is_lru_first() {
        let mut lru = Lru::new(0, 0, Arc::new(StrLen));
        set(&mut lru, "a", "1");
        set(&mut lru, "b", "2");
        assert!(lru.get(&"a").is_some());

        let order: Vec<_> = lru.dump().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["b", "a"]);
    }
}
