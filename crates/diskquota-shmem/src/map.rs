//! Fixed-capacity shared hash map.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Returned when an insert would grow the map past its fixed capacity.
/// Callers drop the update and rely on re-arrival (an active table that is
/// modified again re-registers on a later epoch).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityExceeded;

/// A capacity-bounded hash map behind a single reader/writer lock.
///
/// Stands in for one shared-memory hash table: writers take the exclusive
/// lock for short, bounded sections; bulk readers copy out under the shared
/// lock rather than holding it across further work.
pub struct SharedMap<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, V>>,
    capacity: usize,
    /// Inserts refused because the map was full.
    dropped: AtomicU64,
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Inserts refused so far because the map was at capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Insert or overwrite. `Ok(true)` for a new key, `Ok(false)` when an
    /// existing entry was updated, `Err(CapacityExceeded)` when a new key
    /// does not fit.
    pub fn insert(&self, key: K, value: V) -> Result<bool, CapacityExceeded> {
        let mut entries = self.entries.write();
        if let Some(slot) = entries.get_mut(&key) {
            *slot = value;
            return Ok(false);
        }
        if entries.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(CapacityExceeded);
        }
        entries.insert(key, value);
        Ok(true)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    /// Remove and return every entry matching the predicate in one critical
    /// section. Used to drain per-database subsets.
    pub fn take_matching(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut entries = self.entries.write();
        let keys: Vec<K> = entries
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Copy of the current contents, taken under the shared lock.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Apply a batch of inserts and removals under one exclusive lock.
    /// Inserts that do not fit are counted and skipped.
    pub fn apply(&self, inserts: Vec<(K, V)>, removals: Vec<K>) -> usize {
        let mut entries = self.entries.write();
        for key in removals {
            entries.remove(&key);
        }
        let mut skipped = 0;
        for (key, value) in inserts {
            if entries.contains_key(&key) || entries.len() < self.capacity {
                entries.insert(key, value);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            self.dropped.fetch_add(skipped as u64, Ordering::Relaxed);
        }
        skipped
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
