//! Fixed-capacity cache with most-recently-used ordering.
//!
//! The cache keeps its entries on an intrusive recency list. Once the
//! capacity is exceeded the least recently used entry is handed to the
//! evict callback, exactly once, before it disappears from the map.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    value: V,
    newer: Option<K>,
    older: Option<K>,
}

pub struct Mru<K, V> {
    size: usize,
    map: HashMap<K, Node<K, V>>,
    newest: Option<K>,
    oldest: Option<K>,
    evicted: Box<dyn FnMut(&K, V) + Send>,
}

impl<K: Eq + Hash + Clone, V> Mru<K, V> {
    /// `size` must be positive; `evicted` runs for every entry pushed
    /// out over capacity (and for `clear`).
    pub fn new(size: usize, evicted: Box<dyn FnMut(&K, V) + Send>) -> Self {
        assert!(size > 0);
        Mru {
            size,
            map: HashMap::new(),
            newest: None,
            oldest: None,
            evicted,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn detach(&mut self, key: &K) {
        let (newer, older) = {
            let node = &self.map[key];
            (node.newer.clone(), node.older.clone())
        };
        match &newer {
            Some(n) => self.map.get_mut(n).unwrap().older = older.clone(),
            None => self.newest = older.clone(),
        }
        match &older {
            Some(o) => self.map.get_mut(o).unwrap().newer = newer,
            None => self.oldest = newer,
        }
    }

    fn attach_newest(&mut self, key: K) {
        let old_newest = self.newest.replace(key.clone());
        if let Some(prev) = &old_newest {
            self.map.get_mut(prev).unwrap().newer = Some(key.clone());
        } else {
            self.oldest = Some(key.clone());
        }
        let node = self.map.get_mut(&key).unwrap();
        node.newer = None;
        node.older = old_newest;
    }

    /// Look up an entry, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.map.contains_key(key) {
            return None;
        }
        if self.newest.as_ref() != Some(key) {
            self.detach(key);
            self.attach_newest(key.clone());
        }
        Some(&self.map[key].value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.get(key)?;
        Some(&mut self.map.get_mut(key).unwrap().value)
    }

    /// Insert a new entry at the most-recently-used end, or update an
    /// existing one in place; only `get` refreshes recency. The entry
    /// evicted to make room, if any, goes through the callback before
    /// this returns.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(node) = self.map.get_mut(&key) {
            node.value = value;
            return;
        }
        self.map.insert(
            key.clone(),
            Node {
                value,
                newer: None,
                older: None,
            },
        );
        self.attach_newest(key);
        if self.map.len() > self.size {
            self.pop();
        }
    }

    /// Evict the least recently used entry through the callback.
    pub fn pop(&mut self) {
        let doomed = match self.oldest.clone() {
            Some(key) => key,
            None => return,
        };
        self.detach(&doomed);
        let node = self.map.remove(&doomed).unwrap();
        (self.evicted)(&doomed, node.value);
    }

    /// Evict everything, oldest first.
    pub fn clear(&mut self) {
        while !self.map.is_empty() {
            self.pop();
        }
    }

    /// Drop everything without running the evict callback.
    pub fn reset(&mut self) {
        self.map.clear();
        self.newest = None;
        self.oldest = None;
    }

    /// Keys from most to least recently used. The snapshot is taken up
    /// front, so mutating the cache while consuming it is fine.
    pub fn keys(&self) -> Vec<K> {
        let mut result = Vec::with_capacity(self.map.len());
        let mut cursor = self.newest.clone();
        while let Some(key) = cursor {
            cursor = self.map[&key].older.clone();
            result.push(key);
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<(u32, &'static str)>>>, Box<dyn FnMut(&u32, &'static str) + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (
            log,
            Box::new(move |k, v| sink.lock().unwrap().push((*k, v))),
        )
    }

    #[test]
    fn eviction_runs_once_per_key_in_lru_order() {
        let (log, evicted) = recorder();
        let mut cache = Mru::new(2, evicted);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(3, "c");
        cache.insert(4, "d");
        assert_eq!(*log.lock().unwrap(), vec![(1, "a"), (2, "b")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn get_refreshes_recency() {
        let (log, evicted) = recorder();
        let mut cache = Mru::new(2, evicted);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.get(&1), Some(&"a"));
        cache.insert(3, "c");
        // 2 was the least recently used after the get.
        assert_eq!(*log.lock().unwrap(), vec![(2, "b")]);
        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn update_does_not_evict_or_reorder() {
        let (log, evicted) = recorder();
        let mut cache = Mru::new(2, evicted);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(1, "a2");
        assert!(log.lock().unwrap().is_empty());
        // Updating in place left 2 at the front; only get moves entries.
        assert_eq!(cache.keys(), vec![2, 1]);
        assert_eq!(cache.get(&1), Some(&"a2"));
    }

    #[test]
    fn keys_snapshot_survives_mutation() {
        let (_log, evicted) = recorder();
        let mut cache = Mru::new(3, evicted);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(3, "c");
        let keys = cache.keys();
        assert_eq!(keys, vec![3, 2, 1]);
        for key in keys {
            // Reordering while consuming the snapshot.
            cache.get(&key);
        }
        assert_eq!(cache.keys(), vec![1, 2, 3]);
    }

    #[test]
    fn clear_evicts_everything() {
        let (log, evicted) = recorder();
        let mut cache = Mru::new(4, evicted);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![(1, "a"), (2, "b")]);
    }
}
