use std::collections::{HashSet, VecDeque};

/// Bounded, insertion-ordered set of already emitted console entries.
///
/// Once full, inserting a new key evicts the oldest one.
#[derive(Debug)]
pub struct DedupCache {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
