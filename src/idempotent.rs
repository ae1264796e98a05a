//! Idempotent repositories backing the idempotent consumer.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const DEFAULT_REPOSITORY_CAPACITY: usize = 1000;

/// Store of message keys already seen. `add` must check and insert atomically.
pub trait IdempotentRepository: Send + Sync {
    /// Inserts `key`; `false` when it was already present.
    fn add(&self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str) -> bool;

    /// Marks `key` as fully processed.
    fn confirm(&self, _key: &str) -> bool {
        true
    }

    fn clear(&self);
}

pub type SharedIdempotentRepository = Arc<dyn IdempotentRepository>;

#[derive(Default)]
struct Keys {
    present: HashSet<String>,
    order: VecDeque<String>,
}

/// In-memory repository evicting the oldest key once `capacity` is reached.
pub struct MemoryIdempotentRepository {
    capacity: usize,
    keys: Mutex<Keys>,
}

impl MemoryIdempotentRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: Mutex::new(Keys::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|err| err.into_inner()).present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(DEFAULT_REPOSITORY_CAPACITY)
    }
}

impl IdempotentRepository for MemoryIdempotentRepository {
    fn add(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(|err| err.into_inner());
        if keys.present.contains(key) {
            return false;
        }
        while keys.present.len() >= self.capacity {
            let Some(oldest) = keys.order.pop_front() else {
                break;
            };
            keys.present.remove(&oldest);
        }
        keys.present.insert(key.to_string());
        keys.order.push_back(key.to_string());
        true
    }

    fn contains(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .present
            .contains(key)
    }

    fn remove(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(|err| err.into_inner());
        if !keys.present.remove(key) {
            return false;
        }
        keys.order.retain(|existing| existing != key);
        true
    }

    fn clear(&self) {
        let mut keys = self.keys.lock().unwrap_or_else(|err| err.into_inner());
        keys.present.clear();
        keys.order.clear();
    }
}
