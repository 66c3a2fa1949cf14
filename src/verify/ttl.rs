//! Synchronized in-process cache with time-to-live eviction.
//!
//! Expired entries are swept lazily on every insert; there is no background
//! sweeper. Time is an explicit parameter on the `_at` methods so the policy
//! is testable without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: &str, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if now.duration_since(entry.inserted_at) < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn insert_at(&self, key: &str, value: V, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        entries.insert(key.to_string(), Entry { value, inserted_at: now });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
