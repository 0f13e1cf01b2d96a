//! Short-lived cache of page observations.
//!
//! Observations are keyed by page identity plus the kind of read. Any
//! navigation or mutating action invalidates them; expiry is checked lazily
//! on lookup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// TTL and size bound for [`ObservationCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 3_000,
            capacity: 16,
        }
    }
}

struct CachedObservation {
    at: Instant,
    payload: Value,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct ObservationCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CachedObservation>,
    hits: u64,
    misses: u64,
}

impl ObservationCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            capacity: config.capacity.max(1),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Cache key for a read of `kind` on the page identified by `identity`.
    pub fn key(identity: &str, kind: &str) -> String {
        format!("{kind}@{identity}")
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`. Expired entries are dropped on the way.
    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Value> {
        let fresh = match self.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.at) < self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if !fresh {
            self.entries.remove(key);
            self.misses += 1;
            trace!(key, "observation expired");
            return None;
        }
        self.hits += 1;
        self.entries.get(key).map(|e| e.payload.clone())
    }

    pub fn put(&mut self, key: impl Into<String>, payload: Value) {
        self.put_at(key, payload, Instant::now());
    }

    pub fn put_at(&mut self, key: impl Into<String>, payload: Value, now: Instant) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            // Evict the oldest observation.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, CachedObservation { at: now, payload });
    }

    /// Drop every observation of the page identified by `identity`.
    pub fn invalidate(&mut self, identity: &str) {
        let suffix = format!("@{identity}");
        self.entries.retain(|k, _| !k.ends_with(&suffix));
    }

    pub fn invalidate_all(&mut self) {
        if !self.entries.is_empty() {
            trace!(entries = self.entries.len(), "observation cache cleared");
        }
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}
