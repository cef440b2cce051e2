use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One cached envelope. The bytes are shared and never mutated in place.
#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Arc<[u8]>,
    written_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) >= self.ttl
    }
}

/// TTL-expiring store of the latest envelope per canonical path
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store `bytes` under `path` with the process-wide TTL, replacing any previous entry
    pub fn set(&self, path: &str, bytes: Vec<u8>) {
        self.set_with_ttl(path, bytes, self.default_ttl);
    }

    pub fn set_with_ttl(&self, path: &str, bytes: Vec<u8>, ttl: Duration) {
        let entry = CacheEntry {
            bytes: Arc::from(bytes),
            written_at: Instant::now(),
            ttl,
        };
        self.entries.insert(path.to_string(), entry);
    }

    /// Latest non-expired envelope at `path`
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(path)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.bytes.to_vec())
    }

    /// Snapshot of every entry whose TTL has not elapsed at call time
    pub fn all_non_expired(&self) -> HashMap<String, Vec<u8>> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().bytes.to_vec()))
            .collect()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
