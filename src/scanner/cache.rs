/// Scan Result Cache
///
/// In-memory store mapping a cache key to the `ScanResult` of a previous
/// scan. Entries expire lazily: `get` treats an entry older than the TTL as
/// absent, but nothing ever removes it. An expired entry is only replaced
/// when a new scan writes the same key. `get_all` ignores expiry entirely.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::scanner::types::ScanResult;

/// Cache entry with its creation instant.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: ScanResult,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// TTL cache for scan results.
///
/// A single map-wide lock: readers proceed in parallel, a writer excludes
/// everyone for the duration of its one-key mutation.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a cached result. Expired entries report as absent.
    pub fn get(&self, key: &str) -> Option<ScanResult> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;

        if entry.is_expired(self.ttl) {
            debug!(key, "cache entry expired");
            return None;
        }

        debug!(key, "cache hit");
        Some(entry.value.clone())
    }

    /// Store a result, overwriting any previous entry for `key`.
    pub fn set(&self, key: impl Into<String>, value: ScanResult) {
        let key = key.into();
        debug!(key = %key, "cache entry set");
        self.entries.write().insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    /// Every stored result, expired or not.
    pub fn get_all(&self) -> Vec<ScanResult> {
        self.entries.read().values().map(|e| e.value.clone()).collect()
    }

    /// Number of stored entries, including expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
