//! TTL-bounded answer cache.
//!
//! Keyed by (lowercased name, record kind). Expiry is enforced lazily on
//! every read; the periodic sweep only bounds memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tracing::debug;

use nimbus_dns_domain::{AnswerRecord, RecordType};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: String,
    pub record_type: RecordType,
}

impl CacheKey {
    pub fn new(domain: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            domain: domain.into(),
            record_type,
        }
    }
}

#[derive(Clone, Debug)]
struct CachedEntry {
    records: Vec<AnswerRecord>,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters for cache behavior. Snapshot-only; nothing is exported.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub expirations: u64,
}

/// The cache capability. An in-memory map is the default; alternative
/// backends plug in behind the same trait without touching the resolver.
pub trait CacheStore: Send + Sync {
    fn has(&self, key: &CacheKey) -> bool;
    fn get(&self, key: &CacheKey) -> Option<Vec<AnswerRecord>>;
    /// Stores `records` under `key` for the minimum positive TTL among
    /// them. Returns false (and stores nothing) when no record carries a
    /// positive TTL.
    fn set(&self, key: CacheKey, records: Vec<AnswerRecord>) -> bool;
    fn delete(&self, key: &CacheKey) -> bool;
    /// Drops every expired entry, returning how many were removed.
    fn sweep(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn snapshot(&self) -> CacheMetricsSnapshot;
}

pub struct MemoryCache {
    entries: DashMap<CacheKey, CachedEntry, FxBuildHasher>,
    metrics: Arc<CacheMetrics>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    fn min_positive_ttl(records: &[AnswerRecord]) -> Option<u32> {
        records
            .iter()
            .filter_map(|r| r.ttl)
            .filter(|ttl| *ttl > 0)
            .min()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCache {
    fn has(&self, key: &CacheKey) -> bool {
        match self.entries.get(key) {
            Some(entry) => !entry.is_expired(Instant::now()),
            None => false,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<AnswerRecord>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.records.clone());
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
            self.metrics.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: CacheKey, records: Vec<AnswerRecord>) -> bool {
        let Some(ttl) = Self::min_positive_ttl(&records) else {
            return false;
        };
        debug!(
            domain = %key.domain,
            record_type = %key.record_type,
            ttl,
            records = records.len(),
            "cache insert"
        );
        self.entries.insert(
            key,
            CachedEntry {
                records,
                expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        self.metrics.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn delete(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.metrics
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "cache sweep");
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            entries: self.entries.len(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            insertions: self.metrics.insertions.load(Ordering::Relaxed),
            expirations: self.metrics.expirations.load(Ordering::Relaxed),
        }
    }
}
