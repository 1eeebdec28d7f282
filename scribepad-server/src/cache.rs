//! Read-through document cache with a TTL and usage counters.
//!
//! Cold loads consult the cache before the durable store; flushes write
//! through it. In production the cache is a shared tier across instances;
//! instances share one handle here the same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::Identifier;
use crate::permissions::Role;
use crate::store::DocumentRecord;

/// Cached view of a document record.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedDocument {
    /// Serialized canonical content.
    pub data: String,
    /// Display name.
    pub name: String,
    /// Identity of the creator.
    pub owner: Identifier,
    /// Granted roles by user id.
    pub permissions: HashMap<Identifier, Role>,
    /// Creation instant, carried so a cache hit can rebuild the record.
    pub created_at: SystemTime,
}

impl From<&DocumentRecord> for CachedDocument {
    fn from(record: &DocumentRecord) -> Self {
        Self {
            data: record.data.clone(),
            name: record.name.clone(),
            owner: record.owner.clone(),
            permissions: record.permissions.clone(),
            created_at: record.created_at,
        }
    }
}

struct CacheEntry {
    document: CachedDocument,
    cached_at: Instant,
}

/// Usage counters exposed for monitoring.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through to the store.
    pub misses: u64,
    /// Populations and content refreshes.
    pub writes: u64,
    /// Entries dropped by delete or permission change.
    pub invalidations: u64,
}

/// Shared TTL cache of document records.
pub struct DocumentCache {
    entries: DashMap<Identifier, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl DocumentCache {
    /// An empty cache whose entries live for `ttl` after their last use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a document, extending its lifetime on a hit.
    pub fn get(&self, id: &Identifier) -> Option<CachedDocument> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(id) {
            if now.duration_since(entry.cached_at) < self.ttl {
                entry.cached_at = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.document.clone());
            }
        }
        // Expired entries fall out lazily on the next lookup.
        self.entries
            .remove_if(id, |_, entry| now.duration_since(entry.cached_at) >= self.ttl);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Populate the cache from a store record.
    pub fn put(&self, record: &DocumentRecord) {
        self.entries.insert(
            record.id.clone(),
            CacheEntry {
                document: record.into(),
                cached_at: Instant::now(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh the content of a cached entry, preserving its metadata and
    /// restarting its lifetime. Returns false when the entry is absent.
    pub fn update_content(&self, id: &Identifier, data: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.document.data = data.to_string();
                entry.cached_at = Instant::now();
                self.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop an entry after a delete or permissions change.
    pub fn invalidate(&self, id: &Identifier) {
        if self.entries.remove(id).is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Restart the lifetime of an entry that is in active use.
    pub fn extend_ttl(&self, id: &Identifier) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.cached_at = Instant::now();
        }
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
