//! Read-through TTL cache of resource enumerations.
//!
//! Expiry is evaluated lazily on read; there is no sweeper. Stale entries
//! linger until the next `set` for the same key overwrites them. The TTL is
//! passed on every read so that a configuration change applies to entries
//! that already exist.

// ============================================================================
// RESOURCE CACHE
// ============================================================================

use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::types::{ResourceKey, ResourceList};

#[derive(Debug, Clone)]
struct CacheEntry {
    resources: ResourceList,
    updated_at: Instant,
}

/// Per-(account, region, namespace, resource-type) enumeration cache.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: RwLock<FnvHashMap<ResourceKey, CacheEntry>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached resources for `key` if they are no older than `ttl`
    pub fn get(&self, key: &ResourceKey, ttl: Duration) -> Option<ResourceList> {
        self.get_at(key, ttl, Instant::now())
    }

    /// `get` against an explicit clock
    pub fn get_at(&self, key: &ResourceKey, ttl: Duration, now: Instant) -> Option<ResourceList> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        (now.saturating_duration_since(entry.updated_at) <= ttl).then(|| entry.resources.clone())
    }

    /// Replace the entry for `key` and restamp it
    pub fn set(&self, key: ResourceKey, resources: ResourceList) {
        self.set_at(key, resources, Instant::now());
    }

    pub fn set_at(&self, key: ResourceKey, resources: ResourceList, now: Instant) {
        self.entries.write().insert(
            key,
            CacheEntry {
                resources,
                updated_at: now,
            },
        );
    }

    /// Entries held, fresh or stale
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
