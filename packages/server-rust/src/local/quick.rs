//! Default [`LocalCache`] on top of [`quick_cache`].
//!
//! `quick_cache` bounds the entry count and picks eviction victims; this
//! wrapper adds per-entry expiry and a cost ceiling checked at admission.
//! Expired entries are purged lazily when read.

use std::sync::Arc;
use std::time::Duration;

use quick_cache::sync::Cache;
use tokio::time::Instant;

use super::LocalCache;
use crate::config::LocalCacheConfig;
use crate::error::CacheError;

/// Estimates the admission cost of a value.
pub type Weigher<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;

#[derive(Clone)]
struct LocalEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> LocalEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Bounded local cache with TTL and cost-based admission.
pub struct QuickLocalCache<V: Clone> {
    entries: Cache<String, LocalEntry<V>>,
    weigher: Weigher<V>,
    max_entry_cost: u64,
}

impl<V: Clone> std::fmt::Debug for QuickLocalCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickLocalCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.capacity())
            .field("max_entry_cost", &self.max_entry_cost)
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> QuickLocalCache<V> {
    /// Creates a cache where every entry costs 1.
    #[must_use]
    pub fn new(config: &LocalCacheConfig) -> Self {
        Self::with_weigher(config, Arc::new(|_: &V| 1))
    }

    /// Creates a cache that prices entries with `weigher`; entries costing
    /// more than `config.max_entry_cost` are rejected.
    #[must_use]
    pub fn with_weigher(config: &LocalCacheConfig, weigher: Weigher<V>) -> Self {
        Self {
            entries: Cache::new(config.capacity.max(1)),
            weigher,
            max_entry_cost: config.max_entry_cost,
        }
    }
}

impl<V: Clone> QuickLocalCache<V> {
    /// Drops `key` only if the stored entry is expired at `now`, so a value
    /// written after the expired read survives.
    fn purge_expired(&self, key: &str, now: Instant) -> bool {
        self.entries
            .remove_if(key, |entry| !entry.is_live(now))
            .is_some()
    }
}

impl<V: Clone + Send + Sync + 'static> LocalCache<V> for QuickLocalCache<V> {
    fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        if (self.weigher)(&value) > self.max_entry_cost {
            // A rejected write must not leave an older value visible.
            self.entries.remove(key);
            return Err(CacheError::AdmissionRejected {
                key: key.to_string(),
            });
        }
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), LocalEntry { value, expires_at });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<V, CacheError> {
        let entry = self.entries.get(key).ok_or(CacheError::EntryNotFound)?;
        let now = Instant::now();
        if entry.is_live(now) {
            Ok(entry.value)
        } else {
            self.purge_expired(key, now);
            Err(CacheError::EntryNotFound)
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self.entries.remove(key) {
            Some((_, entry)) if entry.is_live(Instant::now()) => Ok(()),
            _ => Err(CacheError::EntryNotFound),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
