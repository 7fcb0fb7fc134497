//! In-process cache tier.
//!
//! Each cache instance owns one [`LocalCache`] holding values of its type
//! under prefixed keys. Implementations apply admission control and per-entry
//! TTLs; a refused entry surfaces as [`CacheError::AdmissionRejected`].

pub mod quick;

use std::time::Duration;

use crate::error::CacheError;

pub use quick::QuickLocalCache;

/// Admission-controlled in-memory cache with per-entry TTL.
///
/// Used as `Arc<dyn LocalCache<V>>`; implementations must be safe for
/// concurrent use.
pub trait LocalCache<V>: Send + Sync {
    /// Inserts or replaces `key`. A zero `ttl` means no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::AdmissionRejected`] if the entry was not admitted.
    fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError>;

    /// Returns a copy of the live value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::EntryNotFound`] if the key is absent or expired.
    fn get(&self, key: &str) -> Result<V, CacheError>;

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::EntryNotFound`] if the key was absent. Callers
    /// treat that as success.
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Returns `true` if a live entry exists under `key`.
    fn exists(&self, key: &str) -> bool;

    /// Number of entries currently held, including not-yet-purged expired ones.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
