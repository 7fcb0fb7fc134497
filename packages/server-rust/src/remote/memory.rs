//! In-memory [`RemoteStore`] backed by [`DashMap`].
//!
//! Honors per-key TTLs lazily on read, keeps a journal of applied mutations
//! for inspection, and supports fault injection so callers can exercise
//! their failure paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::RemoteStore;
use crate::error::RemoteError;

/// A mutation applied to the store, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Set { key: String, value: Bytes, ttl: Duration },
    Del { key: String },
}

impl RemoteOp {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            RemoteOp::Set { key, .. } | RemoteOp::Del { key } => key,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Concurrent in-memory remote store.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    entries: DashMap<String, StoredValue>,
    journal: Mutex<Vec<RemoteOp>>,
    failing_ops: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` `set`/`del` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.failing_ops.store(count, Ordering::SeqCst);
    }

    /// Makes every call, including `ping`, fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Mutations applied so far, in order.
    #[must_use]
    pub fn journal(&self) -> Vec<RemoteOp> {
        self.journal.lock().clone()
    }

    /// Mutations applied so far for a single key.
    #[must_use]
    pub fn journal_for(&self, key: &str) -> Vec<RemoteOp> {
        self.journal
            .lock()
            .iter()
            .filter(|op| op.key() == key)
            .cloned()
            .collect()
    }

    /// Number of live (unexpired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable);
        }
        Ok(())
    }

    fn check_injected_failure(&self, op: &str, key: &str) -> Result<(), RemoteError> {
        let injected = self
            .failing_ops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Io(anyhow::anyhow!(
                "injected {op} failure for {key}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.check_injected_failure("set", key)?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        // Journal under the same lock order as the write so the journal order
        // matches the order writes became visible.
        let mut journal = self.journal.lock();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                expires_at,
            },
        );
        journal.push(RemoteOp::Set {
            key: key.to_string(),
            value,
            ttl,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        self.check_reachable()?;
        let now = Instant::now();
        let Some(stored) = self.entries.get(key).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if stored.is_expired(now) {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
            return Ok(None);
        }
        Ok(Some(stored.value))
    }

    async fn del(&self, key: &str) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.check_injected_failure("del", key)?;
        let mut journal = self.journal.lock();
        self.entries.remove(key);
        journal.push(RemoteOp::Del {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let store = MemoryRemoteStore::new();
        store
            .set("t:k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.get("t:k").await.unwrap(), Some(Bytes::from_static(b"v")));

        store.del("t:k").await.unwrap();
        assert_eq!(store.get("t:k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn del_of_absent_key_is_ok() {
        let store = MemoryRemoteStore::new();
        assert!(store.del("missing").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryRemoteStore::new();
        store
            .set("t:k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(store.get("t:k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get("t:k").await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn journal_records_mutations_in_order() {
        let store = MemoryRemoteStore::new();
        store.set("a", Bytes::from_static(b"1"), Duration::ZERO).await.unwrap();
        store.del("a").await.unwrap();
        store.set("b", Bytes::from_static(b"2"), Duration::ZERO).await.unwrap();

        let journal = store.journal();
        assert_eq!(journal.len(), 3);
        assert!(matches!(&journal[1], RemoteOp::Del { key } if key == "a"));
        assert_eq!(store.journal_for("a").len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_skip_the_write() {
        let store = MemoryRemoteStore::new();
        store.fail_next(1);
        assert!(store
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .is_err());
        assert!(store.journal().is_empty());
        assert!(store
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_fails_ping() {
        let store = MemoryRemoteStore::new();
        assert!(store.ping().await.is_ok());
        store.set_unreachable(true);
        assert!(matches!(store.ping().await, Err(RemoteError::Unavailable)));
        store.set_unreachable(false);
        assert!(store.ping().await.is_ok());
    }
}
