//! Remote key/value store (the shared, authoritative tier).
//!
//! Cache instances read through it on local misses; only the state node
//! writes to it. Keys are always fully prefixed with the owning type's tag.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RemoteError;

pub use memory::{MemoryRemoteStore, RemoteOp};

/// Pluggable remote key/value backend (Redis-compatible semantics).
///
/// Used as `Arc<dyn RemoteStore>` and shared across workers without
/// additional locking.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stores `value` under `key`. A zero `ttl` means no expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RemoteError>;

    /// Loads the value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), RemoteError>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), RemoteError>;
}
