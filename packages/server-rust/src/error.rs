//! Error types surfaced by cache instances, the bus, and the remote store.

use std::time::Duration;

use tiercache_core::CodecError;

/// Errors returned by cache-instance operations and construction.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is absent from the local cache (and the remote store, for sync reads).
    #[error("entry not found")]
    EntryNotFound,
    #[error("invalid ttl: rkv ttl {rkv_ttl:?} is shorter than local ttl {local_ttl:?}")]
    InvalidTtl {
        local_ttl: Duration,
        rkv_ttl: Duration,
    },
    /// The local cache refused the entry. The intent is still published.
    #[error("local cache rejected entry for key {key}")]
    AdmissionRejected { key: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("type tag {tag} is already registered for a different value type")]
    TagConflict { tag: String },
    #[error("cache instance is closed")]
    Closed,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl From<BusError> for CacheError {
    fn from(err: BusError) -> Self {
        CacheError::Transport(anyhow::Error::new(err))
    }
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        CacheError::Transport(anyhow::Error::new(err))
    }
}

/// Errors from the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus client is closed")]
    Closed,
    #[error("no brokers configured")]
    NoBrokers,
    #[error("produce to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("bus i/o error: {0}")]
    Io(#[source] anyhow::Error),
}

/// Errors from the remote key/value store.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable")]
    Unavailable,
    #[error("remote store i/o error: {0}")]
    Io(#[source] anyhow::Error),
}
