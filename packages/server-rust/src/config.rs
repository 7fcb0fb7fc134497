//! Configuration for cache instances and the state node.
//!
//! Options are plain structs with `Default` impls and `with_*` builder
//! methods. Collaborators that cannot be described by value (the bus broker
//! and the remote store) are injected as trait objects.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::Broker;
use crate::remote::RemoteStore;

/// Floor for the worker-pool capacity.
pub const MIN_WORKERS: usize = 10_000;

/// Per-CPU contribution to the default worker-pool capacity.
pub const WORKERS_PER_CPU: usize = 2_000;

/// Topic carrying `Set`/`Delete` intents.
pub const INTENT_TOPIC: &str = "core-distributed-cache-set-del";

/// Topic carrying `SetDone`/`DeleteDone` completions.
pub const COMPLETION_TOPIC: &str = "core-distributed-cache-done";

/// Default capacity: `max(MIN_WORKERS, num_cpus * WORKERS_PER_CPU)`.
#[must_use]
pub fn default_pool_capacity() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    MIN_WORKERS.max(cpus.saturating_mul(WORKERS_PER_CPU))
}

/// Resolves a requested capacity, falling back to the default and flooring
/// at [`MIN_WORKERS`].
#[must_use]
pub fn effective_pool_capacity(requested: Option<usize>) -> usize {
    requested.map_or_else(default_pool_capacity, |n| n.max(MIN_WORKERS))
}

/// Best-effort host identifier for diagnostics.
#[must_use]
pub fn resolve_hostname(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Names of the two bus topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub intent: String,
    pub completion: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            intent: INTENT_TOPIC.to_string(),
            completion: COMPLETION_TOPIC.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus tuning
// ---------------------------------------------------------------------------

/// Latency-tuned producer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    /// How long the client may wait to batch records before sending.
    pub linger: Duration,
    /// Upper bound on a single produce, retries included. Exceeding it
    /// yields [`BusError::Timeout`](crate::error::BusError::Timeout).
    pub retry_timeout: Duration,
    /// Bound on building the producer.
    pub dial_timeout: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(1),
            retry_timeout: Duration::from_millis(300),
            dial_timeout: Duration::from_secs(2),
        }
    }
}

/// Latency-tuned consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Longest a poll waits for data before returning an empty fetch.
    pub fetch_max_wait: Duration,
    /// Minimum bytes a fetch waits for before returning early.
    pub fetch_min_bytes: usize,
    /// Bound on building the consumer.
    pub dial_timeout: Duration,
    /// Commit the group position after every poll. Off by default: each
    /// instance joins a fresh group at the end of the log, so nothing needs
    /// to resume from a committed offset.
    pub auto_commit: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            fetch_max_wait: Duration::from_millis(10),
            fetch_min_bytes: 1,
            dial_timeout: Duration::from_secs(2),
            auto_commit: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Local cache
// ---------------------------------------------------------------------------

/// Sizing of the default local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held per instance.
    pub capacity: usize,
    /// Entries whose cost exceeds this are rejected at admission.
    pub max_entry_cost: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            max_entry_cost: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheOptions
// ---------------------------------------------------------------------------

/// Options for constructing a per-type cache instance.
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// Bus endpoints handed to the broker when building clients.
    pub brokers: Vec<String>,
    /// Bus client factory.
    pub broker: Option<Arc<dyn Broker>>,
    /// Remote key/value store.
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub local_cache: LocalCacheConfig,
    /// Max in-flight intent publishes; floored at [`MIN_WORKERS`].
    pub worker_pool_capacity: Option<usize>,
    /// Per-operation timing logs.
    pub trace: bool,
    pub hostname: Option<String>,
    /// Drop completions whose `ts` is not newer than the last one applied for the key.
    pub listener_watermarks: bool,
    pub topics: Topics,
    pub producer: ProducerOptions,
    pub consumer: ConsumerOptions,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("brokers", &self.brokers)
            .field("broker", &self.broker.is_some())
            .field("remote", &self.remote.is_some())
            .field("local_cache", &self.local_cache)
            .field("worker_pool_capacity", &self.worker_pool_capacity)
            .field("trace", &self.trace)
            .field("hostname", &self.hostname)
            .field("listener_watermarks", &self.listener_watermarks)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl CacheOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_local_cache(mut self, config: LocalCacheConfig) -> Self {
        self.local_cache = config;
        self
    }

    #[must_use]
    pub fn with_worker_pool_capacity(mut self, capacity: usize) -> Self {
        self.worker_pool_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub fn with_listener_watermarks(mut self, enabled: bool) -> Self {
        self.listener_watermarks = enabled;
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    #[must_use]
    pub fn pool_capacity(&self) -> usize {
        effective_pool_capacity(self.worker_pool_capacity)
    }
}

// ---------------------------------------------------------------------------
// StateNodeOptions
// ---------------------------------------------------------------------------

/// Options for the state-node reducer.
#[derive(Clone, Default)]
pub struct StateNodeOptions {
    pub brokers: Vec<String>,
    pub broker: Option<Arc<dyn Broker>>,
    pub remote: Option<Arc<dyn RemoteStore>>,
    /// Max in-flight applies per batch; floored at [`MIN_WORKERS`].
    pub worker_pool_capacity: Option<usize>,
    pub topics: Topics,
    pub producer: ProducerOptions,
    pub consumer: ConsumerOptions,
}

impl fmt::Debug for StateNodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNodeOptions")
            .field("brokers", &self.brokers)
            .field("broker", &self.broker.is_some())
            .field("remote", &self.remote.is_some())
            .field("worker_pool_capacity", &self.worker_pool_capacity)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl StateNodeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_worker_pool_capacity(mut self, capacity: usize) -> Self {
        self.worker_pool_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    #[must_use]
    pub fn pool_capacity(&self) -> usize {
        effective_pool_capacity(self.worker_pool_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_defaults() {
        let topics = Topics::default();
        assert_eq!(topics.intent, "core-distributed-cache-set-del");
        assert_eq!(topics.completion, "core-distributed-cache-done");
    }

    #[test]
    fn bus_tuning_defaults() {
        let producer = ProducerOptions::default();
        assert_eq!(producer.linger, Duration::from_millis(1));
        assert_eq!(producer.retry_timeout, Duration::from_millis(300));

        let consumer = ConsumerOptions::default();
        assert_eq!(consumer.fetch_max_wait, Duration::from_millis(10));
        assert_eq!(consumer.fetch_min_bytes, 1);
        assert!(!consumer.auto_commit);
    }

    #[test]
    fn pool_capacity_is_floored() {
        assert_eq!(effective_pool_capacity(Some(5)), MIN_WORKERS);
        assert_eq!(effective_pool_capacity(Some(50_000)), 50_000);
        assert!(effective_pool_capacity(None) >= MIN_WORKERS);
        assert!(default_pool_capacity() >= MIN_WORKERS);
    }

    #[test]
    fn cache_options_builder() {
        let opts = CacheOptions::new()
            .with_brokers(["b1:9092", "b2:9092"])
            .with_worker_pool_capacity(20_000)
            .with_trace(true)
            .with_hostname("node-a");

        assert_eq!(opts.brokers, vec!["b1:9092", "b2:9092"]);
        assert_eq!(opts.pool_capacity(), 20_000);
        assert!(opts.trace);
        assert_eq!(opts.hostname.as_deref(), Some("node-a"));
        assert!(opts.remote.is_none());
        assert!(!opts.listener_watermarks);
    }

    #[test]
    fn hostname_prefers_configured_value() {
        assert_eq!(resolve_hostname(Some("node-x")), "node-x");
        assert!(!resolve_hostname(None).is_empty());
    }

    #[test]
    fn debug_output_hides_trait_objects() {
        let rendered = format!("{:?}", StateNodeOptions::new());
        assert!(rendered.contains("remote: false"));
    }
}
