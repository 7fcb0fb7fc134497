//! Per-type cache instance.
//!
//! A [`CacheInstance<T>`] is the public cache API for one value type on one
//! node. It owns:
//!
//! - a local cache subspace, keyed `<type tag>:<key>`
//! - a handle to the shared remote store for read-through
//! - a producer publishing intents to the intent topic
//! - a completion listener task applying other instances' `SetDone`/`DeleteDone`
//! - a bounded worker pool for asynchronous intent publishing
//!
//! Writes are local first and then published best-effort: the caller returns
//! as soon as the local cache is updated. The state node decides what reaches
//! the remote store and fans the result back out as completions.

mod counters;
mod listener;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tiercache_core::{encode, marshal_value, process_clock, unmarshal_value, Event, Op, TypeTag};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{new_consumer, new_producer, Consumer, ProduceRecord, Producer};
use crate::config::{resolve_hostname, CacheOptions};
use crate::error::CacheError;
use crate::local::{LocalCache, QuickLocalCache};
use crate::pool::WorkerPool;
use crate::remote::RemoteStore;

pub use counters::InstanceMetrics;
pub use listener::Outcome;

use self::counters::InstanceCounters;
use self::listener::CompletionListener;

/// Bounds on values a cache instance can hold.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// CacheInstance
// ---------------------------------------------------------------------------

/// Two-tier cache for values of type `T`.
pub struct CacheInstance<T: CacheValue> {
    cache_id: String,
    tag: TypeTag,
    hostname: String,
    intent_topic: String,
    trace: bool,
    local: Arc<dyn LocalCache<T>>,
    remote: Arc<dyn RemoteStore>,
    producer: Arc<dyn Producer>,
    consumer: Arc<dyn Consumer>,
    pool: WorkerPool,
    counters: Arc<InstanceCounters>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<T: CacheValue> std::fmt::Debug for CacheInstance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInstance")
            .field("cache_id", &self.cache_id)
            .field("type", &self.tag)
            .field("hostname", &self.hostname)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: CacheValue> CacheInstance<T> {
    /// Builds an instance tagged with `T`'s type name and a default local cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if no broker or remote store is
    /// configured, or [`CacheError::Transport`] if the bus clients cannot be built.
    pub async fn new(options: CacheOptions) -> Result<Self, CacheError> {
        Self::with_tag(TypeTag::of::<T>(), options).await
    }

    /// Builds an instance under an explicit type tag.
    ///
    /// # Errors
    ///
    /// See [`CacheInstance::new`].
    pub async fn with_tag(tag: TypeTag, options: CacheOptions) -> Result<Self, CacheError> {
        let local: Arc<dyn LocalCache<T>> = Arc::new(QuickLocalCache::new(&options.local_cache));
        Self::with_local_cache(tag, options, local).await
    }

    /// Builds an instance around a caller-provided local cache.
    ///
    /// # Errors
    ///
    /// See [`CacheInstance::new`].
    pub async fn with_local_cache(
        tag: TypeTag,
        options: CacheOptions,
        local: Arc<dyn LocalCache<T>>,
    ) -> Result<Self, CacheError> {
        let broker = options
            .broker
            .clone()
            .ok_or_else(|| CacheError::Config("no bus broker configured".to_string()))?;
        let remote = options
            .remote
            .clone()
            .ok_or_else(|| CacheError::Config("no remote store configured".to_string()))?;

        let producer = new_producer(
            broker.as_ref(),
            &options.brokers,
            &options.topics.intent,
            &options.producer,
        )
        .await?;
        let consumer = new_consumer(
            broker.as_ref(),
            &options.brokers,
            &options.topics.completion,
            &options.topics.completion,
            process_clock().now(),
            &options.consumer,
        )
        .await?;

        let cache_id = Uuid::now_v7().to_string();
        let counters = Arc::new(InstanceCounters::new(tag.as_str()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = CompletionListener::new(
            cache_id.clone(),
            tag.as_str().to_string(),
            Arc::clone(&local),
            Arc::clone(&counters),
            options.listener_watermarks,
        );
        let handle = tokio::spawn(listener.run(Arc::clone(&consumer), shutdown_rx));

        debug!(%cache_id, type_name = %tag, group = consumer.group(), "cache instance created");
        Ok(Self {
            cache_id,
            hostname: resolve_hostname(options.hostname.as_deref()),
            intent_topic: options.topics.intent.clone(),
            trace: options.trace,
            local,
            remote,
            producer,
            consumer,
            pool: WorkerPool::new(options.pool_capacity()),
            counters,
            shutdown,
            listener: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            tag,
        })
    }

    // -- identity ---------------------------------------------------------

    /// Unique, time-sortable identity of this instance.
    #[must_use]
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    #[must_use]
    pub fn type_tag(&self) -> &TypeTag {
        &self.tag
    }

    /// `<type tag>:`, the namespace of every key this instance touches.
    #[must_use]
    pub fn prefix(&self) -> String {
        self.tag.prefix()
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -- writes -----------------------------------------------------------

    /// Writes `value` locally and publishes a non-syncing `Set` intent.
    ///
    /// # Errors
    ///
    /// [`CacheError::AdmissionRejected`] if the local cache refused the value
    /// (the intent is published regardless), or [`CacheError::Closed`].
    pub fn set(&self, key: &str, value: T, local_ttl: Duration) -> Result<(), CacheError> {
        self.write(key, value, local_ttl, None)
    }

    /// Like [`set`](Self::set), but asks the state node to persist the value
    /// in the remote store with `rkv_ttl`.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidTtl`] if `rkv_ttl < local_ttl`, in which case
    /// nothing is written or published. Otherwise as [`set`](Self::set).
    pub fn set_with_sync(
        &self,
        key: &str,
        value: T,
        local_ttl: Duration,
        rkv_ttl: Duration,
    ) -> Result<(), CacheError> {
        if rkv_ttl < local_ttl {
            return Err(CacheError::InvalidTtl { local_ttl, rkv_ttl });
        }
        self.write(key, value, local_ttl, Some(rkv_ttl))
    }

    /// Removes `key` locally and publishes a non-syncing `Delete` intent.
    ///
    /// # Errors
    ///
    /// [`CacheError::Closed`] after [`close`](Self::close).
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key, false)
    }

    /// Like [`delete`](Self::delete), but asks the state node to also delete
    /// the key from the remote store.
    ///
    /// # Errors
    ///
    /// [`CacheError::Closed`] after [`close`](Self::close).
    pub fn delete_with_sync(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key, true)
    }

    fn write(
        &self,
        key: &str,
        value: T,
        local_ttl: Duration,
        rkv_ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let started = Instant::now();
        let full_key = self.tag.prefixed_key(key);

        let local = self.local.set(&full_key, value.clone(), local_ttl);

        let mut event = Event::intent(Op::Set, full_key, process_clock().now());
        event.local_ttl = local_ttl;
        if let Some(rkv_ttl) = rkv_ttl {
            event.sync_to_rkv = true;
            event.rkv_ttl = rkv_ttl;
        }
        self.send_event(event, Some(value));

        if self.trace {
            debug!(
                type_name = %self.tag,
                key,
                sync = rkv_ttl.is_some(),
                elapsed_us = started.elapsed().as_micros(),
                "set"
            );
        }
        local
    }

    fn remove(&self, key: &str, sync_to_rkv: bool) -> Result<(), CacheError> {
        self.ensure_open()?;
        let started = Instant::now();
        let full_key = self.tag.prefixed_key(key);

        match self.local.delete(&full_key) {
            Ok(()) => self.counters.local_delete(),
            Err(CacheError::EntryNotFound) => {}
            Err(err) => return Err(err),
        }

        let mut event = Event::intent(Op::Delete, full_key, process_clock().now());
        event.sync_to_rkv = sync_to_rkv;
        self.send_event(event, None);

        if self.trace {
            debug!(
                type_name = %self.tag,
                key,
                sync = sync_to_rkv,
                elapsed_us = started.elapsed().as_micros(),
                "delete"
            );
        }
        Ok(())
    }

    /// Publishes an intent on the worker pool. Failures are logged and counted;
    /// the caller's local write has already happened.
    fn send_event(&self, mut event: Event, value: Option<T>) {
        event.cache_id.clone_from(&self.cache_id);
        event.type_name = self.tag.as_str().to_string();
        event.hostname.clone_from(&self.hostname);

        let producer = Arc::clone(&self.producer);
        let counters = Arc::clone(&self.counters);
        let topic = self.intent_topic.clone();

        // Detached: the pool tracks it and `close` drains it.
        drop(self.pool.submit(async move {
            if let Some(value) = value {
                match marshal_value(&value) {
                    Ok(bytes) => event.value = bytes,
                    Err(err) => {
                        warn!(key = %event.key, error = %err, "failed to marshal intent value");
                        counters.publish_failure();
                        return;
                    }
                }
            }
            let payload = match encode(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(key = %event.key, error = %err, "failed to encode intent");
                    counters.publish_failure();
                    return;
                }
            };
            if let Err(err) = producer.produce_sync(ProduceRecord::new(topic, payload)).await {
                warn!(
                    key = %event.key,
                    op = %event.op,
                    ts = event.ts,
                    error = %err,
                    "failed to publish intent"
                );
                counters.publish_failure();
            }
        }));
    }

    // -- reads ------------------------------------------------------------

    /// Reads `key` from the local cache only.
    ///
    /// # Errors
    ///
    /// [`CacheError::EntryNotFound`] on a miss.
    pub fn get(&self, key: &str) -> Result<T, CacheError> {
        let started = Instant::now();
        let result = self.get_local(&self.tag.prefixed_key(key));
        if self.trace {
            debug!(
                type_name = %self.tag,
                key,
                hit = result.is_ok(),
                elapsed_us = started.elapsed().as_micros(),
                "get"
            );
        }
        result
    }

    fn get_local(&self, full_key: &str) -> Result<T, CacheError> {
        match self.local.get(full_key) {
            Ok(value) => {
                self.counters.local_hit();
                Ok(value)
            }
            Err(CacheError::EntryNotFound) => {
                self.counters.local_miss();
                Err(CacheError::EntryNotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads `key` locally, falling back to the remote store on a miss.
    ///
    /// A remote hit is copied into the local cache with `local_ttl`. The
    /// backfill is not published.
    ///
    /// # Errors
    ///
    /// [`CacheError::EntryNotFound`] if neither tier holds a value that
    /// decodes as `T`. Remote-store failures are logged and reported as a miss.
    pub async fn get_with_sync(&self, key: &str, local_ttl: Duration) -> Result<T, CacheError> {
        let started = Instant::now();
        let full_key = self.tag.prefixed_key(key);

        let result = match self.get_local(&full_key) {
            Err(CacheError::EntryNotFound) => self.read_through(&full_key, local_ttl).await,
            other => other,
        };

        if self.trace {
            debug!(
                type_name = %self.tag,
                key,
                hit = result.is_ok(),
                elapsed_us = started.elapsed().as_micros(),
                "get_with_sync"
            );
        }
        result
    }

    async fn read_through(&self, full_key: &str, local_ttl: Duration) -> Result<T, CacheError> {
        let bytes = match self.remote.get(full_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.rkv_miss();
                return Err(CacheError::EntryNotFound);
            }
            Err(err) => {
                warn!(key = full_key, error = %err, "remote read failed");
                return Err(CacheError::EntryNotFound);
            }
        };

        let value = match unmarshal_value::<T>(&bytes) {
            Ok(value) => value,
            Err(err) => {
                debug!(key = full_key, error = %err, "remote value does not decode as this type");
                return Err(CacheError::EntryNotFound);
            }
        };
        self.counters.rkv_hit();

        if let Err(err) = self.local.set(full_key, value.clone(), local_ttl) {
            debug!(key = full_key, error = %err, "local cache refused backfill");
        }
        Ok(value)
    }

    /// Whether a live entry exists for `key` in the local cache.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.local.exists(&self.tag.prefixed_key(key))
    }

    #[must_use]
    pub fn metrics(&self) -> InstanceMetrics {
        self.counters.snapshot()
    }

    // -- lifecycle --------------------------------------------------------

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Stops the listener, waits for pending publishes, and releases the bus
    /// clients. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        self.consumer.close();

        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(
                    cache_id = %self.cache_id,
                    error = %err,
                    "completion listener ended abnormally"
                );
            }
        }
        self.pool.drain().await;
        self.producer.close().await;
        debug!(cache_id = %self.cache_id, type_name = %self.tag, "cache instance closed");
    }
}

impl<T: CacheValue> Drop for CacheInstance<T> {
    fn drop(&mut self) {
        // Stops the listener if `close` was never called.
        self.shutdown.send_replace(true);
    }
}
