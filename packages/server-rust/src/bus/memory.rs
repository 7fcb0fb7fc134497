//! In-process [`Broker`] implementation.
//!
//! Each topic is a fixed set of append-only partitions held in memory.
//! Topics are auto-created on first use. Records without a key are spread
//! round-robin across partitions.
//!
//! Consumer groups keep committed offsets per partition, starting at the end
//! of the log when the group is first seen. Each consumer reads from its own
//! position, copied from the group's committed offsets when it is built, and
//! writes it back after every poll only with `auto_commit` on.
//!
//! Client options are honoured: `dial_timeout` bounds client construction,
//! `linger` delays each produce, and `retry_timeout` bounds a whole
//! produce. Dial and produce latency and fetch and produce failures can be
//! injected to drive those paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    Broker, Consumer, FetchError, FetchPartition, Fetches, ProduceRecord, Producer, Record,
};
use crate::config::{ConsumerOptions, ProducerOptions};
use crate::error::BusError;

const DEFAULT_PARTITIONS: usize = 1;

/// Takes one unit from an injected-failure budget.
fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// TopicLog
// ---------------------------------------------------------------------------

struct TopicLog {
    name: String,
    partitions: Vec<Mutex<Vec<Bytes>>>,
    next_partition: AtomicUsize,
    appended: Notify,
    failing_fetches: AtomicUsize,
}

impl TopicLog {
    fn new(name: &str, partition_count: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partition_count.max(1))
                .map(|_| Mutex::new(Vec::new()))
                .collect(),
            next_partition: AtomicUsize::new(0),
            appended: Notify::new(),
            failing_fetches: AtomicUsize::new(0),
        }
    }

    fn append(&self, value: Bytes) {
        let index = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.partitions[index].lock().push(value);
        self.appended.notify_waiters();
    }

    fn end_offsets(&self) -> Vec<usize> {
        self.partitions.iter().map(|p| p.lock().len()).collect()
    }

    /// Copies every record at or after `next[p]` and advances `next`.
    fn read_into(&self, next: &mut [usize], out: &mut Vec<FetchPartition>) -> usize {
        let mut bytes = 0;
        for (index, partition) in self.partitions.iter().enumerate() {
            let log = partition.lock();
            let from = next[index];
            if from >= log.len() {
                continue;
            }
            let partition_id = i32::try_from(index).unwrap_or(i32::MAX);
            let records: Vec<Record> = log[from..]
                .iter()
                .zip(from..)
                .map(|(value, offset)| {
                    bytes += value.len();
                    Record {
                        topic: self.name.clone(),
                        partition: partition_id,
                        offset: i64::try_from(offset).unwrap_or(i64::MAX),
                        value: value.clone(),
                    }
                })
                .collect();
            next[index] = log.len();
            drop(log);

            match out.iter_mut().find(|p| p.partition == partition_id) {
                Some(existing) => existing.records.extend(records),
                None => out.push(FetchPartition {
                    topic: self.name.clone(),
                    partition: partition_id,
                    records,
                }),
            }
        }
        bytes
    }

    /// A fetch carrying one injected partition error and no records.
    fn failed_fetch(&self) -> Fetches {
        let mut fetches = Fetches::new(Vec::new());
        fetches.push_error(FetchError {
            topic: self.name.clone(),
            partition: 0,
            error: BusError::Io(anyhow::anyhow!("injected fetch failure on {}", self.name)),
        });
        fetches
    }

    fn snapshot(&self) -> Vec<Bytes> {
        self.partitions
            .iter()
            .flat_map(|p| p.lock().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

struct BrokerInner {
    topics: DashMap<String, Arc<TopicLog>>,
    /// `(topic, group)` -> committed offset per partition.
    groups: DashMap<(String, String), Arc<Mutex<Vec<usize>>>>,
    partitions_per_topic: usize,
    closed: AtomicBool,
    failing_produces: AtomicUsize,
    produce_delay: Mutex<Duration>,
    dial_delay: Mutex<Duration>,
}

impl BrokerInner {
    fn topic(&self, name: &str) -> Arc<TopicLog> {
        if let Some(log) = self.topics.get(name) {
            return Arc::clone(log.value());
        }
        Arc::clone(
            self.topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TopicLog::new(name, self.partitions_per_topic)))
                .value(),
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulated connection setup, bounded by `timeout`.
    async fn dial(&self, topic: &str, timeout: Duration) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let delay = *self.dial_delay.lock();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::time::timeout(timeout, tokio::time::sleep(delay))
            .await
            .map_err(|_| BusError::Timeout {
                topic: topic.to_string(),
                timeout,
            })
    }
}

/// In-process topic-partitioned log. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.inner.topics.len())
            .field("groups", &self.inner.groups.len())
            .field("partitions_per_topic", &self.inner.partitions_per_topic)
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    /// Creates a broker whose topics have a single partition.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a broker whose topics have `partitions` partitions each.
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: DashMap::new(),
                groups: DashMap::new(),
                partitions_per_topic: partitions.max(1),
                closed: AtomicBool::new(false),
                failing_produces: AtomicUsize::new(0),
                produce_delay: Mutex::new(Duration::ZERO),
                dial_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Makes the next `count` produce calls fail with an I/O error.
    pub fn fail_next_produces(&self, count: usize) {
        self.inner.failing_produces.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` polls of `topic` return a partition error
    /// instead of records. Records stay in the log for later polls.
    pub fn fail_next_fetches(&self, topic: &str, count: usize) {
        self.inner
            .topic(topic)
            .failing_fetches
            .store(count, Ordering::SeqCst);
    }

    /// Adds `delay` to every produce, on top of the producer's linger.
    pub fn set_produce_delay(&self, delay: Duration) {
        *self.inner.produce_delay.lock() = delay;
    }

    /// Makes building a producer or consumer take `delay`.
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.inner.dial_delay.lock() = delay;
    }

    /// All record values of `topic` in partition order. Empty for unknown topics.
    #[must_use]
    pub fn topic_values(&self, topic: &str) -> Vec<Bytes> {
        self.inner
            .topics
            .get(topic)
            .map(|log| log.snapshot())
            .unwrap_or_default()
    }

    /// Closes every client built by this broker.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for log in &self.inner.topics {
            log.value().appended.notify_waiters();
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn producer(
        &self,
        _brokers: &[String],
        topic: &str,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn Producer>, BusError> {
        self.inner.dial(topic, options.dial_timeout).await?;
        self.inner.topic(topic);
        Ok(Arc::new(MemoryProducer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            options: options.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        _brokers: &[String],
        topic: &str,
        group: &str,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn Consumer>, BusError> {
        self.inner.dial(topic, options.dial_timeout).await?;
        let log = self.inner.topic(topic);
        let committed = Arc::clone(
            self.inner
                .groups
                .entry((topic.to_string(), group.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(log.end_offsets())))
                .value(),
        );
        let position = Mutex::new(committed.lock().clone());
        Ok(Arc::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            log,
            group: group.to_string(),
            committed,
            position,
            options: options.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

struct MemoryProducer {
    inner: Arc<BrokerInner>,
    topic: String,
    options: ProducerOptions,
    closed: AtomicBool,
}

impl MemoryProducer {
    async fn deliver(&self, record: ProduceRecord) -> Result<(), BusError> {
        if !self.options.linger.is_zero() {
            tokio::time::sleep(self.options.linger).await;
        }
        let delay = *self.inner.produce_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.inner.failing_produces) {
            return Err(BusError::Io(anyhow::anyhow!(
                "injected produce failure on {}",
                record.topic
            )));
        }
        self.inner.topic(&record.topic).append(record.value);
        Ok(())
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn produce_sync(&self, record: ProduceRecord) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) || self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let timeout = self.options.retry_timeout;
        let topic = record.topic.clone();
        tokio::time::timeout(timeout, self.deliver(record))
            .await
            .unwrap_or(Err(BusError::Timeout { topic, timeout }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    log: Arc<TopicLog>,
    group: String,
    committed: Arc<Mutex<Vec<usize>>>,
    position: Mutex<Vec<usize>>,
    options: ConsumerOptions,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.inner.is_closed()
    }

    fn read(&self, out: &mut Vec<FetchPartition>) -> usize {
        let mut position = self.position.lock();
        let bytes = self.log.read_into(&mut position, out);
        if self.options.auto_commit {
            self.committed.lock().clone_from(&*position);
        }
        bytes
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn group(&self) -> &str {
        &self.group
    }

    async fn poll_fetches(&self) -> Fetches {
        if self.is_closed() {
            return Fetches::closed();
        }
        if take_one(&self.log.failing_fetches) {
            return self.log.failed_fetch();
        }

        let deadline = Instant::now() + self.options.fetch_max_wait;
        let mut partitions = Vec::new();
        let mut bytes = 0;

        loop {
            if self.is_closed() {
                return Fetches::closed();
            }
            // Register interest before reading so an append between the read
            // and the wait is not missed.
            let appended = self.log.appended.notified();

            bytes += self.read(&mut partitions);
            let has_records = partitions.iter().any(|p| !p.records.is_empty());
            if has_records && bytes >= self.options.fetch_min_bytes {
                return Fetches::new(partitions);
            }

            let now = Instant::now();
            if now >= deadline {
                return Fetches::new(partitions);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                self.read(&mut partitions);
                return Fetches::new(partitions);
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.appended.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn brokers() -> Vec<String> {
        vec!["memory".to_string()]
    }

    async fn consumer(broker: &MemoryBroker, topic: &str, group: &str) -> Arc<dyn Consumer> {
        broker
            .consumer(&brokers(), topic, group, &ConsumerOptions::default())
            .await
            .unwrap()
    }

    async fn producer(broker: &MemoryBroker, topic: &str) -> Arc<dyn Producer> {
        broker
            .producer(&brokers(), topic, &ProducerOptions::default())
            .await
            .unwrap()
    }

    fn values(fetches: &Fetches) -> Vec<Bytes> {
        fetches.records().map(|r| r.value.clone()).collect()
    }

    #[tokio::test]
    async fn consumer_starts_at_latest_offset() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        producer.produce_sync(ProduceRecord::new("t", "old")).await.unwrap();

        let consumer = consumer(&broker, "t", "g1").await;
        producer.produce_sync(ProduceRecord::new("t", "new")).await.unwrap();

        let fetches = consumer.poll_fetches().await;
        assert_eq!(values(&fetches), vec![Bytes::from("new")]);
        assert_eq!(fetches.records().next().unwrap().offset, 1);
    }

    #[tokio::test]
    async fn empty_poll_returns_after_fetch_wait() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "t", "g").await;
        let fetches = consumer.poll_fetches().await;
        assert!(fetches.is_empty());
        assert!(!fetches.is_client_closed());
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .consumer(
                &brokers(),
                "t",
                "g",
                &ConsumerOptions {
                    fetch_max_wait: Duration::from_secs(5),
                    ..ConsumerOptions::default()
                },
            )
            .await
            .unwrap();
        let producer = producer(&broker, "t").await;

        let poll = tokio::spawn(async move { consumer.poll_fetches().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.produce_sync(ProduceRecord::new("t", "x")).await.unwrap();

        let fetches = tokio::time::timeout(Duration::from_secs(1), poll)
            .await
            .expect("poll should wake before its fetch wait")
            .unwrap();
        assert_eq!(fetches.record_count(), 1);
    }

    #[tokio::test]
    async fn separate_groups_each_see_every_record() {
        let broker = MemoryBroker::new();
        let a = consumer(&broker, "t", "ga").await;
        let b = consumer(&broker, "t", "gb").await;
        let producer = producer(&broker, "t").await;
        producer.produce_sync(ProduceRecord::new("t", "1")).await.unwrap();
        producer.produce_sync(ProduceRecord::new("t", "2")).await.unwrap();

        assert_eq!(a.poll_fetches().await.record_count(), 2);
        assert_eq!(b.poll_fetches().await.record_count(), 2);
        assert!(a.poll_fetches().await.is_empty());
    }

    #[tokio::test]
    async fn records_spread_across_partitions() {
        let broker = MemoryBroker::with_partitions(3);
        let consumer = consumer(&broker, "t", "g").await;
        let producer = producer(&broker, "t").await;
        for i in 0..6 {
            producer
                .produce_sync(ProduceRecord::new("t", format!("v{i}")))
                .await
                .unwrap();
        }

        let fetches = consumer.poll_fetches().await;
        assert_eq!(fetches.partitions().count(), 3);
        assert!(fetches.partitions().all(|p| p.records.len() == 2));
    }

    #[tokio::test]
    async fn closed_consumer_signals_client_closed() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "t", "g").await;
        consumer.close();
        assert!(consumer.poll_fetches().await.is_client_closed());
    }

    #[tokio::test]
    async fn broker_close_rejects_produce_and_closes_consumers() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "t", "g").await;
        let producer = producer(&broker, "t").await;
        broker.close();

        let err = producer.produce_sync(ProduceRecord::new("t", "x")).await;
        assert!(matches!(err, Err(BusError::Closed)));
        assert!(consumer.poll_fetches().await.is_client_closed());
    }

    #[tokio::test]
    async fn injected_produce_failures_are_consumed() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        broker.fail_next_produces(1);

        assert!(producer.produce_sync(ProduceRecord::new("t", "a")).await.is_err());
        assert!(producer.produce_sync(ProduceRecord::new("t", "b")).await.is_ok());
        assert_eq!(broker.topic_values("t"), vec![Bytes::from("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn produce_waits_for_linger() {
        let broker = MemoryBroker::new();
        let options = ProducerOptions {
            linger: Duration::from_millis(50),
            ..ProducerOptions::default()
        };
        let producer = broker.producer(&brokers(), "t", &options).await.unwrap();

        let started = Instant::now();
        producer.produce_sync(ProduceRecord::new("t", "x")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(broker.topic_values("t").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_produce_times_out_after_retry_timeout() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        broker.set_produce_delay(Duration::from_secs(1));

        let err = producer
            .produce_sync(ProduceRecord::new("t", "late"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Timeout { ref topic, timeout }
                if topic == "t" && timeout == Duration::from_millis(300)
        ));
        assert!(broker.topic_values("t").is_empty());

        broker.set_produce_delay(Duration::ZERO);
        producer.produce_sync(ProduceRecord::new("t", "ok")).await.unwrap();
        assert_eq!(broker.topic_values("t"), vec![Bytes::from("ok")]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dial_times_out_after_dial_timeout() {
        let broker = MemoryBroker::new();
        broker.set_dial_delay(Duration::from_secs(5));

        let producer = broker
            .producer(&brokers(), "t", &ProducerOptions::default())
            .await;
        assert!(matches!(producer, Err(BusError::Timeout { .. })));
        let consumer = broker
            .consumer(&brokers(), "t", "g", &ConsumerOptions::default())
            .await;
        assert!(matches!(consumer, Err(BusError::Timeout { .. })));

        broker.set_dial_delay(Duration::from_millis(100));
        assert!(broker
            .producer(&brokers(), "t", &ProducerOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn positions_are_only_committed_with_auto_commit() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;

        let first = consumer(&broker, "t", "manual").await;
        producer.produce_sync(ProduceRecord::new("t", "a")).await.unwrap();
        assert_eq!(first.poll_fetches().await.record_count(), 1);
        // Nothing was committed, so a new member of the group starts over.
        let second = consumer(&broker, "t", "manual").await;
        assert_eq!(values(&second.poll_fetches().await), vec![Bytes::from("a")]);

        let options = ConsumerOptions {
            auto_commit: true,
            ..ConsumerOptions::default()
        };
        let first = broker.consumer(&brokers(), "t", "auto", &options).await.unwrap();
        producer.produce_sync(ProduceRecord::new("t", "b")).await.unwrap();
        assert_eq!(values(&first.poll_fetches().await), vec![Bytes::from("b")]);
        let second = broker.consumer(&brokers(), "t", "auto", &options).await.unwrap();
        assert!(second.poll_fetches().await.is_empty());
    }

    #[tokio::test]
    async fn injected_fetch_failures_surface_as_partition_errors() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker, "t", "g").await;
        let producer = producer(&broker, "t").await;
        producer.produce_sync(ProduceRecord::new("t", "kept")).await.unwrap();
        broker.fail_next_fetches("t", 1);

        let failed = consumer.poll_fetches().await;
        assert!(failed.is_empty());
        assert!(!failed.is_client_closed());
        assert_eq!(failed.errors().len(), 1);
        assert!(matches!(failed.errors()[0].error, BusError::Io(_)));

        let retried = consumer.poll_fetches().await;
        assert!(retried.errors().is_empty());
        assert_eq!(values(&retried), vec![Bytes::from("kept")]);
    }
}
