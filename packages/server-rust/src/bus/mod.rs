//! Message-bus adapters.
//!
//! The bus is a topic-partitioned, at-least-once log. This module defines the
//! narrow surface the cache needs from it:
//!
//! - [`Producer`]: synchronous produce of one record to one topic
//! - [`Consumer`]: poll-based fetch for one topic and consumer group
//! - [`Broker`]: factory building both from a broker list and tuning options
//!
//! [`new_producer`] and [`new_consumer`] are the entry points used by cache
//! instances and the state node; they validate the broker list and derive
//! the per-start consumer group name. [`MemoryBroker`] is the in-process
//! implementation.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{ConsumerOptions, ProducerOptions};
use crate::error::BusError;

pub use memory::MemoryBroker;

// ---------------------------------------------------------------------------
// Records and fetches
// ---------------------------------------------------------------------------

/// A record to produce. Bus keys are not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: String,
    pub value: Bytes,
}

impl ProduceRecord {
    #[must_use]
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            value: value.into(),
        }
    }
}

/// A consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Bytes,
}

/// Records fetched from a single partition, in offset order.
#[derive(Debug, Clone, Default)]
pub struct FetchPartition {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<Record>,
}

/// A per-partition fetch error.
#[derive(Debug)]
pub struct FetchError {
    pub topic: String,
    pub partition: i32,
    pub error: BusError,
}

/// Result of one poll: records grouped by partition, per-partition errors,
/// and whether the underlying client has been closed.
#[derive(Debug, Default)]
pub struct Fetches {
    partitions: Vec<FetchPartition>,
    errors: Vec<FetchError>,
    client_closed: bool,
}

impl Fetches {
    #[must_use]
    pub fn new(partitions: Vec<FetchPartition>) -> Self {
        Self {
            partitions,
            errors: Vec::new(),
            client_closed: false,
        }
    }

    /// A fetch signalling that the client was closed.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            client_closed: true,
            ..Self::default()
        }
    }

    /// Wraps raw values as records of a single partition of `topic`.
    /// Offsets are assigned in order starting at 0.
    #[must_use]
    pub fn from_values<I>(topic: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let records = values
            .into_iter()
            .zip(0_i64..)
            .map(|(value, offset)| Record {
                topic: topic.to_string(),
                partition: 0,
                offset,
                value: value.into(),
            })
            .collect();
        Self::new(vec![FetchPartition {
            topic: topic.to_string(),
            partition: 0,
            records,
        }])
    }

    pub fn push_error(&mut self, error: FetchError) {
        self.errors.push(error);
    }

    #[must_use]
    pub fn is_client_closed(&self) -> bool {
        self.client_closed
    }

    #[must_use]
    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    /// Iterates partitions in fetch order.
    pub fn partitions(&self) -> impl Iterator<Item = &FetchPartition> {
        self.partitions.iter()
    }

    /// Iterates all records, partition by partition.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.partitions.iter().flat_map(|p| p.records.iter())
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

// ---------------------------------------------------------------------------
// Client traits
// ---------------------------------------------------------------------------

/// Producer bound to one topic.
#[async_trait]
pub trait Producer: Send + Sync {
    /// The topic this producer writes to.
    fn topic(&self) -> &str;

    /// Produces one record and waits for the broker acknowledgement.
    async fn produce_sync(&self, record: ProduceRecord) -> Result<(), BusError>;

    /// Flushes and releases the client.
    async fn close(&self);
}

/// Consumer bound to one topic and consumer group.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// The full consumer group name.
    fn group(&self) -> &str;

    /// Waits for the next batch of records, up to the configured fetch wait.
    /// Returns an empty fetch on timeout and [`Fetches::closed`] once closed.
    async fn poll_fetches(&self) -> Fetches;

    /// Closes the client. The next poll signals client-closed.
    fn close(&self);
}

/// Factory for bus clients.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn producer(
        &self,
        brokers: &[String],
        topic: &str,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn Producer>, BusError>;

    /// Builds a consumer in `group`, starting at the latest offset if the
    /// group is new.
    async fn consumer(
        &self,
        brokers: &[String],
        topic: &str,
        group: &str,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn Consumer>, BusError>;
}

// ---------------------------------------------------------------------------
// Adapter entry points
// ---------------------------------------------------------------------------

/// Consumer group name for a group base and a start-time token.
#[must_use]
pub fn group_name(group_base: &str, start_token: u64) -> String {
    format!("{group_base}-{start_token}")
}

/// Builds a producer bound to `topic`.
///
/// # Errors
///
/// Returns [`BusError::NoBrokers`] if `brokers` is empty, or the broker's
/// construction error.
pub async fn new_producer(
    broker: &dyn Broker,
    brokers: &[String],
    topic: &str,
    options: &ProducerOptions,
) -> Result<Arc<dyn Producer>, BusError> {
    if brokers.is_empty() {
        return Err(BusError::NoBrokers);
    }
    broker.producer(brokers, topic, options).await
}

/// Builds a consumer of `topic` in group `<group_base>-<start_token>`.
///
/// A fresh token per start makes every restart a new group, so consumption
/// begins at the topic's latest offset and nothing is ever committed.
///
/// # Errors
///
/// Returns [`BusError::NoBrokers`] if `brokers` is empty, or the broker's
/// construction error.
pub async fn new_consumer(
    broker: &dyn Broker,
    brokers: &[String],
    topic: &str,
    group_base: &str,
    start_token: u64,
    options: &ConsumerOptions,
) -> Result<Arc<dyn Consumer>, BusError> {
    if brokers.is_empty() {
        return Err(BusError::NoBrokers);
    }
    let group = group_name(group_base, start_token);
    broker.consumer(brokers, topic, &group, options).await
}
