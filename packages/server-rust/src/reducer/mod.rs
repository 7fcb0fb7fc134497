//! State-node reducer.
//!
//! Consumes `Set`/`Delete` intents, applies the newest one per key to the
//! remote store, and publishes a completion for each successful apply.
//!
//! Per batch:
//!
//! 1. Decode every record. Drop intents whose `ts` is not strictly greater
//!    than the key's watermark, and keep only the newest intent per key.
//! 2. Sort survivors by `(ts, key)`.
//! 3. Apply each survivor on the worker pool and wait for all of them.
//! 4. Raise each survivor's key watermark to its `ts`.
//!
//! Watermarks only grow, so the sequence of `ts` applied to the remote store
//! for any key is strictly increasing. Offsets are never committed; a
//! restarted state node resumes from the latest offset.

pub mod state_node;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tiercache_core::{decode, encode, process_clock, Event, Op};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{new_consumer, new_producer, Consumer, Fetches, ProduceRecord, Producer};
use crate::config::StateNodeOptions;
use crate::error::CacheError;
use crate::pool::WorkerPool;
use crate::remote::RemoteStore;

pub use state_node::{init_state_node, shutdown_state_node, state_node};

/// Pause between polls once the consumer reports client-closed.
const CLOSED_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Batch collection
// ---------------------------------------------------------------------------

/// Result of the single pass over a fetched batch.
#[derive(Debug, Default)]
pub struct Collected {
    /// Newest non-stale intent per key, sorted by `(ts, key)`.
    pub survivors: Vec<Event>,
    pub total: u64,
    /// Stale by watermark.
    pub stale: u64,
    /// Beaten by a newer intent for the same key in the same batch.
    pub superseded: u64,
    pub decode_failures: u64,
}

/// Filters and orders one batch against `watermark`, which returns the last
/// applied `ts` for a key (0 if none).
pub fn collect_survivors<F>(fetches: &Fetches, watermark: F) -> Collected
where
    F: Fn(&str) -> u64,
{
    let mut collected = Collected::default();
    let mut latest: HashMap<String, Event> = HashMap::new();

    for record in fetches.records() {
        collected.total += 1;
        let event = match decode(&record.value) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "skipping undecodable intent"
                );
                collected.decode_failures += 1;
                continue;
            }
        };

        if event.ts <= watermark(&event.key) {
            collected.stale += 1;
            continue;
        }

        match latest.get(&event.key) {
            Some(kept) if kept.ts >= event.ts => collected.superseded += 1,
            Some(_) => {
                collected.superseded += 1;
                latest.insert(event.key.clone(), event);
            }
            None => {
                latest.insert(event.key.clone(), event);
            }
        }
    }

    let mut survivors: Vec<Event> = latest.into_values().collect();
    survivors.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.key.cmp(&b.key)));
    collected.survivors = survivors;
    collected
}

// ---------------------------------------------------------------------------
// BatchStats
// ---------------------------------------------------------------------------

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: u64,
    pub survivors: u64,
    /// Remote applies that succeeded (counted before the completion is produced).
    pub success: u64,
    /// Decode, remote, and completion-encode failures.
    pub failed: u64,
    /// Stale plus superseded intents.
    pub skipped: u64,
    pub superseded: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    success: u64,
    failed: u64,
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// The state-node reducer.
pub struct Reducer {
    remote: Arc<dyn RemoteStore>,
    consumer: Arc<dyn Consumer>,
    producer: Arc<dyn Producer>,
    completion_topic: String,
    pool: WorkerPool,
    watermarks: DashMap<String, u64>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("group", &self.consumer.group())
            .field("completion_topic", &self.completion_topic)
            .field("pool_capacity", &self.pool.capacity())
            .field("watermarks", &self.watermarks.len())
            .finish_non_exhaustive()
    }
}

impl Reducer {
    /// Connects to the remote store and the bus. Does not start consuming;
    /// see [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`CacheError::Config`] if the broker or remote store is missing, or
    /// [`CacheError::Transport`] if the remote store is unreachable or the bus
    /// clients cannot be built.
    pub async fn connect(options: StateNodeOptions) -> Result<Self, CacheError> {
        let remote = options
            .remote
            .clone()
            .ok_or_else(|| CacheError::Config("no remote store configured".to_string()))?;
        let broker = options
            .broker
            .clone()
            .ok_or_else(|| CacheError::Config("no bus broker configured".to_string()))?;

        remote.ping().await?;
        let producer = new_producer(
            broker.as_ref(),
            &options.brokers,
            &options.topics.completion,
            &options.producer,
        )
        .await?;
        let consumer = new_consumer(
            broker.as_ref(),
            &options.brokers,
            &options.topics.intent,
            &options.topics.intent,
            process_clock().now(),
            &options.consumer,
        )
        .await?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            remote,
            consumer,
            producer,
            completion_topic: options.topics.completion.clone(),
            pool: WorkerPool::new(options.pool_capacity()),
            watermarks: DashMap::new(),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Spawns the batch loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let reducer = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(reducer.run(shutdown)));
    }

    /// Last applied `ts` for `key`.
    #[must_use]
    pub fn watermark(&self, key: &str) -> Option<u64> {
        self.watermarks.get(key).map(|ts| *ts)
    }

    /// Number of keys with a watermark.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.watermarks.len()
    }

    /// The consumer group this reducer reads intents with.
    #[must_use]
    pub fn group(&self) -> &str {
        self.consumer.group()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(group = self.consumer.group(), "state node reducer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetches = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                fetches = self.consumer.poll_fetches() => fetches,
            };

            if fetches.is_client_closed() {
                debug!("intent consumer closed");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(CLOSED_BACKOFF) => {}
                }
                continue;
            }
            for err in fetches.errors() {
                warn!(
                    topic = %err.topic,
                    partition = err.partition,
                    error = %err.error,
                    "intent fetch error"
                );
            }
            self.process(&fetches).await;
        }
        info!("state node reducer stopped");
    }

    /// Runs one batch through filtering, apply, and watermark advance.
    pub async fn process(&self, fetches: &Fetches) -> BatchStats {
        let started = Instant::now();
        let collected = collect_survivors(fetches, |key| self.watermark(key).unwrap_or(0));

        let mut stats = BatchStats {
            total: collected.total,
            survivors: collected.survivors.len() as u64,
            failed: collected.decode_failures,
            skipped: collected.stale + collected.superseded,
            superseded: collected.superseded,
            ..BatchStats::default()
        };
        if collected.survivors.is_empty() {
            stats.elapsed = started.elapsed();
            record_metrics(&stats);
            return stats;
        }

        let handles: Vec<JoinHandle<Tally>> = collected
            .survivors
            .iter()
            .map(|event| {
                let remote = Arc::clone(&self.remote);
                let producer = Arc::clone(&self.producer);
                let topic = self.completion_topic.clone();
                let event = event.clone();
                self.pool.submit(async move {
                    apply(remote.as_ref(), producer.as_ref(), &topic, event).await
                })
            })
            .collect();

        for tally in futures_util::future::join_all(handles).await {
            match tally {
                Ok(tally) => {
                    stats.success += tally.success;
                    stats.failed += tally.failed;
                }
                Err(err) => {
                    error!(error = %err, "apply task panicked");
                    stats.failed += 1;
                }
            }
        }

        for event in &collected.survivors {
            self.watermarks
                .entry(event.key.clone())
                .and_modify(|ts| *ts = (*ts).max(event.ts))
                .or_insert(event.ts);
        }

        stats.elapsed = started.elapsed();
        info!(
            total = stats.total,
            survivors = stats.survivors,
            success = stats.success,
            failed = stats.failed,
            skipped = stats.skipped,
            elapsed_ms = stats.elapsed.as_millis(),
            "processed intent batch"
        );
        record_metrics(&stats);
        stats
    }

    /// Stops the loop after the current batch, waits for in-flight applies,
    /// and releases the bus clients. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "reducer loop ended abnormally");
            }
        }
        self.pool.drain().await;
        self.consumer.close();
        self.producer.close().await;
    }
}

/// Applies one surviving intent and publishes its completion.
async fn apply(
    remote: &dyn RemoteStore,
    producer: &dyn Producer,
    topic: &str,
    event: Event,
) -> Tally {
    let mut tally = Tally::default();

    match event.op {
        Op::Set if event.sync_to_rkv => {
            let value = Bytes::from(event.value.clone());
            if let Err(err) = remote.set(&event.key, value, event.rkv_ttl).await {
                error!(key = %event.key, ts = event.ts, error = %err, "remote set failed");
                tally.failed += 1;
                return tally;
            }
        }
        Op::Delete if event.sync_to_rkv => {
            if let Err(err) = remote.del(&event.key).await {
                error!(key = %event.key, ts = event.ts, error = %err, "remote delete failed");
                tally.failed += 1;
                return tally;
            }
        }
        Op::Set | Op::Delete => {}
        op => {
            warn!(key = %event.key, %op, "unknown op on intent topic");
            return tally;
        }
    }
    tally.success += 1;

    let Some(completion) = event.to_completion(process_clock().now()) else {
        return tally;
    };
    let payload = match encode(&completion) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(key = %completion.key, error = %err, "failed to encode completion");
            tally.failed += 1;
            return tally;
        }
    };
    if let Err(err) = producer.produce_sync(ProduceRecord::new(topic, payload)).await {
        warn!(
            key = %completion.key,
            op = %completion.op,
            error = %err,
            "failed to publish completion"
        );
    }
    tally
}

fn record_metrics(stats: &BatchStats) {
    for (outcome, count) in [
        ("applied", stats.success),
        ("skipped", stats.skipped),
        ("failed", stats.failed),
    ] {
        metrics::counter!("tiercache_reducer_records_total", "outcome" => outcome).increment(count);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tiercache_core::{marshal_value, unmarshal_value};

    use super::*;
    use crate::bus::{Broker, MemoryBroker};
    use crate::config::{ProducerOptions, COMPLETION_TOPIC, INTENT_TOPIC};
    use crate::remote::{MemoryRemoteStore, RemoteOp};

    fn intent(op: Op, key: &str, ts: u64, sync: bool) -> Event {
        let mut event = Event::intent(op, key, ts);
        event.cache_id = "origin".to_string();
        event.type_name = "String".to_string();
        event.hostname = "host-a".to_string();
        event.sync_to_rkv = sync;
        if op == Op::Set {
            event.value = marshal_value(&format!("v{ts}")).unwrap();
            event.local_ttl = Duration::from_secs(60);
            event.rkv_ttl = Duration::from_secs(600);
        }
        event
    }

    fn batch(events: &[Event]) -> Fetches {
        Fetches::from_values(INTENT_TOPIC, events.iter().map(|e| encode(e).unwrap()))
    }

    struct Node {
        broker: MemoryBroker,
        remote: Arc<MemoryRemoteStore>,
        reducer: Reducer,
    }

    impl Node {
        async fn new() -> Self {
            let broker = MemoryBroker::new();
            let remote = Arc::new(MemoryRemoteStore::new());
            let reducer = Reducer::connect(
                StateNodeOptions::new()
                    .with_brokers(["memory:0"])
                    .with_broker(Arc::new(broker.clone()))
                    .with_remote(Arc::clone(&remote) as Arc<dyn RemoteStore>),
            )
            .await
            .unwrap();
            Self {
                broker,
                remote,
                reducer,
            }
        }

        fn completions(&self) -> Vec<Event> {
            self.broker
                .topic_values(COMPLETION_TOPIC)
                .iter()
                .map(|bytes| decode(bytes).unwrap())
                .collect()
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn collect_keeps_newest_per_key_and_sorts() {
        let fetches = batch(&[
            intent(Op::Set, "b", 30, true),
            intent(Op::Set, "a", 10, true),
            intent(Op::Delete, "a", 20, true),
            intent(Op::Set, "b", 5, true),
            intent(Op::Set, "c", 30, true),
        ]);
        let collected = collect_survivors(&fetches, |_| 0);

        let order: Vec<(&str, u64)> = collected
            .survivors
            .iter()
            .map(|e| (e.key.as_str(), e.ts))
            .collect();
        assert_eq!(order, vec![("a", 20), ("b", 30), ("c", 30)]);
        assert_eq!(collected.total, 5);
        assert_eq!(collected.superseded, 2);
        assert_eq!(collected.stale, 0);
    }

    #[test]
    fn collect_treats_equal_ts_as_stale() {
        let fetches = batch(&[intent(Op::Set, "k", 100, true), intent(Op::Set, "j", 101, true)]);
        let collected = collect_survivors(&fetches, |key| if key == "k" { 100 } else { 0 });
        assert_eq!(collected.stale, 1);
        assert_eq!(collected.survivors.len(), 1);
        assert_eq!(collected.survivors[0].key, "j");
    }

    #[test]
    fn collect_counts_undecodable_records() {
        let mut values = vec![b"\xc1".to_vec()];
        values.push(encode(&intent(Op::Set, "k", 1, true)).unwrap());
        let collected = collect_survivors(&Fetches::from_values(INTENT_TOPIC, values), |_| 0);
        assert_eq!(collected.decode_failures, 1);
        assert_eq!(collected.survivors.len(), 1);
    }

    #[tokio::test]
    async fn applies_set_and_emits_set_done() {
        let node = Node::new().await;
        let stats = node.reducer.process(&batch(&[intent(Op::Set, "String:k", 100, true)])).await;

        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 0);
        let stored = node.remote.get("String:k").await.unwrap().unwrap();
        assert_eq!(unmarshal_value::<String>(&stored).unwrap(), "v100");
        assert_eq!(node.reducer.watermark("String:k"), Some(100));

        let completions = node.completions();
        assert_eq!(completions.len(), 1);
        let done = &completions[0];
        assert_eq!(done.op, Op::SetDone);
        assert_eq!(done.cache_id, "origin");
        assert_eq!(done.type_name, "String");
        assert_eq!(done.hostname, "host-a");
        assert_eq!(done.local_ttl, Duration::from_secs(60));
        assert_ne!(done.ts, 100);
    }

    #[tokio::test]
    async fn non_syncing_intents_still_complete() {
        let node = Node::new().await;
        node.reducer
            .process(&batch(&[
                intent(Op::Set, "String:a", 1, false),
                intent(Op::Delete, "String:b", 2, false),
            ]))
            .await;

        assert!(node.remote.journal().is_empty());
        let ops: Vec<Op> = node.completions().iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![Op::SetDone, Op::DeleteDone]);
    }

    #[tokio::test]
    async fn delete_done_drops_value_and_local_ttl() {
        let node = Node::new().await;
        let mut delete = intent(Op::Delete, "String:k", 7, true);
        delete.local_ttl = Duration::from_secs(5);
        delete.value = b"junk".to_vec();
        node.reducer.process(&batch(&[delete])).await;

        assert_eq!(node.remote.journal(), vec![RemoteOp::Del { key: "String:k".to_string() }]);
        let done = &node.completions()[0];
        assert_eq!(done.op, Op::DeleteDone);
        assert!(done.value.is_empty());
        assert_eq!(done.local_ttl, Duration::ZERO);
        assert!(done.sync_to_rkv);
    }

    #[tokio::test]
    async fn remote_failure_suppresses_only_its_completion() {
        let node = Node::new().await;
        node.remote.fail_next(1);
        let stats = node
            .reducer
            .process(&batch(&[
                intent(Op::Set, "String:a", 1, true),
                intent(Op::Set, "String:b", 2, true),
            ]))
            .await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success, 1);
        let completions = node.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].key, "String:b");
        // Failed applies still advance the watermark.
        assert_eq!(node.reducer.watermark("String:a"), Some(1));
    }

    #[tokio::test]
    async fn produce_failure_is_not_counted_as_failure() {
        let node = Node::new().await;
        node.broker.fail_next_produces(1);
        let stats = node.reducer.process(&batch(&[intent(Op::Set, "String:k", 1, true)])).await;
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 0);
        assert!(node.completions().is_empty());
        assert!(node.remote.get("String:k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_ops_are_dropped() {
        let node = Node::new().await;
        let stats = node
            .reducer
            .process(&batch(&[
                intent(Op::Unknown(9), "String:k", 1, true),
                intent(Op::SetDone, "String:j", 2, true),
            ]))
            .await;
        assert_eq!(stats.survivors, 2);
        assert_eq!(stats.success, 0);
        assert!(node.remote.journal().is_empty());
        assert!(node.completions().is_empty());
    }

    #[tokio::test]
    async fn connect_requires_reachable_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_unreachable(true);
        let err = Reducer::connect(
            StateNodeOptions::new()
                .with_brokers(["memory:0"])
                .with_broker(Arc::new(MemoryBroker::new()))
                .with_remote(remote as Arc<dyn RemoteStore>),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CacheError::Transport(_)));

        let err = Reducer::connect(StateNodeOptions::new()).await.unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[tokio::test]
    async fn started_loop_consumes_bus_and_stops_on_shutdown() {
        let node = Node::new().await;
        let reducer = Arc::new(node.reducer);
        reducer.start();
        reducer.start();

        let producer = node
            .broker
            .producer(&["memory:0".to_string()], INTENT_TOPIC, &ProducerOptions::default())
            .await
            .unwrap();
        let payload = encode(&intent(Op::Set, "String:k", 5, true)).unwrap();
        producer
            .produce_sync(ProduceRecord::new(INTENT_TOPIC, payload))
            .await
            .unwrap();

        wait_for_watermark(&reducer, "String:k").await;
        reducer.shutdown().await;
        reducer.shutdown().await;
        assert_eq!(node.remote.journal_for("String:k").len(), 1);
    }

    async fn wait_for_watermark(reducer: &Reducer, key: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reducer.watermark(key).is_none() {
            assert!(tokio::time::Instant::now() < deadline, "intent never applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn loop_keeps_consuming_after_fetch_errors() {
        let node = Node::new().await;
        let reducer = Arc::new(node.reducer);
        node.broker.fail_next_fetches(INTENT_TOPIC, 3);
        reducer.start();

        let producer = node
            .broker
            .producer(&["memory:0".to_string()], INTENT_TOPIC, &ProducerOptions::default())
            .await
            .unwrap();
        let payload = encode(&intent(Op::Set, "String:k", 9, true)).unwrap();
        producer
            .produce_sync(ProduceRecord::new(INTENT_TOPIC, payload))
            .await
            .unwrap();

        wait_for_watermark(&reducer, "String:k").await;
        assert_eq!(reducer.watermark("String:k"), Some(9));
        reducer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_waits_out_a_closed_bus_and_still_shuts_down() {
        let node = Node::new().await;
        let reducer = Arc::new(node.reducer);
        reducer.start();
        node.broker.close();

        tokio::time::sleep(CLOSED_BACKOFF * 3).await;
        let running = reducer
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        assert!(running, "loop exited on a closed consumer");

        tokio::time::timeout(Duration::from_secs(1), reducer.shutdown())
            .await
            .expect("shutdown hung on a closed bus");
        assert!(reducer.task.lock().is_none());
    }

    fn stamp_of(op: &RemoteOp) -> u64 {
        match op {
            RemoteOp::Set { value, .. } => {
                let text: String = unmarshal_value(value).unwrap();
                text.trim_start_matches('v').parse().unwrap()
            }
            RemoteOp::Del { .. } => unreachable!("only sets are generated"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Applied stamps per key are strictly increasing across batches.
        #[test]
        fn applied_stamps_increase_per_key(
            batches in prop::collection::vec(
                prop::collection::vec((0_usize..4, 1_u64..200), 1..20),
                1..6,
            )
        ) {
            let rt = runtime();
            rt.block_on(async {
                let node = Node::new().await;
                for writes in &batches {
                    let events: Vec<Event> = writes
                        .iter()
                        .map(|(k, ts)| intent(Op::Set, &format!("String:k{k}"), *ts, true))
                        .collect();
                    node.reducer.process(&batch(&events)).await;
                }
                for k in 0..4 {
                    let stamps: Vec<u64> = node
                        .remote
                        .journal_for(&format!("String:k{k}"))
                        .iter()
                        .map(stamp_of)
                        .collect();
                    prop_assert!(stamps.windows(2).all(|w| w[0] < w[1]), "{:?}", stamps);
                }
                Ok(())
            })?;
        }

        /// One batch issues exactly one remote op per key, for the newest stamp.
        #[test]
        fn batch_dedup_keeps_newest(stamps in prop::collection::btree_set(1_u64..10_000, 1..30)) {
            let rt = runtime();
            rt.block_on(async {
                let node = Node::new().await;
                let mut events: Vec<Event> = stamps
                    .iter()
                    .map(|ts| intent(Op::Set, "String:k", *ts, true))
                    .collect();
                events.reverse();
                let stats = node.reducer.process(&batch(&events)).await;

                let journal = node.remote.journal_for("String:k");
                prop_assert_eq!(journal.len(), 1);
                prop_assert_eq!(stamp_of(&journal[0]), *stamps.iter().max().unwrap());
                prop_assert_eq!(stats.survivors, 1);
                prop_assert_eq!(stats.skipped, stamps.len() as u64 - 1);
                Ok(())
            })?;
        }

        /// Intents at or below the watermark never reach the store or the bus.
        #[test]
        fn stale_intents_have_no_effect(
            w in 1_u64..1_000,
            stale in prop::collection::vec(0_u64..=1_000, 1..10),
        ) {
            let rt = runtime();
            rt.block_on(async {
                let node = Node::new().await;
                node.reducer.process(&batch(&[intent(Op::Set, "String:k", w, true)])).await;
                let before_ops = node.remote.journal().len();
                let before_done = node.completions().len();

                let events: Vec<Event> = stale
                    .iter()
                    .map(|ts| intent(Op::Delete, "String:k", (*ts).min(w), true))
                    .collect();
                let stats = node.reducer.process(&batch(&events)).await;

                prop_assert_eq!(node.remote.journal().len(), before_ops);
                prop_assert_eq!(node.completions().len(), before_done);
                prop_assert_eq!(stats.skipped, events.len() as u64);
                prop_assert_eq!(node.reducer.watermark("String:k"), Some(w));
                Ok(())
            })?;
        }
    }
}
