//! Completion listener: applies `SetDone`/`DeleteDone` from other instances
//! of the same type to the local cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tiercache_core::{decode, unmarshal_value, Event, Op};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::counters::InstanceCounters;
use super::CacheValue;
use crate::bus::{Consumer, Fetches};
use crate::local::LocalCache;

/// Pause between polls once the consumer reports client-closed.
const CLOSED_BACKOFF: Duration = Duration::from_millis(100);

/// What the listener did with one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Emitted by this instance; dropped.
    SelfEcho,
    /// Belongs to another type; dropped.
    ForeignType,
    /// Not newer than the last completion applied for the key; dropped.
    Stale,
    /// `SetDone` written to the local cache.
    Set,
    /// `SetDone` refused by the local cache.
    Rejected,
    /// `DeleteDone` removed the key from the local cache.
    Deleted,
    /// Not a completion op; logged and dropped.
    Unknown,
    /// The value did not decode as the instance's type.
    DecodeFailed,
}

pub(crate) struct CompletionListener<T> {
    cache_id: String,
    type_name: String,
    local: Arc<dyn LocalCache<T>>,
    counters: Arc<InstanceCounters>,
    /// Last applied completion `ts` per key, when listener-side filtering is on.
    watermarks: Option<DashMap<String, u64>>,
}

impl<T: CacheValue> CompletionListener<T> {
    pub(crate) fn new(
        cache_id: String,
        type_name: String,
        local: Arc<dyn LocalCache<T>>,
        counters: Arc<InstanceCounters>,
        watermarks: bool,
    ) -> Self {
        Self {
            cache_id,
            type_name,
            local,
            counters,
            watermarks: watermarks.then(DashMap::new),
        }
    }

    /// Applies one decoded completion to the local cache.
    pub(crate) fn apply(&self, event: &Event) -> Outcome {
        if event.cache_id == self.cache_id {
            return Outcome::SelfEcho;
        }
        if event.type_name != self.type_name {
            return Outcome::ForeignType;
        }

        match event.op {
            Op::SetDone => {
                let value = match unmarshal_value::<T>(&event.value) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(
                            key = %event.key,
                            ts = event.ts,
                            error = %err,
                            "dropping undecodable SetDone value"
                        );
                        self.counters.decode_failure();
                        return Outcome::DecodeFailed;
                    }
                };
                if !self.advance(&event.key, event.ts) {
                    return Outcome::Stale;
                }
                if let Err(err) = self.local.set(&event.key, value, event.local_ttl) {
                    debug!(key = %event.key, error = %err, "local cache refused SetDone value");
                    return Outcome::Rejected;
                }
                self.counters.distributed_set();
                Outcome::Set
            }
            Op::DeleteDone => {
                if !self.advance(&event.key, event.ts) {
                    return Outcome::Stale;
                }
                // Absent keys are fine.
                let _ = self.local.delete(&event.key);
                self.counters.distributed_delete();
                Outcome::Deleted
            }
            op => {
                warn!(
                    key = %event.key,
                    %op,
                    cache_id = %event.cache_id,
                    "unknown op on completion topic"
                );
                Outcome::Unknown
            }
        }
    }

    /// Records `ts` as the newest completion for `key`. Returns `false` if an
    /// equal or newer one was already applied. Always `true` when
    /// listener-side filtering is off.
    fn advance(&self, key: &str, ts: u64) -> bool {
        let Some(watermarks) = &self.watermarks else {
            return true;
        };
        let mut last = watermarks.entry(key.to_string()).or_insert(0);
        if ts <= *last {
            return false;
        }
        *last = ts;
        true
    }

    fn apply_fetches(&self, fetches: &Fetches) {
        for err in fetches.errors() {
            warn!(
                topic = %err.topic,
                partition = err.partition,
                error = %err.error,
                "completion fetch error"
            );
        }
        for partition in fetches.partitions() {
            for record in &partition.records {
                match decode(&record.value) {
                    Ok(event) => {
                        self.apply(&event);
                    }
                    Err(err) => {
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %err,
                            "skipping undecodable completion record"
                        );
                        self.counters.decode_failure();
                    }
                }
            }
        }
    }

    /// Polls `consumer` until `shutdown` flips to `true` or its sender is dropped.
    pub(crate) async fn run(
        self,
        consumer: Arc<dyn Consumer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(
            cache_id = %self.cache_id,
            type_name = %self.type_name,
            group = consumer.group(),
            "completion listener started"
        );
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
                fetches = consumer.poll_fetches() => fetches,
            };

            if fetches.is_client_closed() {
                // The owner stops the listener; until then, idle.
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(CLOSED_BACKOFF) => {}
                }
                continue;
            }
            self.apply_fetches(&fetches);
        }
        debug!(cache_id = %self.cache_id, "completion listener stopped");
    }
}
