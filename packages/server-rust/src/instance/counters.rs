//! Per-instance counters.
//!
//! Each counter is kept twice: an atomic read back by
//! [`CacheInstance::metrics`](super::CacheInstance::metrics), and a `metrics`
//! crate counter labelled with the instance's type tag for whatever recorder
//! the process installs. Without a recorder the latter is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::Counter;

/// Point-in-time snapshot of an instance's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceMetrics {
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_deletes: u64,
    pub rkv_hits: u64,
    pub rkv_misses: u64,
    /// `SetDone` completions applied from other instances.
    pub distributed_sets: u64,
    /// `DeleteDone` completions applied from other instances.
    pub distributed_deletes: u64,
    /// Intents that failed to marshal, encode, or produce.
    pub publish_failures: u64,
    /// Completion records or values that failed to decode.
    pub decode_failures: u64,
}

struct Tally {
    count: AtomicU64,
    exported: Counter,
}

impl Tally {
    fn new(name: &'static str, type_name: &str) -> Self {
        Self {
            count: AtomicU64::new(0),
            exported: metrics::counter!(name, "type" => type_name.to_string()),
        }
    }

    fn incr(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.exported.increment(1);
    }

    fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Live counters shared by an instance and its listener task.
pub(crate) struct InstanceCounters {
    local_hits: Tally,
    local_misses: Tally,
    local_deletes: Tally,
    rkv_hits: Tally,
    rkv_misses: Tally,
    distributed_sets: Tally,
    distributed_deletes: Tally,
    publish_failures: Tally,
    decode_failures: Tally,
}

impl InstanceCounters {
    pub(crate) fn new(type_name: &str) -> Self {
        Self {
            local_hits: Tally::new("tiercache_local_hits_total", type_name),
            local_misses: Tally::new("tiercache_local_misses_total", type_name),
            local_deletes: Tally::new("tiercache_local_deletes_total", type_name),
            rkv_hits: Tally::new("tiercache_rkv_hits_total", type_name),
            rkv_misses: Tally::new("tiercache_rkv_misses_total", type_name),
            distributed_sets: Tally::new("tiercache_distributed_sets_total", type_name),
            distributed_deletes: Tally::new("tiercache_distributed_deletes_total", type_name),
            publish_failures: Tally::new("tiercache_publish_failures_total", type_name),
            decode_failures: Tally::new("tiercache_decode_failures_total", type_name),
        }
    }

    pub(crate) fn local_hit(&self) {
        self.local_hits.incr();
    }

    pub(crate) fn local_miss(&self) {
        self.local_misses.incr();
    }

    pub(crate) fn local_delete(&self) {
        self.local_deletes.incr();
    }

    pub(crate) fn rkv_hit(&self) {
        self.rkv_hits.incr();
    }

    pub(crate) fn rkv_miss(&self) {
        self.rkv_misses.incr();
    }

    pub(crate) fn distributed_set(&self) {
        self.distributed_sets.incr();
    }

    pub(crate) fn distributed_delete(&self) {
        self.distributed_deletes.incr();
    }

    pub(crate) fn publish_failure(&self) {
        self.publish_failures.incr();
    }

    pub(crate) fn decode_failure(&self) {
        self.decode_failures.incr();
    }

    pub(crate) fn snapshot(&self) -> InstanceMetrics {
        InstanceMetrics {
            local_hits: self.local_hits.get(),
            local_misses: self.local_misses.get(),
            local_deletes: self.local_deletes.get(),
            rkv_hits: self.rkv_hits.get(),
            rkv_misses: self.rkv_misses.get(),
            distributed_sets: self.distributed_sets.get(),
            distributed_deletes: self.distributed_deletes.get(),
            publish_failures: self.publish_failures.get(),
            decode_failures: self.decode_failures.get(),
        }
    }
}

impl std::fmt::Debug for InstanceCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InstanceCounters")
            .field(&self.snapshot())
            .finish()
    }
}
