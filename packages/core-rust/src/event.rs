//! Cache events exchanged over the bus.
//!
//! A single [`Event`] shape carries both intents (`Set`, `Delete`), produced
//! by cache instances, and completions (`SetDone`, `DeleteDone`), produced by
//! the state node after a mutation has been applied.
//!
//! # Wire format
//!
//! Events serialize to `MsgPack` maps with named fields (`rmp_serde::to_vec_named()`),
//! so field order is irrelevant and unknown fields are ignored on decode.
//! Durations travel as `u64` nanoseconds and [`Op`] as a `u8` code.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Op
// ---------------------------------------------------------------------------

/// Kind of cache event. The `*Done` variants are completions.
///
/// Codes outside the known set decode to [`Op::Unknown`] rather than failing,
/// so a newer producer cannot wedge an older consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Op {
    Set,
    Delete,
    SetDone,
    DeleteDone,
    Unknown(u8),
}

impl Op {
    /// Returns `true` for `Set` and `Delete`.
    #[must_use]
    pub fn is_intent(self) -> bool {
        matches!(self, Op::Set | Op::Delete)
    }

    /// Returns `true` for `SetDone` and `DeleteDone`.
    #[must_use]
    pub fn is_completion(self) -> bool {
        matches!(self, Op::SetDone | Op::DeleteDone)
    }

    /// Maps an intent to its completion. Returns `None` for anything else.
    #[must_use]
    pub fn completion(self) -> Option<Op> {
        match self {
            Op::Set => Some(Op::SetDone),
            Op::Delete => Some(Op::DeleteDone),
            _ => None,
        }
    }
}

impl From<u8> for Op {
    fn from(code: u8) -> Self {
        match code {
            0 => Op::Set,
            1 => Op::Delete,
            2 => Op::SetDone,
            3 => Op::DeleteDone,
            other => Op::Unknown(other),
        }
    }
}

impl From<Op> for u8 {
    fn from(op: Op) -> Self {
        match op {
            Op::Set => 0,
            Op::Delete => 1,
            Op::SetDone => 2,
            Op::DeleteDone => 3,
            Op::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Set => f.write_str("set"),
            Op::Delete => f.write_str("delete"),
            Op::SetDone => f.write_str("set_done"),
            Op::DeleteDone => f.write_str("delete_done"),
            Op::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The single wire message for intents and completions.
///
/// `key` is always fully prefixed with the owning type's namespace; the state
/// node and listeners never re-prefix it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identity of the emitting cache instance; copied verbatim into completions.
    #[serde(default)]
    pub cache_id: String,
    /// Type tag of the cached value (see [`TypeTag`](crate::TypeTag)).
    #[serde(rename = "type", default)]
    pub type_name: String,
    pub op: Op,
    #[serde(default)]
    pub key: String,
    /// Marshaled value. Empty for deletes.
    #[serde(with = "serde_bytes", default)]
    pub value: Vec<u8>,
    /// Nanosecond ordering stamp: origin clock for intents, state-node clock for completions.
    #[serde(default)]
    pub ts: u64,
    /// Local-cache TTL used by the origin and by listeners applying `SetDone`.
    #[serde(with = "duration_nanos", default)]
    pub local_ttl: Duration,
    /// Whether the state node mutates the remote store for this intent.
    #[serde(default)]
    pub sync_to_rkv: bool,
    /// TTL passed to the remote store when `sync_to_rkv` is set.
    #[serde(with = "duration_nanos", default)]
    pub rkv_ttl: Duration,
    /// Origin host, diagnostic only.
    #[serde(default)]
    pub hostname: String,
}

impl Event {
    /// Creates a bare intent with the given op, prefixed key, and stamp.
    /// Identity fields are filled in by the publishing instance.
    #[must_use]
    pub fn intent(op: Op, key: impl Into<String>, ts: u64) -> Self {
        Self {
            cache_id: String::new(),
            type_name: String::new(),
            op,
            key: key.into(),
            value: Vec::new(),
            ts,
            local_ttl: Duration::ZERO,
            sync_to_rkv: false,
            rkv_ttl: Duration::ZERO,
            hostname: String::new(),
        }
    }

    /// Builds the completion for this intent, stamped with `ts`.
    ///
    /// Identity, key, host and sync fields are preserved. `SetDone` keeps the
    /// value and local TTL; `DeleteDone` drops both. Returns `None` if this
    /// event is not an intent.
    #[must_use]
    pub fn to_completion(&self, ts: u64) -> Option<Event> {
        let op = self.op.completion()?;
        let mut done = self.clone();
        done.op = op;
        done.ts = ts;
        if op == Op::DeleteDone {
            done.value = Vec::new();
            done.local_ttl = Duration::ZERO;
        }
        Some(done)
    }
}

/// Serde adapter encoding a [`Duration`] as `u64` nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_codes_are_stable() {
        assert_eq!(u8::from(Op::Set), 0);
        assert_eq!(u8::from(Op::Delete), 1);
        assert_eq!(u8::from(Op::SetDone), 2);
        assert_eq!(u8::from(Op::DeleteDone), 3);
        assert_eq!(Op::from(9), Op::Unknown(9));
        assert_eq!(u8::from(Op::Unknown(9)), 9);
    }

    #[test]
    fn op_classification() {
        assert!(Op::Set.is_intent());
        assert!(Op::Delete.is_intent());
        assert!(!Op::SetDone.is_intent());
        assert!(Op::DeleteDone.is_completion());
        assert!(!Op::Unknown(7).is_intent());
        assert!(!Op::Unknown(7).is_completion());
        assert_eq!(Op::SetDone.completion(), None);
    }

    #[test]
    fn set_completion_preserves_payload() {
        let mut intent = Event::intent(Op::Set, "user:k", 100);
        intent.cache_id = "c1".to_string();
        intent.type_name = "user".to_string();
        intent.value = vec![1, 2, 3];
        intent.local_ttl = Duration::from_secs(60);
        intent.sync_to_rkv = true;
        intent.rkv_ttl = Duration::from_secs(600);
        intent.hostname = "host-a".to_string();

        let done = intent.to_completion(250).unwrap();
        assert_eq!(done.op, Op::SetDone);
        assert_eq!(done.ts, 250);
        assert_eq!(done.cache_id, "c1");
        assert_eq!(done.type_name, "user");
        assert_eq!(done.key, "user:k");
        assert_eq!(done.value, vec![1, 2, 3]);
        assert_eq!(done.local_ttl, Duration::from_secs(60));
        assert!(done.sync_to_rkv);
        assert_eq!(done.rkv_ttl, Duration::from_secs(600));
        assert_eq!(done.hostname, "host-a");
    }

    #[test]
    fn delete_completion_drops_value_and_ttl() {
        let mut intent = Event::intent(Op::Delete, "user:k", 100);
        intent.value = vec![9];
        intent.local_ttl = Duration::from_secs(1);
        intent.sync_to_rkv = true;

        let done = intent.to_completion(101).unwrap();
        assert_eq!(done.op, Op::DeleteDone);
        assert!(done.value.is_empty());
        assert_eq!(done.local_ttl, Duration::ZERO);
        assert!(done.sync_to_rkv);
    }

    #[test]
    fn completion_of_completion_is_none() {
        let done = Event::intent(Op::SetDone, "k", 1);
        assert!(done.to_completion(2).is_none());
    }
}
