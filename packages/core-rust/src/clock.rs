//! Monotonic nanosecond clock for event ordering.
//!
//! Every intent and completion carries a `ts` in nanoseconds since the Unix
//! epoch. The state node rejects intents whose `ts` is not strictly greater
//! than the last applied one for the same key, so a single process must never
//! hand out the same stamp twice or go backwards when the wall clock is
//! adjusted. [`MonotonicClock`] guarantees both by taking
//! `max(wall_clock, last + 1)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a fixed one.
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as nanoseconds since Unix epoch.
    fn now_nanos(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Strictly increasing nanosecond timestamps derived from a [`ClockSource`].
///
/// When the source advances, its value is returned as-is. When the source is
/// unchanged or behind (clock step, coarse resolution), the previous stamp plus
/// one is returned instead. Safe to share across threads.
pub struct MonotonicClock {
    last: AtomicU64,
    source: Box<dyn ClockSource>,
}

impl std::fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MonotonicClock {
    /// Creates a clock backed by the system wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(SystemClock))
    }

    /// Creates a clock backed by a custom source.
    #[must_use]
    pub fn with_source(source: Box<dyn ClockSource>) -> Self {
        Self {
            last: AtomicU64::new(0),
            source,
        }
    }

    /// Returns the next timestamp. Never returns 0 and never repeats.
    pub fn now(&self) -> u64 {
        let wall = self.source.now_nanos();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the most recently issued timestamp (0 if none).
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide system clock shared by every component that stamps events.
///
/// Two stamps taken anywhere in the process through this clock never collide.
pub fn process_clock() -> &'static MonotonicClock {
    static CLOCK: OnceLock<MonotonicClock> = OnceLock::new();
    CLOCK.get_or_init(MonotonicClock::new)
}
