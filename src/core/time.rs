//! Logical time.
//!
//! All causal ordering in the system runs on a single process-wide counter.
//! Every inbound message's timestamp is fed through [`LogicalClock::synchronize`]
//! before the handler reads any state; every outbound reply re-samples. This
//! yields happened-before: if event A at peer P precedes event B at peer Q via
//! a message, then `time(A) < time(B)`.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A point on the shared logical timeline. Zero is invalid.
///
/// Copy is fine: a time is a measurement, the clock owns causality.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub const INVALID: LogicalTime = LogicalTime(0);

    /// Rebuild a time from its serialized value.
    pub fn from_serialized(value: u64) -> Self {
        Self(value)
    }

    pub fn serialize(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The instant immediately preceding this one. Snapshot reads taken
    /// "just before" a commit use this to exclude the commit itself.
    pub fn just_before(self) -> LogicalTime {
        assert!(self.is_valid(), "just_before on invalid logical time");
        LogicalTime(self.0 - 1)
    }
}

impl fmt::Debug for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalTime({})", self.0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process-wide counter behind [`LogicalTime`].
///
/// Owned by the process context and shared by reference; there is exactly one
/// per process.
#[derive(Debug)]
pub struct LogicalClock {
    current: Mutex<u64>,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(1),
        }
    }

    /// Reserve and return the next timestamp.
    pub fn sample(&self) -> LogicalTime {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let sampled = *current;
        *current = current
            .checked_add(1)
            .expect("logical clock overflow on sample");
        LogicalTime(sampled)
    }

    /// Advance past a remotely observed time.
    ///
    /// Must run before the local clock is next sampled in the observing
    /// handler.
    pub fn synchronize(&self, other: LogicalTime) {
        if !other.is_valid() {
            return;
        }
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if other.0 >= *current {
            *current = other
                .0
                .checked_add(1)
                .expect("logical clock overflow on synchronize");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sample_is_strictly_increasing() {
        let clock = LogicalClock::new();
        let a = clock.sample();
        let b = clock.sample();
        assert!(a < b);
        assert!(a.is_valid());
    }

    #[test]
    fn invalid_time_is_zero_and_unordered_before_all_samples() {
        let clock = LogicalClock::new();
        assert!(!LogicalTime::INVALID.is_valid());
        assert!(LogicalTime::INVALID < clock.sample());
    }

    #[test]
    fn synchronize_advances_past_remote() {
        let clock = LogicalClock::new();
        let local = clock.sample();
        let remote = LogicalTime::from_serialized(local.serialize() + 50);
        clock.synchronize(remote);
        assert!(clock.sample() > remote);
    }

    #[test]
    fn synchronize_with_stale_remote_is_a_no_op() {
        let clock = LogicalClock::new();
        clock.synchronize(LogicalTime::from_serialized(5));
        let next = clock.sample();
        clock.synchronize(LogicalTime::INVALID);
        clock.synchronize(LogicalTime::from_serialized(1));
        assert_eq!(clock.sample().serialize(), next.serialize() + 1);
    }

    #[test]
    fn just_before_precedes() {
        let t = LogicalTime::from_serialized(7);
        assert_eq!(t.just_before().serialize(), 6);
    }

    #[test]
    fn concurrent_samples_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.sample()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<LogicalTime> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len);
    }
}
