//! Time quantization into epochs.
//!
//! Epochs are the only invalidation mechanism of a memoized cache: every entry is keyed by the
//! epoch it was created in, so a new epoch automatically means a new entry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The identity of a fixed-width time bucket, `floor(now / ttl)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochId(pub u64);

impl EpochId {
    /// Returns the epoch that the timestamp `now` (in milliseconds) falls into.
    ///
    /// A zero `ttl` is treated as one millisecond.
    pub fn at(now: u64, ttl: Duration) -> Self {
        Self(now / ttl_millis(ttl))
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the `ttl` in whole milliseconds, clamped to at least `1`.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// A source of wall-clock time, in milliseconds since the unix epoch.
///
/// Epoch ids are derived from wall-clock time rather than a monotonic clock so that separate
/// processes sharing a remote store agree on them.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    fn now(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_boundaries() {
        let ttl = Duration::from_millis(1000);

        assert_eq!(EpochId::at(0, ttl), EpochId(0));
        assert_eq!(EpochId::at(999, ttl), EpochId(0));
        assert_eq!(EpochId::at(1000, ttl), EpochId(1));
        assert_eq!(EpochId::at(1_700_000_123_456, ttl), EpochId(1_700_000_123));
    }

    #[test]
    fn test_epoch_is_monotonic() {
        let ttl = Duration::from_millis(250);
        let mut previous = EpochId::at(0, ttl);
        for now in (0..10_000).step_by(37) {
            let epoch = EpochId::at(now, ttl);
            assert!(previous <= epoch);
            previous = epoch;
        }
    }

    #[test]
    fn test_zero_ttl_is_clamped() {
        assert_eq!(EpochId::at(1234, Duration::ZERO), EpochId(1234));
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(500);
        let shared = clock.clone();

        clock.advance(Duration::from_millis(600));
        assert_eq!(shared.now(), 1100);

        shared.set(42);
        assert_eq!(clock.now(), 42);
    }
}
