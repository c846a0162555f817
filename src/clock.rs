//! Monotonic timestamps and the clocks that produce them.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Point in time measured as an offset from an arbitrary epoch.
///
/// Every component takes `now` explicitly so that frame timestamps from the
/// tracker and wall-clock time can be used interchangeably.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Negative and NaN inputs clamp to zero, overflow to the largest timestamp.
    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs <= 0.0 {
            Self::ZERO
        } else {
            Self(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    #[inline]
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs))
    }
}

/// Source of the current time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Monotonic clock anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed())
    }
}

/// Hand-driven clock for replays and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicU64::new(start.as_duration().as_micros() as u64),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.micros
            .store(now.as_duration().as_micros() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(Duration::from_micros(self.micros.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_since() {
        let a = Timestamp::from_secs_f64(1.5);
        let b = Timestamp::from_secs_f64(4.0);
        assert_eq!(b.saturating_since(a), Duration::from_millis(2500));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn test_from_secs_clamps() {
        assert_eq!(Timestamp::from_secs_f64(-3.0), Timestamp::ZERO);
        assert_eq!(Timestamp::from_secs_f64(f64::NAN), Timestamp::ZERO);
        assert_eq!(Timestamp::from_secs_f64(1e30).as_duration(), Duration::MAX);
        assert_eq!(Timestamp::from_secs_f64(2.5).as_secs_f64(), 2.5);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Timestamp::from_secs_f64(10.0));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp::from_millis(10_250));
        clock.set(Timestamp::ZERO);
        assert_eq!(clock.now(), Timestamp::ZERO);
    }
}
