#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! Clock seam for components that expire state by wall time.
//!
//! Heartbeat liveness only ever asks two questions: "what time is it" and
//! "does a deadline built from an earlier reading still hold". [`Clock`]
//! answers the first, [`Timestamp`] the second; [`ManualClock`] lets tests
//! step through expiry without sleeping.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A wall-clock reading with millisecond resolution.
///
/// The representation is a flat count of milliseconds since the UNIX
/// epoch: liveness bookkeeping never needs more precision, and a flat
/// count keeps manual clocks trivially steppable. Arithmetic saturates;
/// a deadline cannot wrap around into the past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    /// The UNIX epoch, the natural origin for manual clocks.
    pub const EPOCH: Self = Self { millis: 0 };

    /// Timestamp `millis` milliseconds after the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(self) -> i64 {
        self.millis
    }

    /// The instant `duration` later, e.g. a deadline for a reading.
    pub fn after(self, duration: Duration) -> Self {
        Self {
            millis: self.millis.saturating_add(duration.as_millis() as i64),
        }
    }

    /// The instant `duration` earlier.
    pub fn before(self, duration: Duration) -> Self {
        Self {
            millis: self.millis.saturating_sub(duration.as_millis() as i64),
        }
    }

    /// Elapsed time from `earlier` to `self`; zero when `earlier` is not
    /// actually earlier.
    pub fn since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(earlier.millis).max(0) as u64)
    }
}

/// Source of the current time.
pub trait Clock: std::fmt::Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Timestamp;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create a clock reading system time.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(Utc::now().timestamp_millis())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    /// Jump to `to`, forwards or backwards.
    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::Release);
    }

    /// Move the clock forward, returning the new reading.
    pub fn advance(&self, by: Duration) -> Timestamp {
        let by = by.as_millis() as i64;
        Timestamp::from_millis(self.millis.fetch_add(by, Ordering::AcqRel) + by)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock::new();
        let (a, b) = (clock.now(), clock.now());
        assert!(a <= b);
        // Sanity: the system clock is set to this century.
        assert!(a > Timestamp::EPOCH);
    }

    #[test]
    fn test_manual_clock_steps() {
        let clock = ManualClock::starting_at(Timestamp::from_millis(1_000));
        assert_eq!(clock.now(), Timestamp::from_millis(1_000));
        assert_eq!(clock.now(), Timestamp::from_millis(1_000));

        assert_eq!(
            clock.advance(Duration::from_millis(500)),
            Timestamp::from_millis(1_500)
        );
        assert_eq!(clock.now(), Timestamp::from_millis(1_500));

        clock.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }

    #[test]
    fn test_deadline_arithmetic() {
        let t = Timestamp::from_millis(5_000);
        assert_eq!(t.after(Duration::from_secs(1)), Timestamp::from_millis(6_000));
        assert_eq!(t.before(Duration::from_secs(1)), Timestamp::from_millis(4_000));
        assert_eq!(
            Timestamp::from_millis(6_000).since(t),
            Duration::from_secs(1)
        );
        // `since` clamps instead of going negative.
        assert_eq!(t.since(Timestamp::from_millis(6_000)), Duration::ZERO);
    }

    #[test]
    fn test_deadline_comparison_reads_naturally() {
        let heartbeat = Timestamp::from_millis(0);
        let timeout = Duration::from_millis(300);
        assert!(Timestamp::from_millis(200) <= heartbeat.after(timeout));
        assert!(Timestamp::from_millis(400) > heartbeat.after(timeout));
    }

    #[test]
    fn test_saturation_at_the_extremes() {
        let far = Timestamp::from_millis(i64::MAX);
        assert_eq!(far.after(Duration::from_secs(1)), far);
        let origin = Timestamp::from_millis(i64::MIN);
        assert_eq!(origin.before(Duration::from_secs(1)), origin);
    }
}
