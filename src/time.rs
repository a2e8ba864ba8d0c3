//! Time sources and deadlines.
//!
//! The lock never reads the system clock directly. Deadline checks and the
//! vacuum timer go through a [`Clock`], so tests can drive time manually
//! with [`ManualClock`] while production uses [`MonotonicClock`].
//!
//! Deadlines are checked lazily: when a releaser scans past a waiter and
//! during the vacuum pass. There is no per-waiter timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point in time, in nanoseconds from an arbitrary epoch.
///
/// # Example
///
/// ```
/// use uplock::time::Time;
///
/// let t = Time::from_millis(5);
/// assert_eq!(t.as_nanos(), 5_000_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch itself.
    pub const ZERO: Time = Time(0);

    /// Creates a time from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from seconds since the epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the time as nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as whole milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns this time advanced by `d`, saturating at the far future.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }
}

/// When a queued waiter stops being willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// Fast path only: the caller never queues.
    Immediate,
    /// Give up once the clock passes this point.
    At(Time),
    /// Wait until admitted, cancelled, or disposed.
    Never,
}

impl Deadline {
    pub(crate) fn after(now: Time, timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::Never,
            Some(d) if d.is_zero() => Self::Immediate,
            Some(d) => Self::At(now.saturating_add(d)),
        }
    }

    /// Whether the deadline has passed at `now`.
    pub(crate) fn elapsed(self, now: Time) -> bool {
        match self {
            Self::Immediate => true,
            Self::At(at) => now >= at,
            Self::Never => false,
        }
    }
}

/// A source of monotonic time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> Time;
}

/// Wall clock backed by [`Instant`], anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Time {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Time::from_nanos(nanos)
    }
}

/// Manually advanced clock for tests.
///
/// # Example
///
/// ```
/// use uplock::time::{Clock, ManualClock, Time};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(Time::ZERO);
/// clock.advance(Duration::from_millis(10));
/// assert_eq!(clock.now(), Time::from_millis(10));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock set to `start`.
    #[must_use]
    pub fn new(start: Time) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, t: Time) {
        self.nanos.store(t.as_nanos(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

/// Shared handle to a clock.
pub(crate) type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_after_maps_timeouts() {
        let now = Time::from_millis(100);
        assert_eq!(Deadline::after(now, None), Deadline::Never);
        assert_eq!(
            Deadline::after(now, Some(Duration::ZERO)),
            Deadline::Immediate
        );
        assert_eq!(
            Deadline::after(now, Some(Duration::from_millis(50))),
            Deadline::At(Time::from_millis(150))
        );
    }

    #[test]
    fn deadline_elapsed() {
        let at = Deadline::At(Time::from_millis(10));
        assert!(!at.elapsed(Time::from_millis(9)));
        assert!(at.elapsed(Time::from_millis(10)));
        assert!(Deadline::Immediate.elapsed(Time::ZERO));
        assert!(!Deadline::Never.elapsed(Time::from_secs(u64::MAX / 2)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Time::ZERO);
        assert_eq!(clock.now(), Time::ZERO);
        clock.advance(Duration::from_millis(3));
        clock.advance(Duration::from_millis(4));
        assert_eq!(clock.now(), Time::from_millis(7));
        clock.set(Time::from_secs(1));
        assert_eq!(clock.now(), Time::from_secs(1));
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
