//! Error types for lock acquisition and construction.
//!
//! Errors are explicit and typed. A timed-out acquisition is *not* an
//! error: the acquire future resolves to `Ok(false)` and the caller decides
//! whether that is worth surfacing. Everything that genuinely prevents the
//! waiter from ever being admitted is a [`LockError`].
//!
//! No release path returns an error or panics; transient CAS losses and
//! queue races are retried internally and are never observable.

/// Error delivered through an acquire future or blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The waiter's [`CancelToken`](crate::CancelToken) fired while waiting.
    Cancelled,
    /// More waiters are queued than the lock can track.
    QueueOverflow,
    /// The lock was disposed; queued waiters are drained with this error
    /// and new acquisitions are refused.
    Disposed,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquisition cancelled"),
            Self::QueueOverflow => write!(f, "lock waiter queue overflow"),
            Self::Disposed => write!(f, "lock disposed"),
        }
    }
}

impl std::error::Error for LockError {}

/// Error returned when lock construction options are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Both `elevate_read_queue` and `elevate_write_queue` were set.
    ConflictingElevation,
    /// `vacuum_interval` was set to a zero duration.
    ZeroVacuumInterval,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConflictingElevation => {
                write!(f, "at most one of the elevation options may be enabled")
            }
            Self::ZeroVacuumInterval => write!(f, "vacuum interval must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
