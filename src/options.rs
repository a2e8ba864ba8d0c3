//! Lock construction options.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::time::{Clock, MonotonicClock, SharedClock};

/// Which requests, if any, are routed to the elevated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Elevation {
    /// Single queue, strict FIFO.
    #[default]
    Fair,
    /// Read and read-upgrade requests are admitted first.
    Reads,
    /// Write and write-upgrade requests are admitted first.
    Writes,
}

/// Configuration for [`ReadWriteLock`](crate::ReadWriteLock).
///
/// At most one of the elevation flags may be set; the default is fair FIFO
/// ordering across all request kinds. Violations surface as
/// [`ConfigError`] at construction time.
///
/// # Example
///
/// ```
/// use uplock::LockOptions;
/// use std::time::Duration;
///
/// let options = LockOptions::new()
///     .elevate_write_queue(true)
///     .vacuum_interval(Some(Duration::from_millis(250)));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct LockOptions {
    /// Dispatch completion wakes through the shared dispatcher thread
    /// instead of the releaser's thread.
    pub run_continuations_async: bool,
    /// Route queued read and read-upgrade requests to the elevated queue.
    pub elevate_read_queue: bool,
    /// Route queued write and write-upgrade requests to the elevated queue.
    pub elevate_write_queue: bool,
    /// Interval of the background vacuum pass; `None` disables the timer.
    pub vacuum_interval: Option<Duration>,
    /// Clock used for deadlines and the vacuum timer.
    pub clock: Arc<dyn Clock>,
}

impl LockOptions {
    /// Options with fair queueing, inline wakes, and no vacuum timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`run_continuations_async`](Self::run_continuations_async).
    #[must_use]
    pub fn run_continuations_async(mut self, enabled: bool) -> Self {
        self.run_continuations_async = enabled;
        self
    }

    /// Sets [`elevate_read_queue`](Self::elevate_read_queue).
    #[must_use]
    pub fn elevate_read_queue(mut self, enabled: bool) -> Self {
        self.elevate_read_queue = enabled;
        self
    }

    /// Sets [`elevate_write_queue`](Self::elevate_write_queue).
    #[must_use]
    pub fn elevate_write_queue(mut self, enabled: bool) -> Self {
        self.elevate_write_queue = enabled;
        self
    }

    /// Sets [`vacuum_interval`](Self::vacuum_interval).
    #[must_use]
    pub fn vacuum_interval(mut self, interval: Option<Duration>) -> Self {
        self.vacuum_interval = interval;
        self
    }

    /// Sets the [`clock`](Self::clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the options for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elevate_read_queue && self.elevate_write_queue {
            return Err(ConfigError::ConflictingElevation);
        }
        if matches!(self.vacuum_interval, Some(d) if d.is_zero()) {
            return Err(ConfigError::ZeroVacuumInterval);
        }
        Ok(())
    }

    pub(crate) fn elevation(&self) -> Elevation {
        if self.elevate_read_queue {
            Elevation::Reads
        } else if self.elevate_write_queue {
            Elevation::Writes
        } else {
            Elevation::Fair
        }
    }

    pub(crate) fn shared_clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            run_continuations_async: false,
            elevate_read_queue: false,
            elevate_write_queue: false,
            vacuum_interval: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl std::fmt::Debug for LockOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockOptions")
            .field("run_continuations_async", &self.run_continuations_async)
            .field("elevate_read_queue", &self.elevate_read_queue)
            .field("elevate_write_queue", &self.elevate_write_queue)
            .field("vacuum_interval", &self.vacuum_interval)
            .finish_non_exhaustive()
    }
}
