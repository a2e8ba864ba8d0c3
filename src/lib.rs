//! Upgradable reader/writer lock with lock-free waiter queues.
//!
//! This crate provides a reader/writer lock usable from both blocking and
//! async callers. Beyond the usual shared/exclusive pair it supports an
//! *upgradable* shared mode: a reader that reserves the right to convert to
//! exclusive once it is the sole remaining reader, without ever releasing
//! the lock.
//!
//! # Lock states
//!
//! | State | Meaning |
//! |---|---|
//! | Free | No holders |
//! | Shared | One or more ordinary readers |
//! | Upgradable-Shared | One upgradable reader, possibly with ordinary readers |
//! | Exclusive | A single writer |
//! | Upgraded-Exclusive | The upgradable reader converted to exclusive |
//!
//! # Waiting
//!
//! Contended acquisitions park on a per-waiter node with an optional
//! deadline and an optional [`CancelToken`]. The node's result channel can
//! be awaited (the [`Acquire`] handle is a `Future`) or waited on
//! synchronously ([`Acquire::wait`]), over the same queue entry.
//!
//! Waiters are queued FIFO. By default a single queue is used; the lock can
//! instead be configured to elevate reads or writes into a priority queue
//! (see [`LockOptions`]). Timed-out and cancelled waiters are discarded
//! lazily, either when a releaser scans past them or by the queue vacuum
//! pass ([`ReadWriteLock::vacuum`]).
//!
//! # Example
//!
//! ```ignore
//! use uplock::RwLock;
//!
//! let lock = RwLock::new(vec![1, 2, 3]);
//!
//! // Multiple readers can hold the lock concurrently.
//! let a = lock.read().await?;
//! let b = lock.read().await?;
//! drop((a, b));
//!
//! // An upgradable reader coexists with readers, then converts in place.
//! let up = lock.upgradable_read().await?;
//! let mut w = up.upgrade().await?;
//! w.push(4);
//! ```

mod cancel;
mod dispatch;
mod error;
mod options;
mod queue;
mod raw;
mod rwlock;
mod state;
mod wait;

pub mod time;

pub mod test_logging;

pub use cancel::{CancelRegistration, CancelToken};
pub use error::{ConfigError, LockError};
pub use options::LockOptions;
pub use raw::Acquire;
pub use rwlock::{
    ReadFuture, ReadGuard, ReadWriteLock, RwLock, UpgradableReadFuture, UpgradableReadGuard,
    UpgradeFuture, UpgradeGuard, WriteFuture, WriteGuard,
};
pub use state::StateSnapshot;
pub use time::{Clock, ManualClock, MonotonicClock, Time};
