//! The packed lock word.
//!
//! All lock state lives in a single `usize` so that every transition is one
//! compare-and-swap, with no torn multi-field updates:
//!
//! ```text
//! MSB                                                        LSB
//! ┌──────────────┬─────────┬────────────────────────────────────┐
//! │ QUEUE_CHANGED│ UPGRADE │ reader count / WRITE_SENTINEL      │
//! └──────────────┴─────────┴────────────────────────────────────┘
//! ```
//!
//! The low bits hold the active reader count, except that the all-ones
//! value is the write sentinel: the lock is exclusive. `QUEUE_CHANGED` is a
//! hint from acquirers to releasers — "inspect the queue on your way out".
//! `UPGRADE` means an upgradable reader currently holds the lock (counted
//! in the reader count, or folded into the sentinel while upgraded).
//!
//! Invariants:
//! - exclusive and `reader count > 0` are mutually exclusive by encoding;
//! - `UPGRADE` implies at most one upgradable owner, which may coexist
//!   with ordinary readers or with the upgraded exclusive state;
//! - the reader count never exceeds [`MAX_READ_COUNT`].

use std::sync::atomic::{AtomicUsize, Ordering};

/// A waiter was enqueued while the lock was held.
pub(crate) const QUEUE_CHANGED: usize = 1 << (usize::BITS - 1);
/// An upgradable reader holds the lock.
pub(crate) const UPGRADE: usize = 1 << (usize::BITS - 2);
/// Mask over the reader-count bits.
pub(crate) const COUNT_MASK: usize = UPGRADE - 1;
/// All-ones count value: the lock is exclusive.
pub(crate) const WRITE_SENTINEL: usize = COUNT_MASK;
/// Largest representable reader count, one below the sentinel.
pub(crate) const MAX_READ_COUNT: usize = WRITE_SENTINEL - 1;

/// One observed value of the lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockWord(pub(crate) usize);

impl LockWord {
    pub(crate) const FREE: LockWord = LockWord(0);

    #[inline]
    pub(crate) fn is_write(self) -> bool {
        self.0 & COUNT_MASK == WRITE_SENTINEL
    }

    #[inline]
    pub(crate) fn read_count(self) -> usize {
        if self.is_write() { 0 } else { self.0 & COUNT_MASK }
    }

    #[inline]
    pub(crate) fn upgrade(self) -> bool {
        self.0 & UPGRADE != 0
    }

    #[inline]
    pub(crate) fn queue_changed(self) -> bool {
        self.0 & QUEUE_CHANGED != 0
    }

    /// Ordinary readers may coexist with an upgradable reader, so the
    /// upgrade flag is deliberately ignored here.
    #[inline]
    pub(crate) fn can_enter_read(self) -> bool {
        !self.is_write() && !self.queue_changed() && self.0 & COUNT_MASK < MAX_READ_COUNT
    }

    /// Encoded form: no flags, not exclusive, count within range.
    #[inline]
    pub(crate) fn can_enter_read_upgrade(self) -> bool {
        self.0 <= MAX_READ_COUNT
    }

    #[inline]
    pub(crate) fn can_enter_write(self) -> bool {
        self.0 == 0
    }

    /// The single remaining reader is the upgradable holder, who is now
    /// requesting the conversion. A set queue-changed bit does not block
    /// the upgrade; the holder outranks queued waiters.
    #[inline]
    pub(crate) fn can_enter_write_upgrade(self) -> bool {
        self.upgrade() && !self.is_write() && self.read_count() <= 1
    }

    #[inline]
    pub(crate) fn with_reader(self) -> LockWord {
        LockWord(self.0 + 1)
    }

    #[inline]
    pub(crate) fn with_upgradable_reader(self) -> LockWord {
        LockWord((self.0 + 1) | UPGRADE)
    }

    #[inline]
    pub(crate) fn to_write(self) -> LockWord {
        LockWord(self.0 | WRITE_SENTINEL)
    }

    /// Conversion keeps the upgrade flag and any queued hint.
    #[inline]
    pub(crate) fn to_write_upgrade(self) -> LockWord {
        LockWord((self.0 & (QUEUE_CHANGED | UPGRADE)) | WRITE_SENTINEL)
    }

    #[inline]
    pub(crate) fn with_queue_changed(self) -> LockWord {
        LockWord(self.0 | QUEUE_CHANGED)
    }

    #[inline]
    pub(crate) fn without_queue_changed(self) -> LockWord {
        LockWord(self.0 & !QUEUE_CHANGED)
    }

    #[inline]
    pub(crate) fn without_upgrade(self) -> LockWord {
        LockWord(self.0 & !UPGRADE)
    }

    /// Builds the word the release dispatcher publishes after admitting a
    /// batch of readers.
    #[inline]
    pub(crate) fn for_readers(count: usize, upgrade: bool, queue_changed: bool) -> LockWord {
        let mut word = count;
        if upgrade {
            word |= UPGRADE;
        }
        if queue_changed {
            word |= QUEUE_CHANGED;
        }
        LockWord(word)
    }

    #[inline]
    pub(crate) fn snapshot(self) -> StateSnapshot {
        StateSnapshot {
            readers: self.read_count(),
            is_write: self.is_write(),
            upgrade: self.upgrade(),
            queue_changed: self.queue_changed(),
        }
    }
}

/// Debug view of the lock word, returned by state accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Number of active readers (zero while exclusive).
    pub readers: usize,
    /// Whether the lock is held exclusively.
    pub is_write: bool,
    /// Whether an upgradable reader holds the lock.
    pub upgrade: bool,
    /// Whether a queued-waiter hint is pending.
    pub queue_changed: bool,
}

/// The shared atomic cell holding the lock word.
#[derive(Debug)]
pub(crate) struct AtomicLockWord(AtomicUsize);

impl AtomicLockWord {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub(crate) fn load(&self) -> LockWord {
        LockWord(self.0.load(Ordering::Acquire))
    }

    /// On failure returns the freshly observed word.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: LockWord,
        new: LockWord,
    ) -> Result<(), LockWord> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LockWord)
    }

    /// Removes `n` readers, returning the resulting word.
    #[inline]
    pub(crate) fn sub_readers(&self, n: usize) -> LockWord {
        let prev = self.0.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(
            !LockWord(prev).is_write() && LockWord(prev).read_count() >= n,
            "reader release without matching acquire"
        );
        LockWord(prev - n)
    }
}
