//! The lock state machine: optimistic acquire, contended enqueue, and the
//! release dispatcher.
//!
//! # Acquire
//!
//! Every acquisition first runs an optimistic CAS loop against the packed
//! lock word. On contention (and a nonzero timeout) the caller rents a
//! waiter node, reserves a queue slot, links the node, and then performs a
//! single *post-enqueue* optimistic attempt. That second attempt closes the
//! lost-wakeup window: either a releaser that runs after our enqueue will
//! observe the queue-changed hint (or the node itself), or we observe the
//! lock available and win it ourselves, marking the queued node deadborn so
//! the queue discards it on sight.
//!
//! # Release
//!
//! Shared exits subtract from the word directly. A release that leaves
//! queued waiters admissible claims exclusivity and runs the dispatcher:
//! with the word at the write sentinel, it scans the queues, batches
//! admissible readers or selects a single writer, and publishes the
//! post-admission word in one CAS. Queue consumption (dispatcher scan,
//! vacuum, dispose drain) is serialized by a spin guard; release paths
//! never block beyond bounded CAS spins and never suspend.

use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::LockError;
use crate::options::{Elevation, LockOptions};
use crate::queue::WaitQueue;
use crate::state::{AtomicLockWord, LockWord, StateSnapshot};
use crate::time::{Deadline, SharedClock};
use crate::wait::{NodePool, NodeRef, WaitKind, WaitNode};

/// Bounded spin for CAS retry loops: cheap pause first, then yield.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    fn new() -> Self {
        Self { step: 0 }
    }

    /// Whether the next snooze gives up the thread (after which the caller
    /// should reload shared state instead of reusing a stale observation).
    fn will_yield(&self) -> bool {
        self.step > Self::SPIN_LIMIT
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Reader batch accumulated by one dispatcher run.
type ReadBatch = SmallVec<[NonNull<WaitNode>; 8]>;

pub(crate) struct RawLock {
    word: AtomicLockWord,
    default_queue: WaitQueue,
    elevated_queue: WaitQueue,
    pool: NodePool,
    /// Serializes queue consumption: dispatcher, vacuum, dispose drain.
    consumer: AtomicBool,
    disposed: AtomicBool,
    elevation: Elevation,
    deferred_wake: bool,
    clock: SharedClock,
}

impl RawLock {
    pub(crate) fn new(options: &LockOptions) -> Self {
        Self {
            word: AtomicLockWord::new(),
            default_queue: WaitQueue::new(),
            elevated_queue: WaitQueue::new(),
            pool: NodePool::new(),
            consumer: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            elevation: options.elevation(),
            deferred_wake: options.run_continuations_async,
            clock: options.shared_clock(),
        }
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        self.word.load().snapshot()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------

    /// Single optimistic attempt, no queueing.
    pub(crate) fn try_enter(&self, kind: WaitKind) -> bool {
        !self.is_disposed() && self.optimistic(kind, false)
    }

    /// Full acquire: optimistic attempt, then enqueue and park.
    pub(crate) fn enter(
        &self,
        kind: WaitKind,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Acquire<'_> {
        if self.is_disposed() {
            return Acquire::ready(self, kind, Err(LockError::Disposed));
        }
        if self.optimistic(kind, false) {
            return Acquire::ready(self, kind, Ok(true));
        }
        let deadline = Deadline::after(self.clock.now(), timeout);
        if matches!(deadline, Deadline::Immediate) {
            return Acquire::ready(self, kind, Ok(false));
        }
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Acquire::ready(self, kind, Err(LockError::Cancelled));
            }
        }

        let node = self.pool.rent(kind, deadline, self.deferred_wake);
        let queue = self.route(kind);
        if queue.reserve_slot().is_err() {
            self.pool.recycle_unshared(node);
            return Acquire::ready(self, kind, Err(LockError::QueueOverflow));
        }

        if let Some(token) = cancel {
            // The registration owns its own node reference, taken while the
            // node is still exclusively ours.
            self.pool.retain(node);
            let node_ref = NodeRef::adopt(node, self.pool.clone());
            let registration = token.register(move || {
                let _ = node_ref.node().try_complete(Err(LockError::Cancelled));
            });
            unsafe { node.as_ref() }.arm_cancellation(registration);
        }

        queue.push(node);

        // Post-enqueue recheck: either a subsequent releaser sees us, or we
        // raced in ourselves and the node is deadborn.
        if self.optimistic(kind, true) {
            let waiter = unsafe { node.as_ref() };
            if waiter.try_release_before_acquired() {
                waiter.disarm_cancellation();
                self.pool.release(node);
                return Acquire::ready(self, kind, Ok(true));
            }
            // A completer beat the deadborn transition. If it admitted the
            // node, that admission duplicates the one we just won: refund it.
            let duplicated = matches!(waiter.take_result_spin(), Ok(true));
            self.pool.release(node);
            if duplicated {
                self.exit(kind);
            }
            return Acquire::ready(self, kind, Ok(true));
        }

        if self.is_disposed() {
            // Dispose may have drained the queues before our push landed.
            let _guard = self.lock_consumer();
            self.drain_queues_disposed();
        }

        Acquire::parked(self, kind, node)
    }

    fn route(&self, kind: WaitKind) -> &WaitQueue {
        let elevated = match self.elevation {
            Elevation::Fair => false,
            Elevation::Reads => kind.is_read(),
            Elevation::Writes => !kind.is_read(),
        };
        if elevated {
            &self.elevated_queue
        } else {
            &self.default_queue
        }
    }

    /// Optimistic CAS loop. With `queued` set (the caller holds a queued
    /// node) a failed attempt also tries to publish the queue-changed hint
    /// before giving up, and rescues the free-but-hinted word by running
    /// the dispatcher itself.
    fn optimistic(&self, kind: WaitKind, queued: bool) -> bool {
        let mut backoff = Backoff::new();
        let mut word = self.word.load();
        loop {
            if Self::can_enter(kind, word) {
                match self.word.compare_exchange(word, Self::transition(kind, word)) {
                    Ok(()) => return true,
                    Err(observed) => {
                        word = self.next_observation(&mut backoff, observed);
                        continue;
                    }
                }
            }
            if !queued {
                return false;
            }
            if word.queue_changed()
                && !word.is_write()
                && !word.upgrade()
                && word.read_count() == 0
            {
                // Free except for the hint: no holder remains to run the
                // dispatcher, so the queued acquirer runs it itself.
                match self.word.compare_exchange(word, LockWord::FREE.to_write()) {
                    Ok(()) => {
                        self.release_exclusive();
                        return false;
                    }
                    Err(observed) => {
                        word = self.next_observation(&mut backoff, observed);
                        continue;
                    }
                }
            }
            if Self::hint_permitted(kind, word) {
                match self.word.compare_exchange(word, word.with_queue_changed()) {
                    Ok(()) => return false,
                    Err(observed) => {
                        word = self.next_observation(&mut backoff, observed);
                        continue;
                    }
                }
            }
            return false;
        }
    }

    fn next_observation(&self, backoff: &mut Backoff, observed: LockWord) -> LockWord {
        let reuse = !backoff.will_yield();
        backoff.snooze();
        if reuse { observed } else { self.word.load() }
    }

    fn can_enter(kind: WaitKind, word: LockWord) -> bool {
        match kind {
            WaitKind::Read => word.can_enter_read(),
            WaitKind::ReadUpgrade => word.can_enter_read_upgrade(),
            WaitKind::Write => word.can_enter_write(),
            WaitKind::WriteUpgrade => word.can_enter_write_upgrade(),
            WaitKind::Uninit => false,
        }
    }

    fn transition(kind: WaitKind, word: LockWord) -> LockWord {
        match kind {
            WaitKind::Read => word.with_reader(),
            WaitKind::ReadUpgrade => word.with_upgradable_reader(),
            WaitKind::Write => word.to_write(),
            WaitKind::WriteUpgrade => word.to_write_upgrade(),
            WaitKind::Uninit => word,
        }
    }

    /// Whether a queued waiter of `kind` may set the queue-changed hint on
    /// `word`. Exits only consult the hint in states these rules cover; a
    /// kind that cannot set it is instead woken by an unconditional
    /// dispatch (write exits) or by a later admissible state.
    fn hint_permitted(kind: WaitKind, word: LockWord) -> bool {
        if word.queue_changed() {
            return false;
        }
        match kind {
            WaitKind::Read => word.is_write(),
            WaitKind::ReadUpgrade => {
                // Behind a writer, or behind a rival upgradable holder.
                (word.is_write() && !word.upgrade()) || (!word.is_write() && word.upgrade())
            }
            WaitKind::Write => true,
            WaitKind::WriteUpgrade => word.upgrade(),
            WaitKind::Uninit => false,
        }
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    pub(crate) fn exit(&self, kind: WaitKind) {
        match kind {
            WaitKind::Read => self.exit_read(1),
            WaitKind::ReadUpgrade => self.exit_read_upgrade(),
            WaitKind::Write | WaitKind::WriteUpgrade => self.exit_write(),
            WaitKind::Uninit => debug_assert!(false, "exit of uninitialized kind"),
        }
    }

    /// Releases `n` shared holders at once.
    pub(crate) fn exit_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        let word = self.word.sub_readers(n);
        self.dispatch_after_shared_exit(word);
    }

    /// Releases the upgradable holder's shared slot and clears the flag.
    pub(crate) fn exit_read_upgrade(&self) {
        let mut word = self.word.sub_readers(1);
        let mut backoff = Backoff::new();
        loop {
            debug_assert!(word.upgrade(), "upgradable release without upgrade flag");
            let cleared = word.without_upgrade();
            match self.word.compare_exchange(word, cleared) {
                Ok(()) => {
                    word = cleared;
                    break;
                }
                Err(observed) => {
                    word = observed;
                    backoff.snooze();
                }
            }
        }
        self.dispatch_after_shared_exit(word);
    }

    /// Releases an exclusive holder (plain or upgraded); the word is still
    /// at the write sentinel, so the dispatcher runs directly.
    pub(crate) fn exit_write(&self) {
        debug_assert!(self.word.load().is_write(), "write release without exclusivity");
        self.release_exclusive();
    }

    /// After a shared exit, claim exclusivity and dispatch if the hint is
    /// set and the remaining holders cannot block admission: either nobody,
    /// or only the upgradable holder (whose queued conversion may now be
    /// admissible).
    fn dispatch_after_shared_exit(&self, mut word: LockWord) {
        let mut backoff = Backoff::new();
        loop {
            if word.is_write() || !word.queue_changed() {
                return;
            }
            let claim = if word.read_count() == 0 && !word.upgrade() {
                LockWord::FREE.to_write()
            } else if word.read_count() == 1 && word.upgrade() {
                LockWord::FREE.with_upgradable_reader().to_write_upgrade()
            } else {
                return;
            };
            match self.word.compare_exchange(word, claim) {
                Ok(()) => {
                    self.release_exclusive();
                    return;
                }
                Err(observed) => {
                    word = observed;
                    backoff.snooze();
                }
            }
        }
    }

    /// The release dispatcher. Precondition: the word is at the write
    /// sentinel and stays there until this routine publishes its result.
    fn release_exclusive(&self) {
        let guard = self.lock_consumer();
        let mut batch = ReadBatch::new();
        let mut batch_upgrade = false;
        let mut queue_remaining = false;

        loop {
            if self.is_disposed() {
                self.finish_disposed(batch);
                return;
            }
            let word = self.word.load();
            debug_assert!(word.is_write(), "dispatcher entered without exclusivity");
            let holder_upgrade = word.upgrade();

            let selected = match self.elevation {
                Elevation::Fair => self.dequeue_chain(
                    &self.default_queue,
                    &mut batch,
                    &mut batch_upgrade,
                    holder_upgrade,
                    true,
                    &mut queue_remaining,
                ),
                Elevation::Reads => {
                    let _none = self.dequeue_chain(
                        &self.elevated_queue,
                        &mut batch,
                        &mut batch_upgrade,
                        holder_upgrade,
                        false,
                        &mut queue_remaining,
                    );
                    debug_assert!(_none.is_none());
                    if batch.is_empty() {
                        self.dequeue_chain(
                            &self.default_queue,
                            &mut batch,
                            &mut batch_upgrade,
                            holder_upgrade,
                            true,
                            &mut queue_remaining,
                        )
                    } else {
                        if self.default_queue.has_waiters() {
                            queue_remaining = true;
                        }
                        None
                    }
                }
                Elevation::Writes => {
                    if !batch.is_empty() {
                        if self.elevated_queue.has_waiters() {
                            queue_remaining = true;
                        }
                        None
                    } else {
                        let writer = self.dequeue_chain(
                            &self.elevated_queue,
                            &mut batch,
                            &mut batch_upgrade,
                            holder_upgrade,
                            true,
                            &mut queue_remaining,
                        );
                        if writer.is_some() {
                            writer
                        } else {
                            self.dequeue_chain(
                                &self.default_queue,
                                &mut batch,
                                &mut batch_upgrade,
                                holder_upgrade,
                                false,
                                &mut queue_remaining,
                            )
                        }
                    }
                }
            };

            if let Some(writer) = selected {
                let admitted = unsafe { writer.as_ref() }.try_complete(Ok(true));
                self.pool.release(writer);
                if admitted {
                    // Ownership transferred; the word never left the
                    // sentinel, only the holder identity changed.
                    return;
                }
                // The writer timed out or was cancelled inside the race
                // window; rescan.
                continue;
            }

            // A node enqueued during the scan may have published the hint;
            // consume it and collect the latecomer.
            let word = self.word.load();
            if word.queue_changed() {
                let _ = self
                    .word
                    .compare_exchange(word, word.without_queue_changed());
                continue;
            }

            // Commit the batch. The upgradable holder, if any, keeps its
            // shared slot alongside the admitted readers.
            let count = batch.len() + usize::from(word.upgrade());
            let target =
                LockWord::for_readers(count, word.upgrade() || batch_upgrade, queue_remaining);
            if self.word.compare_exchange(word, target).is_err() {
                continue;
            }
            drop(guard);

            // Complete admitted readers while already under the shared
            // word. A completion that loses to a timeout or cancellation is
            // a phantom admission; its reserved slot is refunded below.
            let mut phantoms = 0usize;
            let mut phantom_upgrade = false;
            for reader in batch {
                let node = unsafe { reader.as_ref() };
                if !node.try_complete(Ok(true)) {
                    if node.kind.is_upgrade() {
                        phantom_upgrade = true;
                    } else {
                        phantoms += 1;
                    }
                }
                self.pool.release(reader);
            }
            if phantoms > 0 {
                self.exit_read(phantoms);
            }
            if phantom_upgrade {
                self.exit_read_upgrade();
            }
            return;
        }
    }

    /// Dequeues a chain of admissible readers into `batch`; with
    /// `allow_write` set, a write at the front of the chain (and matching
    /// the holder's upgrade parity) is consumed instead and returned.
    ///
    /// Non-admissible pending nodes are re-enqueued at the tail. The scan
    /// keeps hunting for a first admissible read past them while the batch
    /// is empty, bounded by the approximate queue length.
    fn dequeue_chain(
        &self,
        queue: &WaitQueue,
        batch: &mut ReadBatch,
        batch_upgrade: &mut bool,
        holder_upgrade: bool,
        allow_write: bool,
        queue_remaining: &mut bool,
    ) -> Option<NonNull<WaitNode>> {
        let start = queue.approximate_len();
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            let node_ptr = queue.pop()?;
            let node = unsafe { node_ptr.as_ref() };

            if node.is_pending() && node.deadline.elapsed(self.clock.now()) {
                let _ = node.try_complete(Ok(false));
            }
            if !node.is_pending() {
                // Deadborn, timed out, or cancelled: discard.
                queue.release_slot();
                self.pool.release(node_ptr);
                continue;
            }

            if node.kind.is_read() {
                if node.kind.is_upgrade() && (holder_upgrade || *batch_upgrade) {
                    // A second upgradable reader cannot join this round.
                    queue.push(node_ptr);
                    if batch.is_empty() && iterations < start.max(queue.approximate_len()) {
                        continue;
                    }
                    *queue_remaining = true;
                    return None;
                }
                if node.kind.is_upgrade() {
                    *batch_upgrade = true;
                }
                queue.release_slot();
                batch.push(node_ptr);
                continue;
            }

            // A writer may only be admitted before any reader was chosen,
            // and only when its upgrade parity matches the holder's: an
            // ordinary writer cannot displace an upgradable holder, and a
            // conversion needs one.
            if allow_write && batch.is_empty() && node.kind.is_upgrade() == holder_upgrade {
                queue.release_slot();
                return Some(node_ptr);
            }
            queue.push(node_ptr);
            if batch.is_empty() && iterations < start.max(queue.approximate_len()) {
                continue;
            }
            *queue_remaining = true;
            return None;
        }
    }

    // ------------------------------------------------------------------
    // Dispose, vacuum, consumer guard
    // ------------------------------------------------------------------

    /// Cancels every queued waiter with [`LockError::Disposed`] and refuses
    /// new acquisitions. Current holders may still exit.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.lock_consumer();
        self.drain_queues_disposed();
    }

    /// Dispatcher tail once disposal is observed: drain everything, drop
    /// the batch with the disposal error, and publish the post-dispose
    /// word (only the upgradable holder's slot survives).
    fn finish_disposed(&self, batch: ReadBatch) {
        self.drain_queues_disposed();
        for node_ptr in batch {
            let _ = unsafe { node_ptr.as_ref() }.try_complete(Err(LockError::Disposed));
            self.pool.release(node_ptr);
        }
        let mut word = self.word.load();
        loop {
            debug_assert!(word.is_write());
            let target = if word.upgrade() {
                LockWord::FREE.with_upgradable_reader()
            } else {
                LockWord::FREE
            };
            match self.word.compare_exchange(word, target) {
                Ok(()) => return,
                Err(observed) => word = observed,
            }
        }
    }

    fn drain_queues_disposed(&self) {
        for queue in [&self.default_queue, &self.elevated_queue] {
            while let Some(node_ptr) = queue.pop() {
                let _ = unsafe { node_ptr.as_ref() }.try_complete(Err(LockError::Disposed));
                queue.release_slot();
                self.pool.release(node_ptr);
            }
        }
    }

    /// Unlinks dead waiters from both queues. Skipped entirely when a
    /// dispatcher scan is in flight.
    pub(crate) fn vacuum(&self) {
        if self
            .consumer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let guard = ConsumerGuard { lock: self };
        let now = self.clock.now();
        self.default_queue.vacuum(now, &self.pool);
        self.elevated_queue.vacuum(now, &self.pool);
        drop(guard);
    }

    fn lock_consumer(&self) -> ConsumerGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .consumer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        ConsumerGuard { lock: self }
    }
}

impl Drop for RawLock {
    fn drop(&mut self) {
        // Futures borrow the lock, so no caller references remain; drain
        // whatever is still queued so the queue stubs are all that's left.
        self.drain_queues_disposed();
    }
}

struct ConsumerGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.lock.consumer.store(false, Ordering::Release);
    }
}

// ----------------------------------------------------------------------
// Acquire handle
// ----------------------------------------------------------------------

enum AcquireState {
    /// Resolved without parking; `None` once consumed.
    Ready(Option<Result<bool, LockError>>),
    Parked {
        node: NonNull<WaitNode>,
        consumed: bool,
    },
}

/// Pending acquisition: a `Future` resolving to `Ok(true)` on admission and
/// `Ok(false)` on timeout, or a blocking waiter via [`Acquire::wait`].
///
/// Dropping an unresolved `Acquire` cancels the waiter; dropping a resolved
/// but unconsumed one releases the acquisition it won, so an abandoned
/// handle never leaks a held lock.
pub struct Acquire<'a> {
    lock: &'a RawLock,
    kind: WaitKind,
    state: AcquireState,
}

// Safety: the node is only reached through atomics and its channel mutex.
unsafe impl Send for Acquire<'_> {}
unsafe impl Sync for Acquire<'_> {}

impl<'a> Acquire<'a> {
    fn ready(lock: &'a RawLock, kind: WaitKind, result: Result<bool, LockError>) -> Self {
        Self {
            lock,
            kind,
            state: AcquireState::Ready(Some(result)),
        }
    }

    fn parked(lock: &'a RawLock, kind: WaitKind, node: NonNull<WaitNode>) -> Self {
        Self {
            lock,
            kind,
            state: AcquireState::Parked {
                node,
                consumed: false,
            },
        }
    }

    /// Blocks the calling thread until the acquisition resolves.
    pub fn wait(mut self) -> Result<bool, LockError> {
        match &mut self.state {
            AcquireState::Ready(slot) => slot.take().expect("acquire already consumed"),
            AcquireState::Parked { node, consumed } => {
                let result = unsafe { node.as_ref() }.wait_result();
                *consumed = true;
                result
            }
        }
    }
}

impl Future for Acquire<'_> {
    type Output = Result<bool, LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            AcquireState::Ready(slot) => {
                Poll::Ready(slot.take().expect("acquire polled after completion"))
            }
            AcquireState::Parked { node, consumed } => {
                match unsafe { node.as_ref() }.poll_result(cx) {
                    Poll::Ready(result) => {
                        *consumed = true;
                        Poll::Ready(result)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        match &mut self.state {
            AcquireState::Ready(slot) => {
                if let Some(Ok(true)) = slot.take() {
                    // Resolved fast path abandoned without consumption.
                    self.lock.exit(self.kind);
                }
            }
            AcquireState::Parked { node, consumed } => {
                let waiter = unsafe { node.as_ref() };
                if !*consumed {
                    if !waiter.try_complete(Err(LockError::Cancelled)) {
                        // Completed concurrently; undo a won admission.
                        if let Ok(true) = waiter.take_result_spin() {
                            self.lock.exit(self.kind);
                        }
                    }
                }
                self.lock.pool.release(*node);
            }
        }
    }
}

impl std::fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            AcquireState::Ready(_) => "ready",
            AcquireState::Parked { .. } => "parked",
        };
        f.debug_struct("Acquire")
            .field("kind", &self.kind)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logging::{init_test_logging, poll_once};

    fn raw() -> RawLock {
        RawLock::new(&LockOptions::new())
    }

    fn enter_now(lock: &RawLock, kind: WaitKind) -> bool {
        lock.enter(kind, None, None).wait().expect("acquire failed")
    }

    #[test]
    fn uncontended_read_roundtrip() {
        init_test_logging();
        let lock = raw();
        assert!(enter_now(&lock, WaitKind::Read));
        assert_eq!(lock.snapshot().readers, 1);
        lock.exit_read(1);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn readers_stack_and_unwind() {
        init_test_logging();
        let lock = raw();
        for _ in 0..3 {
            assert!(lock.try_enter(WaitKind::Read));
        }
        assert_eq!(lock.snapshot().readers, 3);
        lock.exit_read(3);
        assert_eq!(lock.snapshot().readers, 0);
    }

    #[test]
    fn write_excludes_all() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));
        assert!(!lock.try_enter(WaitKind::Read));
        assert!(!lock.try_enter(WaitKind::Write));
        assert!(!lock.try_enter(WaitKind::ReadUpgrade));
        lock.exit_write();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn zero_timeout_fails_fast_under_contention() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));
        let result = lock
            .enter(WaitKind::Read, Some(Duration::ZERO), None)
            .wait();
        assert_eq!(result, Ok(false));
        lock.exit_write();
    }

    #[test]
    fn queued_writer_admitted_on_reader_exit() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Read));

        let mut acquire = lock.enter(WaitKind::Write, None, None);
        assert!(poll_once(&mut acquire).is_none());
        assert!(lock.snapshot().queue_changed);

        lock.exit_read(1);
        assert_eq!(poll_once(&mut acquire), Some(Ok(true)));
        assert!(lock.snapshot().is_write);
        drop(acquire);

        lock.exit_write();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn queued_reader_admitted_on_write_exit() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));

        let mut acquire = lock.enter(WaitKind::Read, None, None);
        assert!(poll_once(&mut acquire).is_none());

        lock.exit_write();
        assert_eq!(poll_once(&mut acquire), Some(Ok(true)));
        assert_eq!(lock.snapshot().readers, 1);
        drop(acquire);
        lock.exit_read(1);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn upgrade_waits_for_sibling_readers() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::ReadUpgrade));
        assert!(lock.try_enter(WaitKind::Read));

        // Immediate conversion is refused while a sibling reads.
        assert!(!lock.try_enter(WaitKind::WriteUpgrade));
        let mut acquire = lock.enter(WaitKind::WriteUpgrade, None, None);
        assert!(poll_once(&mut acquire).is_none());

        lock.exit_read(1);
        assert_eq!(poll_once(&mut acquire), Some(Ok(true)));
        let snap = lock.snapshot();
        assert!(snap.is_write);
        assert!(snap.upgrade);
        drop(acquire);

        lock.exit_write();
        let snap = lock.snapshot();
        assert_eq!(snap.readers, 1);
        assert!(snap.upgrade);

        lock.exit_read_upgrade();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn cancelled_waiter_is_skipped_by_the_dispatcher() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));

        let token = CancelToken::new();
        let mut acquire = lock.enter(WaitKind::Read, None, Some(&token));
        assert!(poll_once(&mut acquire).is_none());

        token.cancel();
        assert_eq!(poll_once(&mut acquire), Some(Err(LockError::Cancelled)));
        drop(acquire);

        lock.exit_write();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn pre_cancelled_token_fails_cheaply() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));
        let token = CancelToken::new();
        token.cancel();
        let result = lock.enter(WaitKind::Read, None, Some(&token)).wait();
        assert_eq!(result, Err(LockError::Cancelled));
        lock.exit_write();
    }

    #[test]
    fn dispose_drains_waiters_and_blocks_entry() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));

        let mut reader = lock.enter(WaitKind::Read, None, None);
        let mut writer = lock.enter(WaitKind::Write, None, None);
        assert!(poll_once(&mut reader).is_none());
        assert!(poll_once(&mut writer).is_none());

        lock.dispose();
        assert_eq!(poll_once(&mut reader), Some(Err(LockError::Disposed)));
        assert_eq!(poll_once(&mut writer), Some(Err(LockError::Disposed)));
        drop((reader, writer));

        assert!(!lock.try_enter(WaitKind::Read));
        assert_eq!(
            lock.enter(WaitKind::Read, None, None).wait(),
            Err(LockError::Disposed)
        );

        lock.exit_write();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn dropping_a_parked_acquire_cancels_it() {
        init_test_logging();
        let lock = raw();
        assert!(lock.try_enter(WaitKind::Write));

        let mut acquire = lock.enter(WaitKind::Read, None, None);
        assert!(poll_once(&mut acquire).is_none());
        drop(acquire);

        lock.exit_write();
        // The abandoned waiter must not have been admitted.
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn timed_out_waiter_resolves_false_on_next_release() {
        use crate::time::ManualClock;
        use std::sync::Arc;

        init_test_logging();
        let clock = Arc::new(ManualClock::new(crate::time::Time::ZERO));
        let options = LockOptions::new().clock(clock.clone());
        let lock = RawLock::new(&options);

        assert!(lock.try_enter(WaitKind::Write));
        let mut acquire = lock.enter(WaitKind::Read, Some(Duration::from_millis(5)), None);
        assert!(poll_once(&mut acquire).is_none());

        clock.advance(Duration::from_millis(10));
        lock.exit_write();

        assert_eq!(poll_once(&mut acquire), Some(Ok(false)));
        drop(acquire);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn vacuum_completes_elapsed_waiters() {
        use crate::time::ManualClock;
        use std::sync::Arc;

        init_test_logging();
        let clock = Arc::new(ManualClock::new(crate::time::Time::ZERO));
        let options = LockOptions::new().clock(clock.clone());
        let lock = RawLock::new(&options);

        assert!(lock.try_enter(WaitKind::Write));
        let mut short = lock.enter(WaitKind::Read, Some(Duration::from_millis(5)), None);
        let mut long = lock.enter(WaitKind::Read, None, None);
        let mut tail = lock.enter(WaitKind::Read, None, None);
        assert!(poll_once(&mut short).is_none());
        assert!(poll_once(&mut long).is_none());
        assert!(poll_once(&mut tail).is_none());

        clock.advance(Duration::from_millis(20));
        lock.vacuum();
        assert_eq!(poll_once(&mut short), Some(Ok(false)));
        assert!(poll_once(&mut long).is_none());

        lock.exit_write();
        assert_eq!(poll_once(&mut long), Some(Ok(true)));
        assert_eq!(poll_once(&mut tail), Some(Ok(true)));
        drop((short, long, tail));
        lock.exit_read(2);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn write_elevation_prefers_the_writer() {
        init_test_logging();
        let options = LockOptions::new().elevate_write_queue(true);
        let lock = RawLock::new(&options);
        assert!(lock.try_enter(WaitKind::Write));

        let mut reader = lock.enter(WaitKind::Read, None, None);
        let mut writer = lock.enter(WaitKind::Write, None, None);
        assert!(poll_once(&mut reader).is_none());
        assert!(poll_once(&mut writer).is_none());

        lock.exit_write();
        // The writer, though enqueued second, is admitted first.
        assert_eq!(poll_once(&mut writer), Some(Ok(true)));
        assert!(poll_once(&mut reader).is_none());
        drop(writer);

        lock.exit_write();
        assert_eq!(poll_once(&mut reader), Some(Ok(true)));
        drop(reader);
        lock.exit_read(1);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn read_elevation_prefers_the_reader() {
        init_test_logging();
        let options = LockOptions::new().elevate_read_queue(true);
        let lock = RawLock::new(&options);
        assert!(lock.try_enter(WaitKind::Write));

        let mut writer = lock.enter(WaitKind::Write, None, None);
        let mut reader = lock.enter(WaitKind::Read, None, None);
        assert!(poll_once(&mut writer).is_none());
        assert!(poll_once(&mut reader).is_none());

        lock.exit_write();
        assert_eq!(poll_once(&mut reader), Some(Ok(true)));
        assert!(poll_once(&mut writer).is_none());
        drop(reader);

        lock.exit_read(1);
        assert_eq!(poll_once(&mut writer), Some(Ok(true)));
        drop(writer);
        lock.exit_write();
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }

    #[test]
    fn blocking_wait_across_threads() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        init_test_logging();
        let lock = Arc::new(raw());
        assert!(lock.try_enter(WaitKind::Write));

        let started = Arc::new(AtomicBool::new(false));
        let lock2 = Arc::clone(&lock);
        let started2 = Arc::clone(&started);
        let handle = std::thread::spawn(move || {
            started2.store(true, Ordering::Release);
            lock2.enter(WaitKind::Read, None, None).wait()
        });

        while !started.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        // Give the waiter time to reach the queue before releasing.
        std::thread::sleep(Duration::from_millis(10));
        lock.exit_write();

        assert_eq!(handle.join().unwrap(), Ok(true));
        lock.exit_read(1);
        assert_eq!(lock.snapshot(), LockWord::FREE.snapshot());
    }
}
