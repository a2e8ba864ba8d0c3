//! Waiter nodes, their result channel, and the node pool.
//!
//! Every contended acquisition rents a [`WaitNode`], links it into one of
//! the lock's queues, and parks on the node's one-shot result channel. The
//! channel delivers `Result<bool, LockError>` exactly once — `Ok(true)` on
//! admission, `Ok(false)` on timeout, `Err` on cancellation, overflow, or
//! disposal — and can be consumed either by polling (async) or by a condvar
//! wait (blocking).
//!
//! # Completion state machine
//!
//! ```text
//!             ┌──────────► Completed   (admitted, or timed out)
//!   Pending ──┼──────────► Failed      (cancelled / disposed)
//!             └──────────► Deadborn    (acquirer won the post-enqueue race)
//! ```
//!
//! The transition out of `Pending` is a CAS, so exactly one of the
//! releaser, the timeout check, the cancellation callback, and the acquirer
//! wins; a lost CAS means the node was already handled. A non-pending node
//! still sitting in a queue is skipped and unlinked by whoever meets it.
//!
//! # Reference counting
//!
//! A node starts with two references (the queue's and the caller's), plus
//! one taken for the cancellation registration before the node is shared.
//! The node returns to the pool exactly once, when the last reference
//! drops. Nodes whose channel generation saturates are deallocated instead
//! of recycled.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering, fence};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelRegistration;
use crate::dispatch;
use crate::error::LockError;
use crate::time::Deadline;

/// What a waiter is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// Pool/stub filler; never queued by an acquirer.
    Uninit,
    Read,
    Write,
    /// Shared entry that reserves the right to upgrade.
    ReadUpgrade,
    /// Conversion of the upgradable reader to exclusive.
    WriteUpgrade,
}

impl WaitKind {
    #[inline]
    pub(crate) fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadUpgrade)
    }

    #[inline]
    pub(crate) fn is_upgrade(self) -> bool {
        matches!(self, Self::ReadUpgrade | Self::WriteUpgrade)
    }
}

/// Completion states. Stored in an `AtomicU8`; `PENDING` is the only state
/// with outgoing transitions.
pub(crate) const PENDING: u8 = 0;
pub(crate) const COMPLETED: u8 = 1;
pub(crate) const FAILED: u8 = 2;
pub(crate) const DEADBORN: u8 = 3;

#[derive(Default)]
struct Slot {
    result: Option<Result<bool, LockError>>,
    waker: Option<Waker>,
}

/// A pooled waiter record.
///
/// Plain fields (`kind`, `deadline`, `deferred_wake`, `generation`) are
/// written only while the node is exclusively owned, between pool rent and
/// publication to a queue. Everything shared afterwards is atomic or behind
/// the channel mutex.
pub(crate) struct WaitNode {
    pub(crate) kind: WaitKind,
    pub(crate) deadline: Deadline,
    deferred_wake: bool,
    generation: u32,
    pub(crate) next: AtomicPtr<WaitNode>,
    state: AtomicU8,
    refs: AtomicU32,
    channel: Mutex<Slot>,
    done: Condvar,
    cancel_reg: Mutex<Option<CancelRegistration>>,
}

impl WaitNode {
    fn new() -> Self {
        Self {
            kind: WaitKind::Uninit,
            deadline: Deadline::Never,
            deferred_wake: false,
            generation: 0,
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(COMPLETED),
            refs: AtomicU32::new(0),
            channel: Mutex::new(Slot::default()),
            done: Condvar::new(),
            cancel_reg: Mutex::new(None),
        }
    }

    /// Allocates a queue stub: permanently non-pending, never pooled.
    pub(crate) fn stub() -> Box<Self> {
        Box::new(Self::new())
    }

    /// Readies an owned node for one acquisition.
    fn prepare(&mut self, kind: WaitKind, deadline: Deadline, deferred_wake: bool) {
        self.kind = kind;
        self.deadline = deadline;
        self.deferred_wake = deferred_wake;
        self.next = AtomicPtr::new(ptr::null_mut());
        self.state = AtomicU8::new(PENDING);
        self.refs = AtomicU32::new(2);
        debug_assert!(self.channel.get_mut().result.is_none());
        debug_assert!(self.channel.get_mut().waker.is_none());
        debug_assert!(self.cancel_reg.get_mut().is_none());
    }

    /// Clears an owned node on return to the pool. Returns false when the
    /// channel generation has saturated and the node must be retired.
    fn reset(&mut self) -> bool {
        self.kind = WaitKind::Uninit;
        self.deadline = Deadline::Never;
        let slot = self.channel.get_mut();
        slot.result = None;
        slot.waker = None;
        *self.cancel_reg.get_mut() = None;
        if self.generation == u32::MAX {
            return false;
        }
        self.generation += 1;
        true
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    #[inline]
    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending → Deadborn. Used by an acquirer that won an optimistic race
    /// after enqueueing; the queue discards the node on sight.
    pub(crate) fn try_release_before_acquired(&self) -> bool {
        self.transition(DEADBORN)
    }

    /// Completes the node and publishes `result` to the parked caller.
    ///
    /// Returns false if the node was no longer pending (some other
    /// transition won; the result is dropped).
    pub(crate) fn try_complete(&self, result: Result<bool, LockError>) -> bool {
        let to = if result.is_ok() { COMPLETED } else { FAILED };
        if !self.transition(to) {
            return false;
        }
        // Disarm the cancellation hook before publishing; if the hook is
        // mid-fire it already lost the state CAS above. Deregistration runs
        // outside the registration mutex.
        let registration = self.cancel_reg.lock().take();
        drop(registration);
        let waker = {
            let mut slot = self.channel.lock();
            slot.result = Some(result);
            self.done.notify_all();
            slot.waker.take()
        };
        if let Some(waker) = waker {
            dispatch::wake(waker, self.deferred_wake);
        }
        true
    }

    /// Stores the registration guarding this node's waiter.
    pub(crate) fn arm_cancellation(&self, registration: CancelRegistration) {
        *self.cancel_reg.lock() = Some(registration);
    }

    /// Drops the cancellation hook without completing the node.
    pub(crate) fn disarm_cancellation(&self) {
        let registration = self.cancel_reg.lock().take();
        drop(registration);
    }

    /// Polls the result channel, registering `cx`'s waker while pending.
    pub(crate) fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<bool, LockError>> {
        let mut slot = self.channel.lock();
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        match &slot.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Blocks on the condvar until the result is published.
    pub(crate) fn wait_result(&self) -> Result<bool, LockError> {
        let mut slot = self.channel.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return result;
            }
            self.done.wait(&mut slot);
        }
    }

    /// Takes the published result, spinning out the narrow window between
    /// the completer's state transition and its channel store.
    pub(crate) fn take_result_spin(&self) -> Result<bool, LockError> {
        loop {
            if let Some(result) = self.channel.lock().result.take() {
                return result;
            }
            std::hint::spin_loop();
        }
    }
}

/// Pool of waiter nodes for one lock.
///
/// Shared fallback is a lock-free queue; a thread-local single slot serves
/// nodes that were never published to a queue, so cross-thread reuse always
/// flows through the shared queue.
#[derive(Clone)]
pub(crate) struct NodePool {
    shared: Arc<SegQueue<Box<WaitNode>>>,
}

thread_local! {
    static LOCAL_NODE: RefCell<Option<Box<WaitNode>>> = const { RefCell::new(None) };
}

impl NodePool {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SegQueue::new()),
        }
    }

    /// Rents a node prepared for one acquisition. The returned pointer is
    /// exclusively owned until published to a queue.
    pub(crate) fn rent(
        &self,
        kind: WaitKind,
        deadline: Deadline,
        deferred_wake: bool,
    ) -> NonNull<WaitNode> {
        let mut node = LOCAL_NODE
            .with(|slot| slot.borrow_mut().take())
            .or_else(|| self.shared.pop())
            .unwrap_or_else(|| Box::new(WaitNode::new()));
        node.prepare(kind, deadline, deferred_wake);
        // Ownership moves into the queue/caller reference pair.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Returns a node that was never shared: no reference accounting, and
    /// the thread-local slot may keep it.
    pub(crate) fn recycle_unshared(&self, node: NonNull<WaitNode>) {
        // Safety: the caller owns the node exclusively (it was never
        // published), so reconstituting the box is sound.
        let mut node = unsafe { Box::from_raw(node.as_ptr()) };
        if !node.reset() {
            return;
        }
        let node = LOCAL_NODE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(node);
                None
            } else {
                Some(node)
            }
        });
        if let Some(node) = node {
            self.shared.push(node);
        }
    }

    /// Adds a reference. Only valid before the node is shared (the count is
    /// still visible to the owning thread alone).
    pub(crate) fn retain(&self, node: NonNull<WaitNode>) {
        unsafe { node.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference; the last one home returns the node to the pool.
    pub(crate) fn release(&self, node: NonNull<WaitNode>) {
        let refs = unsafe { node.as_ref() }.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(refs > 0, "waiter reference count underflow");
        if refs == 1 {
            fence(Ordering::Acquire);
            // Safety: every reference is gone; we own the allocation.
            let mut node = unsafe { Box::from_raw(node.as_ptr()) };
            if node.reset() {
                self.shared.push(node);
            }
        }
    }
}

/// A counted node reference held by a cancellation callback.
pub(crate) struct NodeRef {
    node: NonNull<WaitNode>,
    pool: NodePool,
}

// Safety: the node outlives every counted reference, and all shared node
// state is atomic or mutex-guarded.
unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    /// Wraps a reference the caller has already counted via `retain`.
    pub(crate) fn adopt(node: NonNull<WaitNode>, pool: NodePool) -> Self {
        Self { node, pool }
    }

    pub(crate) fn node(&self) -> &WaitNode {
        unsafe { self.node.as_ref() }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.pool.release(self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Time;

    fn rent(pool: &NodePool, kind: WaitKind) -> NonNull<WaitNode> {
        pool.rent(kind, Deadline::Never, false)
    }

    #[test]
    fn completion_is_one_shot() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::Read);
        let n = unsafe { node.as_ref() };

        assert!(n.is_pending());
        assert!(n.try_complete(Ok(true)));
        assert!(!n.try_complete(Ok(false)));
        assert!(!n.try_release_before_acquired());
        assert_eq!(n.take_result_spin(), Ok(true));

        pool.release(node);
        pool.release(node);
    }

    #[test]
    fn deadborn_blocks_completion() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::Write);
        let n = unsafe { node.as_ref() };

        assert!(n.try_release_before_acquired());
        assert!(!n.is_pending());
        assert!(!n.try_complete(Ok(true)));

        pool.release(node);
        pool.release(node);
    }

    #[test]
    fn blocking_wait_receives_result() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::Read);
        let n = unsafe { node.as_ref() };

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| n.wait_result());
            std::thread::sleep(std::time::Duration::from_millis(10));
            assert!(n.try_complete(Err(LockError::Cancelled)));
            assert_eq!(handle.join().unwrap(), Err(LockError::Cancelled));
        });

        pool.release(node);
        pool.release(node);
    }

    #[test]
    fn pool_recycles_released_nodes() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::Read);
        unsafe { node.as_ref() }.try_complete(Ok(false));
        pool.release(node);
        pool.release(node);

        // The same allocation comes back with a fresh pending state.
        let again = pool.rent(WaitKind::Write, Deadline::At(Time::from_millis(1)), false);
        let n = unsafe { again.as_ref() };
        assert!(n.is_pending());
        assert_eq!(n.kind, WaitKind::Write);
        n.try_complete(Ok(true));
        pool.release(again);
        pool.release(again);
    }

    #[test]
    fn unshared_recycle_skips_reference_accounting() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::ReadUpgrade);
        pool.recycle_unshared(node);

        let again = rent(&pool, WaitKind::Read);
        assert!(unsafe { again.as_ref() }.is_pending());
        unsafe { again.as_ref() }.try_complete(Ok(false));
        pool.release(again);
        pool.release(again);
    }

    #[test]
    fn registration_reference_keeps_node_alive() {
        let pool = NodePool::new();
        let node = rent(&pool, WaitKind::Read);
        pool.retain(node);
        let extra = NodeRef::adopt(node, pool.clone());

        unsafe { node.as_ref() }.try_complete(Ok(true));
        pool.release(node);
        pool.release(node);

        // The callback's reference still reaches valid node state.
        assert!(!extra.node().is_pending());
        drop(extra);
    }
}
