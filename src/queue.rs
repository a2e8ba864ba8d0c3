//! Lock-free waiter FIFO.
//!
//! Each lock owns two of these queues (default and elevated). Producers —
//! contended acquirers and the dispatcher re-enqueueing nodes it cannot
//! admit — link nodes at the tail wait-free: one atomic swap of the tail
//! pointer, then one store into the predecessor's `next`. Consumption is
//! single-threaded by construction: the release dispatcher, the vacuum
//! pass, and the dispose drain all hold the lock's consumer guard.
//!
//! The list head is a permanently-installed stub node owned by the queue.
//! An empty queue is `cursor == stub, stub.next == null, tail == stub`;
//! there are no null head/tail states and therefore no torn empty↔nonempty
//! transitions. A popped node is fully detached: the producer that swapped
//! it out of the tail has already published its `next` link, and no other
//! thread retains a pointer to it, so it can be completed, re-enqueued, or
//! released to the pool immediately.
//!
//! The length counter is approximate and is used only to bound scans and
//! to cap the number of queued waiters; correctness never depends on it.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::state::MAX_READ_COUNT;
use crate::time::Time;
use crate::wait::{NodePool, WaitNode};

pub(crate) struct WaitQueue {
    /// Permanent stub; also the initial cursor and tail.
    stub: NonNull<WaitNode>,
    /// Consumer cursor: the next unconsumed node, or the stub.
    cursor: AtomicPtr<WaitNode>,
    tail: AtomicPtr<WaitNode>,
    count: AtomicUsize,
}

// Safety: all cross-thread state is atomic; consumer-only fields are
// guarded by the lock's consumer guard.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        let stub = unsafe { NonNull::new_unchecked(Box::into_raw(WaitNode::stub())) };
        Self {
            stub,
            cursor: AtomicPtr::new(stub.as_ptr()),
            tail: AtomicPtr::new(stub.as_ptr()),
            count: AtomicUsize::new(0),
        }
    }

    /// Reserves a waiter slot in the approximate counter, failing when the
    /// queue is at capacity.
    pub(crate) fn reserve_slot(&self) -> Result<(), ()> {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev >= MAX_READ_COUNT {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(());
        }
        Ok(())
    }

    /// Releases a reserved slot after its node was consumed or discarded.
    pub(crate) fn release_slot(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "queue slot release without reservation");
    }

    pub(crate) fn approximate_len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Links `node` at the tail. Wait-free for producers.
    pub(crate) fn push(&self, node: NonNull<WaitNode>) {
        unsafe {
            node.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
            let prev = self.tail.swap(node.as_ptr(), Ordering::AcqRel);
            // Between the swap and this store the queue is transiently
            // unlinked at `prev`; pop() spins that window out.
            (*prev).next.store(node.as_ptr(), Ordering::Release);
        }
    }

    /// Detaches and returns the oldest node, or `None` when the queue is
    /// empty. Caller must hold the consumer guard.
    pub(crate) fn pop(&self) -> Option<NonNull<WaitNode>> {
        unsafe {
            let mut head = self.cursor.load(Ordering::Relaxed);
            let mut next = (*head).next.load(Ordering::Acquire);

            if head == self.stub.as_ptr() {
                if next.is_null() {
                    if self.tail.load(Ordering::Acquire) == head {
                        return None;
                    }
                    // A producer has swapped the tail but not yet linked.
                    next = self.spin_next(head);
                }
                self.cursor.store(next, Ordering::Relaxed);
                head = next;
                next = (*head).next.load(Ordering::Acquire);
            }

            if next.is_null() {
                let tail = self.tail.load(Ordering::Acquire);
                if tail == head {
                    // `head` is the single remaining node: re-home the stub
                    // behind it so the cursor has somewhere to land.
                    self.push(self.stub);
                }
                next = self.spin_next(head);
            }

            self.cursor.store(next, Ordering::Relaxed);
            Some(NonNull::new_unchecked(head))
        }
    }

    /// Whether any waiter is queued or mid-enqueue. Caller must hold the
    /// consumer guard.
    pub(crate) fn has_waiters(&self) -> bool {
        unsafe {
            let cursor = self.cursor.load(Ordering::Relaxed);
            if cursor != self.stub.as_ptr() {
                return true;
            }
            !(*cursor).next.load(Ordering::Acquire).is_null()
                || self.tail.load(Ordering::Acquire) != cursor
        }
    }

    /// Completes elapsed pending nodes as "not acquired" and unlinks dead
    /// nodes between the cursor and the current tail. Nodes in the tail
    /// region (where a producer may still be appending) are completed but
    /// left linked; the next dequeue discards them. Caller must hold the
    /// consumer guard.
    pub(crate) fn vacuum(&self, now: Time, pool: &NodePool) {
        unsafe {
            let tail_snapshot = self.tail.load(Ordering::Acquire);
            let mut pred = self.cursor.load(Ordering::Relaxed);
            loop {
                let node_ptr = (*pred).next.load(Ordering::Acquire);
                if node_ptr.is_null() {
                    break;
                }
                if node_ptr == self.stub.as_ptr() {
                    pred = node_ptr;
                    continue;
                }
                let node = &*node_ptr;
                if node.is_pending() && node.deadline.elapsed(now) {
                    let _ = node.try_complete(Ok(false));
                }
                if node_ptr == tail_snapshot {
                    break;
                }
                let successor = node.next.load(Ordering::Acquire);
                if successor.is_null() {
                    break;
                }
                if node.is_pending() {
                    pred = node_ptr;
                } else {
                    (*pred).next.store(successor, Ordering::Release);
                    self.release_slot();
                    pool.release(NonNull::new_unchecked(node_ptr));
                }
            }
        }
    }

    /// Waits out the window between a producer's tail swap and its link
    /// store. The window is two instructions wide; the yield covers a
    /// producer that got preempted inside it.
    fn spin_next(&self, node: *mut WaitNode) -> *mut WaitNode {
        let mut spins = 0u32;
        loop {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_null() {
                return next;
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // The owner drains waiters before the queue is dropped; only the
        // stub remains.
        unsafe {
            drop(Box::from_raw(self.stub.as_ptr()));
        }
    }
}
