//! Waker dispatch for lock releases.
//!
//! Completing a waiter wakes whoever parked on its node. By default the
//! wake runs inline on the releasing thread. When a lock is built with
//! `run_continuations_async`, wakes are instead pushed to a process-wide
//! injector drained by a single lazily-spawned dispatcher thread, so a slow
//! continuation cannot stall the releaser.
//!
//! Either way, a waker that panics is rethrown on a detached thread: no
//! release path is ever poisoned by a misbehaving continuation.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::OnceLock;
use std::task::Waker;

struct Injector {
    queue: SegQueue<Waker>,
    signal: Mutex<bool>,
    wakeup: Condvar,
}

static INJECTOR: OnceLock<&'static Injector> = OnceLock::new();

fn injector() -> &'static Injector {
    *INJECTOR.get_or_init(|| {
        let injector: &'static Injector = Box::leak(Box::new(Injector {
            queue: SegQueue::new(),
            signal: Mutex::new(false),
            wakeup: Condvar::new(),
        }));
        std::thread::Builder::new()
            .name("uplock-dispatch".into())
            .spawn(move || dispatch_loop(injector))
            .expect("failed to spawn wake dispatcher");
        injector
    })
}

fn dispatch_loop(injector: &'static Injector) -> ! {
    loop {
        while let Some(waker) = injector.queue.pop() {
            wake_guarded(waker);
        }
        let mut signalled = injector.signal.lock();
        while !*signalled {
            injector.wakeup.wait(&mut signalled);
        }
        *signalled = false;
    }
}

/// Invokes the waker, rethrowing any panic on a detached thread.
fn wake_guarded(waker: Waker) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        waker.wake();
    })) {
        std::thread::spawn(move || std::panic::resume_unwind(panic));
    }
}

/// Wakes `waker` either inline or through the dispatcher thread.
pub(crate) fn wake(waker: Waker, deferred: bool) {
    if deferred {
        let injector = injector();
        injector.queue.push(waker);
        let mut signalled = injector.signal.lock();
        *signalled = true;
        injector.wakeup.notify_one();
    } else {
        wake_guarded(waker);
    }
}
