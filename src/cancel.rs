//! Cancellation tokens for waiting acquirers.
//!
//! A [`CancelToken`] is a cloneable flag with callback registration. The
//! lock registers a callback per parked waiter; firing the token fails the
//! waiter's node and resolves its future with
//! [`LockError::Cancelled`](crate::LockError::Cancelled). The node itself
//! stays queued until a releaser scan or the vacuum pass discards it.
//!
//! Callbacks are removed from the registry before they run and are invoked
//! outside the registry lock, so a callback may freely drop its own
//! [`CancelRegistration`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    entries: Vec<(u64, Callback)>,
    next_id: u64,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    registry: Mutex<Registry>,
}

/// A cloneable cancellation flag with callback registration.
///
/// # Example
///
/// ```
/// use uplock::CancelToken;
///
/// let token = CancelToken::new();
/// let reg = token.register(|| println!("cancelled"));
/// token.cancel();
/// assert!(token.is_cancelled());
/// drop(reg);
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Fires the token: all registered callbacks run once, on this thread,
    /// outside the registry lock. Subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = {
            let mut registry = self.inner.registry.lock();
            std::mem::take(&mut registry.entries)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Registers a callback to run when the token fires.
    ///
    /// If the token has already fired, the callback runs immediately on the
    /// calling thread. Dropping the returned registration removes the
    /// callback if it has not run yet.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        if self.is_cancelled() {
            callback();
            return CancelRegistration { slot: None };
        }
        let id = {
            let mut registry = self.inner.registry.lock();
            // Re-check under the lock so a concurrent cancel() cannot strand
            // an entry it never saw.
            if self.inner.cancelled.load(Ordering::Acquire) {
                drop(registry);
                callback();
                return CancelRegistration { slot: None };
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Box::new(callback)));
            id
        };
        CancelRegistration {
            slot: Some((Arc::clone(&self.inner), id)),
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Handle to a registered cancellation callback.
///
/// Dropping it deregisters the callback; if the callback already ran (or is
/// being run by a concurrent `cancel`) the drop is a no-op.
pub struct CancelRegistration {
    slot: Option<(Arc<Inner>, u64)>,
}

impl CancelRegistration {
    /// A registration that holds nothing.
    #[must_use]
    pub fn disarmed() -> Self {
        Self { slot: None }
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some((inner, id)) = self.slot.take() {
            let mut registry = inner.registry.lock();
            if let Some(pos) = registry.entries.iter().position(|(entry, _)| *entry == id) {
                let (_, callback) = registry.entries.swap_remove(pos);
                // Drop the callback outside the lock; it may own resources
                // with nontrivial drops.
                drop(registry);
                drop(callback);
            }
        }
    }
}

impl std::fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("armed", &self.slot.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_callbacks_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let _reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_cancel_fires_inline() {
        let token = CancelToken::new();
        token.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let _reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_does_not_fire() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn callback_may_drop_its_own_registration() {
        let token = CancelToken::new();
        let slot: Arc<Mutex<Option<CancelRegistration>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let reg = token.register(move || {
            // Taking the registration inside the callback must not deadlock.
            drop(slot2.lock().take());
        });
        *slot.lock() = Some(reg);
        token.cancel();
        assert!(slot.lock().is_none());
    }
}
