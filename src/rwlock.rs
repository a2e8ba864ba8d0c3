//! The lock owner and the typed RAII wrapper.
//!
//! [`ReadWriteLock`] owns the state machine: it validates options, runs the
//! optional background vacuum timer, and exposes the raw enter/exit surface
//! used by adapters. [`RwLock`] wraps it around a value with RAII guards.
//!
//! # Fairness
//!
//! | Configuration | Behavior on release |
//! |---|---|
//! | default (fair) | FIFO across reads and writes in one queue |
//! | `elevate_read_queue` | queued readers admitted before queued writers |
//! | `elevate_write_queue` | queued writers admitted before queued readers |
//!
//! Optimistic acquirers never overtake a published queue hint: once a
//! waiter sets it, new arrivals fall into the queue behind the waiter.
//!
//! # Upgradable reads
//!
//! An [`UpgradableReadGuard`] coexists with ordinary readers but excludes
//! other upgradable readers. [`UpgradableReadGuard::upgrade`] converts to
//! exclusive once the holder is the sole remaining reader, without ever
//! releasing the lock; [`UpgradeGuard::downgrade`] converts back.

use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::{ConfigError, LockError};
use crate::options::LockOptions;
use crate::raw::{Acquire, RawLock};
use crate::state::StateSnapshot;
use crate::wait::WaitKind;

/// The lock itself, without an attached value.
///
/// All acquisition methods return an [`Acquire`] handle usable as a future
/// or as a blocking waiter. `true` means admitted; `false` means the
/// timeout elapsed before admission.
pub struct ReadWriteLock {
    raw: Arc<RawLock>,
    vacuum_timer: Option<VacuumTimer>,
}

impl ReadWriteLock {
    /// Creates a lock with default options: fair queueing, inline wakes,
    /// no vacuum timer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(LockOptions::new()).expect("default options are valid")
    }

    /// Creates a lock with explicit options.
    pub fn with_options(options: LockOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let raw = Arc::new(RawLock::new(&options));
        let vacuum_timer = options
            .vacuum_interval
            .map(|interval| VacuumTimer::spawn(Arc::clone(&raw), interval));
        Ok(Self { raw, vacuum_timer })
    }

    /// Attempts a shared acquisition without waiting.
    #[must_use]
    pub fn try_enter_read(&self) -> bool {
        self.raw.try_enter(WaitKind::Read)
    }

    /// Attempts an upgradable shared acquisition without waiting.
    #[must_use]
    pub fn try_enter_read_upgrade(&self) -> bool {
        self.raw.try_enter(WaitKind::ReadUpgrade)
    }

    /// Attempts an exclusive acquisition without waiting.
    #[must_use]
    pub fn try_enter_write(&self) -> bool {
        self.raw.try_enter(WaitKind::Write)
    }

    /// Attempts to convert the upgradable holder to exclusive without
    /// waiting.
    #[must_use]
    pub fn try_enter_write_upgrade(&self) -> bool {
        self.raw.try_enter(WaitKind::WriteUpgrade)
    }

    /// Shared acquisition.
    pub fn enter_read(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Acquire<'_> {
        self.raw.enter(WaitKind::Read, timeout, cancel)
    }

    /// Upgradable shared acquisition.
    pub fn enter_read_upgrade(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Acquire<'_> {
        self.raw.enter(WaitKind::ReadUpgrade, timeout, cancel)
    }

    /// Exclusive acquisition.
    pub fn enter_write(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Acquire<'_> {
        self.raw.enter(WaitKind::Write, timeout, cancel)
    }

    /// Conversion of the upgradable holder to exclusive. Only meaningful
    /// while holding the upgradable shared state.
    pub fn enter_write_upgrade(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Acquire<'_> {
        self.raw.enter(WaitKind::WriteUpgrade, timeout, cancel)
    }

    /// Releases one shared holder.
    pub fn exit_read(&self) {
        self.raw.exit_read(1);
    }

    /// Releases the upgradable shared holder.
    pub fn exit_read_upgrade(&self) {
        self.raw.exit_read_upgrade();
    }

    /// Releases the exclusive holder.
    pub fn exit_write(&self) {
        self.raw.exit_write();
    }

    /// Releases the upgraded exclusive state, returning the holder to
    /// upgradable shared.
    pub fn exit_write_upgrade(&self) {
        self.raw.exit_write();
    }

    /// Cancels every queued waiter with [`LockError::Disposed`] and
    /// refuses new acquisitions. Current holders may still exit.
    pub fn dispose(&self) {
        self.raw.dispose();
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.raw.is_disposed()
    }

    /// Runs one vacuum pass over both waiter queues.
    pub fn vacuum(&self) {
        self.raw.vacuum();
    }

    /// Debug snapshot of the lock word.
    #[must_use]
    pub fn state(&self) -> StateSnapshot {
        self.raw.snapshot()
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadWriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteLock")
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Background thread running periodic vacuum passes.
struct VacuumTimer {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl VacuumTimer {
    fn spawn(raw: Arc<RawLock>, interval: Duration) -> Self {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("uplock-vacuum".into())
            .spawn(move || {
                let (stop, wakeup) = &*thread_signal;
                let mut stopped = stop.lock();
                while !*stopped {
                    let timed_out = wakeup.wait_for(&mut stopped, interval).timed_out();
                    if *stopped {
                        break;
                    }
                    if timed_out {
                        raw.vacuum();
                    }
                }
            })
            .expect("failed to spawn vacuum timer");
        Self {
            signal,
            handle: Some(handle),
        }
    }
}

impl Drop for VacuumTimer {
    fn drop(&mut self) {
        let (stop, wakeup) = &*self.signal;
        *stop.lock() = true;
        wakeup.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A reader/writer lock protecting a value.
///
/// # Example
///
/// ```
/// use uplock::RwLock;
///
/// let lock = RwLock::new(41);
/// {
///     let mut w = lock.write_blocking().unwrap();
///     *w += 1;
/// }
/// assert_eq!(*lock.read_blocking().unwrap(), 42);
/// ```
pub struct RwLock<T> {
    lock: ReadWriteLock,
    data: UnsafeCell<T>,
}

// Safety: the state machine guarantees exclusive access for writers and
// shared access for readers.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a lock around `value` with default options.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            lock: ReadWriteLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a lock around `value` with explicit options.
    pub fn with_options(value: T, options: LockOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            lock: ReadWriteLock::with_options(options)?,
            data: UnsafeCell::new(value),
        })
    }

    /// Consumes the lock and returns the inner value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the inner value.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Debug snapshot of the lock word.
    #[must_use]
    pub fn state(&self) -> StateSnapshot {
        self.lock.state()
    }

    /// Cancels every queued waiter and refuses new acquisitions.
    pub fn dispose(&self) {
        self.lock.dispose();
    }

    /// Runs one vacuum pass over both waiter queues.
    pub fn vacuum(&self) {
        self.lock.vacuum();
    }

    /// Acquires a read guard asynchronously.
    pub fn read(&self) -> ReadFuture<'_, T> {
        ReadFuture {
            lock: self,
            acquire: self.lock.enter_read(None, None),
        }
    }

    /// Tries to acquire a read guard without waiting.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.lock.try_enter_read().then(|| ReadGuard { lock: self })
    }

    /// Acquires a read guard, blocking the calling thread.
    pub fn read_blocking(&self) -> Result<ReadGuard<'_, T>, LockError> {
        admit(self.lock.enter_read(None, None).wait())?;
        Ok(ReadGuard { lock: self })
    }

    /// Acquires a write guard asynchronously.
    pub fn write(&self) -> WriteFuture<'_, T> {
        WriteFuture {
            lock: self,
            acquire: self.lock.enter_write(None, None),
        }
    }

    /// Tries to acquire a write guard without waiting.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.lock.try_enter_write().then(|| WriteGuard { lock: self })
    }

    /// Acquires a write guard, blocking the calling thread.
    pub fn write_blocking(&self) -> Result<WriteGuard<'_, T>, LockError> {
        admit(self.lock.enter_write(None, None).wait())?;
        Ok(WriteGuard { lock: self })
    }

    /// Acquires an upgradable read guard asynchronously.
    pub fn upgradable_read(&self) -> UpgradableReadFuture<'_, T> {
        UpgradableReadFuture {
            lock: self,
            acquire: self.lock.enter_read_upgrade(None, None),
        }
    }

    /// Tries to acquire an upgradable read guard without waiting.
    pub fn try_upgradable_read(&self) -> Option<UpgradableReadGuard<'_, T>> {
        self.lock
            .try_enter_read_upgrade()
            .then(|| UpgradableReadGuard { lock: self })
    }

    /// Acquires an upgradable read guard, blocking the calling thread.
    pub fn upgradable_read_blocking(&self) -> Result<UpgradableReadGuard<'_, T>, LockError> {
        admit(self.lock.enter_read_upgrade(None, None).wait())?;
        Ok(UpgradableReadGuard { lock: self })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => s.field("data", &*guard),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.field("state", &self.state()).finish()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Maps the raw acquire result onto the guard-producing surface, where a
/// timeout cannot occur (guard acquisition never sets a deadline).
fn admit(result: Result<bool, LockError>) -> Result<(), LockError> {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => unreachable!("acquisition without a deadline reported a timeout"),
        Err(e) => Err(e),
    }
}

macro_rules! guard_future {
    ($(#[$doc:meta])* $future:ident => $guard:ident) => {
        $(#[$doc])*
        pub struct $future<'a, T> {
            lock: &'a RwLock<T>,
            acquire: Acquire<'a>,
        }

        impl<'a, T> Future for $future<'a, T> {
            type Output = Result<$guard<'a, T>, LockError>;

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = &mut *self;
                match Pin::new(&mut this.acquire).poll(cx) {
                    Poll::Ready(result) => {
                        Poll::Ready(admit(result).map(|()| $guard { lock: this.lock }))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    };
}

guard_future! {
    /// Future returned by [`RwLock::read`].
    ReadFuture => ReadGuard
}
guard_future! {
    /// Future returned by [`RwLock::write`].
    WriteFuture => WriteGuard
}
guard_future! {
    /// Future returned by [`RwLock::upgradable_read`].
    UpgradableReadFuture => UpgradableReadGuard
}

/// Shared access to the locked value.
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared admission excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.exit_read();
    }
}

/// Exclusive access to the locked value.
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive admission.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive admission.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.exit_write();
    }
}

/// Shared access that can convert to exclusive in place.
pub struct UpgradableReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> UpgradableReadGuard<'a, T> {
    /// Converts to exclusive access once every sibling reader has exited.
    pub fn upgrade(self) -> UpgradeFuture<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        UpgradeFuture {
            lock,
            acquire: Some(lock.lock.enter_write_upgrade(None, None)),
            resolved: false,
        }
    }

    /// Converts to exclusive access without waiting; returns the guard
    /// unchanged if sibling readers still hold the lock.
    pub fn try_upgrade(self) -> Result<UpgradeGuard<'a, T>, Self> {
        if self.lock.lock.try_enter_write_upgrade() {
            let lock = self.lock;
            std::mem::forget(self);
            Ok(UpgradeGuard { lock })
        } else {
            Err(self)
        }
    }

    /// Converts to exclusive access, blocking the calling thread.
    ///
    /// On error the upgradable hold is released.
    pub fn upgrade_blocking(self) -> Result<UpgradeGuard<'a, T>, LockError> {
        let lock = self.lock;
        std::mem::forget(self);
        match lock.lock.enter_write_upgrade(None, None).wait() {
            Ok(true) => Ok(UpgradeGuard { lock }),
            Ok(false) => unreachable!("acquisition without a deadline reported a timeout"),
            Err(e) => {
                lock.lock.exit_read_upgrade();
                Err(e)
            }
        }
    }
}

impl<T> Deref for UpgradableReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared admission excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for UpgradableReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.exit_read_upgrade();
    }
}

/// Future returned by [`UpgradableReadGuard::upgrade`].
///
/// Dropping it before completion abandons the conversion *and* releases the
/// underlying upgradable hold.
pub struct UpgradeFuture<'a, T> {
    lock: &'a RwLock<T>,
    acquire: Option<Acquire<'a>>,
    resolved: bool,
}

impl<'a, T> Future for UpgradeFuture<'a, T> {
    type Output = Result<UpgradeGuard<'a, T>, LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let acquire = this
            .acquire
            .as_mut()
            .expect("upgrade future polled after completion");
        match Pin::new(acquire).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                this.acquire = None;
                match admit(result) {
                    Ok(()) => Poll::Ready(Ok(UpgradeGuard { lock: this.lock })),
                    Err(e) => {
                        this.lock.lock.exit_read_upgrade();
                        Poll::Ready(Err(e))
                    }
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for UpgradeFuture<'_, T> {
    fn drop(&mut self) {
        if !self.resolved {
            // Resolve the waiter first (undoing a won conversion), then
            // release the upgradable hold itself.
            drop(self.acquire.take());
            self.lock.lock.exit_read_upgrade();
        }
    }
}

/// Exclusive access obtained by upgrading an upgradable read.
pub struct UpgradeGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> UpgradeGuard<'a, T> {
    /// Returns to the upgradable shared state, keeping the hold.
    pub fn downgrade(self) -> UpgradableReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.lock.exit_write_upgrade();
        UpgradableReadGuard { lock }
    }
}

impl<T> Deref for UpgradeGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive admission.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for UpgradeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive admission.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for UpgradeGuard<'_, T> {
    fn drop(&mut self) {
        // Leave the exclusive state, then the upgradable hold beneath it.
        self.lock.lock.exit_write_upgrade();
        self.lock.lock.exit_read_upgrade();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logging::{init_test_logging, poll_once, poll_until_ready};
    use std::sync::Arc as StdArc;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;

    #[test]
    fn multiple_readers_allowed() {
        init_test_logging();
        let lock = RwLock::new(42_u32);

        let a = lock.read_blocking().expect("read failed");
        let b = lock.read_blocking().expect("read failed");
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
        assert_eq!(lock.state().readers, 2);
        drop((a, b));
        assert_eq!(lock.state().readers, 0);
    }

    #[test]
    fn write_excludes_readers_and_writers() {
        init_test_logging();
        let lock = RwLock::new(5_u32);

        let mut write = lock.write_blocking().expect("write failed");
        *write = 7;
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(write);

        assert_eq!(*lock.read_blocking().expect("read failed"), 7);
    }

    #[test]
    fn async_read_and_write_roundtrip() {
        init_test_logging();
        let lock = RwLock::new(vec![1, 2, 3]);

        let read = poll_until_ready(lock.read()).expect("read failed");
        assert_eq!(read.len(), 3);
        drop(read);

        let mut write = poll_until_ready(lock.write()).expect("write failed");
        write.push(4);
        drop(write);

        assert_eq!(*poll_until_ready(lock.read()).expect("read failed"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn upgradable_reader_coexists_then_converts() {
        init_test_logging();
        let lock = RwLock::new(0_u32);

        let up = lock.upgradable_read_blocking().expect("upgradable failed");
        let sibling = lock.read_blocking().expect("read failed");
        assert_eq!(lock.state().readers, 2);
        assert!(lock.state().upgrade);

        // A rival upgradable reader is excluded while one is held.
        assert!(lock.try_upgradable_read().is_none());

        // Conversion is refused while the sibling reads.
        let up = match up.try_upgrade() {
            Err(up) => up,
            Ok(_) => panic!("upgrade should wait for the sibling"),
        };

        let mut pending = up.upgrade();
        assert!(poll_once(&mut pending).is_none());
        drop(sibling);

        let mut guard = poll_once(&mut pending)
            .expect("upgrade should resolve")
            .expect("upgrade failed");
        *guard = 9;
        let snap = lock.state();
        assert!(snap.is_write);
        assert!(snap.upgrade);

        let up = guard.downgrade();
        assert_eq!(*up, 9);
        assert_eq!(lock.state().readers, 1);
        drop(up);
        assert_eq!(lock.state().readers, 0);
        assert!(!lock.state().upgrade);
    }

    #[test]
    fn writer_waiting_blocks_new_readers() {
        init_test_logging();
        let lock = StdArc::new(RwLock::new(1_u32));
        let read_guard = lock.read_blocking().expect("read failed");

        let writer_started = StdArc::new(AtomicBool::new(false));
        let writer_lock = StdArc::clone(&lock);
        let writer_flag = StdArc::clone(&writer_started);
        let handle = thread::spawn(move || {
            writer_flag.store(true, AtomicOrdering::Release);
            let _guard = writer_lock.write_blocking().expect("write failed");
        });

        while !writer_started.load(AtomicOrdering::Acquire) {
            thread::yield_now();
        }

        // Queue registration races with the flag; poll until the hint
        // lands and optimistic readers are refused.
        let mut blocked = false;
        for _ in 0..100 {
            if lock.state().queue_changed && lock.try_read().is_none() {
                blocked = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(blocked, "waiting writer should block new readers");

        drop(read_guard);
        handle.join().expect("writer thread panicked");
        assert_eq!(lock.state().readers, 0);
    }

    #[test]
    fn dropping_an_unconsumed_future_backs_out() {
        init_test_logging();
        let lock = RwLock::new(0_u32);
        drop(lock.write());
        drop(lock.read());
        assert_eq!(lock.state(), StateSnapshot {
            readers: 0,
            is_write: false,
            upgrade: false,
            queue_changed: false,
        });
        // The lock still works.
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn abandoned_upgrade_releases_the_hold() {
        init_test_logging();
        let lock = RwLock::new(0_u32);
        let sibling = lock.read_blocking().expect("read failed");
        let up = lock.upgradable_read_blocking().expect("upgradable failed");

        let mut pending = up.upgrade();
        assert!(poll_once(&mut pending).is_none());
        drop(pending);

        // Both the conversion waiter and the upgradable hold are gone.
        assert!(!lock.state().upgrade);
        assert_eq!(lock.state().readers, 1);
        drop(sibling);
        assert_eq!(lock.state().readers, 0);
    }

    #[test]
    fn dispose_fails_blocked_acquisitions() {
        init_test_logging();
        let lock = RwLock::new(0_u32);
        let write = lock.write_blocking().expect("write failed");

        let mut read = lock.read();
        assert!(poll_once(&mut read).is_none());
        lock.dispose();
        assert_eq!(
            poll_once(&mut read).map(|r| r.err()),
            Some(Some(LockError::Disposed))
        );
        drop(read);
        drop(write);
        assert_eq!(lock.state().readers, 0);
    }

    #[test]
    fn into_inner_and_get_mut() {
        init_test_logging();
        let mut lock = RwLock::new(String::from("a"));
        lock.get_mut().push('b');
        assert_eq!(lock.into_inner(), "ab");
    }

    #[test]
    fn vacuum_timer_runs_in_background() {
        init_test_logging();
        let options = LockOptions::new().vacuum_interval(Some(Duration::from_millis(5)));
        let lock = RwLock::with_options(0_u32, options).expect("options are valid");

        let write = lock.write_blocking().expect("write failed");
        let mut timed = lock.lock.enter_read(Some(Duration::from_millis(1)), None);
        assert!(poll_once(&mut timed).is_none());

        // The background pass completes the elapsed waiter without any
        // release happening.
        let mut resolved = false;
        for _ in 0..500 {
            if let Some(result) = poll_once(&mut timed) {
                assert_eq!(result, Ok(false));
                resolved = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(resolved, "vacuum timer should resolve the elapsed waiter");
        drop(timed);
        drop(write);
        assert_eq!(lock.state().readers, 0);
    }

    #[test]
    fn invalid_options_are_rejected() {
        init_test_logging();
        let options = LockOptions::new()
            .elevate_read_queue(true)
            .elevate_write_queue(true);
        assert!(matches!(
            RwLock::with_options(0_u32, options),
            Err(ConfigError::ConflictingElevation)
        ));
    }
}
