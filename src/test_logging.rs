//! Test logging and polling helpers.
//!
//! Unit and integration tests share a tiny logging layer: a verbosity
//! level read from the `TEST_LOG_LEVEL` environment variable and a pair of
//! phase macros that print progress when `Debug` or higher is selected.
//! Failures always print through the assertion macros, so a quiet run
//! stays quiet until something breaks.
//!
//! The poll helpers drive manual futures without an executor, using the
//! no-op waker: [`poll_once`] for single-step assertions and
//! [`poll_until_ready`] to spin a future to completion.

use std::future::Future;
use std::sync::OnceLock;
use std::task::{Context, Poll, Waker};

/// Logging verbosity for tests, parsed from `TEST_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only failures.
    #[default]
    Error,
    /// Test phase progress.
    Info,
    /// Everything, including per-step traces.
    Debug,
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            "debug" | "trace" => Ok(Self::Debug),
            _ => Err(()),
        }
    }
}

static LEVEL: OnceLock<TestLogLevel> = OnceLock::new();

/// Initializes the shared log level; idempotent, callable from any test.
pub fn init_test_logging() {
    let _ = LEVEL.get_or_init(|| {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    });
}

/// The level selected for this process.
#[must_use]
pub fn level() -> TestLogLevel {
    LEVEL.get().copied().unwrap_or_default()
}

/// Marks the beginning of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        if $crate::test_logging::level() >= $crate::test_logging::TestLogLevel::Info {
            eprintln!("[phase] {}", $name);
        }
    };
}

/// Marks a test as complete.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        if $crate::test_logging::level() >= $crate::test_logging::TestLogLevel::Info {
            eprintln!("[done ] {}", $name);
        }
    };
}

/// Asserts a condition, printing the expectation and observation on
/// failure.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            panic!(
                "assertion failed: {}\n  expected: {:?}\n    actual: {:?}",
                $what, $expected, $actual
            );
        } else if $crate::test_logging::level() >= $crate::test_logging::TestLogLevel::Debug {
            eprintln!("[ok   ] {}", $what);
        }
    };
}

/// Polls a future once with the no-op waker.
pub fn poll_once<T>(future: &mut (impl Future<Output = T> + Unpin)) -> Option<T> {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    match std::pin::Pin::new(future).poll(&mut cx) {
        Poll::Ready(value) => Some(value),
        Poll::Pending => None,
    }
}

/// Polls a future to completion, yielding the thread between attempts.
pub fn poll_until_ready<T>(future: impl Future<Output = T>) -> T {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}
