//! Injectable time source.
//!
//! Deadlines throughout this crate are absolute [`tokio::time::Instant`]s
//! read from a [`Clock`], never the wall clock. The default [`TokioClock`]
//! rides tokio's timer, so tests running under a paused runtime
//! (`#[tokio::test(start_paused = true)]`) get fully deterministic timeout
//! behavior without a second clock implementation.

use std::future::pending;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

/// Time source used for every deadline and poll interval.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Sleep until `deadline`; resolves immediately if it already passed.
    async fn sleep_until(&self, deadline: Instant);
}

/// The default clock, backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Read/write deadlines of one connection or socket.
///
/// Setters are pure state mutations; an operation already parked keeps the
/// deadline it captured when it last checked.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Deadlines {
    pub(crate) read: Option<Instant>,
    pub(crate) write: Option<Instant>,
}

/// Wait out an optional absolute deadline; `None` means wait forever.
///
/// Used as one arm of a `select!` — the sleep future is dropped on every
/// other exit path, so no timer outlives its wait.
pub(crate) async fn deadline_passed(clock: &Arc<dyn Clock>, deadline: Option<Instant>) {
    match deadline {
        Some(at) => clock.sleep_until(at).await,
        None => pending().await,
    }
}
