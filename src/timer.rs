//! Cancellable timers
//!
//! Two primitives are used across the crate:
//! - [`bounded_wait`]: await a future for at most a given duration, falling back to a
//!   deterministic continuation when the limit is hit.
//! - [`Ticker`]: a periodic task owned by a handle; dropping or cancelling the handle
//!   stops the task.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The awaited future finished in time
    Completed(T),
    /// The limit elapsed; carries the fallback value
    TimedOut(T),
}

impl<T> WaitOutcome<T> {
    pub fn timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            WaitOutcome::Completed(v) | WaitOutcome::TimedOut(v) => v,
        }
    }
}

/// Await `fut` for at most `limit`; on expiry the future is dropped and `fallback` runs.
pub async fn bounded_wait<F, T, G>(fut: F, limit: Duration, fallback: G) -> WaitOutcome<T>
where
    F: Future<Output = T>,
    G: FnOnce() -> T,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => WaitOutcome::Completed(value),
        Err(_) => WaitOutcome::TimedOut(fallback()),
    }
}

/// Handle to a periodic task
pub struct Ticker {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Run `tick` every `period` until cancelled. Missed ticks are skipped, not bursted.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Run `action` once after `delay` unless cancelled first.
    pub fn once<F, Fut>(name: &'static str, delay: Duration, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        });
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Ticker '{}' cancelled", self.name);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel();
    }
}
