//! Service-wide throttle driven by the server's "global limit hit" signal.
//!
//! The limiter stays open until [`GlobalLimiter::throttle`] is called. From then on every
//! acquisition queues until the retry-after delay elapses, when the whole queue is released in
//! FIFO order. A newer `throttle` call replaces any pending unlock.

use crate::limiter::{Acquire, BurstQueue, BurstRateLimiter};
use crate::RateLimitError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Current state of the global limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    /// Acquisitions resolve immediately.
    Open,
    /// Acquisitions queue until the unlock fires.
    Throttled,
}

#[derive(Debug, Default)]
struct GlobalLimiterState {
    queue: BurstQueue,
    // Bumped by every throttle() so a superseded unlock can tell it lost the race.
    generation: u64,
}

#[derive(Debug)]
struct GlobalInner {
    name: Arc<str>,
    state: Mutex<GlobalLimiterState>,
}

impl GlobalInner {
    fn lock(&self) -> MutexGuard<'_, GlobalLimiterState> {
        self.state.lock().expect("global limiter state poisoned")
    }
}

/// Manual, service-wide gate. Clones share the same gate.
#[derive(Debug, Clone)]
pub struct GlobalLimiter {
    inner: Arc<GlobalInner>,
}

impl Default for GlobalLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLimiter {
    pub fn new() -> Self {
        Self::named("global")
    }

    /// Create a limiter with a custom name for logs and errors.
    pub fn named(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            inner: Arc::new(GlobalInner {
                name: Arc::from(name),
                state: Mutex::new(GlobalLimiterState::default()),
            }),
        }
    }

    pub fn state(&self) -> GlobalState {
        if self.inner.lock().queue.is_throttling() {
            GlobalState::Throttled
        } else {
            GlobalState::Open
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.state() == GlobalState::Throttled
    }

    /// Hold every acquisition for `retry_after`, replacing any unlock already scheduled.
    ///
    /// Must be called from within a Tokio runtime. Errors if the limiter is closed.
    pub fn throttle(&self, retry_after: Duration) -> Result<(), RateLimitError> {
        let mut state = self.inner.lock();
        if state.queue.is_closed() {
            return Err(RateLimitError::closed(&*self.inner.name));
        }

        state.generation = state.generation.wrapping_add(1);
        if let Some(previous) = state.queue.take_throttle_task() {
            previous.abort();
        }

        tracing::warn!(
            target: "bucketeer::global",
            limiter = %self.inner.name,
            ?retry_after,
            "globally rate limited"
        );
        let task = tokio::spawn(unlock_later(self.inner.clone(), retry_after, state.generation));
        state.queue.set_throttle_task(task);
        Ok(())
    }
}

async fn unlock_later(inner: Arc<GlobalInner>, retry_after: Duration, generation: u64) {
    tokio::time::sleep(retry_after).await;

    let mut state = inner.lock();
    if state.generation != generation || state.queue.is_closed() {
        return;
    }
    let released = state.queue.grant_all();
    state.queue.finish_throttle();
    tracing::debug!(target: "bucketeer::global", limiter = %inner.name, released, "global rate limit lifted");
}

impl BurstRateLimiter for GlobalLimiter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn acquire(&self) -> Acquire {
        let mut state = self.inner.lock();
        if state.queue.is_closed() {
            Acquire::failed(RateLimitError::closed(&*self.inner.name))
        } else if state.queue.is_throttling() {
            state.queue.enqueue(&self.inner.name)
        } else {
            Acquire::granted()
        }
    }

    fn close(&self) {
        self.inner.lock().queue.close(&self.inner.name);
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().queue.is_closed()
    }
}
