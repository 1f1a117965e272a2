//! Fixed-window burst limiter.
//!
//! Up to `limit` acquisitions are granted per window of `period`. Once the window budget is
//! spent, callers queue and a single background throttle task releases them, in order, as
//! windows roll over. The throttle task exits as soon as the queue is empty, so an idle limiter
//! costs nothing.

use crate::limiter::{Acquire, BurstQueue, BurstRateLimiter};
use crate::RateLimitError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct WindowState {
    remaining: u32,
    limit: u32,
    period: Duration,
    reset_at: Instant,
    queue: BurstQueue,
}

impl WindowState {
    fn is_rate_limited(&mut self, now: Instant) -> bool {
        if self.reset_at <= now {
            self.remaining = self.limit;
            self.reset_at = now + self.period;
            return false;
        }
        self.remaining = self.remaining.min(self.limit);
        self.remaining == 0
    }

    fn time_until_reset(&mut self, now: Instant) -> Duration {
        if !self.is_rate_limited(now) {
            return Duration::ZERO;
        }
        self.reset_at.saturating_duration_since(now)
    }

    fn drip(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    fn drain(&mut self) -> usize {
        let mut granted = 0;
        while self.remaining > 0 {
            match self.queue.grant_next() {
                Some(true) => {
                    self.drip();
                    granted += 1;
                }
                Some(false) => continue,
                None => break,
            }
        }
        granted
    }
}

#[derive(Debug)]
struct WindowInner {
    name: Arc<str>,
    state: Mutex<WindowState>,
}

impl WindowInner {
    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().expect("window limiter state poisoned")
    }
}

/// Fixed-window token bucket. Clones share the same window and queue.
#[derive(Debug, Clone)]
pub struct WindowedBurstRateLimiter {
    inner: Arc<WindowInner>,
}

impl WindowedBurstRateLimiter {
    /// Create a limiter granting `limit` acquisitions per `period`.
    ///
    /// Errors if `period` is zero or `limit` is zero.
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        limit: u32,
    ) -> Result<Self, RateLimitError> {
        if period.is_zero() {
            return Err(RateLimitError::invalid("period", "must be greater than zero"));
        }
        if limit == 0 {
            return Err(RateLimitError::invalid("limit", "must be greater than zero"));
        }
        Ok(Self::with_window(name, period, limit))
    }

    /// Construct without validation; the values must already be known to be positive.
    pub(crate) fn with_window(name: impl Into<String>, period: Duration, limit: u32) -> Self {
        let name: String = name.into();
        Self {
            inner: Arc::new(WindowInner {
                name: Arc::from(name),
                state: Mutex::new(WindowState {
                    remaining: 0,
                    limit,
                    period,
                    // Already elapsed, so the first acquisition opens a fresh window.
                    reset_at: Instant::now(),
                    queue: BurstQueue::default(),
                }),
            }),
        }
    }

    /// Determine whether the limiter is exhausted at `now`.
    ///
    /// **This mutates state.** If the current window has ended (`reset_at <= now`) the budget is
    /// refilled (`remaining = limit`) and a new window starting at `now` is opened. Callers must
    /// only ever pass a `now` that never moves backwards between calls; passing past or future
    /// timestamps leaves the window in an unspecified state.
    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.inner.lock().is_rate_limited(now)
    }

    /// How long until the current limit lifts, or zero if not limited at `now`.
    ///
    /// Has the same mutating contract as [`is_rate_limited`](Self::is_rate_limited).
    pub fn time_until_reset(&self, now: Instant) -> Duration {
        self.inner.lock().time_until_reset(now)
    }

    /// Consume one unit of the current window's budget.
    pub fn drip(&self) {
        self.inner.lock().drip();
    }

    /// Acquisitions left in the current window.
    pub fn remaining(&self) -> u32 {
        self.inner.lock().remaining
    }

    /// Maximum acquisitions per window.
    pub fn limit(&self) -> u32 {
        self.inner.lock().limit
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.inner.lock().period
    }

    /// When the current window ends.
    pub fn reset_at(&self) -> Instant {
        self.inner.lock().reset_at
    }

    /// Overwrite the window with fresher data. `reset_at` never moves backwards.
    pub(crate) fn overwrite(&self, remaining: u32, limit: u32, reset_at: Instant) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.remaining = remaining;
        // A zero limit would never refill the queue.
        state.limit = limit.max(1);
        state.reset_at = state.reset_at.max(reset_at);
        state.period = state.reset_at.saturating_duration_since(now);
    }

    /// Acquire, failing fast instead of queueing when the wait would exceed `max_wait`.
    pub(crate) fn acquire_within(&self, max_wait: Option<(Duration, &str)>) -> Acquire {
        let mut state = self.inner.lock();
        if state.queue.is_closed() {
            return Acquire::failed(RateLimitError::closed(&*self.inner.name));
        }

        let now = Instant::now();
        if !state.queue.is_throttling() && !state.is_rate_limited(now) {
            state.drip();
            return Acquire::granted();
        }

        let wait = state.reset_at.saturating_duration_since(now);
        if let Some((max_rate_limit, route)) = max_wait {
            if wait > max_rate_limit {
                return Acquire::failed(RateLimitError::RateLimitTooLong {
                    route: route.to_string(),
                    retry_after: wait,
                    max_rate_limit,
                });
            }
        }

        let acquire = state.queue.enqueue(&self.inner.name);
        if !state.queue.is_throttling() {
            tracing::debug!(
                target: "bucketeer::limiter",
                limiter = %self.inner.name,
                backoff = ?wait,
                "rate limited, throttling queued acquisitions"
            );
            let task = tokio::spawn(throttle(self.inner.clone()));
            state.queue.set_throttle_task(task);
        }
        acquire
    }

    #[cfg(test)]
    pub(crate) fn enqueue_without_throttle(&self) -> Acquire {
        let mut state = self.inner.lock();
        state.queue.enqueue(&self.inner.name)
    }
}

async fn throttle(inner: Arc<WindowInner>) {
    loop {
        let sleep_for = {
            let mut state = inner.lock();
            if state.queue.is_closed() {
                return;
            }
            if state.queue.is_empty() {
                state.queue.finish_throttle();
                return;
            }
            state.time_until_reset(Instant::now())
        };

        tokio::time::sleep(sleep_for).await;

        let granted = {
            let mut state = inner.lock();
            if state.queue.is_closed() {
                return;
            }
            // Refills the budget if the window rolled over while sleeping.
            state.is_rate_limited(Instant::now());
            state.drain()
        };
        tracing::trace!(target: "bucketeer::limiter", limiter = %inner.name, granted, "window drained");
    }
}

impl BurstRateLimiter for WindowedBurstRateLimiter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn acquire(&self) -> Acquire {
        self.acquire_within(None)
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
