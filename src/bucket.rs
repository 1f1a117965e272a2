//! Per-endpoint rate limit bucket.

use crate::limiter::{Acquire, BurstRateLimiter};
use crate::route::CompiledRoute;
use crate::window::WindowedBurstRateLimiter;
use crate::RateLimitError;
use std::time::Duration;
use tokio::time::Instant;

/// Whether the server has told us which bucket a route belongs to yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Limits come from response headers.
    Known,
    /// Placeholder with unlimited capacity until the first response arrives.
    Unknown,
}

/// A windowed limiter for one `(server bucket, major parameter)` pair.
///
/// Starts with a one-request-per-second window; the real numbers arrive through
/// [`update_rate_limit`](Self::update_rate_limit) and may change at any time. An
/// [`Unknown`](BucketKind::Unknown) bucket never limits. Clones share state.
#[derive(Debug, Clone)]
pub struct RestBucket {
    window: WindowedBurstRateLimiter,
    kind: BucketKind,
    compiled_route: Option<CompiledRoute>,
    max_rate_limit: Option<Duration>,
}

impl RestBucket {
    /// Create a bucket named after its real bucket hash.
    pub fn new(name: impl Into<String>, kind: BucketKind, compiled_route: Option<CompiledRoute>) -> Self {
        Self {
            window: WindowedBurstRateLimiter::with_window(name, Duration::from_secs(1), 1),
            kind,
            compiled_route,
            max_rate_limit: None,
        }
    }

    /// Fail acquisitions with [`RateLimitError::RateLimitTooLong`] instead of queueing when the
    /// current window would keep the caller waiting longer than `max_rate_limit`.
    pub fn with_max_rate_limit(mut self, max_rate_limit: Duration) -> Self {
        self.max_rate_limit = Some(max_rate_limit);
        self
    }

    /// Whether the server has assigned this bucket yet.
    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    /// `true` for the unlimited placeholder bucket.
    pub fn is_unknown(&self) -> bool {
        self.kind == BucketKind::Unknown
    }

    /// The route that first created this bucket, if any.
    pub fn compiled_route(&self) -> Option<&CompiledRoute> {
        self.compiled_route.as_ref()
    }

    /// Overwrite the window with header data from a response.
    ///
    /// `reset_at` is on the local monotonic clock. The budget may shrink or grow mid-window;
    /// a throttle task that is already sleeping keeps its current deadline.
    pub fn update_rate_limit(&self, remaining: u32, limit: u32, reset_at: Instant) {
        self.window.overwrite(remaining, limit, reset_at);
    }

    /// Consume one unit of budget. Does nothing on an unknown bucket.
    pub fn drip(&self) {
        if !self.is_unknown() {
            self.window.drip();
        }
    }

    /// Acquisitions left in the current window.
    pub fn remaining(&self) -> u32 {
        self.window.remaining()
    }

    /// Maximum acquisitions per window.
    pub fn limit(&self) -> u32 {
        self.window.limit()
    }

    /// Window length derived from the last headers.
    pub fn period(&self) -> Duration {
        self.window.period()
    }

    /// When the current window ends.
    pub fn reset_at(&self) -> Instant {
        self.window.reset_at()
    }

    /// See [`WindowedBurstRateLimiter::is_rate_limited`]; always `false` for unknown buckets.
    pub fn is_rate_limited(&self, now: Instant) -> bool {
        !self.is_unknown() && self.window.is_rate_limited(now)
    }

    #[cfg(test)]
    pub(crate) fn enqueue_without_throttle(&self) -> Acquire {
        self.window.enqueue_without_throttle()
    }
}

impl BurstRateLimiter for RestBucket {
    fn name(&self) -> &str {
        self.window.name()
    }

    fn acquire(&self) -> Acquire {
        match self.kind {
            BucketKind::Unknown if self.window.is_closed() => {
                Acquire::failed(RateLimitError::closed(self.window.name()))
            }
            BucketKind::Unknown => Acquire::granted(),
            BucketKind::Known => {
                let Some(max_rate_limit) = self.max_rate_limit else {
                    return self.window.acquire_within(None);
                };
                let route = match &self.compiled_route {
                    Some(route) => route.to_string(),
                    None => self.window.name().to_string(),
                };
                self.window.acquire_within(Some((max_rate_limit, &route)))
            }
        }
    }

    fn close(&self) {
        self.window.close();
    }

    fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.window.is_closed()
    }
}
