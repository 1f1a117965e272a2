//! Route-to-bucket bookkeeping for a REST client.
//!
//! The server tags every response with a bucket hash. Routes sharing a hash share limits, but
//! each value of the route's major parameter gets its own window, so buckets are keyed by the
//! *real* hash `"{server_hash};{major_param}"`. Until a route's first response arrives its hash
//! is [`UNKNOWN_HASH`] and it is served by an unlimited placeholder bucket.
//!
//! Typical request flow:
//!
//! ```rust
//! use bucketeer::{BucketManager, Method, Route};
//! use std::time::Duration;
//!
//! const POST_MESSAGES: Route = Route::new(Method::Post, "/channels/{channel}/messages");
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let manager = BucketManager::new();
//! manager.start();
//!
//! let route = POST_MESSAGES.compile([("channel", 42)]).unwrap();
//! manager.acquire(&route).await.unwrap();
//! // ... send the request, then report the headers back:
//! manager.update_rate_limits_after(&route, "abc", 4, 5, Duration::from_secs(2)).unwrap();
//! assert!(manager.bucket("abc;42").is_some());
//!
//! manager.close();
//! # });
//! ```

use crate::bucket::{BucketKind, RestBucket};
use crate::limiter::{Acquire, BurstRateLimiter};
use crate::route::{CompiledRoute, Route};
use crate::RateLimitError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Server bucket hash assumed for routes that have not been seen yet.
pub const UNKNOWN_HASH: &str = "UNKNOWN";

const MANAGER_NAME: &str = "bucket manager";

/// Validated settings for the garbage collector and bucket acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketManagerConfig {
    gc_interval: Duration,
    expire_after: Duration,
    max_rate_limit: Option<Duration>,
}

impl Default for BucketManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(20),
            expire_after: Duration::from_secs(10),
            max_rate_limit: None,
        }
    }
}

impl BucketManagerConfig {
    /// Create a config with validation. `gc_interval` must be non-zero; `expire_after` may be
    /// zero to collect buckets as soon as their window has reset.
    pub fn new(gc_interval: Duration, expire_after: Duration) -> Result<Self, RateLimitError> {
        if gc_interval.is_zero() {
            return Err(RateLimitError::invalid("gc_interval", "must be greater than zero"));
        }
        Ok(Self { gc_interval, expire_after, max_rate_limit: None })
    }

    /// Fail acquisitions that would wait longer than `max_rate_limit`; must be > 0.
    pub fn with_max_rate_limit(mut self, max_rate_limit: Duration) -> Result<Self, RateLimitError> {
        if max_rate_limit.is_zero() {
            return Err(RateLimitError::invalid("max_rate_limit", "must be greater than zero"));
        }
        self.max_rate_limit = Some(max_rate_limit);
        Ok(self)
    }

    /// How often the garbage collector runs.
    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }

    /// How long past its reset an idle bucket is kept.
    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }

    /// Longest wait an acquisition accepts before failing, if capped.
    pub fn max_rate_limit(&self) -> Option<Duration> {
        self.max_rate_limit
    }
}

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Buckets removed and closed.
    pub purged: usize,
    /// Buckets whose window has not reset yet.
    pub active: usize,
    /// Buckets past their reset but still inside the expiry grace period, or still holding waiters.
    pub surviving: usize,
}

#[derive(Debug, Default)]
struct ManagerState {
    routes_to_hashes: HashMap<Route, String>,
    real_hashes_to_buckets: HashMap<String, RestBucket>,
    gc_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl ManagerState {
    fn bucket_for(
        &mut self,
        real_hash: String,
        server_hash: &str,
        compiled_route: &CompiledRoute,
        max_rate_limit: Option<Duration>,
    ) -> RestBucket {
        match self.real_hashes_to_buckets.entry(real_hash) {
            Entry::Occupied(entry) => {
                tracing::trace!(target: "bucketeer::manager", route = %compiled_route, bucket = %entry.key(), "mapped to existing bucket");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                tracing::debug!(target: "bucketeer::manager", route = %compiled_route, bucket = %entry.key(), "mapped to new bucket");
                let kind =
                    if server_hash == UNKNOWN_HASH { BucketKind::Unknown } else { BucketKind::Known };
                let mut bucket =
                    RestBucket::new(entry.key().clone(), kind, Some(compiled_route.clone()));
                if let Some(max) = max_rate_limit {
                    bucket = bucket.with_max_rate_limit(max);
                }
                entry.insert(bucket).clone()
            }
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    config: BucketManagerConfig,
    state: Mutex<ManagerState>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("bucket manager state poisoned")
    }
}

/// Maps routes to buckets and garbage-collects idle ones. One per REST client; clones share it.
#[derive(Debug, Clone)]
pub struct BucketManager {
    inner: Arc<ManagerInner>,
}

impl Default for BucketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketManager {
    /// Create a manager with the default GC interval and expiry.
    pub fn new() -> Self {
        Self::with_config(BucketManagerConfig::default())
    }

    /// Create a manager from a validated config.
    pub fn with_config(config: BucketManagerConfig) -> Self {
        Self { inner: Arc::new(ManagerInner { config, state: Mutex::new(ManagerState::default()) }) }
    }

    /// Settings this manager was built with.
    pub fn config(&self) -> &BucketManagerConfig {
        &self.inner.config
    }

    /// Start the periodic garbage collector. Idempotent; does nothing once closed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.closed || state.gc_task.is_some() {
            return;
        }
        let task = tokio::spawn(gc_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.gc_interval,
            self.inner.config.expire_after,
        ));
        state.gc_task = Some(task);
    }

    /// Stop the garbage collector, close every bucket (cancelling their waiters) and forget all
    /// routes. Idempotent. The manager rejects every later acquisition.
    pub fn close(&self) {
        let buckets: Vec<RestBucket> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(task) = state.gc_task.take() {
                task.abort();
            }
            state.routes_to_hashes.clear();
            state.real_hashes_to_buckets.drain().map(|(_, bucket)| bucket).collect()
        };

        for bucket in &buckets {
            bucket.close();
        }
        tracing::debug!(target: "bucketeer::manager", buckets = buckets.len(), "bucket manager closed");
    }

    /// `true` while the garbage collector task is running.
    pub fn is_started(&self) -> bool {
        self.inner.lock().gc_task.is_some()
    }

    /// `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Acquire permission to send a request on `compiled_route`.
    ///
    /// The caller must await the returned future before sending. Routes that have never been
    /// answered are recorded under [`UNKNOWN_HASH`] and pass straight through.
    pub fn acquire(&self, compiled_route: &CompiledRoute) -> Acquire {
        let mut state = self.inner.lock();
        if state.closed {
            return Acquire::failed(RateLimitError::closed(MANAGER_NAME));
        }
        let server_hash = state
            .routes_to_hashes
            .entry(*compiled_route.route())
            .or_insert_with(|| UNKNOWN_HASH.to_string())
            .clone();
        let real_hash = compiled_route.create_real_bucket_hash(&server_hash);
        let bucket =
            state.bucket_for(real_hash, &server_hash, compiled_route, self.inner.config.max_rate_limit);
        // Still under the manager lock, so a concurrent GC pass cannot close the bucket first.
        bucket.acquire()
    }

    /// Record the rate limit headers of a response.
    ///
    /// `reset_after` is the time until the bucket's window resets, measured by the server. The
    /// route is (re)mapped to `bucket_header`; a bucket it previously used is left to drain and
    /// be garbage collected.
    pub fn update_rate_limits_after(
        &self,
        compiled_route: &CompiledRoute,
        bucket_header: &str,
        remaining: u32,
        limit: u32,
        reset_after: Duration,
    ) -> Result<(), RateLimitError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RateLimitError::closed(MANAGER_NAME));
        }
        let previous =
            state.routes_to_hashes.insert(*compiled_route.route(), bucket_header.to_string());
        if let Some(previous) = previous.filter(|hash| hash != bucket_header) {
            tracing::debug!(
                target: "bucketeer::manager",
                route = %compiled_route.route(),
                from = %previous,
                to = %bucket_header,
                "route remapped to a new bucket hash"
            );
        }
        let real_hash = compiled_route.create_real_bucket_hash(bucket_header);
        let bucket =
            state.bucket_for(real_hash, bucket_header, compiled_route, self.inner.config.max_rate_limit);

        tracing::trace!(
            target: "bucketeer::manager",
            bucket = %bucket.name(),
            remaining,
            limit,
            ?reset_after,
            "updating bucket"
        );
        // Written before the manager lock is released so GC never purges a freshly updated bucket.
        bucket.update_rate_limit(remaining, limit, Instant::now() + reset_after);
        drop(state);
        Ok(())
    }

    /// Record rate limit headers given as the response `Date` and the absolute reset time.
    ///
    /// The window length is `reset_at - date`, measured on the server's clock and replayed on
    /// the local monotonic clock, so clock skew between client and server does not matter.
    pub fn update_rate_limits(
        &self,
        compiled_route: &CompiledRoute,
        bucket_header: &str,
        remaining: u32,
        limit: u32,
        date: SystemTime,
        reset_at: SystemTime,
    ) -> Result<(), RateLimitError> {
        let reset_after = reset_at.duration_since(date).unwrap_or(Duration::ZERO);
        self.update_rate_limits_after(compiled_route, bucket_header, remaining, limit, reset_after)
    }

    /// Remove and close every bucket that has no waiters and whose window reset more than
    /// `expire_after` ago.
    pub fn do_gc_pass(&self, expire_after: Duration) -> Result<GcReport, RateLimitError> {
        let now = Instant::now();
        let (purged, report) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(RateLimitError::closed(MANAGER_NAME));
            }
            let total = state.real_hashes_to_buckets.len();
            let mut active = 0;
            let mut stale = Vec::new();
            for (real_hash, bucket) in &state.real_hashes_to_buckets {
                let reset_at = bucket.reset_at();
                if reset_at >= now {
                    active += 1;
                }
                if bucket.is_empty() && now > reset_at + expire_after {
                    stale.push(real_hash.clone());
                }
            }
            let purged: Vec<RestBucket> = stale
                .iter()
                .filter_map(|real_hash| state.real_hashes_to_buckets.remove(real_hash))
                .collect();
            let report = GcReport {
                purged: purged.len(),
                active,
                surviving: total.saturating_sub(active).saturating_sub(purged.len()),
            };
            (purged, report)
        };

        for bucket in &purged {
            bucket.close();
        }
        tracing::debug!(
            target: "bucketeer::manager",
            purged = report.purged,
            surviving = report.surviving,
            active = report.active,
            "garbage collection pass finished"
        );
        Ok(report)
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.inner.lock().real_hashes_to_buckets.len()
    }

    /// Look up a live bucket by real hash.
    pub fn bucket(&self, real_hash: &str) -> Option<RestBucket> {
        self.inner.lock().real_hashes_to_buckets.get(real_hash).cloned()
    }

    /// Current server bucket hash recorded for `route`.
    pub fn route_hash(&self, route: &Route) -> Option<String> {
        self.inner.lock().routes_to_hashes.get(route).cloned()
    }
}

async fn gc_loop(manager: Weak<ManagerInner>, gc_interval: Duration, expire_after: Duration) {
    tracing::debug!(target: "bucketeer::manager", ?gc_interval, ?expire_after, "rate limit garbage collector started");
    let mut ticker = tokio::time::interval_at(Instant::now() + gc_interval, gc_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = manager.upgrade() else {
            return;
        };
        let live = BucketManager { inner };
        match live.do_gc_pass(expire_after) {
            Ok(_) => {}
            Err(err) if err.is_closed() => return,
            Err(err) => {
                tracing::error!(target: "bucketeer::manager", error = %err, "ignoring garbage collection error for rate limits");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Method;
    use futures::FutureExt;
    use std::io;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    const GET_CHANNEL: Route = Route::new(Method::Get, "/channels/{channel}");
    const GET_GATEWAY: Route = Route::new(Method::Get, "/gateway/bot");

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn config_validation() {
        assert!(BucketManagerConfig::new(Duration::ZERO, Duration::ZERO).unwrap_err().is_configuration());
        let config = BucketManagerConfig::new(Duration::from_secs(1), Duration::ZERO)
            .unwrap()
            .with_max_rate_limit(Duration::from_secs(30))
            .unwrap();
        assert_eq!(config.max_rate_limit(), Some(Duration::from_secs(30)));
        assert!(BucketManagerConfig::default().with_max_rate_limit(Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_records_unknown_hash() {
        let manager = BucketManager::new();
        let route = GET_GATEWAY.compile([("unused", 0)]).unwrap();

        manager.acquire(&route).await.unwrap();
        assert_eq!(manager.route_hash(&GET_GATEWAY).as_deref(), Some(UNKNOWN_HASH));
        let bucket = manager.bucket("UNKNOWN;-").expect("placeholder bucket");
        assert!(bucket.is_unknown());
        assert_eq!(manager.bucket_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_creates_known_bucket_per_major_param() {
        let manager = BucketManager::new();
        let a = GET_CHANNEL.compile([("channel", 1)]).unwrap();
        let b = GET_CHANNEL.compile([("channel", 2)]).unwrap();

        manager.update_rate_limits_after(&a, "abc", 0, 1, Duration::from_secs(5)).unwrap();
        assert_eq!(manager.route_hash(&GET_CHANNEL).as_deref(), Some("abc"));

        let bucket = manager.bucket("abc;1").expect("bucket for channel 1");
        assert!(!bucket.is_unknown());
        assert_eq!(bucket.limit(), 1);

        // Same server bucket, different major parameter: independent window.
        assert!(manager.acquire(&b).is_immediate());
        assert!(!manager.acquire(&a).is_immediate());
        assert!(manager.bucket("abc;2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn date_headers_become_a_monotonic_period() {
        let manager = BucketManager::new();
        let route = GET_CHANNEL.compile([("channel", 7)]).unwrap();
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        manager
            .update_rate_limits(&route, "xyz", 3, 5, date, date + Duration::from_millis(2500))
            .unwrap();
        let bucket = manager.bucket("xyz;7").unwrap();
        assert_eq!(bucket.period(), Duration::from_millis(2500));
        assert_eq!(bucket.reset_at(), Instant::now() + Duration::from_millis(2500));
        assert_eq!(bucket.remaining(), 3);

        // A reset before the date collapses to an immediate reset instead of panicking.
        manager.update_rate_limits(&route, "xyz", 3, 5, date, date - Duration::from_secs(1)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn remap_orphans_old_bucket() {
        let manager = BucketManager::new();
        let route = GET_CHANNEL.compile([("channel", 1)]).unwrap();

        manager.update_rate_limits_after(&route, "old", 0, 1, Duration::from_secs(10)).unwrap();
        let waiter = manager.acquire(&route);
        assert!(!waiter.is_immediate());

        manager.update_rate_limits_after(&route, "new", 5, 5, Duration::from_secs(10)).unwrap();
        assert!(manager.acquire(&route).is_immediate());
        assert!(manager.bucket("old;1").is_some());

        // The orphaned waiter still drains under the old bucket's window.
        let start = Instant::now();
        waiter.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_purges_only_idle_expired_buckets() {
        let manager = BucketManager::new();
        let idle = GET_CHANNEL.compile([("channel", 1)]).unwrap();
        let busy = GET_CHANNEL.compile([("channel", 2)]).unwrap();
        let fresh = GET_CHANNEL.compile([("channel", 3)]).unwrap();

        manager.update_rate_limits_after(&idle, "abc", 1, 1, Duration::from_secs(1)).unwrap();
        manager.update_rate_limits_after(&busy, "abc", 1, 1, Duration::from_secs(1)).unwrap();
        let parked = manager.bucket("abc;2").unwrap().enqueue_without_throttle();

        tokio::time::advance(Duration::from_secs(5)).await;
        manager.update_rate_limits_after(&fresh, "abc", 1, 1, Duration::from_secs(60)).unwrap();

        let report = manager.do_gc_pass(Duration::from_secs(2)).unwrap();
        assert_eq!(report, GcReport { purged: 1, active: 1, surviving: 1 });
        assert!(manager.bucket("abc;1").is_none());
        assert!(manager.bucket("abc;2").is_some());
        assert!(manager.bucket("abc;3").is_some());

        // Not yet expired relative to a long grace period.
        tokio::time::advance(Duration::from_secs(100)).await;
        drop(parked);
        let report = manager.do_gc_pass(Duration::from_secs(3600)).unwrap();
        assert_eq!(report.purged, 0);

        let report = manager.do_gc_pass(Duration::ZERO).unwrap();
        assert_eq!(report.purged, 2);
        assert_eq!(manager.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_gc_runs_periodically() {
        let config = BucketManagerConfig::new(Duration::from_secs(1), Duration::ZERO).unwrap();
        let manager = BucketManager::with_config(config);
        manager.start();
        manager.start();
        assert!(manager.is_started());

        let route = GET_GATEWAY.compile([("x", 0)]).unwrap();
        manager.acquire(&route).await.unwrap();
        assert_eq!(manager.bucket_count(), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(manager.bucket_count(), 0);
        manager.close();
        assert!(!manager.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_waiters_and_clears_maps() {
        let manager = BucketManager::new();
        let route = GET_CHANNEL.compile([("channel", 1)]).unwrap();
        manager.update_rate_limits_after(&route, "abc", 0, 1, Duration::from_secs(30)).unwrap();
        let waiter = manager.acquire(&route);

        manager.close();
        manager.close();

        assert_eq!(waiter.now_or_never(), Some(Err(RateLimitError::closed("abc;1"))));
        assert_eq!(manager.bucket_count(), 0);
        assert_eq!(manager.route_hash(&GET_CHANNEL), None);
        assert!(manager.acquire(&route).await.unwrap_err().is_closed());
        assert!(manager.do_gc_pass(Duration::ZERO).unwrap_err().is_closed());
        assert!(manager
            .update_rate_limits_after(&route, "abc", 1, 1, Duration::from_secs(1))
            .unwrap_err()
            .is_closed());

        manager.start();
        assert!(!manager.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn close_logs_cancelled_waiters() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_max_level(tracing::Level::DEBUG)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let manager = BucketManager::new();
        let route = GET_CHANNEL.compile([("channel", 1)]).unwrap();
        manager.update_rate_limits_after(&route, "abc", 0, 1, Duration::from_secs(30)).unwrap();
        let _waiter = manager.acquire(&route);
        manager.close();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("rate limiter closed with pending acquisitions"), "logs: {logs}");
        assert!(logs.contains("bucketeer::manager"), "logs: {logs}");
    }
}
