//! Tower adapter that gates requests on the global limiter and the route's bucket.
//!
//! ```rust
//! use bucketeer::{BucketManager, CompiledRoute, GlobalLimiter, Method, RateLimitLayer, Route};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! const GET_USER: Route = Route::new(Method::Get, "/users/{user}");
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let layer = RateLimitLayer::new(GlobalLimiter::new(), BucketManager::new());
//! let svc = layer.layer(service_fn(|route: CompiledRoute| async move {
//!     Ok::<_, std::convert::Infallible>(route.compiled_path().to_string())
//! }));
//!
//! let route = GET_USER.compile([("user", 1)]).unwrap();
//! assert_eq!(svc.oneshot(route).await.unwrap(), "/users/1");
//! # });
//! ```

use crate::global::GlobalLimiter;
use crate::limiter::BurstRateLimiter;
use crate::manager::BucketManager;
use crate::route::CompiledRoute;
use crate::LayerError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A request that targets a compiled route.
pub trait Routed {
    fn compiled_route(&self) -> &CompiledRoute;
}

impl Routed for CompiledRoute {
    fn compiled_route(&self) -> &CompiledRoute {
        self
    }
}

/// Layer that waits for the [`GlobalLimiter`], then the route's bucket in the
/// [`BucketManager`], before calling the inner service.
///
/// It only gates requests. Reporting response headers back through
/// [`BucketManager::update_rate_limits`] and calling [`GlobalLimiter::throttle`] stays with the
/// inner service, which can hold clones of both.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    global: GlobalLimiter,
    buckets: BucketManager,
}

impl RateLimitLayer {
    pub fn new(global: GlobalLimiter, buckets: BucketManager) -> Self {
        Self { global, buckets }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, global: self.global.clone(), buckets: self.buckets.clone() }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    global: GlobalLimiter,
    buckets: BucketManager,
}

impl<S, Req> Service<Req> for RateLimitService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    Req: Routed + Send + 'static,
{
    type Response = S::Response;
    type Error = LayerError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LayerError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let mut inner = self.inner.clone();
        // The global queue position is taken at call time; the bucket is only entered once the
        // global gate has opened.
        let global = self.global.acquire();
        let buckets = self.buckets.clone();

        Box::pin(async move {
            global.await?;
            let bucket = buckets.acquire(req.compiled_route());
            bucket.await?;
            inner.call(req).await.map_err(LayerError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Method, Route};
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::time::Instant;
    use tower::{service_fn, ServiceExt};

    const GET_CHANNEL: Route = Route::new(Method::Get, "/channels/{channel}");

    async fn echo(route: CompiledRoute) -> Result<String, Infallible> {
        Ok(route.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn passes_through_when_unlimited() {
        let layer = RateLimitLayer::new(GlobalLimiter::new(), BucketManager::new());
        let svc = layer.layer(service_fn(echo));
        let route = GET_CHANNEL.compile([("channel", 5)]).unwrap();
        assert_eq!(svc.oneshot(route).await.unwrap(), "GET /channels/5");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_global_throttle() {
        let global = GlobalLimiter::new();
        let layer = RateLimitLayer::new(global.clone(), BucketManager::new());
        let svc = layer.layer(service_fn(echo));

        global.throttle(Duration::from_millis(300)).unwrap();
        let start = Instant::now();
        let route = GET_CHANNEL.compile([("channel", 5)]).unwrap();
        svc.oneshot(route).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_manager_surfaces_rate_limit_error() {
        let buckets = BucketManager::new();
        let layer = RateLimitLayer::new(GlobalLimiter::new(), buckets.clone());
        let svc = layer.layer(service_fn(echo));
        buckets.close();

        let route = GET_CHANNEL.compile([("channel", 5)]).unwrap();
        let err = svc.oneshot(route).await.unwrap_err();
        assert!(err.as_rate_limit().is_some_and(|e| e.is_closed()));
    }
}
