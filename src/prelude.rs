//! Convenient re-exports for common bucketeer types.
pub use crate::{
    backoff::ExponentialBackOff,
    bucket::{BucketKind, RestBucket},
    global::{GlobalLimiter, GlobalState},
    limiter::{Acquire, BurstRateLimiter},
    manager::{BucketManager, BucketManagerConfig, GcReport},
    middleware::{RateLimitLayer, Routed},
    route::{CompiledRoute, Method, Route},
    window::WindowedBurstRateLimiter,
    LayerError, RateLimitError,
};
