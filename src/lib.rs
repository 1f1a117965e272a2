#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketeer
//!
//! Client-side rate limiting for bucket-based REST APIs.
//!
//! The server groups endpoints into *buckets* and reports each bucket's budget in response
//! headers. This crate keeps one fixed-window limiter per bucket and major parameter, queues
//! callers in FIFO order once a window is spent, and releases them as windows roll over. A
//! separate global gate handles service-wide limits.
//!
//! ## Features
//!
//! - **Routes** with `{placeholder}` templates and major-parameter extraction
//! - **Windowed burst limiters** with a background throttle task per exhausted bucket
//! - **Bucket manager** mapping routes to buckets as headers arrive, with periodic garbage collection
//! - **Global limiter** for service-wide retry-after signals
//! - **Exponential backoff** generator for retry and reconnect loops
//! - **Tower layer** composing both gates in front of an HTTP service
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketeer::{BucketManager, GlobalLimiter, Method, Route};
//! use bucketeer::BurstRateLimiter;
//! use std::time::Duration;
//!
//! const GET_MESSAGES: Route = Route::new(Method::Get, "/channels/{channel}/messages");
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bucketeer::RateLimitError> {
//!     let global = GlobalLimiter::new();
//!     let buckets = BucketManager::new();
//!     buckets.start();
//!
//!     let route = GET_MESSAGES.compile([("channel", 123)])?;
//!     global.acquire().await?;
//!     buckets.acquire(&route).await?;
//!
//!     // Send the request, then feed the rate limit headers back.
//!     buckets.update_rate_limits_after(&route, "a1b2c3", 4, 5, Duration::from_millis(1500))?;
//!
//!     buckets.close();
//!     global.close();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod error;
pub mod global;
pub mod limiter;
pub mod manager;
pub mod middleware;
pub mod prelude;
pub mod route;
pub mod window;

// Re-exports
pub use backoff::ExponentialBackOff;
pub use bucket::{BucketKind, RestBucket};
pub use error::{LayerError, RateLimitError};
pub use global::{GlobalLimiter, GlobalState};
pub use limiter::{Acquire, BurstRateLimiter};
pub use manager::{BucketManager, BucketManagerConfig, GcReport, UNKNOWN_HASH};
pub use middleware::{RateLimitLayer, RateLimitService, Routed};
pub use route::{CompiledRoute, Method, Route};
pub use window::WindowedBurstRateLimiter;
