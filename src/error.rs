//! Error types for rate limiting, route compilation and backoff.
use std::time::Duration;

/// Unified error type for the rate limiting core.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The limiter, bucket or manager was closed before (or while) permission was pending.
    #[error("rate limiter '{name}' is closed")]
    Closed {
        /// Name of the closed limiter.
        name: String,
    },
    /// A route was compiled without a value for one of its placeholders.
    #[error("route '{route}' is missing a value for '{{{param}}}'")]
    MissingParameter {
        /// Template of the route being compiled.
        route: String,
        /// Placeholder that had no value.
        param: String,
    },
    /// A route template could not be parsed.
    #[error("malformed route template '{template}': {reason}")]
    MalformedTemplate {
        /// Offending template.
        template: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// A constructor argument was out of range.
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        /// Name of the argument.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// The backoff would exceed its maximum; the caller should stop retrying.
    #[error("backoff exhausted at increment {increment} (maximum {maximum}s)")]
    BackoffExhausted {
        /// Increment that produced the out-of-range value.
        increment: u32,
        /// Configured maximum in seconds.
        maximum: f64,
    },
    /// The wait for a bucket is longer than the configured `max_rate_limit`.
    #[error("rate limit on '{route}' resets in {retry_after:?}, longer than the allowed {max_rate_limit:?}")]
    RateLimitTooLong {
        /// Route that was being acquired.
        route: String,
        /// How long the caller would have had to wait.
        retry_after: Duration,
        /// Configured ceiling.
        max_rate_limit: Duration,
    },
}

impl RateLimitError {
    pub(crate) fn closed(name: impl Into<String>) -> Self {
        Self::Closed { name: name.into() }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field, reason: reason.into() }
    }

    /// Check if this error is a cancellation caused by `close()`.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Check if this error comes from invalid construction arguments or route templates.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. } | Self::MalformedTemplate { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Check if this error signals that a backoff ran out.
    pub fn is_backoff_exhausted(&self) -> bool {
        matches!(self, Self::BackoffExhausted { .. })
    }

    /// Check if this error was raised because the wait exceeded `max_rate_limit`.
    pub fn is_rate_limit_too_long(&self) -> bool {
        matches!(self, Self::RateLimitTooLong { .. })
    }
}

/// Error returned by [`RateLimitService`](crate::middleware::RateLimitService).
#[derive(thiserror::Error, Debug)]
pub enum LayerError<E> {
    /// Permission to send was never granted.
    #[error("rate limit: {0}")]
    RateLimit(#[from] RateLimitError),
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> LayerError<E> {
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimit(_) => None,
        }
    }

    /// Borrow the rate limit error if present.
    pub fn as_rate_limit(&self) -> Option<&RateLimitError> {
        match self {
            Self::RateLimit(e) => Some(e),
            Self::Inner(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_error_display() {
        let err = RateLimitError::closed("global");
        assert_eq!(err.to_string(), "rate limiter 'global' is closed");
        assert!(err.is_closed());
        assert!(!err.is_configuration());
    }

    #[test]
    fn missing_parameter_display_shows_placeholder() {
        let err = RateLimitError::MissingParameter {
            route: "/channels/{channel}".into(),
            param: "channel".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("{channel}"));
        assert!(err.is_configuration());
    }

    #[test]
    fn predicates_cover_all_variants() {
        assert!(RateLimitError::invalid("limit", "must be > 0").is_configuration());
        assert!(RateLimitError::MalformedTemplate { template: "{".into(), reason: "unclosed" }
            .is_configuration());
        let exhausted = RateLimitError::BackoffExhausted { increment: 6, maximum: 64.0 };
        assert!(exhausted.is_backoff_exhausted());
        assert!(!exhausted.is_closed());
        let too_long = RateLimitError::RateLimitTooLong {
            route: "GET /x".into(),
            retry_after: Duration::from_secs(60),
            max_rate_limit: Duration::from_secs(5),
        };
        assert!(too_long.is_rate_limit_too_long());
        assert!(too_long.to_string().contains("GET /x"));
    }

    #[test]
    fn layer_error_accessors() {
        let err: LayerError<std::io::Error> = RateLimitError::closed("bucket").into();
        assert!(err.as_rate_limit().is_some_and(RateLimitError::is_closed));
        assert!(err.into_inner().is_none());

        let inner = LayerError::Inner(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(inner.as_rate_limit().is_none());
        assert_eq!(inner.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }
}
