//! Retry classification and backoff delays
//!
//! The [`RequestExecutor`](crate::executor::RequestExecutor) owns the retry
//! loop itself (each attempt must report to the proxy registry and rate
//! limiter), so this module only carries the pieces the loop is built from:
//! the [`IsRetryable`] classification trait and the delay helpers.

use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, remote throttling, garbage bodies
/// from an overloaded upstream) should return `true`. Permanent failures
/// (record does not exist, bad configuration) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Anything the network or the remote end did wrong is worth another attempt
            Error::Network(_) => true,
            Error::RateLimited { .. } => true,
            Error::MalformedResponse { .. } => true,
            Error::UnexpectedStatus { .. } => true,
            // 404 means the record does not exist; retrying cannot change that
            Error::NotFound { .. } => false,
            // Pool exhaustion is handled at the registry level, not per attempt
            Error::PoolExhausted => false,
            Error::Config { .. } => false,
            Error::Io(_) => false,
            Error::Serialization(_) => false,
            Error::Interrupted => false,
        }
    }
}

/// Delay before retry number `retry` (1-based), scaled linearly
///
/// Matches the upstream API's observed tolerance better than exponential
/// growth at this call volume: 2s, 4s, 6s, ... for the default base.
pub fn attempt_delay(initial: Duration, retry: u32) -> Duration {
    initial.saturating_mul(retry.max(1))
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies in `[delay, 2 * delay]`.
pub fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let err = Error::RateLimited {
            url: "https://api.example.com/records/1".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn malformed_response_is_retryable() {
        let err = Error::MalformedResponse {
            url: "https://api.example.com/records/1".into(),
            diagnostic: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn unexpected_status_is_retryable() {
        let err = Error::UnexpectedStatus {
            status: 503,
            url: "https://api.example.com/records/1".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_terminal() {
        let err = Error::NotFound {
            url: "https://api.example.com/records/1".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn config_and_pool_errors_are_terminal() {
        assert!(
            !Error::Config {
                message: "bad".into(),
                key: None,
            }
            .is_retryable()
        );
        assert!(!Error::PoolExhausted.is_retryable());
        assert!(!Error::Interrupted.is_retryable());
    }

    #[test]
    fn attempt_delay_grows_linearly() {
        let base = Duration::from_secs(2);
        assert_eq!(attempt_delay(base, 1), Duration::from_secs(2));
        assert_eq!(attempt_delay(base, 2), Duration::from_secs(4));
        assert_eq!(attempt_delay(base, 3), Duration::from_secs(6));
    }

    #[test]
    fn attempt_delay_treats_zero_as_first_retry() {
        let base = Duration::from_secs(2);
        assert_eq!(attempt_delay(base, 0), base);
    }

    #[test]
    fn add_jitter_stays_within_bounds_over_many_iterations() {
        let delay = Duration::from_millis(50);
        for i in 0..200 {
            let jittered = add_jitter(delay);
            assert!(
                jittered >= delay,
                "iteration {i}: jittered {jittered:?} < base delay {delay:?}"
            );
            assert!(
                jittered <= delay * 2,
                "iteration {i}: jittered {jittered:?} > 2x base delay"
            );
        }
    }

    #[test]
    fn add_jitter_on_zero_delay_returns_zero() {
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }
}
