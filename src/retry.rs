//! Vendor error classification and exponential-backoff retry.
//!
//! Vendor SDKs are opaque: classification is substring matching on the
//! lowercased error text, checked in a fixed order so that a message mentioning
//! both a permission problem and a timeout is treated as an auth failure.

// ============================================================================
// ERROR CLASSIFIER & RETRY
// ============================================================================

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ErrorClass, VendorError};
use crate::{
    DEFAULT_RETRY_BACKOFF_FACTOR, DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
    DEFAULT_RETRY_MAX_DELAY_MS,
};

// ----------------------------------------------------------------------------
// Classifier
// ----------------------------------------------------------------------------

const AUTH_PATTERNS: &[&str] = &[
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "incompletesignature",
    "invalidclienttokenid",
    "unrecognizedclient",
    "authfailure",
    "expiredtoken",
    "accessdenied",
    "access denied",
    "forbidden",
    "unauthorized",
    "no permission",
    "not authorized",
];

const LIMIT_PATTERNS: &[&str] = &[
    "throttl",
    "rate limit",
    "ratelimit",
    "rate exceeded",
    "toomanyrequests",
    "too many requests",
    "requestlimitexceeded",
    "flow control",
    "qps limit",
    "status 429",
];

const REGION_SKIP_PATTERNS: &[&str] = &[
    "invalidregion",
    "unsupportedregion",
    "region not supported",
    "not supported in region",
    "optinrequired",
    "unsupportedoperation",
    "unknownendpoint",
    "endpoint not found",
    "service not open",
    "notopen",
];

const NETWORK_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "no such host",
    "dns error",
    "unexpected eof",
    "tls handshake",
    "temporarily unavailable",
    "serviceunavailable",
    "network is unreachable",
];

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Map an opaque vendor error message to the error taxonomy.
pub fn classify_message(message: &str) -> ErrorClass {
    let text = message.to_lowercase();
    if matches_any(&text, AUTH_PATTERNS) {
        ErrorClass::Auth
    } else if matches_any(&text, LIMIT_PATTERNS) {
        ErrorClass::Limit
    } else if matches_any(&text, REGION_SKIP_PATTERNS) {
        ErrorClass::RegionSkip
    } else if matches_any(&text, NETWORK_PATTERNS) {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    }
}

pub fn classify_error(err: &VendorError) -> ErrorClass {
    classify_message(&err.text())
}

// ----------------------------------------------------------------------------
// Retry Predicates
// ----------------------------------------------------------------------------

/// Which error classes warrant another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Throttled API calls
    LimitOrNetwork,
    /// Calls with their own fallback, where throttling must propagate immediately
    NetworkOnly,
}

impl RetryOn {
    pub fn allows(&self, class: ErrorClass) -> bool {
        match self {
            RetryOn::LimitOrNetwork => matches!(class, ErrorClass::Limit | ErrorClass::Network),
            RetryOn::NetworkOnly => class == ErrorClass::Network,
        }
    }
}

pub fn retry_on_limit_or_network(class: ErrorClass) -> bool {
    RetryOn::LimitOrNetwork.allows(class)
}

pub fn retry_on_network_only(class: ErrorClass) -> bool {
    RetryOn::NetworkOnly.allows(class)
}

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failure of attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        // Overflow to infinity lands on the cap
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Total attempts including the first
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }
}

/// Run `op` until it succeeds, `should_retry` rejects its error, or the
/// policy's attempts are used up. Returns the last error on failure.
pub async fn retry_with_backoff<T, E, F, Fut, P>(policy: &RetryPolicy, mut op: F, should_retry: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let total = policy.total_attempts();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 >= total || !should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(target: "exporter::retry", attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`retry_with_backoff`] for vendor calls, using the classifier and a predicate.
pub async fn retry_vendor<T, F, Fut>(
    policy: &RetryPolicy,
    retry_on: RetryOn,
    classify: impl Fn(&VendorError) -> ErrorClass,
    op: F,
) -> Result<T, VendorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VendorError>>,
{
    retry_with_backoff(policy, op, |err| retry_on.allows(classify(err))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[rstest]
    #[case("InvalidAccessKeyId.NotFound: Specified access key is not found", ErrorClass::Auth)]
    #[case("Forbidden.RAM: User not authorized to operate", ErrorClass::Auth)]
    #[case("Throttling.User: Request was denied due to user flow control", ErrorClass::Limit)]
    #[case("ThrottlingException: Rate exceeded", ErrorClass::Limit)]
    #[case("InvalidRegionId: The specified region does not exist", ErrorClass::RegionSkip)]
    #[case("OptInRequired: You are not subscribed to this service", ErrorClass::RegionSkip)]
    #[case("dial tcp 10.0.0.1:443: i/o timeout", ErrorClass::Network)]
    #[case("read: connection reset by peer", ErrorClass::Network)]
    #[case("InternalError: something odd", ErrorClass::Unknown)]
    #[case("", ErrorClass::Unknown)]
    fn test_classify_message(#[case] message: &str, #[case] expected: ErrorClass) {
        assert_eq!(classify_message(message), expected);
    }

    #[test]
    fn test_auth_wins_over_network() {
        assert_eq!(classify_message("AccessDenied after connection timeout"), ErrorClass::Auth);
    }

    #[test]
    fn test_predicates_never_retry_permanent_classes() {
        for class in [ErrorClass::Auth, ErrorClass::RegionSkip] {
            assert!(!retry_on_limit_or_network(class));
            assert!(!retry_on_network_only(class));
        }
        assert!(retry_on_limit_or_network(ErrorClass::Limit));
        assert!(!retry_on_network_only(ErrorClass::Limit));
        assert!(retry_on_network_only(ErrorClass::Network));
        assert!(!retry_on_limit_or_network(ErrorClass::Unknown));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3200));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_keeps_sub_millisecond_precision() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(3),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(1),
        };
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_nanos(4_499_000), "{delay:?}");
        assert!(delay <= Duration::from_nanos(4_501_000), "{delay:?}");

        let huge = RetryPolicy {
            backoff_factor: 1e300,
            ..policy
        };
        assert_eq!(huge.delay_for(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, VendorError> = retry_vendor(&fast_policy(5), RetryOn::LimitOrNetwork, classify_error, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 3 {
                    Err(VendorError::new("Throttling"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), VendorError> = retry_vendor(&fast_policy(5), RetryOn::LimitOrNetwork, classify_error, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VendorError::new("InvalidAccessKeyId"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), VendorError> = retry_vendor(&fast_policy(3), RetryOn::NetworkOnly, classify_error, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VendorError::new("connection refused"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_backoff_elapsed_time() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let result: Result<&str, VendorError> = retry_vendor(&policy, RetryOn::LimitOrNetwork, classify_error, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(VendorError::new("limit_error: Throttling"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(20 + 40));
    }
}
