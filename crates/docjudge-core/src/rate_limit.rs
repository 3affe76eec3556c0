//! Request pacing and 429 handling for the LLM oracle.
//!
//! [`AdaptiveLimiter::call`] is the only way a chat request reaches the
//! network: it waits for a governor permit, and when the server answers 429
//! it slows every caller down, sleeps per [`RetryPolicy`] and retries exactly
//! once. A second 429 is returned to the caller as
//! [`OracleError::RateLimited`]. The base rate comes back after a minute
//! without throttling.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::OracleError;

type Governor = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const MAX_SLOWDOWN: u32 = 16;
const QUIET_PERIOD: Duration = Duration::from_secs(60);
/// Wait used for a Retry-After given as an HTTP date.
const HTTP_DATE_WAIT: Duration = Duration::from_secs(5);

fn governor(period: Duration) -> Arc<Governor> {
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
    Arc::new(Governor::direct(quota))
}

/// How long to back off before the single retry after a 429.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Used when the server sends no Retry-After.
    pub default_wait: Duration,
    /// Upper bound on the server-requested wait.
    pub max_wait: Duration,
    /// Random extra delay in `[0, jitter)` so workers do not retry in lockstep.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Default waits, never sleeping longer than `max_wait` before jitter.
    pub fn capped_at(max_wait: Duration) -> Self {
        Self {
            max_wait,
            ..Self::default()
        }
    }

    pub fn wait_for(&self, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or(self.default_wait).min(self.max_wait);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(fastrand::u64(0..jitter_ms))
        }
    }
}

/// Shared pacing for every LLM request of a run.
///
/// The live governor sits behind an [`ArcSwap`] so a 429 can install a slower
/// one without blocking callers already waiting on the old one.
pub struct AdaptiveLimiter {
    governor: ArcSwap<Governor>,
    base_period: Duration,
    /// 1 at the configured rate, doubling per 429 up to [`MAX_SLOWDOWN`].
    slowdown: AtomicU32,
    throttled_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("base_period", &self.base_period)
            .field("slowdown", &self.slowdown())
            .finish()
    }
}

impl AdaptiveLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            governor: ArcSwap::new(governor(period)),
            base_period: period,
            slowdown: AtomicU32::new(1),
            throttled_at: Mutex::new(None),
        }
    }

    /// Allow `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        Self::new(Duration::from_millis(1000 / n.max(1) as u64))
    }

    pub fn slowdown(&self) -> u32 {
        self.slowdown.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self) {
        self.restore_if_quiet();
        self.governor.load().until_ready().await;
    }

    /// Run one request under the limiter, retrying once if it is throttled.
    pub async fn call<T, F, Fut>(&self, policy: &RetryPolicy, mut request: F) -> Result<T, OracleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OracleError>>,
    {
        self.acquire().await;
        match request().await {
            Err(OracleError::RateLimited { retry_after }) => {
                self.slow_down();
                let wait = policy.wait_for(retry_after);
                tracing::info!(
                    wait_secs = wait.as_secs_f64(),
                    slowdown = self.slowdown(),
                    "LLM rate limited, retrying once"
                );
                tokio::time::sleep(wait).await;
                self.acquire().await;
                request().await
            }
            other => other,
        }
    }

    /// Halve the permitted rate.
    pub fn slow_down(&self) {
        if let Ok(mut at) = self.throttled_at.lock() {
            *at = Some(Instant::now());
        }
        let previous = self
            .slowdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_SLOWDOWN))
            })
            .unwrap_or(MAX_SLOWDOWN);
        let slowdown = (previous * 2).min(MAX_SLOWDOWN);
        if let Some(period) = self.base_period.checked_mul(slowdown) {
            self.governor.store(governor(period));
        }
    }

    fn restore_if_quiet(&self) {
        if self.slowdown() == 1 {
            return;
        }
        let quiet = self
            .throttled_at
            .lock()
            .ok()
            .and_then(|at| at.map(|t| t.elapsed() >= QUIET_PERIOD))
            .unwrap_or(false);
        if quiet {
            self.slowdown.store(1, Ordering::SeqCst);
            self.governor.store(governor(self.base_period));
            tracing::debug!("LLM rate limiter back to base rate");
        }
    }
}

/// The error for a 429 answer, or `None` for any other status.
pub fn throttle_error(status: StatusCode, headers: &HeaderMap) -> Option<OracleError> {
    (status == StatusCode::TOO_MANY_REQUESTS).then(|| OracleError::RateLimited {
        retry_after: headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after),
    })
}

/// Retry-After as delta-seconds; an HTTP date maps to a fixed short wait.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value.ends_with("GMT").then_some(HTTP_DATE_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_forms() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(HTTP_DATE_WAIT)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn only_429_is_a_throttle() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("10"));
        assert!(throttle_error(StatusCode::OK, &headers).is_none());
        assert!(throttle_error(StatusCode::SERVICE_UNAVAILABLE, &headers).is_none());
        match throttle_error(StatusCode::TOO_MANY_REQUESTS, &headers) {
            Some(OracleError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(10)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn wait_is_capped_then_jittered() {
        let policy = RetryPolicy::capped_at(Duration::from_secs(10));
        let capped = policy.wait_for(Some(Duration::from_secs(60)));
        assert!(capped >= Duration::from_secs(10));
        assert!(capped < Duration::from_millis(10_500));

        let default = policy.wait_for(None);
        assert!(default >= Duration::from_secs(2));
        assert!(default < Duration::from_millis(2_500));

        let exact = RetryPolicy {
            jitter: Duration::ZERO,
            ..policy
        };
        assert_eq!(exact.wait_for(Some(Duration::from_secs(3))), Duration::from_secs(3));
    }

    #[test]
    fn slowdown_doubles_and_caps() {
        let limiter = AdaptiveLimiter::per_second(10);
        assert_eq!(limiter.slowdown(), 1);
        limiter.slow_down();
        assert_eq!(limiter.slowdown(), 2);
        for _ in 0..10 {
            limiter.slow_down();
        }
        assert_eq!(limiter.slowdown(), MAX_SLOWDOWN);
    }

    #[tokio::test]
    async fn base_rate_returns_after_quiet_period() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.slow_down();
        limiter.slow_down();
        *limiter.throttled_at.lock().unwrap() = Some(Instant::now() - Duration::from_secs(61));
        limiter.acquire().await;
        assert_eq!(limiter.slowdown(), 1);
    }

    fn throttled() -> OracleError {
        OracleError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_request_is_retried_once() {
        let limiter = AdaptiveLimiter::per_second(1000);
        let calls = AtomicU32::new(0);

        let result = limiter
            .call(&RetryPolicy::default(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err(throttled()) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.slowdown(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_throttle_is_returned() {
        let limiter = AdaptiveLimiter::per_second(1000);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .call(&RetryPolicy::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(throttled()) }
            })
            .await;

        assert!(matches!(result, Err(OracleError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let limiter = AdaptiveLimiter::per_second(1000);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .call(&RetryPolicy::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OracleError::Http("reset".into())) }
            })
            .await;

        assert!(matches!(result, Err(OracleError::Http(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.slowdown(), 1);
    }
}
