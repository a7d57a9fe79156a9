//! Retry, pacing and circuit-breaker state for the source adapters.
//!
//! Each retry loop owns its own [`Backoff`]; nothing here is global, so two
//! clients for the same source can run side by side.

use crate::error::{BiblioError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget and delay growth for one kind of request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            factor: 2.0,
            max_delay: Duration::from_secs(120),
        }
    }

    /// Fresh backoff state for one request.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempt: 1,
            max_attempts: self.max_attempts.max(1),
            delay: self.initial_delay,
            factor: self.factor,
            max_delay: self.max_delay,
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 2 s then 4 s between them.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Attempt counter and current delay for a single retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
    factor: f64,
    max_delay: Duration,
}

impl Backoff {
    /// Attempt number currently in flight, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the next attempt, or `None` once the budget is spent.
    ///
    /// A server-provided `hint` wins when it is longer than the current delay.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let wait = hint.map_or(self.delay, |h| h.max(self.delay));
        self.attempt += 1;
        self.delay = self.delay.mul_f64(self.factor).min(self.max_delay);
        Some(wait)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// Only [`BiblioError::is_transient`] errors are retried. The last error is
/// returned on exhaustion so the caller can tell the two failure modes apart.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let hint = match &e {
                    BiblioError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
                    _ => None,
                };
                let attempt = backoff.attempt();
                match backoff.next_delay(hint) {
                    Some(wait) => {
                        warn!(
                            request = label,
                            attempt = attempt,
                            max_attempts = backoff.max_attempts(),
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "Transient failure, backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        warn!(request = label, attempts = attempt, error = %e, "Retry budget exhausted");
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Trips after `threshold` consecutive failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Count a failure; true when the breaker is now open.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.is_open()
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_open(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Randomized pause between requests to a scraping target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub const fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = (self.max.as_millis() as u64).max(min);
        let span = max - min;
        if span == 0 {
            return Duration::from_millis(min);
        }
        Duration::from_millis(min + rand::random::<u64>() % (span + 1))
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let mut backoff = RetryPolicy::default().backoff();
        assert_eq!(backoff.attempt(), 1);
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(2)));
        assert_eq!(backoff.attempt(), 2);
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(4)));
        assert_eq!(backoff.attempt(), 3);
        assert_eq!(backoff.next_delay(None), None);
    }

    #[test]
    fn test_backoff_honours_longer_hint() {
        let mut backoff = RetryPolicy::new(3, Duration::from_secs(2)).backoff();
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(10))),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            backoff.next_delay(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut backoff = RetryPolicy::new(1, Duration::from_millis(1)).backoff();
        assert_eq!(backoff.next_delay(None), None);
    }

    #[test]
    fn test_backoff_caps_delay() {
        let mut policy = RetryPolicy::new(5, Duration::from_secs(100));
        policy.max_delay = Duration::from_secs(150);
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(100)));
        assert_eq!(backoff.next_delay(None), Some(Duration::from_secs(150)));
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = retry_transient(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BiblioError::Timeout("test".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_exhausts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<()> = retry_transient(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BiblioError::RateLimited(0)) }
        })
        .await;
        assert!(matches!(result, Err(BiblioError::RateLimited(0))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<()> = retry_transient(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BiblioError::Api {
                    code: 401,
                    message: "unauthorized".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        breaker.record_success();
        assert_eq!(breaker.consecutive(), 0);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
    }

    #[test]
    fn test_delay_range_bounds() {
        let range = DelayRange::new(Duration::from_millis(300), Duration::from_millis(600));
        for _ in 0..100 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(600));
        }
        assert_eq!(DelayRange::none().sample(), Duration::ZERO);
    }
}
