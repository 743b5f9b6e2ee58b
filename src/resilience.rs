//! Timeout and exponential-backoff retry around completion calls.
//!
//! [`ResiliencePolicy`] bounds each attempt with a timeout and spaces retries
//! with `min(base_delay * 2^attempt, max_delay)`. [`with_resilience`] drives an
//! arbitrary async operation under a policy, racing every attempt and every
//! backoff sleep against an optional [`CancelSignal`].

use crate::cancel::CancelSignal;
use crate::error::{GenerationError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry and timeout policy for one completion call.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use webgen_pipeline::resilience::{JitterStrategy, ResiliencePolicy};
///
/// let policy = ResiliencePolicy::standard().with_jitter(JitterStrategy::None);
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay, including `Retry-After`.
    pub max_delay: Duration,

    /// Per-attempt timeout.
    pub timeout: Duration,

    pub jitter: JitterStrategy,

    /// Use a provider's `Retry-After` in place of the computed delay.
    pub respect_retry_after: bool,
}

/// Jitter applied to the computed delay.
///
/// Jitter only ever shortens a delay, so the exponential bound stays an upper
/// limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    #[default]
    None,

    /// Random value in `[0, calculated_delay]`.
    Full,

    /// `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

impl ResiliencePolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// 3 retries, 1s base, 30s cap, 60s per-attempt timeout.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            jitter: JitterStrategy::None,
            respect_retry_after: true,
        }
    }

    /// Build from the millisecond knobs used in configuration files.
    pub fn from_millis(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, timeout_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            timeout: Duration::from_millis(timeout_ms),
            ..Self::standard()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Calculated delay for retry `attempt` (0-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay for retry `attempt` (0-indexed) with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_for_attempt(attempt);
        match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => capped.mul_f64(fastrand::f64()),
            JitterStrategy::Equal => capped / 2 + (capped / 2).mul_f64(fastrand::f64()),
        }
    }

    /// Upper bound on total sleep across all retries.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|i| self.base_delay_for_attempt(i))
            .sum()
    }

    fn delay_after(&self, attempt: u32, err: &GenerationError) -> Duration {
        if self.respect_retry_after {
            if let GenerationError::Provider {
                retry_after: Some(after),
                ..
            } = err
            {
                return (*after).min(self.max_delay);
            }
        }
        self.delay_for_attempt(attempt)
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Called before each retry with `(retry_number, delay, error)`.
///
/// `retry_number` starts at 1.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &GenerationError) + Send)>;

/// Run `operation` under `policy`.
///
/// `operation` receives the 0-indexed attempt number and is called once per
/// attempt. Each attempt is bounded by `policy.timeout`; a timeout counts as a
/// retryable failure. Non-retryable errors propagate immediately. Once retries
/// are used up the last error is returned inside
/// [`GenerationError::RetriesExhausted`].
///
/// When `cancel` fires, the in-flight attempt or backoff sleep is dropped and
/// `Cancelled` is returned.
pub async fn with_resilience<T, F, Fut>(
    policy: &ResiliencePolicy,
    cancel: Option<&CancelSignal>,
    mut on_retry: RetryCallback<'_>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if let Some(signal) = cancel {
            signal.check()?;
        }

        let timeout = policy.timeout;
        let call = operation(attempt);
        let bounded = async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(timeout)),
            }
        };

        let err = match until_cancelled(cancel, bounded).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if err.is_cancelled() || !err.is_retryable() {
            debug!(attempt, error = %err, "Not retrying");
            return Err(err);
        }
        if attempt >= policy.max_retries {
            return Err(GenerationError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_after(attempt, &err);
        warn!(
            retry = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying completion"
        );
        if let Some(ref mut cb) = on_retry {
            cb(attempt + 1, delay, &err);
        }

        until_cancelled(cancel, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;

        attempt += 1;
    }
}

async fn until_cancelled<T>(
    cancel: Option<&CancelSignal>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(signal) => {
            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(GenerationError::Cancelled),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> ResiliencePolicy {
        ResiliencePolicy::none()
            .with_max_retries(max_retries)
            .with_delays(Duration::from_millis(100), Duration::from_millis(400))
            .with_timeout(Duration::from_secs(5))
    }

    fn provider_error() -> GenerationError {
        GenerationError::Provider {
            status: Some(503),
            message: "overloaded".into(),
            retry_after: None,
        }
    }

    #[test]
    fn test_delay_exponential_and_capped() {
        let policy = fast(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(400));
    }

    #[test]
    fn test_full_jitter_stays_under_bound() {
        let policy = fast(3).with_jitter(JitterStrategy::Full);
        for _ in 0..100 {
            assert!(policy.delay_for_attempt(1) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_max_total_delay() {
        assert_eq!(fast(3).max_total_delay(), Duration::from_millis(700));
        assert_eq!(fast(0).max_total_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let mut on_retry = |n: u32, _: Duration, _: &GenerationError| retries.push(n);

        let result = with_resilience(&fast(3), None, Some(&mut on_retry), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(provider_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_resilience::<(), _, _>(&fast(3), None, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GenerationError::Auth("invalid key".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_exhausted() {
        let policy = fast(1).with_timeout(Duration::from_millis(50));
        let err = with_resilience::<(), _, _>(&policy, None, None, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        match err {
            GenerationError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, GenerationError::Timeout(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_capped() {
        let mut delays = Vec::new();
        let mut on_retry = |_: u32, d: Duration, _: &GenerationError| delays.push(d);
        let calls = AtomicU32::new(0);

        let _ = with_resilience(&fast(1), None, Some(&mut on_retry), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(GenerationError::Provider {
                        status: Some(429),
                        message: "slow down".into(),
                        retry_after: Some(Duration::from_secs(120)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(delays, vec![Duration::from_millis(400)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_ignored_when_disabled() {
        let mut delays = Vec::new();
        let mut on_retry = |_: u32, d: Duration, _: &GenerationError| delays.push(d);
        let calls = AtomicU32::new(0);
        let policy = fast(1).with_retry_after(false);

        let _ = with_resilience(&policy, None, Some(&mut on_retry), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(GenerationError::Provider {
                        status: Some(503),
                        message: "busy".into(),
                        retry_after: Some(Duration::from_secs(120)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(delays, vec![Duration::from_millis(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let signal = CancelSignal::new();
        let policy = fast(3).with_delays(Duration::from_secs(30), Duration::from_secs(30));
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = with_resilience::<(), _, _>(&policy, Some(&signal), None, |_| async {
            Err(GenerationError::Transport("refused".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_attempt() {
        let signal = CancelSignal::new();
        let finished = Arc::new(AtomicU32::new(0));
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let flag = Arc::clone(&finished);
        let err = with_resilience::<(), _, _>(&fast(0), Some(&signal), None, move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_always_failing_makes_max_retries_plus_one_attempts(
            max_retries in 0u32..6,
            base_ms in 1u64..500,
            cap_factor in 1u64..8,
        ) {
            let policy = ResiliencePolicy::none()
                .with_max_retries(max_retries)
                .with_delays(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(base_ms * cap_factor),
                );
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let calls = AtomicU32::new(0);
            let (err, elapsed) = rt.block_on(async {
                let start = tokio::time::Instant::now();
                let err = with_resilience::<(), _, _>(&policy, None, None, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(GenerationError::Transport("down".into())) }
                })
                .await
                .unwrap_err();
                (err, start.elapsed())
            });

            prop_assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
            let is_exhausted = matches!(err, GenerationError::RetriesExhausted { .. });
            prop_assert!(is_exhausted);
            // Timer resolution is 1ms; allow one tick per sleep.
            let slack = Duration::from_millis(u64::from(max_retries));
            prop_assert!(elapsed <= policy.max_total_delay() + slack);
        }
    }
}
