// src/provider/retry.rs — Timeouts and retry with exponential backoff for collaborator calls
//
// Every call gets its own timeout. Retries: rate limits, server errors, timeouts,
// dropped connections. Does NOT retry: auth errors, rejected requests, malformed replies.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::infra::config::{RetryConfig, TimeoutConfig};
use crate::infra::errors::ServiceError;

const BACKOFF_FACTOR: f64 = 2.0;
const RATE_LIMIT_BUFFER_MS: u64 = 100;

/// Per-call jitter salt, so a batch failing together does not retry in lockstep.
static CALL_SEQ: AtomicU32 = AtomicU32::new(0);

/// Attempt budget, backoff shape and per-call timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), &TimeoutConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
            backoff_factor: BACKOFF_FACTOR,
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter_fraction: retry.jitter_fraction,
            call_timeout: Duration::from_secs(timeouts.call_timeout_secs),
        }
    }

    /// Delay before the retry following failed attempt `attempt` (0-indexed).
    /// `salt` identifies the call; equal salts give equal delays.
    pub fn delay_for_attempt(
        &self,
        attempt: u32,
        salt: u32,
        rate_limit_delay: Option<Duration>,
    ) -> Duration {
        // The server's hint wins, still bounded by the cap.
        if let Some(rl_delay) = rate_limit_delay {
            return (rl_delay + Duration::from_millis(RATE_LIMIT_BUFFER_MS)).min(self.max_delay);
        }

        let base_ms = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let jitter = deterministic_jitter(attempt, salt, self.jitter_fraction);
        let final_ms = (capped_ms * jitter)
            .min(self.max_delay.as_millis() as f64)
            .max(1.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Multiplier in [1 - fraction, 1 + fraction], reproducible per (attempt, salt).
fn deterministic_jitter(attempt: u32, salt: u32, fraction: f64) -> f64 {
    // splitmix64 finalizer
    let mut z = (((salt as u64) << 32) | attempt as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    let hash = (z >> 32) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}

fn rate_limit_delay(error: &ServiceError) -> Option<Duration> {
    match error {
        ServiceError::RateLimited { retry_after_ms, .. } if *retry_after_ms > 0 => {
            Some(Duration::from_millis(*retry_after_ms))
        }
        _ => None,
    }
}

/// One collaborator attempt, as written to the audit.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub service: String,
    pub operation: String,
    /// 1-based.
    pub attempt: u32,
    pub status: &'static str,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub trait CallAudit: Send + Sync {
    fn record(&self, call: &CallRecord);
}

/// Audit sink that drops everything.
pub struct NoAudit;

impl CallAudit for NoAudit {
    fn record(&self, _call: &CallRecord) {}
}

/// Run `call` under the policy: each attempt bounded by the call timeout,
/// transient failures retried with capped backoff, every attempt audited.
/// Returns the last error once the budget is spent.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    audit: &dyn CallAudit,
    service: &str,
    operation: &str,
    mut call: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let salt = CALL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                service: service.to_string(),
                after_ms: policy.call_timeout.as_millis() as u64,
            }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                audit.record(&CallRecord {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    attempt,
                    status: "ok",
                    error_kind: None,
                    error: None,
                    duration_ms,
                });
                return Ok(value);
            }
            Err(e) => {
                audit.record(&CallRecord {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    attempt,
                    status: "error",
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    duration_ms,
                });

                if !e.is_retriable() || attempt >= policy.max_attempts {
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt - 1, salt, rate_limit_delay(&e));
                tracing::warn!(
                    service,
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
            jitter_fraction: 0.0,
            call_timeout: Duration::from_millis(200),
        }
    }

    #[derive(Default)]
    struct VecAudit(Mutex<Vec<CallRecord>>);

    impl CallAudit for VecAudit {
        fn record(&self, call: &CallRecord) {
            self.0.lock().unwrap().push(call.clone());
        }
    }

    fn server_error() -> ServiceError {
        ServiceError::Server {
            service: "fake".into(),
            message: "HTTP 503".into(),
        }
    }

    // ─── Delay computation ──────────────────────────────────────

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0, 7, None), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(1, 7, None), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(10, 7, None), Duration::from_millis(60_000));
    }

    #[test]
    fn test_delay_uses_rate_limit_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(0, 1, Some(Duration::from_millis(500))),
            Duration::from_millis(600)
        );
        assert_eq!(
            policy.delay_for_attempt(0, 2, Some(Duration::from_secs(600))),
            policy.max_delay
        );
    }

    #[test]
    fn test_jitter_bounds() {
        for attempt in 0..20 {
            for salt in 0..20 {
                let j = deterministic_jitter(attempt, salt, 0.2);
                assert!((0.8..=1.2).contains(&j), "jitter {j} out of range");
            }
        }
    }

    #[test]
    fn test_jitter_decorrelates_concurrent_calls() {
        let policy = RetryPolicy::default();
        let delays: std::collections::BTreeSet<Duration> = (0..5)
            .map(|salt| policy.delay_for_attempt(0, salt, None))
            .collect();
        assert!(delays.len() > 1, "all calls share one delay: {delays:?}");
        assert_eq!(
            policy.delay_for_attempt(1, 3, None),
            policy.delay_for_attempt(1, 3, None)
        );
    }

    // ─── call_with_retry ────────────────────────────────────────

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let audit = VecAudit::default();
        let result = call_with_retry(&fast_policy(), &audit, "fake", "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(server_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let records = audit.0.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, "error");
        assert_eq!(records[2].status, "ok");
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(), &NoAudit, "fake", "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(server_error()) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Server { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(), &NoAudit, "fake", "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ServiceError::Auth {
                    service: "fake".into(),
                    message: "bad key".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let mut policy = fast_policy();
        policy.max_attempts = 2;
        policy.call_timeout = Duration::from_millis(20);
        let audit = VecAudit::default();
        let result: Result<(), _> = call_with_retry(&policy, &audit, "fake", "op", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Timeout { .. })));
        let records = audit.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].error_kind, Some("timeout"));
    }
}
