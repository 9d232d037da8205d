//! Outbound call resilience
//!
//! Every provider call goes through [`OutboundGuard::call`], which:
//! - waits for a slot on the process-local rate limiter (queued, never dropped)
//! - bounds each attempt with the call kind's timeout
//! - retries throttled and transient failures with jittered exponential backoff

use crate::config::{CallPolicy, RateLimitConfig};
use crate::errors::{AppError, Result};
use crate::metrics;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outbound call kinds, each with its own policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Classification,
    Decomposition,
    Embedding,
    Synthesis,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Classification => "classification",
            CallKind::Decomposition => "decomposition",
            CallKind::Embedding => "embedding",
            CallKind::Synthesis => "synthesis",
        }
    }
}

impl CallPolicy {
    /// Jittered exponential schedule; attempt counts are bounded by the caller
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_randomization_factor(0.5)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Shared pacing and retry wrapper for provider calls
#[derive(Clone, Default)]
pub struct OutboundGuard {
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl OutboundGuard {
    /// Build from config. A disabled or zero-rate config yields an unpaced guard.
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::unlimited();
        }
        let Some(rate) = NonZeroU32::new(config.requests_per_second) else {
            return Self::unlimited();
        };
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: Some(Arc::new(RateLimiter::direct(quota))),
        }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    /// Run `op` under `policy`, retrying on throttling and transient errors
    pub async fn call<T, F, Fut>(&self, kind: CallKind, policy: &CallPolicy, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut schedule = policy.backoff();
        let mut transient_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let started = Instant::now();
            let outcome = match tokio::time::timeout(policy.timeout(), op()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::ProviderTimeout {
                    operation: kind.as_str().to_string(),
                    timeout_ms: policy.timeout_ms,
                }),
            };
            let elapsed = started.elapsed().as_secs_f64();

            let error = match outcome {
                Ok(value) => {
                    metrics::record_provider_call(kind.as_str(), "success", elapsed);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if error.is_rate_limited() {
                if rate_limit_retries >= policy.max_rate_limit_retries {
                    metrics::record_provider_call(kind.as_str(), "rate_limited", elapsed);
                    tracing::warn!(
                        kind = kind.as_str(),
                        retries = rate_limit_retries,
                        "Provider still throttling, giving up"
                    );
                    return Err(AppError::RateLimited {
                        retries: rate_limit_retries,
                    });
                }
                rate_limit_retries += 1;
                metrics::record_provider_call(kind.as_str(), "rate_limited", elapsed);
            } else if error.is_transient() {
                if transient_retries >= policy.max_retries {
                    let status = if error.is_timeout() { "timeout" } else { "error" };
                    metrics::record_provider_call(kind.as_str(), status, elapsed);
                    return Err(error);
                }
                transient_retries += 1;
                metrics::record_provider_call(kind.as_str(), "retry", elapsed);
            } else {
                metrics::record_provider_call(kind.as_str(), "error", elapsed);
                return Err(error);
            }

            let delay = schedule
                .next_backoff()
                .unwrap_or(Duration::from_millis(policy.max_backoff_ms));
            tracing::warn!(
                kind = kind.as_str(),
                error = %error,
                delay_ms = delay.as_millis() as u64,
                transient_retries,
                rate_limit_retries,
                "Provider call failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for OutboundGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGuard")
            .field("paced", &self.limiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32, max_rate_limit_retries: u32) -> CallPolicy {
        CallPolicy {
            timeout_ms: 50,
            max_retries,
            max_rate_limit_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_tokens: 0,
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let guard = OutboundGuard::unlimited();
        let attempts = AtomicU32::new(0);

        let result = guard
            .call(CallKind::Synthesis, &fast_policy(1, 0), || async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::Upstream {
                        status: 500,
                        message: "boom".into(),
                    })
                } else {
                    Ok("answer")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "answer");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let guard = OutboundGuard::unlimited();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = guard
            .call(CallKind::Synthesis, &fast_policy(1, 0), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream {
                    status: 503,
                    message: "down".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Upstream { status: 503, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_is_typed() {
        let guard = OutboundGuard::unlimited();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = guard
            .call(CallKind::Embedding, &fast_policy(0, 3), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream {
                    status: 429,
                    message: "slow down".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::RateLimited { retries: 3 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_provider_timeout() {
        let guard = OutboundGuard::unlimited();

        let result: Result<()> = guard
            .call(CallKind::Classification, &fast_policy(0, 0), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AppError::ProviderTimeout { timeout_ms: 50, .. })));
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let guard = OutboundGuard::new(&RateLimitConfig::default());
        let attempts = AtomicU32::new(0);

        let result: Result<()> = guard
            .call(CallKind::Decomposition, &fast_policy(3, 3), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream {
                    status: 400,
                    message: "bad request".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
