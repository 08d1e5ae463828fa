//! Retry manager
//!
//! Wraps each stage invocation behind the agent's circuit breaker and
//! retries transient failures with capped exponential backoff. Permanent
//! errors (validation, privilege, sandbox) short-circuit after a single
//! attempt and are never retried.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::PipelineError;
use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
use crate::Result;

/// Successful invocation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before retry number `attempt` (0-based): base * 2^attempt,
    /// capped at max_delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.config.max_delay)
    }

    /// Invoke `op` for `agent` behind its circuit breaker.
    ///
    /// Every executed attempt is recorded on the breaker. When the breaker
    /// refuses the call, `CircuitOpen` is returned without invoking the
    /// agent at all — the caller decides whether a fallback applies.
    pub async fn execute<T, F, Fut>(
        &self,
        agent: &str,
        breakers: &CircuitBreakerRegistry,
        op: F,
    ) -> Result<RetryOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !breakers.can_execute(agent).await {
            return Err(PipelineError::CircuitOpen(agent.to_string()));
        }

        let mut attempts = 0u32;
        let mut last_error: Option<PipelineError> = None;

        while attempts < self.config.max_attempts {
            attempts += 1;

            match op().await {
                Ok(value) => {
                    breakers.record_success(agent).await;
                    if attempts > 1 {
                        debug!(agent = %agent, attempts, "Stage succeeded after retry");
                    }
                    return Ok(RetryOutcome { value, attempts });
                }
                Err(e) => {
                    breakers.record_failure(agent).await;

                    if !e.is_retryable() {
                        warn!(agent = %agent, error = %e, "Permanent error, not retrying");
                        return Err(e);
                    }

                    warn!(
                        agent = %agent,
                        attempt = attempts,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Transient stage failure"
                    );
                    last_error = Some(e);

                    if attempts < self.config.max_attempts {
                        // The breaker may have tripped on this failure.
                        if !breakers.can_execute(agent).await {
                            return Err(PipelineError::CircuitOpen(agent.to_string()));
                        }
                        tokio::time::sleep(self.backoff_delay(attempts - 1)).await;
                    }
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(PipelineError::RetriesExhausted {
            agent: agent.to_string(),
            attempts,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> RetryManager {
        RetryManager::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        })
    }

    fn breakers() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let manager = RetryManager::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        });
        assert_eq!(manager.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(manager.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(manager.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(manager.backoff_delay(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_reports_two_attempts() {
        let manager = manager();
        let breakers = breakers();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let outcome = manager
            .execute("categorization", &breakers, move || {
                let calls = calls_ref.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PipelineError::Transient("llm timeout".into()))
                    } else {
                        Ok("categorized")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.value, "categorized");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_never_retried() {
        let manager = manager();
        let breakers = breakers();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result: Result<RetryOutcome<()>> = manager
            .execute("ingestion", &breakers, move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Permanent("malformed input".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_max_attempts() {
        let manager = manager();
        let breakers = breakers();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result: Result<RetryOutcome<()>> = manager
            .execute("categorization", &breakers, move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Transient("still down".into()))
                }
            })
            .await;

        match result {
            Err(PipelineError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_invoking() {
        let manager = manager();
        let breakers = breakers();
        for _ in 0..5 {
            breakers.record_failure("categorization").await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        let result: Result<RetryOutcome<()>> = manager
            .execute("categorization", &breakers, move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
