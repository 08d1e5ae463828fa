//! Execution sandbox
//!
//! Wraps agent invocations with hard ceilings: wall-clock timeout,
//! per-call token budget, and a payload-size bound standing in for a
//! memory ceiling. Exceeding any ceiling aborts the call with a
//! `SandboxViolation`, which is permanent and never retried. A timed-out
//! future is dropped, so a cancelled call leaves no partial state.

use std::future::Future;
use std::time::Instant;

use tracing::warn;

use crate::config::SandboxLimits;
use crate::error::PipelineError;
use crate::Result;

#[derive(Clone, Copy)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Run `fut` under the wall-clock ceiling. On timeout the future is
    /// cancelled and the stage fails with a permanent error.
    pub async fn execute<T, F>(&self, agent: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.limits.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    agent = %agent,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    timeout_ms = self.limits.timeout.as_millis() as u64,
                    "Sandbox timeout, call cancelled"
                );
                Err(PipelineError::SandboxViolation {
                    agent: agent.to_string(),
                    detail: format!(
                        "wall-clock timeout after {}ms",
                        self.limits.timeout.as_millis()
                    ),
                })
            }
        }
    }

    /// Enforce the per-call token ceiling.
    pub fn check_token_budget(&self, agent: &str, tokens: u64) -> Result<()> {
        if tokens > self.limits.max_call_tokens {
            return Err(PipelineError::SandboxViolation {
                agent: agent.to_string(),
                detail: format!(
                    "call used {} tokens, ceiling is {}",
                    tokens, self.limits.max_call_tokens
                ),
            });
        }
        Ok(())
    }

    /// Best-effort memory ceiling: bound the serialized size of a stage
    /// payload.
    pub fn check_payload_size(&self, agent: &str, payload: &serde_json::Value) -> Result<()> {
        let size = serde_json::to_vec(payload).map(|v| v.len() as u64).unwrap_or(0);
        if size > self.limits.max_memory_bytes {
            return Err(PipelineError::SandboxViolation {
                agent: agent.to_string(),
                detail: format!(
                    "payload of {} bytes exceeds memory ceiling of {} bytes",
                    size, self.limits.max_memory_bytes
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sandbox_with_timeout(timeout: Duration) -> Sandbox {
        Sandbox::new(SandboxLimits {
            timeout,
            max_call_tokens: 100,
            max_memory_bytes: 1024,
        })
    }

    #[tokio::test]
    async fn test_fast_call_passes() {
        let sandbox = sandbox_with_timeout(Duration::from_secs(5));
        let result = sandbox.execute("analysis", async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_is_sandbox_violation() {
        let sandbox = sandbox_with_timeout(Duration::from_millis(10));
        let result: Result<()> = sandbox
            .execute("analysis", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(PipelineError::SandboxViolation { agent, .. }) => {
                assert_eq!(agent, "analysis");
            }
            other => panic!("expected SandboxViolation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_not_retryable() {
        let sandbox = sandbox_with_timeout(Duration::from_millis(10));
        let result: Result<()> = sandbox
            .execute("analysis", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(!result.unwrap_err().is_retryable());
    }

    #[test]
    fn test_token_budget() {
        let sandbox = sandbox_with_timeout(Duration::from_secs(1));
        assert!(sandbox.check_token_budget("categorization", 50).is_ok());
        assert!(sandbox.check_token_budget("categorization", 500).is_err());
    }

    #[test]
    fn test_payload_size_ceiling() {
        let sandbox = sandbox_with_timeout(Duration::from_secs(1));
        let small = serde_json::json!({"ok": true});
        assert!(sandbox.check_payload_size("ingestion", &small).is_ok());

        let big = serde_json::json!({"blob": "x".repeat(4096)});
        assert!(sandbox.check_payload_size("ingestion", &big).is_err());
    }
}
