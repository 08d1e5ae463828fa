//! Environment-backed configuration
//!
//! All knobs come from env vars (loaded via dotenv in the binaries)
//! with defaults that keep the engine functional out of the box.

use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-session resource caps enforced by the session guard.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_iterations: u32,
    pub max_tokens: u64,
    pub max_runtime: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_tokens: 100_000,
            max_runtime: Duration::from_secs(300),
        }
    }
}

/// Retry behavior for transient stage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Per-agent circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip CLOSED → OPEN.
    pub failure_threshold: u32,
    /// Time in OPEN before a single HALF_OPEN trial is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Hard ceilings applied to every single agent invocation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_call_tokens: u64,
    pub max_memory_bytes: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_call_tokens: 4096,
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Risk-score thresholds above which a stage output requires approval.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalThresholds {
    pub anomaly: f64,
    pub high_risk_transaction: f64,
    pub budget_override: f64,
}

impl Default for ApprovalThresholds {
    fn default() -> Self {
        Self {
            anomaly: 0.8,
            high_risk_transaction: 0.7,
            budget_override: 0.9,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub limits: SessionLimits,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub sandbox: SandboxLimits,
    pub approval: ApprovalThresholds,
    /// Postgres URL for durable checkpoints and event log; in-memory
    /// backends are used when unset.
    pub database_url: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            limits: SessionLimits {
                max_iterations: env_parse("MAX_ITERATIONS", 12),
                max_tokens: env_parse("MAX_SESSION_TOKENS", 100_000),
                max_runtime: Duration::from_secs(env_parse("MAX_RUNTIME_SECONDS", 300)),
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
                base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 250)),
                max_delay: Duration::from_secs(env_parse("RETRY_MAX_DELAY_SECONDS", 30)),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                cooldown: Duration::from_secs(env_parse("BREAKER_COOLDOWN_SECONDS", 60)),
            },
            sandbox: SandboxLimits {
                timeout: Duration::from_secs(env_parse("SANDBOX_TIMEOUT_SECONDS", 30)),
                max_call_tokens: env_parse("SANDBOX_MAX_CALL_TOKENS", 4096),
                max_memory_bytes: env_parse("SANDBOX_MAX_MEMORY_BYTES", 256 * 1024 * 1024),
            },
            approval: ApprovalThresholds {
                anomaly: env_parse("APPROVAL_ANOMALY_THRESHOLD", 0.8),
                high_risk_transaction: env_parse("APPROVAL_RISK_THRESHOLD", 0.7),
                budget_override: env_parse("APPROVAL_BUDGET_THRESHOLD", 0.9),
            },
            database_url: env::var("POSTGRES_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_iterations, 12);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.database_url.is_none());
    }
}
