//! Per-agent circuit breaker registry
//!
//! The one piece of cross-session shared mutable state: breaker records
//! are keyed by agent name and guarded per key, so sessions hammering
//! different agents never contend. Records are created on first use and
//! never evicted. The registry is passed into the orchestrator as an
//! explicit dependency rather than living in a global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    /// Consecutive failures since the last success.
    failure_count: u32,
    success_count: u64,
    total_calls: u64,
    total_failures: u64,
    last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last entered OPEN; drives the cooldown.
    opened_at: Option<Instant>,
    /// Set while the single HALF_OPEN trial call is outstanding.
    trial_in_flight: bool,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            total_failures: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of one agent's breaker, for tests and the API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub agent: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_calls: u64,
    pub error_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerRecord>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn record_for(&self, agent: &str) -> Arc<Mutex<BreakerRecord>> {
        {
            let breakers = self.breakers.read().await;
            if let Some(record) = breakers.get(agent) {
                return record.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerRecord::new())))
            .clone()
    }

    /// Whether a call to `agent` may proceed. While OPEN this is false
    /// until the cooldown elapses; the breaker then moves to HALF_OPEN
    /// and this call claims the single trial slot.
    pub async fn can_execute(&self, agent: &str) -> bool {
        let record = self.record_for(agent).await;
        let mut record = record.lock().await;

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = record
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    info!(agent = %agent, "Circuit breaker cooldown elapsed, allowing trial call");
                    record.state = CircuitState::HalfOpen;
                    record.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if record.trial_in_flight {
                    false
                } else {
                    record.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self, agent: &str) {
        let record = self.record_for(agent).await;
        let mut record = record.lock().await;

        record.total_calls += 1;
        record.success_count += 1;
        record.failure_count = 0;
        record.trial_in_flight = false;

        if record.state != CircuitState::Closed {
            info!(agent = %agent, "Circuit breaker reset to CLOSED");
        }
        record.state = CircuitState::Closed;
        record.opened_at = None;
    }

    pub async fn record_failure(&self, agent: &str) {
        let record = self.record_for(agent).await;
        let mut record = record.lock().await;

        record.total_calls += 1;
        record.total_failures += 1;
        record.failure_count += 1;
        record.last_failure_at = Some(Utc::now());

        let tripped = match record.state {
            // A failed trial call reopens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => record.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        record.trial_in_flight = false;

        if tripped {
            warn!(
                agent = %agent,
                consecutive_failures = record.failure_count,
                "Circuit breaker tripped to OPEN"
            );
            record.state = CircuitState::Open;
            record.opened_at = Some(Instant::now());
        }
    }

    pub async fn state(&self, agent: &str) -> CircuitState {
        let record = self.record_for(agent).await;
        let record = record.lock().await;
        record.state
    }

    pub async fn stats(&self, agent: &str) -> BreakerStats {
        let record = self.record_for(agent).await;
        let record = record.lock().await;
        let error_rate = if record.total_calls > 0 {
            record.total_failures as f64 / record.total_calls as f64
        } else {
            0.0
        };
        BreakerStats {
            agent: agent.to_string(),
            state: record.state,
            failure_count: record.failure_count,
            total_calls: record.total_calls,
            error_rate,
            last_failure_at: record.last_failure_at,
        }
    }

    /// Stats for every agent seen so far.
    pub async fn all_stats(&self) -> Vec<BreakerStats> {
        let agents: Vec<String> = {
            let breakers = self.breakers.read().await;
            breakers.keys().cloned().collect()
        };
        let mut stats = Vec::with_capacity(agents.len());
        for agent in agents {
            stats.push(self.stats(&agent).await);
        }
        stats
    }
}
