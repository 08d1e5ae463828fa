//! Observability sinks
//!
//! Passive recording of spans, per-agent cost, and compliance events.
//! Everything here is fire-and-forget: a failure to record must never
//! fail a stage, so these methods log at `warn` and swallow errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info_span, warn};
use uuid::Uuid;

/// Cost per 1K tokens, mirroring the flat pricing the LLM client assumes.
const COST_PER_1K_INPUT: f64 = 0.000_15;
const COST_PER_1K_OUTPUT: f64 = 0.000_60;

#[derive(Debug, Clone, Serialize)]
pub struct AgentCost {
    pub agent: String,
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: String,
    pub detail: Value,
}

/// Handle returned by `span_start`; finish with `span_end`.
pub struct SpanHandle {
    pub span_id: Uuid,
    session_id: Uuid,
    agent: String,
    started: Instant,
}

#[derive(Default)]
struct ObservabilityState {
    costs: HashMap<String, AgentCost>,
    compliance: Vec<ComplianceRecord>,
}

#[derive(Clone, Default)]
pub struct Observability {
    state: Arc<RwLock<ObservabilityState>>,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn span_start(&self, session_id: Uuid, agent: &str) -> SpanHandle {
        let span_id = Uuid::new_v4();
        let span = info_span!("stage", session_id = %session_id, agent = %agent, span_id = %span_id);
        let _entered = span.enter();
        SpanHandle {
            span_id,
            session_id,
            agent: agent.to_string(),
            started: Instant::now(),
        }
    }

    pub fn span_end(&self, handle: SpanHandle, error: Option<&str>) {
        let elapsed_ms = handle.started.elapsed().as_millis() as u64;
        match error {
            Some(error) => warn!(
                session_id = %handle.session_id,
                agent = %handle.agent,
                span_id = %handle.span_id,
                elapsed_ms,
                error,
                "Stage span finished with error"
            ),
            None => tracing::debug!(
                session_id = %handle.session_id,
                agent = %handle.agent,
                span_id = %handle.span_id,
                elapsed_ms,
                "Stage span finished"
            ),
        }
    }

    /// Estimate the dollar cost of a call from its token counts.
    pub fn estimate_cost(tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 / 1000.0) * COST_PER_1K_INPUT
            + (tokens_out as f64 / 1000.0) * COST_PER_1K_OUTPUT
    }

    pub async fn record_cost(&self, agent: &str, tokens_in: u64, tokens_out: u64, cost: f64) {
        let mut state = self.state.write().await;
        let entry = state
            .costs
            .entry(agent.to_string())
            .or_insert_with(|| AgentCost {
                agent: agent.to_string(),
                calls: 0,
                tokens_in: 0,
                tokens_out: 0,
                cost: 0.0,
            });
        entry.calls += 1;
        entry.tokens_in += tokens_in;
        entry.tokens_out += tokens_out;
        entry.cost += cost;
    }

    pub async fn record_compliance(&self, session_id: Uuid, kind: &str, detail: Value) {
        let mut state = self.state.write().await;
        state.compliance.push(ComplianceRecord {
            timestamp: Utc::now(),
            session_id,
            kind: kind.to_string(),
            detail,
        });
    }

    pub async fn cost_report(&self) -> Vec<AgentCost> {
        let state = self.state.read().await;
        let mut report: Vec<AgentCost> = state.costs.values().cloned().collect();
        report.sort_by(|a, b| a.agent.cmp(&b.agent));
        report
    }

    pub async fn compliance_for_session(&self, session_id: Uuid) -> Vec<ComplianceRecord> {
        let state = self.state.read().await;
        state
            .compliance
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}
