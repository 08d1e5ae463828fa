//! Analysis stage
//!
//! Pure compute: aggregation, anomaly detection, and per-transaction
//! risk scoring. No LLM access here.

use serde_json::{json, Value};

use crate::agents::{Agent, StageContext};
use crate::compute;
use crate::error::PipelineError;
use crate::models::Transaction;
use crate::security::Capability;
use crate::Result;

/// Risk score above which a transaction is counted as high risk.
const HIGH_RISK_THRESHOLD: f64 = 0.5;

pub struct AnalysisAgent;

#[async_trait::async_trait]
impl Agent for AnalysisAgent {
    fn name(&self) -> &'static str {
        "analysis"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles]
    }

    async fn execute(&self, _ctx: &StageContext, input: &Value) -> Result<Value> {
        let transactions: Vec<Transaction> = input
            .get("transactions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| PipelineError::Permanent("transactions are required".into()))?;

        let summary = compute::aggregate(&transactions);
        let anomalies = compute::detect_anomalies(&transactions);

        let risk_scores: Vec<Value> = transactions
            .iter()
            .map(|t| {
                json!({
                    "transaction_id": t.transaction_id,
                    "risk_score": compute::score_risk(t),
                })
            })
            .collect();
        let high_risk_count = risk_scores
            .iter()
            .filter(|r| {
                r.get("risk_score")
                    .and_then(Value::as_f64)
                    .map(|s| s > HIGH_RISK_THRESHOLD)
                    .unwrap_or(false)
            })
            .count();

        Ok(json!({
            "summary": summary,
            "anomalies": anomalies,
            "risk_scores": risk_scores,
            "high_risk_count": high_risk_count,
        }))
    }
}
