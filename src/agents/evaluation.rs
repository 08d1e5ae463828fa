//! Evaluation stage
//!
//! Deterministic scoring of financial health from the analysis and
//! budget outputs. Surfaces the highest anomaly risk so the orchestrator
//! can decide whether a human needs to approve before reporting.

use serde_json::{json, Value};

use crate::agents::{Agent, StageContext};
use crate::models::Anomaly;
use crate::security::Capability;
use crate::Result;

pub struct EvaluationAgent;

impl EvaluationAgent {
    fn evaluate(
        total_income: f64,
        total_expense: f64,
        savings_rate: f64,
        anomalies: &[Anomaly],
        high_risk_count: u64,
    ) -> Value {
        let mut health_score: f64 = 100.0;
        let mut issues: Vec<String> = Vec::new();
        let mut recommendations: Vec<String> = Vec::new();

        if savings_rate < 0.0 {
            health_score -= 30.0;
            issues.push("Negative savings rate - spending exceeds income".into());
            recommendations.push("Reduce expenses or increase income immediately".into());
        } else if savings_rate < 10.0 {
            health_score -= 20.0;
            issues.push("Low savings rate below 10%".into());
            recommendations.push("Aim for at least 10-20% savings".into());
        } else if savings_rate < 20.0 {
            health_score -= 10.0;
            recommendations.push("Good savings rate, aim for 20%+".into());
        } else {
            recommendations.push("Excellent savings rate!".into());
        }

        if high_risk_count > 0 {
            health_score -= (high_risk_count as f64 * 5.0).min(20.0);
            issues.push(format!("{} high-risk transactions detected", high_risk_count));
            recommendations.push("Review high-risk transactions for potential fraud".into());
        }

        if !anomalies.is_empty() {
            health_score -= (anomalies.len() as f64 * 3.0).min(15.0);
            issues.push(format!("{} anomalous transactions detected", anomalies.len()));
            recommendations.push("Verify unusual transactions".into());
        }

        let expense_to_income_ratio = if total_income > 0.0 {
            (total_expense / total_income) * 100.0
        } else {
            0.0
        };
        if expense_to_income_ratio > 100.0 {
            health_score -= 25.0;
            issues.push("Expenses exceed income".into());
        }

        let health_score = health_score.clamp(0.0, 100.0);
        let health_grade = match health_score {
            s if s >= 90.0 => "A",
            s if s >= 80.0 => "B",
            s if s >= 70.0 => "C",
            s if s >= 60.0 => "D",
            _ => "F",
        };
        let risk_level = if health_score < 60.0 {
            "HIGH"
        } else if health_score < 80.0 {
            "MEDIUM"
        } else {
            "LOW"
        };

        let max_anomaly_risk = anomalies
            .iter()
            .map(|a| a.risk_score)
            .fold(0.0_f64, f64::max);

        json!({
            "health_score": (health_score * 10.0).round() / 10.0,
            "health_grade": health_grade,
            "issues": issues,
            "recommendations": recommendations,
            "expense_to_income_ratio": (expense_to_income_ratio * 10.0).round() / 10.0,
            "savings_rate": savings_rate,
            "risk_level": risk_level,
            "max_anomaly_risk": max_anomaly_risk,
        })
    }
}

#[async_trait::async_trait]
impl Agent for EvaluationAgent {
    fn name(&self) -> &'static str {
        "evaluation"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles, Capability::UseRetrieval]
    }

    async fn execute(&self, _ctx: &StageContext, input: &Value) -> Result<Value> {
        let summary = input.get("summary").cloned().unwrap_or(json!({}));
        let total_income = summary.get("total_income").and_then(Value::as_f64).unwrap_or(0.0);
        let total_expense = summary
            .get("total_expense")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let savings_rate = summary
            .get("savings_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let anomalies: Vec<Anomaly> = input
            .get("anomalies")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let high_risk_count = input
            .get("high_risk_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(Self::evaluate(
            total_income,
            total_expense,
            savings_rate,
            &anomalies,
            high_risk_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::stage_context;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_healthy_finances_grade_a() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let input = json!({
            "summary": {"total_income": 5000.0, "total_expense": 3000.0, "savings_rate": 40.0},
            "anomalies": [],
            "high_risk_count": 0,
        });

        let output = EvaluationAgent.execute(&ctx, &input).await.unwrap();
        assert_eq!(output["health_grade"], "A");
        assert_eq!(output["risk_level"], "LOW");
        assert_eq!(output["max_anomaly_risk"], 0.0);
    }

    #[tokio::test]
    async fn test_overspending_drops_grade() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let input = json!({
            "summary": {"total_income": 3000.0, "total_expense": 4000.0, "savings_rate": -33.0},
            "anomalies": [],
            "high_risk_count": 0,
        });

        let output = EvaluationAgent.execute(&ctx, &input).await.unwrap();
        assert_eq!(output["health_score"], 45.0);
        assert_eq!(output["health_grade"], "F");
        assert_eq!(output["risk_level"], "HIGH");
    }

    #[tokio::test]
    async fn test_max_anomaly_risk_surfaces() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let input = json!({
            "summary": {"total_income": 5000.0, "total_expense": 2000.0, "savings_rate": 60.0},
            "anomalies": [
                {"transaction_id": "t1", "reason": "spike", "risk_score": 0.55},
                {"transaction_id": "t2", "reason": "bigger spike", "risk_score": 0.91},
            ],
            "high_risk_count": 1,
        });

        let output = EvaluationAgent.execute(&ctx, &input).await.unwrap();
        assert_eq!(output["max_anomaly_risk"], 0.91);
        assert!(!output["issues"].as_array().unwrap().is_empty());
    }
}
