//! Reporting stage
//!
//! Assembles the final financial report from the analysis, budgeting,
//! and evaluation outputs, plus a human-readable rendering.

use serde_json::{json, Value};

use crate::agents::{Agent, StageContext};
use crate::models::{Anomaly, BudgetRecommendation, FinancialReport};
use crate::security::Capability;
use crate::Result;

pub struct ReportingAgent;

impl ReportingAgent {
    fn format_text(report: &FinancialReport) -> String {
        let mut lines = vec![
            "=".repeat(50),
            "FINANCIAL REPORT".to_string(),
            "=".repeat(50),
            String::new(),
            format!("Total Income:    ${:.2}", report.total_income),
            format!("Total Expenses:  ${:.2}", report.total_expense),
            format!(
                "Net Savings:     ${:.2}",
                report.total_income - report.total_expense
            ),
            format!("Savings Rate:    {:.1}%", report.savings_rate),
            String::new(),
            "Spending by Category:".to_string(),
        ];

        for (category, amount) in &report.category_breakdown {
            lines.push(format!("  {:<16} ${:.2}", category, amount));
        }

        if !report.budget_suggestions.is_empty() {
            lines.push(String::new());
            lines.push("Budget Suggestions:".to_string());
            for suggestion in &report.budget_suggestions {
                lines.push(format!(
                    "  {:<16} ${:.2}  ({})",
                    suggestion.category, suggestion.suggested_budget, suggestion.reasoning
                ));
            }
        }

        if !report.anomalies.is_empty() {
            lines.push(String::new());
            lines.push(format!("Anomalies ({}):", report.anomalies.len()));
            for anomaly in &report.anomalies {
                lines.push(format!(
                    "  [{:.2}] {} - {}",
                    anomaly.risk_score, anomaly.transaction_id, anomaly.reason
                ));
            }
        }

        if report.degraded {
            lines.push(String::new());
            lines.push("NOTE: parts of this report were produced in degraded mode.".to_string());
        }

        lines.join("\n")
    }
}

#[async_trait::async_trait]
impl Agent for ReportingAgent {
    fn name(&self) -> &'static str {
        "reporting"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles, Capability::WriteFiles]
    }

    async fn execute(&self, _ctx: &StageContext, input: &Value) -> Result<Value> {
        let summary = input.get("summary").cloned().unwrap_or(json!({}));

        let budget_suggestions: Vec<BudgetRecommendation> = input
            .get("suggestions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let anomalies: Vec<Anomaly> = input
            .get("anomalies")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let report = FinancialReport {
            total_income: summary.get("total_income").and_then(Value::as_f64).unwrap_or(0.0),
            total_expense: summary
                .get("total_expense")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            savings_rate: summary.get("savings_rate").and_then(Value::as_f64).unwrap_or(0.0),
            category_breakdown: summary
                .get("category_breakdown")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            budget_suggestions,
            anomalies,
            degraded: input
                .get("degraded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let text = Self::format_text(&report);
        let mut output = serde_json::to_value(&report)?;
        output["report_text"] = json!(text);
        output["evaluation"] = input.get("evaluation").cloned().unwrap_or(Value::Null);
        output["narrative"] = input.get("narrative").cloned().unwrap_or(Value::Null);

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::stage_context;
    use uuid::Uuid;

    fn report_input() -> Value {
        json!({
            "summary": {
                "total_income": 5000.0,
                "total_expense": 2000.0,
                "savings_rate": 60.0,
                "category_breakdown": {"Housing": 1500.0, "Food": 500.0},
            },
            "suggestions": [
                {"category": "Housing", "suggested_budget": 1400.0, "reasoning": "slightly over"},
            ],
            "anomalies": [
                {"transaction_id": "t9", "reason": "spike", "risk_score": 0.7},
            ],
            "evaluation": {"health_grade": "B"},
            "narrative": "Solid month overall.",
        })
    }

    #[tokio::test]
    async fn test_report_assembly() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let output = ReportingAgent.execute(&ctx, &report_input()).await.unwrap();

        assert_eq!(output["total_income"], 5000.0);
        assert_eq!(output["savings_rate"], 60.0);
        assert_eq!(output["evaluation"]["health_grade"], "B");

        let text = output["report_text"].as_str().unwrap();
        assert!(text.contains("FINANCIAL REPORT"));
        assert!(text.contains("Housing"));
        assert!(text.contains("Anomalies (1):"));
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_report() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let output = ReportingAgent.execute(&ctx, &json!({})).await.unwrap();
        assert_eq!(output["total_income"], 0.0);
        assert_eq!(output["budget_suggestions"], json!([]));
        assert_eq!(output["degraded"], false);
    }

    #[tokio::test]
    async fn test_degraded_flag_propagates_into_text() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let mut input = report_input();
        input["degraded"] = json!(true);

        let output = ReportingAgent.execute(&ctx, &input).await.unwrap();
        assert_eq!(output["degraded"], true);
        assert!(output["report_text"]
            .as_str()
            .unwrap()
            .contains("degraded mode"));
    }
}
