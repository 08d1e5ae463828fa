//! Fallback manager
//!
//! When retries exhaust or a breaker is open, each stage still gets a
//! degraded but well-formed result so the session can continue instead
//! of failing outright. The orchestrator flags the resulting stage
//! output as degraded in the trace.

use serde_json::{json, Value};
use tracing::warn;

use crate::models::Transaction;

const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("grocery", "Food"),
    ("restaurant", "Food"),
    ("coffee", "Food"),
    ("uber", "Transportation"),
    ("lyft", "Transportation"),
    ("gas", "Transportation"),
    ("rent", "Housing"),
    ("mortgage", "Housing"),
    ("electric", "Utilities"),
    ("water", "Utilities"),
    ("internet", "Utilities"),
    ("netflix", "Entertainment"),
    ("spotify", "Entertainment"),
    ("doctor", "Healthcare"),
    ("pharmacy", "Healthcare"),
    ("salary", "Income"),
    ("payroll", "Income"),
    ("deposit", "Income"),
];

/// Default percentage split used when the budgeting stage is degraded.
const DEFAULT_BUDGET_SPLIT: &[(&str, f64)] = &[
    ("Housing", 0.30),
    ("Food", 0.20),
    ("Transportation", 0.15),
    ("Utilities", 0.10),
    ("Healthcare", 0.05),
    ("Entertainment", 0.05),
    ("Savings", 0.10),
    ("Other", 0.05),
];

#[derive(Default)]
pub struct FallbackManager;

impl FallbackManager {
    pub fn new() -> Self {
        Self
    }

    /// Produce the degraded result for `agent`, shaped like the real
    /// stage output. `context` is the session context accumulated so far.
    pub fn degraded_result(&self, agent: &str, context: &Value) -> Value {
        warn!(agent = %agent, "Serving degraded fallback result");
        match agent {
            "ingestion" => json!({ "transactions": [], "count": 0 }),
            "categorization" => self.rule_based_categorization(context),
            "analysis" => json!({
                "summary": {
                    "total_income": 0.0,
                    "total_expense": 0.0,
                    "net_savings": 0.0,
                    "savings_rate": 0.0,
                    "category_breakdown": {},
                    "uncategorized_total": 0.0,
                },
                "anomalies": [],
            }),
            "budgeting" => self.deterministic_budget(context),
            "evaluation" => json!({ "consistent": true, "max_risk_score": 0.0, "flags": [] }),
            "reporting" => json!({
                "total_income": 0.0,
                "total_expense": 0.0,
                "savings_rate": 0.0,
                "category_breakdown": {},
                "budget_suggestions": [],
                "anomalies": [],
                "degraded": true,
            }),
            "conversation" => json!({
                "message": "Refinement is temporarily unavailable; the report is unchanged.",
                "action": "none",
            }),
            _ => json!({ "degraded": true }),
        }
    }

    /// Keyword categorization standing in for the LLM categorizer.
    fn rule_based_categorization(&self, context: &Value) -> Value {
        let transactions: Vec<Transaction> = context
            .get("ingestion")
            .and_then(|v| v.get("transactions"))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let categorized: Vec<Value> = transactions
            .into_iter()
            .map(|mut txn| {
                let desc_lower = txn.description.to_lowercase();
                let mut category = KEYWORD_CATEGORIES
                    .iter()
                    .find(|(keyword, _)| desc_lower.contains(keyword))
                    .map(|(_, cat)| cat.to_string())
                    .unwrap_or_else(|| "Other".to_string());
                if txn.amount > 0.0 {
                    category = "Income".to_string();
                }
                txn.category = Some(category);
                serde_json::to_value(txn).unwrap_or(Value::Null)
            })
            .collect();

        json!({ "transactions": categorized, "method": "rule_based" })
    }

    /// Fixed percentage allocation standing in for the budget stage.
    fn deterministic_budget(&self, context: &Value) -> Value {
        let total_income = context
            .get("analysis")
            .and_then(|v| v.get("summary"))
            .and_then(|v| v.get("total_income"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        if total_income <= 0.0 {
            return json!({ "suggestions": [], "method": "deterministic" });
        }

        let suggestions: Vec<Value> = DEFAULT_BUDGET_SPLIT
            .iter()
            .map(|(category, pct)| {
                json!({
                    "category": category,
                    "suggested_budget": (total_income * pct * 100.0).round() / 100.0,
                    "reasoning": format!("Default {}% allocation", (pct * 100.0) as u32),
                })
            })
            .collect();

        json!({ "suggestions": suggestions, "method": "deterministic" })
    }
}
