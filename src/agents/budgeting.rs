//! Budgeting stage
//!
//! Allocates budgets from the analysis summary using the deterministic
//! allocator, enriched with the user's monthly history via retrieval.
//! A single guarded LLM call produces the narrative note. Refinement
//! overrides from the conversation stage are applied last.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::agents::{Agent, StageContext};
use crate::compute;
use crate::error::PipelineError;
use crate::models::BudgetRecommendation;
use crate::security::Capability;
use crate::Result;

const SYSTEM_PROMPT: &str = "You are a personal-finance assistant. \
Write a short, plain-language note (2-3 sentences) about the budget \
allocation you are shown. No lists, no headings.";

pub struct BudgetingAgent;

#[async_trait::async_trait]
impl Agent for BudgetingAgent {
    fn name(&self) -> &'static str {
        "budgeting"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles, Capability::UseRetrieval, Capability::CallLlm]
    }

    async fn execute(&self, ctx: &StageContext, input: &Value) -> Result<Value> {
        let summary = input
            .get("summary")
            .ok_or_else(|| PipelineError::Permanent("analysis summary is required".into()))?;
        let total_income = summary
            .get("total_income")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let category_spend: BTreeMap<String, f64> = summary
            .get("category_breakdown")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let mut suggestions = compute::allocate_budget(total_income, &category_spend);

        // Conversational refinements pin specific categories.
        if let Some(overrides) = input.get("overrides").and_then(Value::as_object) {
            for (category, amount) in overrides {
                if let Some(amount) = amount.as_f64() {
                    apply_override(&mut suggestions, category, amount);
                }
            }
        }

        let history = ctx.retrieve_monthly_summaries(self.name()).await?;

        let narrative = if total_income > 0.0 {
            let prompt = format!(
                "Income ${:.2}/month across {} months of history. Suggested budgets: {}.",
                total_income,
                history.len(),
                suggestions
                    .iter()
                    .map(|s| format!("{} ${:.0}", s.category, s.suggested_budget))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            ctx.call_llm(self.name(), SYSTEM_PROMPT, &prompt).await?
        } else {
            "No income recorded this period, so no budget was allocated.".to_string()
        };

        Ok(json!({
            "suggestions": suggestions,
            "narrative": narrative,
            "historical_months": history.len(),
        }))
    }
}

fn apply_override(suggestions: &mut Vec<BudgetRecommendation>, category: &str, amount: f64) {
    match suggestions
        .iter_mut()
        .find(|s| s.category.eq_ignore_ascii_case(category))
    {
        Some(existing) => {
            existing.suggested_budget = amount;
            existing.reasoning = format!("Adjusted to ${:.2} on request", amount);
        }
        None => suggestions.push(BudgetRecommendation {
            category: category.to_string(),
            suggested_budget: amount,
            reasoning: format!("Added at ${:.2} on request", amount),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::stage_context;
    use crate::models::Transaction;
    use uuid::Uuid;

    fn analysis_input(income: f64) -> Value {
        json!({
            "summary": {
                "total_income": income,
                "total_expense": 2000.0,
                "net_savings": income - 2000.0,
                "savings_rate": 50.0,
                "category_breakdown": {"Housing": 1500.0, "Food": 500.0},
                "uncategorized_total": 0.0,
            }
        })
    }

    #[tokio::test]
    async fn test_budget_from_analysis() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let output = BudgetingAgent
            .execute(&ctx, &analysis_input(4000.0))
            .await
            .unwrap();

        let suggestions = output["suggestions"].as_array().unwrap();
        assert!(!suggestions.is_empty());
        assert!(output["narrative"].as_str().map(|s| !s.is_empty()).unwrap_or(false));

        let (tokens_in, _) = ctx.token_usage();
        assert!(tokens_in > 0, "narrative call should consume tokens");
    }

    #[tokio::test]
    async fn test_retrieval_feeds_history() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        ctx.memory
            .append_transactions(
                ctx.user_id,
                vec![Transaction {
                    transaction_id: "t1".into(),
                    date: "2025-05-01".into(),
                    description: "Salary".into(),
                    amount: 4000.0,
                    category: Some("Income".into()),
                }],
            )
            .await
            .unwrap();

        let output = BudgetingAgent
            .execute(&ctx, &analysis_input(4000.0))
            .await
            .unwrap();
        assert_eq!(output["historical_months"], 1);
    }

    #[tokio::test]
    async fn test_overrides_pin_categories() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let mut input = analysis_input(4000.0);
        input["overrides"] = json!({"Food": 350.0});

        let output = BudgetingAgent.execute(&ctx, &input).await.unwrap();
        let food = output["suggestions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["category"] == "Food")
            .unwrap()
            .clone();
        assert_eq!(food["suggested_budget"], 350.0);
    }

    #[tokio::test]
    async fn test_no_income_skips_llm() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let output = BudgetingAgent
            .execute(&ctx, &analysis_input(0.0))
            .await
            .unwrap();
        assert_eq!(output["suggestions"], json!([]));
        assert_eq!(ctx.token_usage(), (0, 0));
    }

    #[tokio::test]
    async fn test_missing_summary_is_permanent() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let result = BudgetingAgent.execute(&ctx, &json!({})).await;
        assert!(matches!(result, Err(PipelineError::Permanent(_))));
    }
}
