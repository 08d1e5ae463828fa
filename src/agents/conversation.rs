//! Conversation stage (refinement loop)
//!
//! Interprets post-report refinement commands with keyword heuristics:
//! budget adjustments, what-if simulations, savings targets. Anything it
//! cannot parse goes to the LLM as a guarded general question. Command
//! wording is matched, not understood — this is deliberately not NLU.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::agents::{Agent, StageContext};
use crate::error::PipelineError;
use crate::security::{Capability, PromptGuard};
use crate::Result;

const SYSTEM_PROMPT: &str = "You are a personal-finance assistant answering \
a follow-up question about a budget report. Be brief and concrete.";

fn amount_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$?(\d+(?:\.\d+)?)").unwrap())
}

pub struct ConversationAgent;

impl ConversationAgent {
    fn extract_amount(message: &str) -> Option<f64> {
        amount_pattern()
            .captures(message)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }

    /// Find which report category the message refers to.
    fn extract_category(message: &str, report: &Value) -> Option<String> {
        let message_lower = message.to_lowercase();
        report
            .get("category_breakdown")
            .and_then(Value::as_object)?
            .keys()
            .find(|category| message_lower.contains(&category.to_lowercase()))
            .cloned()
    }

    fn current_suggestion(report: &Value, category: &str) -> Option<f64> {
        report
            .get("budget_suggestions")
            .and_then(Value::as_array)?
            .iter()
            .find(|s| {
                s.get("category")
                    .and_then(Value::as_str)
                    .map(|c| c.eq_ignore_ascii_case(category))
                    .unwrap_or(false)
            })?
            .get("suggested_budget")
            .and_then(Value::as_f64)
    }

    fn simulate_reduction(report: &Value, category: &str, amount: f64) -> Value {
        let total_income = report
            .get("total_income")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let total_expense = report
            .get("total_expense")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let projected_expense = (total_expense - amount).max(0.0);
        let projected_savings_rate = if total_income > 0.0 {
            ((total_income - projected_expense) / total_income) * 100.0
        } else {
            0.0
        };

        json!({
            "category": category,
            "reduction": amount,
            "projected_expense": projected_expense,
            "projected_savings_rate": (projected_savings_rate * 10.0).round() / 10.0,
        })
    }
}

#[async_trait::async_trait]
impl Agent for ConversationAgent {
    fn name(&self) -> &'static str {
        "conversation"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles, Capability::CallLlm]
    }

    async fn execute(&self, ctx: &StageContext, input: &Value) -> Result<Value> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Permanent("refinement message is required".into()))?;
        let report = input.get("report").cloned().unwrap_or(json!({}));

        let message_lower = message.to_lowercase();
        let amount = Self::extract_amount(message);
        let category = Self::extract_category(message, &report);

        // What-if is checked first: it mentions reduce/increase wording
        // but must never modify the report.
        if message_lower.contains("what if") {
            return Ok(match (category, amount) {
                (Some(category), Some(amount)) => {
                    let simulation = Self::simulate_reduction(&report, &category, amount);
                    json!({
                        "action": "what_if",
                        "message": format!(
                            "Spending ${:.2} less on {} would put your savings rate at {}%.",
                            amount, category, simulation["projected_savings_rate"]
                        ),
                        "simulation": simulation,
                    })
                }
                _ => json!({
                    "action": "clarify",
                    "message": "Tell me the category and amount, e.g. 'what if I spend $100 less on Food?'",
                }),
            });
        }

        let reduces = message_lower.contains("reduce")
            || message_lower.contains("cut")
            || message_lower.contains("lower");
        let increases = message_lower.contains("increase") || message_lower.contains("raise");

        if reduces || increases {
            let (Some(category), Some(amount)) = (category, amount) else {
                return Ok(json!({
                    "action": "clarify",
                    "message": "Which category, and by how much?",
                }));
            };

            let current = Self::current_suggestion(&report, &category).unwrap_or(0.0);
            let target = if message_lower.contains(" to ") {
                amount
            } else if reduces {
                (current - amount).max(0.0)
            } else {
                current + amount
            };

            return Ok(json!({
                "action": "adjust_budget",
                "category": category,
                "amount": target,
                "message": format!("Setting the {} budget to ${:.2}.", category, target),
            }));
        }

        if message_lower.contains("save") {
            let Some(amount) = amount else {
                return Ok(json!({
                    "action": "clarify",
                    "message": "How much would you like to save?",
                }));
            };
            return Ok(json!({
                "action": "adjust_budget",
                "category": "Savings",
                "amount": amount,
                "message": format!("Targeting ${:.2} in savings.", amount),
            }));
        }

        // Unrecognized command: answer as a guarded general question.
        let prompt = format!(
            "Report: {}\n\nQuestion: {}",
            report
                .get("report_text")
                .and_then(Value::as_str)
                .unwrap_or("(no report)"),
            PromptGuard::wrap_untrusted(message),
        );
        let answer = ctx.call_llm(self.name(), SYSTEM_PROMPT, &prompt).await?;

        Ok(json!({
            "action": "general",
            "message": answer,
        }))
    }
}
