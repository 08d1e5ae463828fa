//! Ingestion stage
//!
//! Parses the raw transaction payload (inline JSON or a file path),
//! validates it, and persists it to the owner's long-term history.
//! This is the one critical stage: when it degrades, the pipeline gets a
//! well-formed empty transaction set rather than an abort.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::agents::{Agent, StageContext};
use crate::error::PipelineError;
use crate::models::Transaction;
use crate::security::Capability;
use crate::Result;

pub struct IngestionAgent;

impl IngestionAgent {
    fn parse_transactions(raw: &Value) -> Result<Vec<Transaction>> {
        let items = raw
            .as_array()
            .ok_or_else(|| PipelineError::Permanent("transactions must be an array".into()))?;

        let mut transactions = Vec::with_capacity(items.len());
        for item in items {
            let amount = item
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| PipelineError::Permanent("transaction amount missing".into()))?;
            if !amount.is_finite() {
                return Err(PipelineError::Permanent(
                    "transaction amount must be finite".into(),
                ));
            }

            let date = item
                .get("date")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::Permanent("transaction date missing".into()))?;
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PipelineError::Permanent("transaction description missing".into())
                })?;

            transactions.push(Transaction {
                transaction_id: item
                    .get("transaction_id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                date: date.to_string(),
                description: description.to_string(),
                amount,
                category: item
                    .get("category")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
            });
        }

        Ok(transactions)
    }
}

#[async_trait::async_trait]
impl Agent for IngestionAgent {
    fn name(&self) -> &'static str {
        "ingestion"
    }

    fn required_capabilities(&self) -> &'static [Capability] {
        &[Capability::ReadFiles, Capability::WriteDb]
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext, input: &Value) -> Result<Value> {
        let raw = if let Some(inline) = input.get("transactions") {
            inline.clone()
        } else if let Some(file_path) = input.get("file_path").and_then(Value::as_str) {
            let contents = tokio::fs::read_to_string(file_path).await?;
            serde_json::from_str(&contents)?
        } else {
            return Err(PipelineError::Permanent(
                "input requires either 'transactions' or 'file_path'".into(),
            ));
        };

        let transactions = Self::parse_transactions(&raw)?;

        ctx.memory
            .append_transactions(ctx.user_id, transactions.clone())
            .await?;

        let count = transactions.len();
        Ok(json!({
            "transactions": transactions,
            "count": count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::stage_context;

    #[tokio::test]
    async fn test_inline_transactions() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let input = json!({
            "transactions": [
                {"date": "2025-06-01", "description": "Salary", "amount": 4000.0},
                {"date": "2025-06-02", "description": "Rent", "amount": -1500.0, "transaction_id": "t2"},
            ]
        });

        let output = IngestionAgent.execute(&ctx, &input).await.unwrap();
        assert_eq!(output["count"], 2);

        let transactions = output["transactions"].as_array().unwrap();
        assert_eq!(transactions[1]["transaction_id"], "t2");
        // Generated IDs are present when missing from the input.
        assert!(transactions[0]["transaction_id"].as_str().is_some());

        // Persisted to the owner's long-term history.
        assert_eq!(ctx.memory.get_transactions(ctx.user_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_payload_is_permanent() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let result = IngestionAgent.execute(&ctx, &json!({})).await;
        match result {
            Err(e) => assert!(!e.is_retryable()),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_malformed_amount_is_permanent() {
        let ctx = stage_context(Uuid::new_v4(), Uuid::new_v4());
        let input = json!({
            "transactions": [
                {"date": "2025-06-01", "description": "Broken", "amount": "not-a-number"},
            ]
        });
        let result = IngestionAgent.execute(&ctx, &input).await;
        assert!(matches!(result, Err(PipelineError::Permanent(_))));
    }
}
