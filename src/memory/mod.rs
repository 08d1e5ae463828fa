//! Session and long-term memory
//!
//! Short-term memory is session-scoped workflow state; long-term memory
//! holds a user's transaction history and monthly summaries. Every call
//! validates `user_id` ownership — a cross-user read is rejected with a
//! `SecurityViolation` and recorded as a security event, never served.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    MonthlySummary, SecurityCategory, SecurityDecision, SecurityEvent, Severity, Transaction,
    WorkflowState,
};
use crate::security::SecurityLog;
use crate::Result;

/// Session-scoped state snapshot kept in short-term memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub workflow_state: WorkflowState,
    pub context: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    stm: HashMap<Uuid, StmRecord>,
    transactions: HashMap<Uuid, Vec<Transaction>>,
}

pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    security_log: SecurityLog,
}

impl MemoryStore {
    pub fn new(security_log: SecurityLog) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            security_log,
        }
    }

    async fn reject_cross_user(
        &self,
        session_id: Uuid,
        owner: Uuid,
        requester: Uuid,
    ) -> PipelineError {
        let detail = format!(
            "user {} attempted to access session {} owned by {}",
            requester, session_id, owner
        );
        self.security_log
            .record(SecurityEvent {
                timestamp: Utc::now(),
                session_id,
                agent: "memory".to_string(),
                category: SecurityCategory::CrossUserAccess,
                severity: Severity::High,
                decision: SecurityDecision::Blocked,
                detail: detail.clone(),
            })
            .await;
        PipelineError::SecurityViolation {
            agent: "memory".to_string(),
            detail,
        }
    }

    /// Read session state. Rejects callers who do not own the session.
    pub async fn get_stm(&self, session_id: Uuid, user_id: Uuid) -> Result<StmRecord> {
        let record = {
            let state = self.state.read().await;
            state
                .stm
                .get(&session_id)
                .cloned()
                .ok_or(PipelineError::SessionNotFound(session_id))?
        };

        if record.user_id != user_id {
            return Err(self.reject_cross_user(session_id, record.user_id, user_id).await);
        }

        Ok(record)
    }

    /// Write session state. The first write binds the session to its
    /// owner; later writes from a different user are rejected.
    pub async fn put_stm(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        workflow_state: WorkflowState,
        context: Value,
    ) -> Result<()> {
        let existing_owner = {
            let state = self.state.read().await;
            state.stm.get(&session_id).map(|r| r.user_id)
        };

        if let Some(owner) = existing_owner {
            if owner != user_id {
                return Err(self.reject_cross_user(session_id, owner, user_id).await);
            }
        }

        let mut state = self.state.write().await;
        state.stm.insert(
            session_id,
            StmRecord {
                session_id,
                user_id,
                workflow_state,
                context,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Append transactions to a user's long-term history.
    pub async fn append_transactions(
        &self,
        user_id: Uuid,
        transactions: Vec<Transaction>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .transactions
            .entry(user_id)
            .or_insert_with(Vec::new)
            .extend(transactions);
        Ok(())
    }

    pub async fn get_transactions(&self, user_id: Uuid) -> Vec<Transaction> {
        let state = self.state.read().await;
        state.transactions.get(&user_id).cloned().unwrap_or_default()
    }

    /// Monthly income/expense summaries derived from the user's history,
    /// keyed by `YYYY-MM`, oldest first.
    pub async fn get_monthly_summaries(&self, user_id: Uuid) -> Vec<MonthlySummary> {
        let transactions = self.get_transactions(user_id).await;

        let mut by_month: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for txn in &transactions {
            let month = txn.date.get(..7).unwrap_or("unknown").to_string();
            let entry = by_month.entry(month).or_insert((0.0, 0.0));
            if txn.amount > 0.0 {
                entry.0 += txn.amount;
            } else {
                entry.1 += txn.amount.abs();
            }
        }

        by_month
            .into_iter()
            .map(|(month, (income, expense))| MonthlySummary {
                month,
                total_income: income,
                total_expense: expense,
                savings_rate: if income > 0.0 {
                    ((income - expense) / income) * 100.0
                } else {
                    0.0
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn txn(date: &str, amount: f64) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4().to_string(),
            date: date.to_string(),
            description: "test".to_string(),
            amount,
            category: None,
        }
    }

    #[tokio::test]
    async fn test_stm_roundtrip() {
        let store = MemoryStore::new(SecurityLog::new());
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        store
            .put_stm(session_id, user_id, WorkflowState::Ingest, json!({}))
            .await
            .unwrap();

        let record = store.get_stm(session_id, user_id).await.unwrap();
        assert_eq!(record.workflow_state, WorkflowState::Ingest);
    }

    #[tokio::test]
    async fn test_cross_user_read_rejected() {
        let log = SecurityLog::new();
        let store = MemoryStore::new(log.clone());
        let session_id = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        store
            .put_stm(session_id, user_a, WorkflowState::Analyze, json!({"secret": 1}))
            .await
            .unwrap();

        let result = store.get_stm(session_id, user_b).await;
        assert!(matches!(
            result,
            Err(PipelineError::SecurityViolation { .. })
        ));

        let events = log.events_for_session(session_id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, SecurityCategory::CrossUserAccess);
        assert_eq!(events[0].decision, SecurityDecision::Blocked);
    }

    #[tokio::test]
    async fn test_cross_user_write_rejected() {
        let store = MemoryStore::new(SecurityLog::new());
        let session_id = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        store
            .put_stm(session_id, user_a, WorkflowState::Ingest, json!({}))
            .await
            .unwrap();

        let result = store
            .put_stm(session_id, user_b, WorkflowState::Ingest, json!({}))
            .await;
        assert!(result.is_err());

        // Owner's record is untouched.
        let record = store.get_stm(session_id, user_a).await.unwrap();
        assert_eq!(record.user_id, user_a);
    }

    #[tokio::test]
    async fn test_monthly_summaries() {
        let store = MemoryStore::new(SecurityLog::new());
        let user_id = Uuid::new_v4();

        store
            .append_transactions(
                user_id,
                vec![
                    txn("2025-05-01", 4000.0),
                    txn("2025-05-10", -1000.0),
                    txn("2025-06-01", 4000.0),
                    txn("2025-06-15", -3000.0),
                ],
            )
            .await
            .unwrap();

        let summaries = store.get_monthly_summaries(user_id).await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].month, "2025-05");
        assert_eq!(summaries[0].savings_rate, 75.0);
        assert_eq!(summaries[1].month, "2025-06");
        assert_eq!(summaries[1].savings_rate, 25.0);
    }

    #[tokio::test]
    async fn test_transactions_are_per_user() {
        let store = MemoryStore::new(SecurityLog::new());
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        store
            .append_transactions(user_a, vec![txn("2025-06-01", 100.0)])
            .await
            .unwrap();

        assert_eq!(store.get_transactions(user_a).await.len(), 1);
        assert!(store.get_transactions(user_b).await.is_empty());
    }
}
