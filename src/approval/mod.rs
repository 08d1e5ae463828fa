//! Human approval management
//!
//! Threshold-based approval triggers with immutable decisions. At most
//! one request per session is pending at a time; later breaches queue
//! behind it and are issued only when the head resolves. The orchestrator
//! persists `WAITING_APPROVAL` and returns — nothing blocks a thread
//! waiting for a human.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::ApprovalThresholds;
use crate::error::PipelineError;
use crate::models::{ApprovalKind, ApprovalRequest, ApprovalStatus};
use crate::Result;

#[derive(Default)]
struct ApprovalState {
    requests: HashMap<Uuid, ApprovalRequest>,
    /// Front is the one issued request per session; the rest are queued.
    per_session: HashMap<Uuid, VecDeque<Uuid>>,
}

pub struct ApprovalManager {
    thresholds: ApprovalThresholds,
    state: Arc<RwLock<ApprovalState>>,
}

impl ApprovalManager {
    pub fn new(thresholds: ApprovalThresholds) -> Self {
        Self {
            thresholds,
            state: Arc::new(RwLock::new(ApprovalState::default())),
        }
    }

    /// Policy check: does a risk score of this kind require a human?
    pub fn needs_approval(&self, kind: ApprovalKind, risk_score: f64) -> bool {
        let threshold = match kind {
            ApprovalKind::AnomalyDetected => self.thresholds.anomaly,
            ApprovalKind::HighRiskTransaction => self.thresholds.high_risk_transaction,
            ApprovalKind::BudgetOverride => self.thresholds.budget_override,
        };
        risk_score > threshold
    }

    /// Create a request. If the session already has one pending, the new
    /// request queues behind it rather than being issued concurrently.
    pub async fn request(
        &self,
        session_id: Uuid,
        kind: ApprovalKind,
        description: String,
        risk_score: f64,
    ) -> ApprovalRequest {
        let request = ApprovalRequest {
            request_id: Uuid::new_v4(),
            session_id,
            kind,
            description,
            risk_score,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };

        let mut state = self.state.write().await;
        state.requests.insert(request.request_id, request.clone());
        let queue = state.per_session.entry(session_id).or_default();
        queue.push_back(request.request_id);

        info!(
            session_id = %session_id,
            request_id = %request.request_id,
            kind = %kind,
            risk_score,
            queued_behind = queue.len() - 1,
            "Approval requested"
        );

        request
    }

    /// Resolve a pending request. Decisions are immutable: resolving an
    /// already-resolved request is an error.
    pub async fn resolve(
        &self,
        request_id: Uuid,
        approve: bool,
        approver: &str,
    ) -> Result<ApprovalRequest> {
        let mut state = self.state.write().await;

        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| PipelineError::ApprovalNotFound(request_id.to_string()))?;

        if request.status != ApprovalStatus::Pending {
            return Err(PipelineError::Permanent(format!(
                "approval request {} already resolved",
                request_id
            )));
        }

        request.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.resolved_at = Some(Utc::now());
        request.resolved_by = Some(approver.to_string());
        let resolved = request.clone();

        if let Some(queue) = state.per_session.get_mut(&resolved.session_id) {
            queue.retain(|id| *id != request_id);
        }

        info!(
            request_id = %request_id,
            approved = approve,
            approver = %approver,
            "Approval resolved"
        );

        Ok(resolved)
    }

    /// The currently issued (front-of-queue) pending request for a
    /// session, if any.
    pub async fn pending_for_session(&self, session_id: Uuid) -> Option<ApprovalRequest> {
        let state = self.state.read().await;
        let queue = state.per_session.get(&session_id)?;
        let front = queue.front()?;
        state.requests.get(front).cloned()
    }

    pub async fn get(&self, request_id: Uuid) -> Option<ApprovalRequest> {
        let state = self.state.read().await;
        state.requests.get(&request_id).cloned()
    }

    pub async fn is_approved(&self, request_id: Uuid) -> bool {
        self.get(request_id)
            .await
            .map(|r| r.status == ApprovalStatus::Approved)
            .unwrap_or(false)
    }
}
