//! Core data models for the pipeline orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Workflow =================
//

/// Pipeline stage the session will execute next.
///
/// The main path is INIT → INGEST → CATEGORIZE → ANALYZE → BUDGET →
/// EVALUATE → REPORT → COMPLETE. REFINE is the post-report conversational
/// loop; WAITING_APPROVAL is the human-in-the-loop interrupt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Init,
    Ingest,
    Categorize,
    Analyze,
    Budget,
    Evaluate,
    Report,
    Refine,
    WaitingApproval,
    Complete,
    Failed,
}

impl WorkflowState {
    /// The single next state on the deterministic main path.
    /// `WaitingApproval` has no static successor — the session resumes to
    /// the state recorded when the interrupt fired.
    pub fn successor(&self) -> Option<WorkflowState> {
        match self {
            WorkflowState::Init => Some(WorkflowState::Ingest),
            WorkflowState::Ingest => Some(WorkflowState::Categorize),
            WorkflowState::Categorize => Some(WorkflowState::Analyze),
            WorkflowState::Analyze => Some(WorkflowState::Budget),
            WorkflowState::Budget => Some(WorkflowState::Evaluate),
            WorkflowState::Evaluate => Some(WorkflowState::Report),
            WorkflowState::Report => Some(WorkflowState::Complete),
            WorkflowState::Refine => Some(WorkflowState::Report),
            WorkflowState::WaitingApproval => None,
            WorkflowState::Complete | WorkflowState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Complete | WorkflowState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Init => "INIT",
            WorkflowState::Ingest => "INGEST",
            WorkflowState::Categorize => "CATEGORIZE",
            WorkflowState::Analyze => "ANALYZE",
            WorkflowState::Budget => "BUDGET",
            WorkflowState::Evaluate => "EVALUATE",
            WorkflowState::Report => "REPORT",
            WorkflowState::Refine => "REFINE",
            WorkflowState::WaitingApproval => "WAITING_APPROVAL",
            WorkflowState::Complete => "COMPLETE",
            WorkflowState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<WorkflowState> {
        match value {
            "INIT" => Some(WorkflowState::Init),
            "INGEST" => Some(WorkflowState::Ingest),
            "CATEGORIZE" => Some(WorkflowState::Categorize),
            "ANALYZE" => Some(WorkflowState::Analyze),
            "BUDGET" => Some(WorkflowState::Budget),
            "EVALUATE" => Some(WorkflowState::Evaluate),
            "REPORT" => Some(WorkflowState::Report),
            "REFINE" => Some(WorkflowState::Refine),
            "WAITING_APPROVAL" => Some(WorkflowState::WaitingApproval),
            "COMPLETE" => Some(WorkflowState::Complete),
            "FAILED" => Some(WorkflowState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Session =================
//

/// The unit of work. Owned by exactly one user; mutated only by the
/// orchestrator under the per-session execution lock. Never deleted,
/// only marked terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub state: WorkflowState,
    /// State to return to when a pending approval resolves.
    pub resume_state: Option<WorkflowState>,
    /// Stage agents already finished, in execution order.
    pub completed_agents: Vec<String>,
    pub iteration_count: u32,
    pub token_count: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: Uuid, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            state: WorkflowState::Init,
            resume_state: None,
            completed_agents: Vec::new(),
            iteration_count: 0,
            token_count: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Output of one stage execution. Immutable once produced; appended to
/// the session trace. `output` is the opaque payload consumed by the
/// next stage and replayed verbatim for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub agent_name: String,
    pub output: serde_json::Value,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub attempts: u32,
    /// True when the fallback manager supplied this result.
    pub degraded: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Checkpoint =================
//

/// Durable snapshot of a session. Many per session, ordered by sequence;
/// never mutated, only superseded by a newer one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub state: WorkflowState,
    pub completed_agents: Vec<String>,
    /// Serialized session context (stage outputs keyed by agent name).
    pub payload: serde_json::Value,
    /// SHA-256 of the payload, for integrity verification.
    pub payload_hash: String,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
}

//
// ================= Session Guard =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    None,
    MaxIterations,
    MaxTokens,
    MaxRuntime,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::None => "NONE",
            TerminationReason::MaxIterations => "MAX_ITERATIONS",
            TerminationReason::MaxTokens => "MAX_TOKENS",
            TerminationReason::MaxRuntime => "MAX_RUNTIME",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardStatus {
    Running,
    Completed,
    ForcedTermination,
}

//
// ================= Approval =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    HighRiskTransaction,
    AnomalyDetected,
    BudgetOverride,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalKind::HighRiskTransaction => "high_risk_transaction",
            ApprovalKind::AnomalyDetected => "anomaly_detected",
            ApprovalKind::BudgetOverride => "budget_override",
        };
        write!(f, "{}", s)
    }
}

/// Human-in-the-loop interrupt. Created by the orchestrator when a stage
/// output breaches a risk threshold; resolved only by an external actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub kind: ApprovalKind,
    pub description: String,
    pub risk_score: f64,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

//
// ================= Security =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityCategory {
    UnauthorizedAction,
    PromptInjection,
    TokenLimitExceeded,
    CrossUserAccess,
    SandboxBreach,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityDecision {
    Allowed,
    Blocked,
}

/// Append-only audit record of a privilege-gate or prompt-guard decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub agent: String,
    pub category: SecurityCategory,
    pub severity: Severity,
    pub decision: SecurityDecision,
    pub detail: String,
}

//
// ================= Event Log =================
//

/// One entry per orchestrator transition, including failed attempts.
/// Append-only; the replayable audit trail for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub state: WorkflowState,
    pub agent: String,
    pub error: bool,
    pub detail: serde_json::Value,
}

//
// ================= Domain Records =================
//

/// A single financial transaction. Positive amounts are income,
/// negative amounts are expenses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub date: String,
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Aggregated view of a transaction set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub total_income: f64,
    pub total_expense: f64,
    pub net_savings: f64,
    pub savings_rate: f64,
    pub category_breakdown: std::collections::BTreeMap<String, f64>,
    pub uncategorized_total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub transaction_id: String,
    pub reason: String,
    pub risk_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetRecommendation {
    pub category: String,
    pub suggested_budget: f64,
    pub reasoning: String,
}

/// Final report assembled by the reporting stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialReport {
    pub total_income: f64,
    pub total_expense: f64,
    pub savings_rate: f64,
    pub category_breakdown: std::collections::BTreeMap<String, f64>,
    pub budget_suggestions: Vec<BudgetRecommendation>,
    pub anomalies: Vec<Anomaly>,
    #[serde(default)]
    pub degraded: bool,
}

/// One month of aggregated history, served from long-term memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub month: String,
    pub total_income: f64,
    pub total_expense: f64,
    pub savings_rate: f64,
}
