//! Error types for the financial pipeline orchestrator

use thiserror::Error;

use crate::models::TerminationReason;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Stage Execution Errors
    // =============================

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Security violation by agent '{agent}': {detail}")]
    SecurityViolation { agent: String, detail: String },

    #[error("Sandbox violation for agent '{agent}': {detail}")]
    SandboxViolation { agent: String, detail: String },

    #[error("Session cap exceeded: {reason}")]
    GuardExceeded { reason: TerminationReason },

    #[error("Approval request {0} was rejected")]
    ApprovalRejected(String),

    #[error("Circuit breaker is open for agent: {0}")]
    CircuitOpen(String),

    #[error("Stage '{agent}' failed after {attempts} attempts: {detail}")]
    RetriesExhausted {
        agent: String,
        attempts: u32,
        detail: String,
    },

    // =============================
    // Orchestration Errors
    // =============================

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("No checkpoint found for session: {0}")]
    CheckpointNotFound(uuid::Uuid),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("No agent mapped for state: {0}")]
    NoAgentForState(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the retry manager may attempt this operation again.
    /// Security, sandbox, and validation failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_)
                | PipelineError::HttpError(_)
                | PipelineError::DatabaseError(_)
                | PipelineError::LlmError(_)
        )
    }

    /// Short category label written into event-log entries and surfaced
    /// to clients for failed sessions.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Transient(_) => "transient",
            PipelineError::Permanent(_) => "permanent",
            PipelineError::SecurityViolation { .. } => "security_violation",
            PipelineError::SandboxViolation { .. } => "sandbox_violation",
            PipelineError::GuardExceeded { .. } => "guard_exceeded",
            PipelineError::ApprovalRejected(_) => "approval_rejected",
            PipelineError::CircuitOpen(_) => "circuit_open",
            PipelineError::RetriesExhausted { .. } => "retries_exhausted",
            PipelineError::InvalidTransition { .. } => "invalid_transition",
            PipelineError::SessionNotFound(_) => "session_not_found",
            PipelineError::CheckpointNotFound(_) => "checkpoint_not_found",
            PipelineError::ApprovalNotFound(_) => "approval_not_found",
            PipelineError::NoAgentForState(_) => "no_agent_for_state",
            PipelineError::LlmError(_) => "llm_error",
            PipelineError::DatabaseError(_) => "database_error",
            PipelineError::SerializationError(_) => "serialization_error",
            PipelineError::HttpError(_) => "http_error",
            PipelineError::UuidError(_) => "uuid_error",
            PipelineError::IoError(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Transient("timeout".into()).is_retryable());
        assert!(PipelineError::LlmError("503".into()).is_retryable());
        assert!(!PipelineError::Permanent("bad input".into()).is_retryable());
        assert!(!PipelineError::SecurityViolation {
            agent: "analysis".into(),
            detail: "call_llm denied".into(),
        }
        .is_retryable());
        assert!(!PipelineError::SandboxViolation {
            agent: "budgeting".into(),
            detail: "timeout".into(),
        }
        .is_retryable());
    }
}
