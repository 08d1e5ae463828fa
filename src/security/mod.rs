//! Privilege model and security event log
//!
//! Every agent has a fixed grant of capabilities. Before a stage performs
//! a privileged action the gate checks the grant; a denial is fatal to the
//! stage and never retried. All decisions worth auditing land in the
//! append-only security event log.

pub mod prompt_guard;
pub mod sandbox;

pub use prompt_guard::PromptGuard;
pub use sandbox::Sandbox;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    SecurityCategory, SecurityDecision, SecurityEvent, Severity,
};
use crate::Result;

/// Privileged action classes an agent may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadFiles,
    WriteFiles,
    WriteDb,
    CallLlm,
    UseRetrieval,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ReadFiles => "read_files",
            Capability::WriteFiles => "write_files",
            Capability::WriteDb => "write_db",
            Capability::CallLlm => "call_llm",
            Capability::UseRetrieval => "use_retrieval",
        }
    }
}

struct Grant {
    agent: &'static str,
    capabilities: &'static [Capability],
    /// Max tokens for a single LLM call (0 = LLM disabled).
    max_llm_tokens: u64,
}

/// Fixed per-agent capability grants. An agent absent from this table
/// has no privileges at all.
const GRANTS: &[Grant] = &[
    Grant {
        agent: "orchestrator",
        capabilities: &[Capability::ReadFiles],
        max_llm_tokens: 0,
    },
    Grant {
        agent: "ingestion",
        capabilities: &[Capability::ReadFiles, Capability::WriteFiles, Capability::WriteDb],
        max_llm_tokens: 0,
    },
    Grant {
        agent: "categorization",
        capabilities: &[Capability::ReadFiles, Capability::CallLlm],
        max_llm_tokens: 2048,
    },
    Grant {
        agent: "analysis",
        capabilities: &[Capability::ReadFiles],
        max_llm_tokens: 0,
    },
    Grant {
        agent: "budgeting",
        capabilities: &[Capability::ReadFiles, Capability::CallLlm, Capability::UseRetrieval],
        max_llm_tokens: 1024,
    },
    Grant {
        agent: "evaluation",
        capabilities: &[Capability::ReadFiles, Capability::UseRetrieval],
        max_llm_tokens: 0,
    },
    Grant {
        agent: "reporting",
        capabilities: &[Capability::ReadFiles, Capability::WriteFiles],
        max_llm_tokens: 0,
    },
    Grant {
        agent: "conversation",
        capabilities: &[Capability::ReadFiles, Capability::CallLlm],
        max_llm_tokens: 1024,
    },
];

fn grant_for(agent: &str) -> Option<&'static Grant> {
    GRANTS.iter().find(|g| g.agent == agent)
}

//
// ================= Security Event Log =================
//

/// Append-only sink for gate and guard decisions.
#[derive(Clone, Default)]
pub struct SecurityLog {
    events: Arc<RwLock<Vec<SecurityEvent>>>,
}

impl SecurityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: SecurityEvent) {
        if event.decision == SecurityDecision::Blocked {
            warn!(
                agent = %event.agent,
                category = ?event.category,
                severity = ?event.severity,
                detail = %event.detail,
                "Security event: blocked"
            );
        }
        let mut events = self.events.write().await;
        events.push(event);
    }

    pub async fn events_for_session(&self, session_id: Uuid) -> Vec<SecurityEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub async fn blocked_count(&self) -> usize {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|e| e.decision == SecurityDecision::Blocked)
            .count()
    }
}

//
// ================= Privilege Gate =================
//

/// Checks stage capability requirements against the fixed grant table.
pub struct PrivilegeGate {
    log: SecurityLog,
}

impl PrivilegeGate {
    pub fn new(log: SecurityLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &SecurityLog {
        &self.log
    }

    /// Authorize `agent` to perform every capability in `required`.
    /// A missing grant raises `SecurityViolation` (severity HIGH) and the
    /// action must not execute.
    pub async fn authorize(
        &self,
        session_id: Uuid,
        agent: &str,
        required: &[Capability],
    ) -> Result<()> {
        let granted = grant_for(agent).map(|g| g.capabilities).unwrap_or(&[]);

        for capability in required {
            if !granted.contains(capability) {
                let detail = format!(
                    "agent '{}' is not authorized to perform '{}'",
                    agent,
                    capability.as_str()
                );
                self.log
                    .record(SecurityEvent {
                        timestamp: Utc::now(),
                        session_id,
                        agent: agent.to_string(),
                        category: SecurityCategory::UnauthorizedAction,
                        severity: Severity::High,
                        decision: SecurityDecision::Blocked,
                        detail: detail.clone(),
                    })
                    .await;
                return Err(PipelineError::SecurityViolation {
                    agent: agent.to_string(),
                    detail,
                });
            }
        }

        self.log
            .record(SecurityEvent {
                timestamp: Utc::now(),
                session_id,
                agent: agent.to_string(),
                category: SecurityCategory::UnauthorizedAction,
                severity: Severity::Low,
                decision: SecurityDecision::Allowed,
                detail: required
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            })
            .await;

        Ok(())
    }

    /// Authorize an LLM call, additionally enforcing the per-agent token
    /// ceiling from the grant table.
    pub async fn authorize_llm_call(
        &self,
        session_id: Uuid,
        agent: &str,
        token_estimate: u64,
    ) -> Result<()> {
        self.authorize(session_id, agent, &[Capability::CallLlm])
            .await?;

        let max_tokens = grant_for(agent).map(|g| g.max_llm_tokens).unwrap_or(0);
        if max_tokens > 0 && token_estimate > max_tokens {
            let detail = format!(
                "token estimate {} exceeds per-call limit {} for agent '{}'",
                token_estimate, max_tokens, agent
            );
            self.log
                .record(SecurityEvent {
                    timestamp: Utc::now(),
                    session_id,
                    agent: agent.to_string(),
                    category: SecurityCategory::TokenLimitExceeded,
                    severity: Severity::Medium,
                    decision: SecurityDecision::Blocked,
                    detail: detail.clone(),
                })
                .await;
            return Err(PipelineError::SecurityViolation {
                agent: agent.to_string(),
                detail,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authorized_action_allowed() {
        let gate = PrivilegeGate::new(SecurityLog::new());
        let session_id = Uuid::new_v4();

        let result = gate
            .authorize(session_id, "categorization", &[Capability::CallLlm])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_capability_blocked_and_logged() {
        let log = SecurityLog::new();
        let gate = PrivilegeGate::new(log.clone());
        let session_id = Uuid::new_v4();

        let result = gate
            .authorize(session_id, "analysis", &[Capability::CallLlm])
            .await;

        match result {
            Err(PipelineError::SecurityViolation { agent, .. }) => {
                assert_eq!(agent, "analysis");
            }
            other => panic!("expected SecurityViolation, got {:?}", other),
        }

        let events = log.events_for_session(session_id).await;
        let blocked: Vec<_> = events
            .iter()
            .filter(|e| e.decision == SecurityDecision::Blocked)
            .collect();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].severity, Severity::High);
        assert_eq!(blocked[0].category, SecurityCategory::UnauthorizedAction);
    }

    #[tokio::test]
    async fn test_unknown_agent_has_no_privileges() {
        let gate = PrivilegeGate::new(SecurityLog::new());
        let result = gate
            .authorize(Uuid::new_v4(), "mystery", &[Capability::ReadFiles])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_llm_token_ceiling() {
        let gate = PrivilegeGate::new(SecurityLog::new());
        let session_id = Uuid::new_v4();

        assert!(gate
            .authorize_llm_call(session_id, "categorization", 512)
            .await
            .is_ok());
        assert!(gate
            .authorize_llm_call(session_id, "categorization", 10_000)
            .await
            .is_err());
    }
}
