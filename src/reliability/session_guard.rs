//! Session guard
//!
//! Last line of defense against runaway loops: per-session counters for
//! iterations, tokens, and runtime. Once any cap trips, the record is
//! terminal — every subsequent stage attempt fails immediately with a
//! cap-exceeded error regardless of orchestrator state. Executed
//! iterations and rejected attempts are tracked separately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::config::SessionLimits;
use crate::error::PipelineError;
use crate::models::{GuardStatus, TerminationReason};
use crate::Result;

#[derive(Debug)]
struct GuardRecord {
    limits: SessionLimits,
    iterations: u32,
    tokens_used: u64,
    rejected_attempts: u32,
    started_at: Instant,
    status: GuardStatus,
    termination_reason: TerminationReason,
}

/// Point-in-time view of one session's counters.
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub session_id: Uuid,
    pub iterations: u32,
    pub tokens_used: u64,
    pub rejected_attempts: u32,
    pub status: GuardStatus,
    pub termination_reason: TerminationReason,
}

pub struct SessionGuard {
    default_limits: SessionLimits,
    records: RwLock<HashMap<Uuid, Arc<Mutex<GuardRecord>>>>,
}

impl SessionGuard {
    pub fn new(default_limits: SessionLimits) -> Self {
        Self {
            default_limits,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize counters for a session. Re-starting an existing session
    /// resets nothing — the first record wins.
    pub async fn start(&self, session_id: Uuid, limits: Option<SessionLimits>) {
        let mut records = self.records.write().await;
        records.entry(session_id).or_insert_with(|| {
            Arc::new(Mutex::new(GuardRecord {
                limits: limits.unwrap_or(self.default_limits),
                iterations: 0,
                tokens_used: 0,
                rejected_attempts: 0,
                started_at: Instant::now(),
                status: GuardStatus::Running,
                termination_reason: TerminationReason::None,
            }))
        });
    }

    async fn record_for(&self, session_id: Uuid) -> Option<Arc<Mutex<GuardRecord>>> {
        let records = self.records.read().await;
        records.get(&session_id).cloned()
    }

    /// Account for one stage attempt. Trips the guard when the iteration
    /// or runtime cap would be exceeded; a tripped guard rejects every
    /// further attempt without incrementing the executed count.
    pub async fn record_iteration(&self, session_id: Uuid) -> Result<()> {
        let record = self
            .record_for(session_id)
            .await
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let mut record = record.lock().await;

        if record.status == GuardStatus::ForcedTermination {
            record.rejected_attempts += 1;
            return Err(PipelineError::GuardExceeded {
                reason: record.termination_reason,
            });
        }

        if record.iterations >= record.limits.max_iterations {
            record.rejected_attempts += 1;
            Self::trip(&mut record, session_id, TerminationReason::MaxIterations);
            return Err(PipelineError::GuardExceeded {
                reason: TerminationReason::MaxIterations,
            });
        }

        if record.started_at.elapsed() > record.limits.max_runtime {
            record.rejected_attempts += 1;
            Self::trip(&mut record, session_id, TerminationReason::MaxRuntime);
            return Err(PipelineError::GuardExceeded {
                reason: TerminationReason::MaxRuntime,
            });
        }

        record.iterations += 1;
        Ok(())
    }

    /// Account for tokens consumed by a finished stage. Exceeding the cap
    /// trips the guard so no further stages run.
    pub async fn record_tokens(&self, session_id: Uuid, tokens: u64) -> Result<()> {
        let record = self
            .record_for(session_id)
            .await
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let mut record = record.lock().await;

        record.tokens_used += tokens;

        if record.status == GuardStatus::Running && record.tokens_used > record.limits.max_tokens {
            Self::trip(&mut record, session_id, TerminationReason::MaxTokens);
            return Err(PipelineError::GuardExceeded {
                reason: TerminationReason::MaxTokens,
            });
        }

        Ok(())
    }

    /// Mark a session's guard as cleanly finished.
    pub async fn complete(&self, session_id: Uuid) {
        if let Some(record) = self.record_for(session_id).await {
            let mut record = record.lock().await;
            if record.status == GuardStatus::Running {
                record.status = GuardStatus::Completed;
            }
        }
    }

    pub async fn snapshot(&self, session_id: Uuid) -> Option<GuardSnapshot> {
        let record = self.record_for(session_id).await?;
        let record = record.lock().await;
        Some(GuardSnapshot {
            session_id,
            iterations: record.iterations,
            tokens_used: record.tokens_used,
            rejected_attempts: record.rejected_attempts,
            status: record.status,
            termination_reason: record.termination_reason,
        })
    }

    fn trip(record: &mut GuardRecord, session_id: Uuid, reason: TerminationReason) {
        warn!(
            session_id = %session_id,
            reason = %reason,
            iterations = record.iterations,
            tokens_used = record.tokens_used,
            "Session guard forced termination"
        );
        record.status = GuardStatus::ForcedTermination;
        record.termination_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_iterations: u32) -> SessionLimits {
        SessionLimits {
            max_iterations,
            max_tokens: 1000,
            max_runtime: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_sixth_iteration_trips_max_iterations() {
        let guard = SessionGuard::new(limits(5));
        let session_id = Uuid::new_v4();
        guard.start(session_id, None).await;

        for _ in 0..5 {
            guard.record_iteration(session_id).await.unwrap();
        }

        let result = guard.record_iteration(session_id).await;
        match result {
            Err(PipelineError::GuardExceeded { reason }) => {
                assert_eq!(reason, TerminationReason::MaxIterations);
            }
            other => panic!("expected GuardExceeded, got {:?}", other),
        }

        let snapshot = guard.snapshot(session_id).await.unwrap();
        assert_eq!(snapshot.status, GuardStatus::ForcedTermination);
        assert_eq!(snapshot.termination_reason, TerminationReason::MaxIterations);
        assert_eq!(snapshot.iterations, 5);
        assert_eq!(snapshot.rejected_attempts, 1);
    }

    #[tokio::test]
    async fn test_tripped_guard_rejects_everything() {
        let guard = SessionGuard::new(limits(1));
        let session_id = Uuid::new_v4();
        guard.start(session_id, None).await;

        guard.record_iteration(session_id).await.unwrap();
        assert!(guard.record_iteration(session_id).await.is_err());
        assert!(guard.record_iteration(session_id).await.is_err());

        let snapshot = guard.snapshot(session_id).await.unwrap();
        assert_eq!(snapshot.iterations, 1);
        assert_eq!(snapshot.rejected_attempts, 2);
    }

    #[tokio::test]
    async fn test_token_cap_trips() {
        let guard = SessionGuard::new(limits(100));
        let session_id = Uuid::new_v4();
        guard.start(session_id, None).await;

        guard.record_tokens(session_id, 600).await.unwrap();
        let result = guard.record_tokens(session_id, 600).await;
        match result {
            Err(PipelineError::GuardExceeded { reason }) => {
                assert_eq!(reason, TerminationReason::MaxTokens);
            }
            other => panic!("expected GuardExceeded, got {:?}", other),
        }

        // Iterations are now rejected too.
        assert!(guard.record_iteration(session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_cap_trips() {
        let guard = SessionGuard::new(SessionLimits {
            max_iterations: 100,
            max_tokens: 1000,
            max_runtime: Duration::ZERO,
        });
        let session_id = Uuid::new_v4();
        guard.start(session_id, None).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = guard.record_iteration(session_id).await;
        match result {
            Err(PipelineError::GuardExceeded { reason }) => {
                assert_eq!(reason, TerminationReason::MaxRuntime);
            }
            other => panic!("expected GuardExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_error() {
        let guard = SessionGuard::new(limits(5));
        assert!(guard.record_iteration(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_marks_status() {
        let guard = SessionGuard::new(limits(5));
        let session_id = Uuid::new_v4();
        guard.start(session_id, None).await;
        guard.complete(session_id).await;

        let snapshot = guard.snapshot(session_id).await.unwrap();
        assert_eq!(snapshot.status, GuardStatus::Completed);
    }
}
