//! Pipeline orchestrator
//!
//! Owns the session record and drives the stage state machine:
//! INIT → INGEST → CATEGORIZE → ANALYZE → BUDGET → EVALUATE → REPORT,
//! with the WAITING_APPROVAL interrupt and the post-report REFINE loop.
//! Each `advance` call executes at most one stage under the per-session
//! execution lock: gate check, retry-wrapped sandboxed execution,
//! checkpoint, event-log append, then the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{default_stage_registry, Agent, StageContext};
use crate::approval::ApprovalManager;
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::event_log::EventLog;
use crate::llm::LlmClient;
use crate::memory::MemoryStore;
use crate::models::{
    ApprovalKind, ApprovalStatus, Session, StageResult, WorkflowState,
};
use crate::observability::Observability;
use crate::reliability::{
    CheckpointStore, CircuitBreakerRegistry, FallbackManager, RetryManager, SessionGuard,
};
use crate::security::{PrivilegeGate, PromptGuard, Sandbox, SecurityLog};
use crate::Result;

/// Outcome of a single `advance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A stage ran (or a bookkeeping transition fired); the session is
    /// now at this state.
    Advanced(WorkflowState),
    /// Progression halted on a pending approval request.
    AwaitingApproval(Uuid),
    Completed,
    /// The session moved to FAILED; carries the error category.
    Failed(String),
}

/// Result of driving a session to a halt state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorResult {
    pub session_id: Uuid,
    pub final_state: WorkflowState,
    pub final_report: Value,
    pub iterations: u32,
    pub success: bool,
    pub error: Option<String>,
    pub pending_approval: Option<Uuid>,
}

/// In-memory session record guarded by the per-session execution lock.
struct SessionRecord {
    session: Session,
    /// Accumulated stage outputs keyed by agent name, plus `input`,
    /// `budget_overrides`, and `refine_message`.
    context: Value,
    trace: Vec<StageResult>,
}

impl SessionRecord {
    fn payload(&self) -> Value {
        json!({
            "session": self.session,
            "context": self.context,
            "trace": self.trace,
        })
    }
}

pub struct Orchestrator {
    stages: HashMap<WorkflowState, Arc<dyn Agent>>,
    gate: Arc<PrivilegeGate>,
    prompt_guard: Arc<PromptGuard>,
    sandbox: Sandbox,
    retry: RetryManager,
    breakers: Arc<CircuitBreakerRegistry>,
    fallback: FallbackManager,
    checkpoints: Arc<CheckpointStore>,
    session_guard: Arc<SessionGuard>,
    approvals: Arc<ApprovalManager>,
    event_log: Arc<EventLog>,
    memory: Arc<MemoryStore>,
    observability: Observability,
    llm: Arc<dyn LlmClient>,
    security_log: SecurityLog,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<SessionRecord>>>>,
}

impl Orchestrator {
    /// Wire the engine. The breaker registry, checkpoint store, and event
    /// log are passed in explicitly: breakers are shared across sessions,
    /// and the two stores must survive a restart of this struct.
    pub fn new(
        config: &EngineConfig,
        llm: Arc<dyn LlmClient>,
        breakers: Arc<CircuitBreakerRegistry>,
        checkpoints: Arc<CheckpointStore>,
        event_log: Arc<EventLog>,
    ) -> Self {
        let security_log = SecurityLog::new();
        Self {
            stages: default_stage_registry(),
            gate: Arc::new(PrivilegeGate::new(security_log.clone())),
            prompt_guard: Arc::new(PromptGuard::new(security_log.clone())),
            sandbox: Sandbox::new(config.sandbox),
            retry: RetryManager::new(config.retry),
            breakers,
            fallback: FallbackManager::new(),
            checkpoints,
            session_guard: Arc::new(SessionGuard::new(config.limits)),
            approvals: Arc::new(ApprovalManager::new(config.approval)),
            event_log,
            memory: Arc::new(MemoryStore::new(security_log.clone())),
            observability: Observability::new(),
            llm,
            security_log,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    pub fn approvals(&self) -> Arc<ApprovalManager> {
        self.approvals.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        self.event_log.clone()
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        self.checkpoints.clone()
    }

    pub fn session_guard(&self) -> Arc<SessionGuard> {
        self.session_guard.clone()
    }

    pub fn security_log(&self) -> &SecurityLog {
        &self.security_log
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    //
    // ================= Session Lifecycle =================
    //

    /// Create a session for `user_id` with the raw input payload.
    pub async fn start_session(&self, user_id: Uuid, input: Value) -> Result<Uuid> {
        let session_id = Uuid::new_v4();
        let session = Session::new(session_id, user_id);

        self.session_guard.start(session_id, None).await;
        self.memory
            .put_stm(session_id, user_id, session.state, json!({}))
            .await?;
        self.event_log
            .append(
                session_id,
                WorkflowState::Init,
                "orchestrator",
                false,
                json!({"status": "session_started"}),
            )
            .await?;

        let record = SessionRecord {
            session,
            context: json!({ "input": input }),
            trace: Vec::new(),
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, Arc::new(Mutex::new(record)));

        info!(session_id = %session_id, user_id = %user_id, "Session started");
        Ok(session_id)
    }

    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        let record = self.record_for(session_id).await?;
        let record = record.lock().await;
        Some(record.session.clone())
    }

    pub async fn trace(&self, session_id: Uuid) -> Vec<StageResult> {
        match self.record_for(session_id).await {
            Some(record) => record.lock().await.trace.clone(),
            None => Vec::new(),
        }
    }

    pub async fn list_incomplete(&self) -> Result<Vec<Uuid>> {
        self.checkpoints.list_incomplete().await
    }

    async fn record_for(&self, session_id: Uuid) -> Option<Arc<Mutex<SessionRecord>>> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned()
    }

    //
    // ================= Advance =================
    //

    /// Execute the single next stage for a session. Deterministic: the
    /// next stage follows from the current state alone, except for the
    /// approval interrupt and the refine branch.
    pub async fn advance(&self, session_id: Uuid) -> Result<AdvanceOutcome> {
        let record = self
            .record_for(session_id)
            .await
            .ok_or(PipelineError::SessionNotFound(session_id))?;

        // Per-session execution lock: held through gate check, execution,
        // checkpoint, and log append.
        let mut record = record.lock().await;

        match record.session.state {
            WorkflowState::Complete => return Ok(AdvanceOutcome::Completed),
            WorkflowState::Failed => {
                return Ok(AdvanceOutcome::Failed("already_failed".to_string()))
            }
            WorkflowState::WaitingApproval => {
                let pending = self.approvals.pending_for_session(session_id).await;
                return Ok(match pending {
                    Some(request) => AdvanceOutcome::AwaitingApproval(request.request_id),
                    None => AdvanceOutcome::AwaitingApproval(Uuid::nil()),
                });
            }
            WorkflowState::Init => {
                // Bookkeeping transition; no stage runs.
                self.event_log
                    .append(
                        session_id,
                        WorkflowState::Init,
                        "orchestrator",
                        false,
                        json!({"status": "transition", "to": WorkflowState::Ingest.as_str()}),
                    )
                    .await?;
                return self
                    .transition(&mut record, WorkflowState::Ingest, "orchestrator")
                    .await;
            }
            _ => {}
        }

        let state = record.session.state;
        let agent = self
            .stages
            .get(&state)
            .cloned()
            .ok_or_else(|| PipelineError::NoAgentForState(state.to_string()))?;

        // Session guard is checked before anything else runs; a tripped
        // guard terminates the session regardless of its state.
        if let Err(e) = self.session_guard.record_iteration(session_id).await {
            return self.fail_session(&mut record, &agent, &e).await;
        }

        let stage_input = self.stage_input(&record, state);
        let agent_name = agent.name();

        // Privilege gate: fatal to the stage on denial, never retried.
        if let Err(e) = self
            .gate
            .authorize(session_id, agent_name, agent.required_capabilities())
            .await
        {
            return self.fail_session(&mut record, &agent, &e).await;
        }

        let ctx = StageContext::new(
            session_id,
            record.session.user_id,
            self.gate.clone(),
            self.prompt_guard.clone(),
            self.sandbox,
            self.llm.clone(),
            self.memory.clone(),
        );

        let span = self.observability.span_start(session_id, agent_name);
        let started = Instant::now();

        debug!(session_id = %session_id, state = %state, agent = %agent_name, "Executing stage");

        let execution = self
            .retry
            .execute(agent_name, &self.breakers, || {
                let agent = agent.clone();
                let ctx = &ctx;
                let input = &stage_input;
                async move {
                    self.sandbox
                        .execute(agent.name(), agent.execute(ctx, input))
                        .await
                }
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let (tokens_in, tokens_out) = ctx.token_usage();
        let cost = Observability::estimate_cost(tokens_in, tokens_out);

        match execution {
            Ok(outcome) => {
                self.observability.span_end(span, None);
                self.complete_stage(
                    &mut record,
                    &agent,
                    outcome.value,
                    duration_ms,
                    tokens_in,
                    tokens_out,
                    cost,
                    outcome.attempts,
                    false,
                )
                .await
            }
            Err(error @ (PipelineError::CircuitOpen(_) | PipelineError::RetriesExhausted { .. })) => {
                // Absorbed: the fallback manager produces a degraded but
                // well-formed result and the pipeline continues.
                self.observability.span_end(span, Some(&error.to_string()));
                let attempts = match &error {
                    PipelineError::RetriesExhausted { attempts, .. } => *attempts,
                    _ => 0,
                };
                let degraded = self.fallback.degraded_result(agent_name, &record.context);
                self.complete_stage(
                    &mut record,
                    &agent,
                    degraded,
                    duration_ms,
                    tokens_in,
                    tokens_out,
                    cost,
                    attempts,
                    true,
                )
                .await
            }
            Err(error) => {
                self.observability.span_end(span, Some(&error.to_string()));
                self.fail_session(&mut record, &agent, &error).await
            }
        }
    }

    /// Drive a session until it completes, fails, or halts on approval.
    pub async fn run(&self, session_id: Uuid) -> Result<OrchestratorResult> {
        loop {
            match self.advance(session_id).await? {
                AdvanceOutcome::Advanced(_) => continue,
                outcome => return self.result_for(session_id, outcome).await,
            }
        }
    }

    //
    // ================= Stage Bookkeeping =================
    //

    #[allow(clippy::too_many_arguments)]
    async fn complete_stage(
        &self,
        record: &mut SessionRecord,
        agent: &Arc<dyn Agent>,
        output: Value,
        duration_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        attempts: u32,
        degraded: bool,
    ) -> Result<AdvanceOutcome> {
        let session_id = record.session.session_id;
        let state = record.session.state;
        let agent_name = agent.name();

        record.trace.push(StageResult {
            agent_name: agent_name.to_string(),
            output: output.clone(),
            duration_ms,
            tokens_in,
            tokens_out,
            cost,
            attempts,
            degraded,
            error: None,
            created_at: Utc::now(),
        });
        record.context[agent_name] = output.clone();
        record.session.iteration_count += 1;

        if !record
            .session
            .completed_agents
            .iter()
            .any(|name| name == agent_name)
        {
            record.session.completed_agents.push(agent_name.to_string());
        }

        self.observability
            .record_cost(agent_name, tokens_in, tokens_out, cost)
            .await;
        self.event_log
            .append(
                session_id,
                state,
                agent_name,
                false,
                json!({"attempts": attempts, "degraded": degraded}),
            )
            .await?;

        // Token accounting can trip the guard; the trip takes effect on
        // the next stage attempt.
        record.session.token_count += tokens_in + tokens_out;
        if let Err(e) = self
            .session_guard
            .record_tokens(session_id, tokens_in + tokens_out)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Token cap tripped after stage");
        }

        // Risk threshold breach after evaluation interrupts progression.
        if state == WorkflowState::Evaluate {
            if let Some(outcome) = self.maybe_interrupt_for_approval(record).await? {
                return Ok(outcome);
            }
        }

        let next = match state {
            WorkflowState::Refine => self.refine_branch(record, &output),
            _ => state.successor().unwrap_or(WorkflowState::Complete),
        };

        self.transition(record, next, agent_name).await
    }

    /// REFINE is the one data-dependent branch: a budget adjustment
    /// re-enters BUDGET with the override pinned; a transaction exclusion
    /// re-enters ANALYZE; everything else returns to REPORT.
    fn refine_branch(&self, record: &mut SessionRecord, output: &Value) -> WorkflowState {
        match output.get("action").and_then(Value::as_str) {
            Some("adjust_budget") => {
                if let (Some(category), Some(amount)) = (
                    output.get("category").and_then(Value::as_str),
                    output.get("amount").and_then(Value::as_f64),
                ) {
                    record.context["budget_overrides"][category] = json!(amount);
                }
                WorkflowState::Budget
            }
            Some("exclude_transaction") => WorkflowState::Analyze,
            _ => WorkflowState::Report,
        }
    }

    async fn maybe_interrupt_for_approval(
        &self,
        record: &mut SessionRecord,
    ) -> Result<Option<AdvanceOutcome>> {
        // A session resumes past the interrupt once a human has signed
        // off; the same anomalies must not re-trigger it.
        if record.context["approval_granted"] == json!(true) {
            return Ok(None);
        }

        let anomalies = record.context["analysis"]["anomalies"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut first_request = None;
        for anomaly in &anomalies {
            let risk = anomaly
                .get("risk_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            if self.approvals.needs_approval(ApprovalKind::AnomalyDetected, risk) {
                let reason = anomaly
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("anomalous transaction");
                let request = self
                    .approvals
                    .request(
                        record.session.session_id,
                        ApprovalKind::AnomalyDetected,
                        format!("Anomaly detected: {}", reason),
                        risk,
                    )
                    .await;
                first_request.get_or_insert(request.request_id);
            }
        }

        let Some(request_id) = first_request else {
            return Ok(None);
        };

        let session_id = record.session.session_id;
        record.session.resume_state = record.session.state.successor();
        record.session.state = WorkflowState::WaitingApproval;
        record.session.updated_at = Utc::now();

        self.event_log
            .append(
                session_id,
                WorkflowState::WaitingApproval,
                "orchestrator",
                false,
                json!({"status": "waiting_approval", "request_id": request_id}),
            )
            .await?;
        self.observability
            .record_compliance(session_id, "approval_requested", json!({"request_id": request_id}))
            .await;

        self.checkpoints
            .save(&record.session, &record.payload())
            .await?;
        self.memory
            .put_stm(
                session_id,
                record.session.user_id,
                WorkflowState::WaitingApproval,
                json!({}),
            )
            .await?;

        info!(session_id = %session_id, request_id = %request_id, "Session waiting for approval");
        Ok(Some(AdvanceOutcome::AwaitingApproval(request_id)))
    }

    async fn transition(
        &self,
        record: &mut SessionRecord,
        next: WorkflowState,
        agent: &str,
    ) -> Result<AdvanceOutcome> {
        let session_id = record.session.session_id;

        record.session.state = next;
        record.session.updated_at = Utc::now();

        self.checkpoints
            .save(&record.session, &record.payload())
            .await?;
        self.memory
            .put_stm(session_id, record.session.user_id, next, json!({}))
            .await?;

        if next == WorkflowState::Complete {
            self.session_guard.complete(session_id).await;
            self.event_log
                .append(
                    session_id,
                    WorkflowState::Complete,
                    "orchestrator",
                    false,
                    json!({"status": "session_completed", "iterations": record.session.iteration_count}),
                )
                .await?;
            info!(session_id = %session_id, "Session completed");
            return Ok(AdvanceOutcome::Completed);
        }

        debug!(session_id = %session_id, agent = %agent, next = %next, "Transition");
        Ok(AdvanceOutcome::Advanced(next))
    }

    async fn fail_session(
        &self,
        record: &mut SessionRecord,
        agent: &Arc<dyn Agent>,
        error: &PipelineError,
    ) -> Result<AdvanceOutcome> {
        let session_id = record.session.session_id;
        let state = record.session.state;

        warn!(
            session_id = %session_id,
            state = %state,
            agent = agent.name(),
            error = %error,
            "Stage failed, session moving to FAILED"
        );

        record.trace.push(StageResult {
            agent_name: agent.name().to_string(),
            output: Value::Null,
            duration_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            attempts: 1,
            degraded: false,
            error: Some(error.to_string()),
            created_at: Utc::now(),
        });

        self.event_log
            .append(
                session_id,
                state,
                agent.name(),
                true,
                json!({"error": error.to_string(), "category": error.category()}),
            )
            .await?;

        record.session.state = WorkflowState::Failed;
        record.session.updated_at = Utc::now();
        self.checkpoints
            .save(&record.session, &record.payload())
            .await?;
        self.memory
            .put_stm(session_id, record.session.user_id, WorkflowState::Failed, json!({}))
            .await?;
        self.observability
            .record_compliance(
                session_id,
                "session_failed",
                json!({"category": error.category()}),
            )
            .await;

        Ok(AdvanceOutcome::Failed(error.category().to_string()))
    }

    /// Input payload for the stage executing at `state`, assembled from
    /// the accumulated context.
    fn stage_input(&self, record: &SessionRecord, state: WorkflowState) -> Value {
        let context = &record.context;
        match state {
            WorkflowState::Ingest => context["input"].clone(),
            WorkflowState::Categorize => json!({
                "transactions": context["ingestion"]["transactions"].clone(),
            }),
            WorkflowState::Analyze => json!({
                "transactions": context["categorization"]["transactions"].clone(),
            }),
            WorkflowState::Budget => json!({
                "summary": context["analysis"]["summary"].clone(),
                "overrides": context["budget_overrides"].clone(),
            }),
            WorkflowState::Evaluate => json!({
                "summary": context["analysis"]["summary"].clone(),
                "anomalies": context["analysis"]["anomalies"].clone(),
                "high_risk_count": context["analysis"]["high_risk_count"].clone(),
                "suggestions": context["budgeting"]["suggestions"].clone(),
            }),
            WorkflowState::Report => json!({
                "summary": context["analysis"]["summary"].clone(),
                "suggestions": context["budgeting"]["suggestions"].clone(),
                "anomalies": context["analysis"]["anomalies"].clone(),
                "evaluation": context["evaluation"].clone(),
                "narrative": context["budgeting"]["narrative"].clone(),
                "degraded": record.trace.iter().any(|r| r.degraded),
            }),
            WorkflowState::Refine => json!({
                "message": context["refine_message"].clone(),
                "report": context["reporting"].clone(),
            }),
            _ => Value::Null,
        }
    }

    //
    // ================= Approval Resolution =================
    //

    /// Apply a human decision to the owning session. Approval resumes the
    /// originating state (or stays put while more requests are queued);
    /// rejection fails the session.
    pub async fn resolve_approval(
        &self,
        request_id: Uuid,
        approve: bool,
        approver: &str,
    ) -> Result<AdvanceOutcome> {
        let request = self.approvals.resolve(request_id, approve, approver).await?;
        let session_id = request.session_id;

        let record = self
            .record_for(session_id)
            .await
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let mut record = record.lock().await;

        self.observability
            .record_compliance(
                session_id,
                "approval_resolved",
                json!({"request_id": request_id, "approved": approve, "approver": approver}),
            )
            .await;

        if request.status == ApprovalStatus::Rejected {
            self.event_log
                .append(
                    session_id,
                    WorkflowState::WaitingApproval,
                    "orchestrator",
                    true,
                    json!({"status": "approval_rejected", "request_id": request_id}),
                )
                .await?;

            record.session.state = WorkflowState::Failed;
            record.session.resume_state = None;
            record.session.updated_at = Utc::now();
            self.checkpoints
                .save(&record.session, &record.payload())
                .await?;
            self.memory
                .put_stm(session_id, record.session.user_id, WorkflowState::Failed, json!({}))
                .await?;
            return Ok(AdvanceOutcome::Failed("approval_rejected".to_string()));
        }

        // More queued requests keep the session parked.
        if let Some(next_pending) = self.approvals.pending_for_session(session_id).await {
            self.event_log
                .append(
                    session_id,
                    WorkflowState::WaitingApproval,
                    "orchestrator",
                    false,
                    json!({"status": "next_approval_pending", "request_id": next_pending.request_id}),
                )
                .await?;
            return Ok(AdvanceOutcome::AwaitingApproval(next_pending.request_id));
        }

        let resume = record
            .session
            .resume_state
            .take()
            .unwrap_or(WorkflowState::Report);
        record.context["approval_granted"] = json!(true);

        self.event_log
            .append(
                session_id,
                WorkflowState::WaitingApproval,
                "orchestrator",
                false,
                json!({"status": "approval_granted", "resume_state": resume.as_str()}),
            )
            .await?;

        self.transition(&mut record, resume, "orchestrator").await
    }

    //
    // ================= Refine =================
    //

    /// Conversational refinement of a finished report. Validates session
    /// ownership, runs the conversation stage, and continues the pipeline
    /// along the branch the command selected.
    pub async fn refine(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        message: &str,
    ) -> Result<OrchestratorResult> {
        {
            let record = self
                .record_for(session_id)
                .await
                .ok_or(PipelineError::SessionNotFound(session_id))?;
            let mut record = record.lock().await;

            if record.session.user_id != user_id {
                return Err(PipelineError::SecurityViolation {
                    agent: "orchestrator".to_string(),
                    detail: format!("user {} does not own session {}", user_id, session_id),
                });
            }

            match record.session.state {
                WorkflowState::Complete | WorkflowState::Report => {}
                state => {
                    return Err(PipelineError::Permanent(format!(
                        "cannot refine a session in state {}",
                        state
                    )));
                }
            }

            record.context["refine_message"] = json!(message);
            record.session.state = WorkflowState::Refine;
            record.session.updated_at = Utc::now();
            self.event_log
                .append(
                    session_id,
                    WorkflowState::Refine,
                    "orchestrator",
                    false,
                    json!({"status": "refine_requested"}),
                )
                .await?;
        }

        self.run(session_id).await
    }

    //
    // ================= Recovery =================
    //

    /// Rebuild a session from its newest checkpoint. Completed stages are
    /// restored verbatim and never re-executed.
    pub async fn resume_from_checkpoint(&self, session_id: Uuid) -> Result<Session> {
        if let Some(existing) = self.record_for(session_id).await {
            let record = existing.lock().await;
            return Ok(record.session.clone());
        }

        let checkpoint = self.checkpoints.load_latest(session_id).await?;
        if !CheckpointStore::verify_integrity(&checkpoint) {
            return Err(PipelineError::Permanent(format!(
                "checkpoint {} failed integrity verification",
                checkpoint.checkpoint_id
            )));
        }

        let session: Session = serde_json::from_value(checkpoint.payload["session"].clone())?;
        let context = checkpoint.payload["context"].clone();
        let trace: Vec<StageResult> =
            serde_json::from_value(checkpoint.payload["trace"].clone()).unwrap_or_default();

        self.session_guard.start(session_id, None).await;
        self.event_log
            .append(
                session_id,
                session.state,
                "orchestrator",
                false,
                json!({
                    "status": "resumed_from_checkpoint",
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "completed_agents": session.completed_agents,
                }),
            )
            .await?;

        let restored = session.clone();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id,
            Arc::new(Mutex::new(SessionRecord {
                session,
                context,
                trace,
            })),
        );

        info!(
            session_id = %session_id,
            state = %restored.state,
            "Session resumed from checkpoint"
        );
        Ok(restored)
    }

    async fn result_for(
        &self,
        session_id: Uuid,
        outcome: AdvanceOutcome,
    ) -> Result<OrchestratorResult> {
        let record = self
            .record_for(session_id)
            .await
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        let record = record.lock().await;

        let (success, error, pending) = match &outcome {
            AdvanceOutcome::Completed => (true, None, None),
            AdvanceOutcome::AwaitingApproval(id) => (true, None, Some(*id)),
            AdvanceOutcome::Failed(category) => (false, Some(category.clone()), None),
            AdvanceOutcome::Advanced(_) => (true, None, None),
        };

        Ok(OrchestratorResult {
            session_id,
            final_state: record.session.state,
            final_report: record.context["reporting"].clone(),
            iterations: record.session.iteration_count,
            success,
            error,
            pending_approval: pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SessionLimits};
    use crate::llm::{LlmClient, LlmResponse, MockLlm};
    use crate::models::GuardStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Provider that is permanently down; every call is a transient
    /// failure, so retries run dry and fallbacks kick in.
    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn generate(&self, _system: &str, _prompt: &str) -> crate::Result<LlmResponse> {
            Err(PipelineError::LlmError("provider unavailable".into()))
        }
    }

    fn engine_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.base_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(5);
        config
    }

    fn build(config: &EngineConfig, llm: Arc<dyn LlmClient>) -> Orchestrator {
        Orchestrator::new(
            config,
            llm,
            Arc::new(CircuitBreakerRegistry::new(config.breaker)),
            Arc::new(CheckpointStore::in_memory()),
            Arc::new(EventLog::in_memory()),
        )
    }

    fn orchestrator() -> Orchestrator {
        build(&engine_config(), Arc::new(MockLlm::new()))
    }

    /// Quiet month: expenses are close enough together that the IQR
    /// detector finds no outliers and nothing crosses an approval
    /// threshold.
    fn quiet_input() -> Value {
        json!({
            "transactions": [
                {"transaction_id": "t1", "date": "2025-06-01", "description": "ACME payroll", "amount": 4000.0},
                {"transaction_id": "t2", "date": "2025-06-02", "description": "Monthly rent", "amount": -1400.0},
                {"transaction_id": "t3", "date": "2025-06-03", "description": "Grocery store", "amount": -900.0},
                {"transaction_id": "t4", "date": "2025-06-05", "description": "Gas station fill-up", "amount": -700.0},
                {"transaction_id": "t5", "date": "2025-06-08", "description": "Electric bill", "amount": -500.0},
                {"transaction_id": "t6", "date": "2025-06-12", "description": "Restaurant dinner", "amount": -300.0},
            ]
        })
    }

    /// Contains one extreme outlier whose anomaly risk lands at 1.0,
    /// which is above the 0.8 approval threshold.
    fn anomalous_input() -> Value {
        json!({
            "transactions": [
                {"transaction_id": "t1", "date": "2025-06-01", "description": "ACME payroll", "amount": 9000.0},
                {"transaction_id": "t2", "date": "2025-06-02", "description": "Coffee shop", "amount": -20.0},
                {"transaction_id": "t3", "date": "2025-06-03", "description": "Coffee shop", "amount": -22.0},
                {"transaction_id": "t4", "date": "2025-06-04", "description": "Coffee shop", "amount": -24.0},
                {"transaction_id": "t5", "date": "2025-06-05", "description": "Coffee shop", "amount": -26.0},
                {"transaction_id": "t6", "date": "2025-06-06", "description": "Coffee shop", "amount": -27.0},
                {"transaction_id": "big", "date": "2025-06-07", "description": "Wire transfer out", "amount": -5000.0},
            ]
        })
    }

    #[tokio::test]
    async fn test_full_pipeline_reaches_complete() {
        let orchestrator = orchestrator();
        let session_id = orchestrator
            .start_session(Uuid::new_v4(), quiet_input())
            .await
            .unwrap();

        let result = orchestrator.run(session_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Complete);
        assert_eq!(result.final_report["total_income"], 4000.0);

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(
            session.completed_agents,
            vec![
                "ingestion",
                "categorization",
                "analysis",
                "budgeting",
                "evaluation",
                "reporting",
            ]
        );
    }

    #[tokio::test]
    async fn test_event_sequence_is_deterministic() {
        let orchestrator = orchestrator();

        let a = orchestrator
            .start_session(Uuid::new_v4(), quiet_input())
            .await
            .unwrap();
        orchestrator.run(a).await.unwrap();

        let b = orchestrator
            .start_session(Uuid::new_v4(), quiet_input())
            .await
            .unwrap();
        orchestrator.run(b).await.unwrap();

        let log = orchestrator.event_log();
        let seq_a: Vec<(WorkflowState, String, bool)> = log.state_sequence(a).await.unwrap();
        let seq_b: Vec<(WorkflowState, String, bool)> = log.state_sequence(b).await.unwrap();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a
            .iter()
            .any(|(state, _, _)| *state == WorkflowState::Report));
    }

    #[tokio::test]
    async fn test_anomaly_halts_for_approval_then_approves() {
        let orchestrator = orchestrator();
        let session_id = orchestrator
            .start_session(Uuid::new_v4(), anomalous_input())
            .await
            .unwrap();

        let result = orchestrator.run(session_id).await.unwrap();
        assert_eq!(result.final_state, WorkflowState::WaitingApproval);
        let request_id = result.pending_approval.unwrap();

        // Progression is blocked while pending.
        let stalled = orchestrator.advance(session_id).await.unwrap();
        assert_eq!(stalled, AdvanceOutcome::AwaitingApproval(request_id));

        let outcome = orchestrator
            .resolve_approval(request_id, true, "analyst-7")
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::Advanced(WorkflowState::Report));

        let result = orchestrator.run(session_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Complete);
        assert!(!result.final_report["anomalies"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_approval_fails_session() {
        let orchestrator = orchestrator();
        let session_id = orchestrator
            .start_session(Uuid::new_v4(), anomalous_input())
            .await
            .unwrap();

        let result = orchestrator.run(session_id).await.unwrap();
        let request_id = result.pending_approval.unwrap();

        let outcome = orchestrator
            .resolve_approval(request_id, false, "analyst-7")
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::Failed("approval_rejected".into()));

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(session.state, WorkflowState::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_completed_stages() {
        let config = engine_config();
        let checkpoints = Arc::new(CheckpointStore::in_memory());
        let event_log = Arc::new(EventLog::in_memory());

        let first = Orchestrator::new(
            &config,
            Arc::new(MockLlm::new()),
            Arc::new(CircuitBreakerRegistry::new(config.breaker)),
            checkpoints.clone(),
            event_log.clone(),
        );

        let session_id = first
            .start_session(Uuid::new_v4(), quiet_input())
            .await
            .unwrap();
        // INIT→INGEST, then run ingestion and categorization.
        first.advance(session_id).await.unwrap();
        first.advance(session_id).await.unwrap();
        first.advance(session_id).await.unwrap();

        // Process restarts: a fresh orchestrator over the same stores.
        let second = Orchestrator::new(
            &config,
            Arc::new(MockLlm::new()),
            Arc::new(CircuitBreakerRegistry::new(config.breaker)),
            checkpoints.clone(),
            event_log,
        );

        assert_eq!(second.list_incomplete().await.unwrap(), vec![session_id]);

        let restored = second.resume_from_checkpoint(session_id).await.unwrap();
        assert_eq!(restored.state, WorkflowState::Analyze);
        assert_eq!(
            restored.completed_agents,
            vec!["ingestion".to_string(), "categorization".to_string()]
        );

        let outcome = second.advance(session_id).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Advanced(WorkflowState::Budget));
    }

    #[tokio::test]
    async fn test_guard_forces_termination() {
        let mut config = engine_config();
        config.limits = SessionLimits {
            max_iterations: 2,
            max_tokens: 100_000,
            max_runtime: Duration::from_secs(600),
        };
        let orchestrator = build(&config, Arc::new(MockLlm::new()));

        let session_id = orchestrator
            .start_session(Uuid::new_v4(), quiet_input())
            .await
            .unwrap();
        let result = orchestrator.run(session_id).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("guard_exceeded"));
        assert_eq!(result.final_state, WorkflowState::Failed);

        let snapshot = orchestrator
            .session_guard()
            .snapshot(session_id)
            .await
            .unwrap();
        assert_eq!(snapshot.status, GuardStatus::ForcedTermination);
        assert_eq!(snapshot.iterations, 2);
    }

    #[tokio::test]
    async fn test_llm_outage_degrades_but_completes() {
        // Input with an unknown merchant forces the categorization stage
        // onto the (dead) LLM path; the fallback keeps the run alive.
        let orchestrator = build(&engine_config(), Arc::new(FailingLlm));
        let input = json!({
            "transactions": [
                {"transaction_id": "t1", "date": "2025-06-01", "description": "ACME payroll", "amount": 4000.0},
                {"transaction_id": "t2", "date": "2025-06-02", "description": "XKCD-9000 gadget", "amount": -45.0},
                {"transaction_id": "t3", "date": "2025-06-03", "description": "Monthly rent", "amount": -1400.0},
            ]
        });

        let session_id = orchestrator
            .start_session(Uuid::new_v4(), input)
            .await
            .unwrap();
        let result = orchestrator.run(session_id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Complete);
        assert_eq!(result.final_report["degraded"], true);

        let trace = orchestrator.trace(session_id).await;
        let degraded: Vec<&StageResult> = trace.iter().filter(|r| r.degraded).collect();
        assert!(!degraded.is_empty(), "degraded stages must be flagged in the trace");
    }

    #[tokio::test]
    async fn test_refine_adjust_budget_reenters_budget() {
        let orchestrator = orchestrator();
        let user_id = Uuid::new_v4();
        let session_id = orchestrator
            .start_session(user_id, quiet_input())
            .await
            .unwrap();
        orchestrator.run(session_id).await.unwrap();

        let result = orchestrator
            .refine(session_id, user_id, "reduce Food to $150")
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Complete);

        let food = result.final_report["budget_suggestions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["category"] == "Food")
            .cloned()
            .unwrap();
        assert_eq!(food["suggested_budget"], 150.0);
    }

    #[tokio::test]
    async fn test_refine_rejects_foreign_user() {
        let orchestrator = orchestrator();
        let owner = Uuid::new_v4();
        let session_id = orchestrator
            .start_session(owner, quiet_input())
            .await
            .unwrap();
        orchestrator.run(session_id).await.unwrap();

        let result = orchestrator
            .refine(session_id, Uuid::new_v4(), "reduce Food by $50")
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::SecurityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let orchestrator = orchestrator();
        let result = orchestrator.advance(Uuid::new_v4()).await;
        assert!(matches!(result, Err(PipelineError::SessionNotFound(_))));
    }
}
