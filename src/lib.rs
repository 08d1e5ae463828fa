//! Financial Pipeline Orchestrator
//!
//! Orchestration and reliability engine for a multi-stage, agent-based
//! financial-analysis pipeline:
//! - Sequences stages through a deterministic state machine
//! - Gates every stage behind a fixed privilege model and prompt guard
//! - Absorbs failures with retry, per-agent circuit breakers, and fallbacks
//! - Checkpoints every transition for crash recovery
//! - Records a replayable, append-only event log for audit
//!
//! PIPELINE:
//! INIT → INGEST → CATEGORIZE → ANALYZE → BUDGET → EVALUATE → REPORT
//! (WAITING_APPROVAL interrupt, post-report REFINE loop)

pub mod agents;
pub mod api;
pub mod approval;
pub mod compute;
pub mod config;
pub mod error;
pub mod event_log;
pub mod gemini;
pub mod llm;
pub mod memory;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod reliability;
pub mod security;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{AdvanceOutcome, Orchestrator, OrchestratorResult};
