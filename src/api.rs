//! REST API for the pipeline orchestrator
//!
//! Command/query surface for the presentation layer: start sessions,
//! inspect state and traces, replay the event log, resolve approvals,
//! resume from checkpoints, and refine finished reports.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::orchestrator::{AdvanceOutcome, Orchestrator};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub user_id: Option<String>,
    pub transactions: Option<serde_json::Value>,
    pub file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveApprovalRequest {
    pub approve: bool,
    pub approver: String,
}

#[derive(Debug, Deserialize)]
pub struct RefineRequest {
    pub user_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn error_status(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::SessionNotFound(_)
        | PipelineError::CheckpointNotFound(_)
        | PipelineError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::SecurityViolation { .. } => StatusCode::FORBIDDEN,
        PipelineError::Permanent(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Helpers — String → UUID
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn start_session(
    State(state): State<ApiState>,
    Json(req): Json<StartSessionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");

    let mut input = serde_json::Map::new();
    if let Some(transactions) = req.transactions {
        input.insert("transactions".to_string(), transactions);
    }
    if let Some(file_path) = req.file_path {
        input.insert("file_path".to_string(), serde_json::json!(file_path));
    }

    info!(user_id = %user_id, "Received session start request");

    let session_id = match state
        .orchestrator
        .start_session(user_id, serde_json::Value::Object(input))
        .await
    {
        Ok(session_id) => session_id,
        Err(e) => return (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    };

    match state.orchestrator.run(session_id).await {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&owner.user_id), "anonymous-user");

    let Some(session) = state.orchestrator.session(session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("session {} not found", session_id))),
        );
    };

    if session.user_id != user_id {
        return (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::error("session is owned by another user".into())),
        );
    }

    let trace = state.orchestrator.trace(session_id).await;
    let guard = state.orchestrator.session_guard().snapshot(session_id).await;

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session": session,
            "trace": trace,
            "guard": guard,
        }))),
    )
}

async fn replay_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.event_log().replay(session_id).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::success(entries))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn list_incomplete(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.list_incomplete().await {
        Ok(sessions) => (StatusCode::OK, Json(ApiResponse::success(sessions))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn resume_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    if let Err(e) = state.orchestrator.resume_from_checkpoint(session_id).await {
        return (error_status(&e), Json(ApiResponse::error(e.to_string())));
    }

    match state.orchestrator.run(session_id).await {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn resolve_approval(
    State(state): State<ApiState>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<ResolveApprovalRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let outcome = match state
        .orchestrator
        .resolve_approval(request_id, req.approve, &req.approver)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    };

    // An approved session resumes immediately; anything else is reported
    // as-is.
    if let AdvanceOutcome::Advanced(_) = outcome {
        if let Some(session) = state
            .orchestrator
            .approvals()
            .get(request_id)
            .await
            .map(|r| r.session_id)
        {
            match state.orchestrator.run(session).await {
                Ok(result) => return (StatusCode::OK, Json(ApiResponse::success(result))),
                Err(e) => return (error_status(&e), Json(ApiResponse::error(e.to_string()))),
            }
        }
    }

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "outcome": format!("{:?}", outcome),
        }))),
    )
}

async fn refine_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<RefineRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&req.user_id), "anonymous-user");

    match state
        .orchestrator
        .refine(session_id, user_id, &req.message)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn breaker_stats(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    let stats = state.orchestrator.breakers().all_stats().await;
    (StatusCode::OK, Json(ApiResponse::success(stats)))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/incomplete", get(list_incomplete))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/events", get(replay_session))
        .route("/api/sessions/:id/resume", post(resume_session))
        .route("/api/sessions/:id/refine", post(refine_session))
        .route("/api/approvals/:id/resolve", post(resolve_approval))
        .route("/api/breakers", get(breaker_stats))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_stable() {
        let a = stable_uuid_from_string("user-42");
        let b = stable_uuid_from_string("user-42");
        assert_eq!(a, b);
        assert_ne!(a, stable_uuid_from_string("user-43"));
    }

    #[test]
    fn test_parse_or_stable_uuid() {
        let real = Uuid::new_v4();
        assert_eq!(
            parse_or_stable_uuid(Some(&real.to_string()), "seed"),
            real
        );
        assert_eq!(
            parse_or_stable_uuid(None, "seed"),
            parse_or_stable_uuid(Some("  "), "seed")
        );
    }
}
