//! Checkpoint store
//!
//! Persists a snapshot after every successful stage transition. Saves are
//! strictly additive — prior checkpoints are never overwritten, which is
//! what enables point-in-time recovery. Recovery always resumes from the
//! newest checkpoint for a session.
//!
//! Runs in-memory by default; set POSTGRES_URL/DATABASE_URL for a durable
//! Postgres backend.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Checkpoint, Session, WorkflowState};
use crate::Result;

enum CheckpointBackend {
    InMemory {
        checkpoints: Arc<RwLock<HashMap<Uuid, Vec<Checkpoint>>>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct CheckpointStore {
    backend: CheckpointBackend,
}

impl CheckpointStore {
    pub fn in_memory() -> Self {
        Self {
            backend: CheckpointBackend::InMemory {
                checkpoints: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    /// Build from config: Postgres when a database URL is set, otherwise
    /// in-memory.
    pub fn from_database_url(database_url: Option<&str>) -> Self {
        if let Some(url) = database_url {
            match PgPoolOptions::new().max_connections(5).connect_lazy(url) {
                Ok(pool) => {
                    info!("Checkpoint backend: postgres");
                    return Self {
                        backend: CheckpointBackend::Postgres {
                            pool,
                            schema_ready: Arc::new(OnceCell::new()),
                        },
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres checkpoint backend, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }
        Self::in_memory()
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let CheckpointBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS checkpoints (
                      id BIGSERIAL PRIMARY KEY,
                      checkpoint_id UUID NOT NULL UNIQUE,
                      session_id UUID NOT NULL,
                      user_id UUID NOT NULL,
                      state TEXT NOT NULL,
                      completed_agents JSONB NOT NULL,
                      payload JSONB NOT NULL,
                      payload_hash TEXT NOT NULL,
                      iteration INTEGER NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_checkpoints_session
                    ON checkpoints (session_id, id DESC);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    /// Snapshot `session` with the accumulated stage-output context.
    pub async fn save(&self, session: &Session, context: &Value) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4(),
            session_id: session.session_id,
            user_id: session.user_id,
            state: session.state,
            completed_agents: session.completed_agents.clone(),
            payload: context.clone(),
            payload_hash: hash_payload(context),
            iteration: session.iteration_count,
            created_at: Utc::now(),
        };

        match &self.backend {
            CheckpointBackend::InMemory { checkpoints } => {
                let mut checkpoints = checkpoints.write().await;
                checkpoints
                    .entry(session.session_id)
                    .or_insert_with(Vec::new)
                    .push(checkpoint.clone());
            }
            CheckpointBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints
                      (checkpoint_id, session_id, user_id, state, completed_agents, payload, payload_hash, iteration, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(checkpoint.checkpoint_id)
                .bind(checkpoint.session_id)
                .bind(checkpoint.user_id)
                .bind(checkpoint.state.as_str())
                .bind(serde_json::to_value(&checkpoint.completed_agents)?)
                .bind(&checkpoint.payload)
                .bind(&checkpoint.payload_hash)
                .bind(checkpoint.iteration as i32)
                .bind(checkpoint.created_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!("Failed to save checkpoint: {}", e))
                })?;
            }
        }

        Ok(checkpoint)
    }

    /// Most recent checkpoint for a session, or `CheckpointNotFound`.
    pub async fn load_latest(&self, session_id: Uuid) -> Result<Checkpoint> {
        match &self.backend {
            CheckpointBackend::InMemory { checkpoints } => {
                let checkpoints = checkpoints.read().await;
                checkpoints
                    .get(&session_id)
                    .and_then(|list| list.last())
                    .cloned()
                    .ok_or(PipelineError::CheckpointNotFound(session_id))
            }
            CheckpointBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let row = sqlx::query(
                    r#"
                    SELECT checkpoint_id, session_id, user_id, state, completed_agents, payload, payload_hash, iteration, created_at
                    FROM checkpoints
                    WHERE session_id = $1
                    ORDER BY id DESC
                    LIMIT 1
                    "#,
                )
                .bind(session_id)
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!("Failed to load checkpoint: {}", e))
                })?;

                let row = row.ok_or(PipelineError::CheckpointNotFound(session_id))?;
                row_to_checkpoint(&row)
            }
        }
    }

    /// Full checkpoint history for a session, oldest first.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<Checkpoint>> {
        match &self.backend {
            CheckpointBackend::InMemory { checkpoints } => {
                let checkpoints = checkpoints.read().await;
                Ok(checkpoints.get(&session_id).cloned().unwrap_or_default())
            }
            CheckpointBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT checkpoint_id, session_id, user_id, state, completed_agents, payload, payload_hash, iteration, created_at
                    FROM checkpoints
                    WHERE session_id = $1
                    ORDER BY id ASC
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!(
                        "Failed to load checkpoint history: {}",
                        e
                    ))
                })?;

                rows.iter().map(row_to_checkpoint).collect()
            }
        }
    }

    /// Sessions whose newest checkpoint is in a non-terminal state.
    pub async fn list_incomplete(&self) -> Result<Vec<Uuid>> {
        match &self.backend {
            CheckpointBackend::InMemory { checkpoints } => {
                let checkpoints = checkpoints.read().await;
                Ok(checkpoints
                    .iter()
                    .filter_map(|(session_id, list)| {
                        list.last()
                            .filter(|cp| !cp.state.is_terminal())
                            .map(|_| *session_id)
                    })
                    .collect())
            }
            CheckpointBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT DISTINCT ON (session_id) session_id, state
                    FROM checkpoints
                    ORDER BY session_id, id DESC
                    "#,
                )
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!(
                        "Failed to list incomplete sessions: {}",
                        e
                    ))
                })?;

                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let state: String = row.try_get("state").ok()?;
                        let state = WorkflowState::parse(&state)?;
                        if state.is_terminal() {
                            None
                        } else {
                            row.try_get::<Uuid, _>("session_id").ok()
                        }
                    })
                    .collect())
            }
        }
    }

    /// Verify a checkpoint payload against its stored hash.
    pub fn verify_integrity(checkpoint: &Checkpoint) -> bool {
        hash_payload(&checkpoint.payload) == checkpoint.payload_hash
    }
}

fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
    let state: String = row
        .try_get("state")
        .map_err(|e| PipelineError::DatabaseError(e.to_string()))?;
    let completed: Value = row
        .try_get("completed_agents")
        .map_err(|e| PipelineError::DatabaseError(e.to_string()))?;
    let iteration: i32 = row
        .try_get("iteration")
        .map_err(|e| PipelineError::DatabaseError(e.to_string()))?;

    Ok(Checkpoint {
        checkpoint_id: row
            .try_get("checkpoint_id")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
        session_id: row
            .try_get("session_id")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
        state: WorkflowState::parse(&state)
            .ok_or_else(|| PipelineError::DatabaseError(format!("unknown state '{}'", state)))?,
        completed_agents: serde_json::from_value(completed)?,
        payload: row
            .try_get("payload")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
        payload_hash: row
            .try_get("payload_hash")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
        iteration: iteration.max(0) as u32,
        created_at: row
            .try_get("created_at")
            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
    })
}

/// Compute SHA256 hash of a checkpoint payload.
/// Uses zero-copy streaming serialization into the hasher.
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), payload).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
