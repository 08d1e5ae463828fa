//! Append-only event log and replay
//!
//! One entry per orchestrator transition, failed attempts included.
//! The log is the sole source of truth for "what happened": execution
//! views and compliance audits are projections of this sequence, never
//! independent state. Entries are never edited.
//!
//! In-memory by default; Postgres when a database URL is configured.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{EventLogEntry, WorkflowState};
use crate::Result;

enum LogBackend {
    InMemory {
        entries: Arc<RwLock<HashMap<Uuid, Vec<EventLogEntry>>>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct EventLog {
    backend: LogBackend,
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self {
            backend: LogBackend::InMemory {
                entries: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    pub fn from_database_url(database_url: Option<&str>) -> Self {
        if let Some(url) = database_url {
            match PgPoolOptions::new().max_connections(5).connect_lazy(url) {
                Ok(pool) => {
                    info!("Event log backend: postgres");
                    return Self {
                        backend: LogBackend::Postgres {
                            pool,
                            schema_ready: Arc::new(OnceCell::new()),
                        },
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres event log backend, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }
        Self::in_memory()
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let LogBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS event_log (
                      id BIGSERIAL PRIMARY KEY,
                      session_id UUID NOT NULL,
                      state TEXT NOT NULL,
                      agent TEXT NOT NULL,
                      error BOOLEAN NOT NULL,
                      detail JSONB NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_event_log_session
                    ON event_log (session_id, id);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!("Failed to initialize event log schema: {}", e))
            })?;

        Ok(())
    }

    /// Append one transition record.
    pub async fn append(
        &self,
        session_id: Uuid,
        state: WorkflowState,
        agent: &str,
        error: bool,
        detail: Value,
    ) -> Result<()> {
        let entry = EventLogEntry {
            timestamp: Utc::now(),
            session_id,
            state,
            agent: agent.to_string(),
            error,
            detail,
        };

        match &self.backend {
            LogBackend::InMemory { entries } => {
                let mut entries = entries.write().await;
                entries.entry(session_id).or_insert_with(Vec::new).push(entry);
            }
            LogBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO event_log (session_id, state, agent, error, detail, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(entry.session_id)
                .bind(entry.state.as_str())
                .bind(&entry.agent)
                .bind(entry.error)
                .bind(&entry.detail)
                .bind(entry.timestamp)
                .execute(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!("Failed to append event: {}", e))
                })?;
            }
        }

        Ok(())
    }

    /// The ordered transition sequence for a session, oldest first.
    pub async fn replay(&self, session_id: Uuid) -> Result<Vec<EventLogEntry>> {
        match &self.backend {
            LogBackend::InMemory { entries } => {
                let entries = entries.read().await;
                Ok(entries.get(&session_id).cloned().unwrap_or_default())
            }
            LogBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT session_id, state, agent, error, detail, created_at
                    FROM event_log
                    WHERE session_id = $1
                    ORDER BY id ASC
                    "#,
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!("Failed to replay session: {}", e))
                })?;

                rows.iter()
                    .map(|row| {
                        let state: String = row
                            .try_get("state")
                            .map_err(|e| PipelineError::DatabaseError(e.to_string()))?;
                        Ok(EventLogEntry {
                            timestamp: row
                                .try_get("created_at")
                                .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
                            session_id: row
                                .try_get("session_id")
                                .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
                            state: WorkflowState::parse(&state).ok_or_else(|| {
                                PipelineError::DatabaseError(format!("unknown state '{}'", state))
                            })?,
                            agent: row
                                .try_get("agent")
                                .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
                            error: row
                                .try_get("error")
                                .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
                            detail: row
                                .try_get("detail")
                                .map_err(|e| PipelineError::DatabaseError(e.to_string()))?,
                        })
                    })
                    .collect()
            }
        }
    }

    /// Projection of the replay used by audits: the `(state, agent, error)`
    /// tuple per transition, in order.
    pub async fn state_sequence(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<(WorkflowState, String, bool)>> {
        let entries = self.replay(session_id).await?;
        Ok(entries
            .into_iter()
            .map(|e| (e.state, e.agent, e.error))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_replay_preserve_order() {
        let log = EventLog::in_memory();
        let session_id = Uuid::new_v4();

        log.append(session_id, WorkflowState::Init, "orchestrator", false, json!({}))
            .await
            .unwrap();
        log.append(session_id, WorkflowState::Ingest, "ingestion", false, json!({}))
            .await
            .unwrap();
        log.append(session_id, WorkflowState::Categorize, "categorization", true, json!({"error": "timeout"}))
            .await
            .unwrap();

        let entries = log.replay(session_id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].state, WorkflowState::Init);
        assert_eq!(entries[1].agent, "ingestion");
        assert!(entries[2].error);
    }

    #[tokio::test]
    async fn test_replay_is_per_session() {
        let log = EventLog::in_memory();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        log.append(a, WorkflowState::Ingest, "ingestion", false, json!({}))
            .await
            .unwrap();
        log.append(b, WorkflowState::Ingest, "ingestion", false, json!({}))
            .await
            .unwrap();
        log.append(b, WorkflowState::Categorize, "categorization", false, json!({}))
            .await
            .unwrap();

        assert_eq!(log.replay(a).await.unwrap().len(), 1);
        assert_eq!(log.replay(b).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_state_sequence_projection() {
        let log = EventLog::in_memory();
        let session_id = Uuid::new_v4();

        log.append(session_id, WorkflowState::Ingest, "ingestion", false, json!({}))
            .await
            .unwrap();
        log.append(session_id, WorkflowState::Categorize, "categorization", false, json!({}))
            .await
            .unwrap();

        let sequence = log.state_sequence(session_id).await.unwrap();
        assert_eq!(
            sequence,
            vec![
                (WorkflowState::Ingest, "ingestion".to_string(), false),
                (WorkflowState::Categorize, "categorization".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_session_replays_empty() {
        let log = EventLog::in_memory();
        assert!(log.replay(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
