//! Postgres checkpoint store
//!
//! One row per session holding the serialized state. The schema is created
//! lazily on first use.

use super::{CheckpointStore, ConversationState};
use crate::error::OrchestrationError;
use crate::Result;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PostgresCheckpointStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_checkpoints (
                      session_id UUID PRIMARY KEY,
                      state TEXT NOT NULL,
                      turn_count BIGINT NOT NULL DEFAULT 0,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT state FROM conversation_checkpoints WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to load checkpoint: {}", e))
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("state")?;
        let state: ConversationState = serde_json::from_str(&raw).map_err(|e| {
            OrchestrationError::CheckpointError(format!(
                "Corrupt checkpoint for session {}: {}",
                session_id, e
            ))
        })?;

        Ok(Some(state))
    }

    async fn put(&self, state: &ConversationState) -> Result<()> {
        self.ensure_schema().await?;

        let raw = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT INTO conversation_checkpoints (session_id, state, turn_count, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id)
            DO UPDATE SET state = EXCLUDED.state,
                          turn_count = EXCLUDED.turn_count,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.session_id)
        .bind(raw)
        .bind(state.turn_count as i64)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::CheckpointError(format!("Failed to write checkpoint: {}", e))
        })?;

        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM conversation_checkpoints WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to delete checkpoint: {}", e))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
