//! PostgreSQL history store

use super::{HistoryStore, StoredRecord};
use crate::catalog::Env;
use crate::config::DatabaseConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::interaction::InteractionFamily;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// History store backed by one JSONB row per interaction
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(OrchestratorError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS interaction_history (
                id VARCHAR(32) PRIMARY KEY,
                env VARCHAR(16) NOT NULL,
                family VARCHAR(16) NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_history_env_submitted
            ON interaction_history (env, submitted_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn put(&self, record: StoredRecord) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO interaction_history (id, env, family, submitted_at, record, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id)
            DO UPDATE SET record = $5, updated_at = NOW()
            "#,
        )
        .bind(&record.id)
        .bind(record.env.as_str())
        .bind(record.family.as_str())
        .bind(record.submitted_at)
        .bind(&record.body)
        .execute(&self.pool)
        .await?;

        debug!("Stored interaction {}", record.id);
        Ok(())
    }

    async fn list(&self, env: Env) -> OrchestratorResult<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, family, submitted_at, record
            FROM interaction_history
            WHERE env = $1
            ORDER BY submitted_at
            "#,
        )
        .bind(env.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let family: String = row.get("family");
                Ok(StoredRecord {
                    id: row.get("id"),
                    env,
                    family: family
                        .parse::<InteractionFamily>()
                        .map_err(OrchestratorError::Serialization)?,
                    submitted_at: row.get::<DateTime<Utc>, _>("submitted_at"),
                    body: row.get::<Value, _>("record"),
                })
            })
            .collect()
    }

    async fn delete(&self, id: &str) -> OrchestratorResult<()> {
        sqlx::query("DELETE FROM interaction_history WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
