//! Feature gates stored in PostgreSQL.

use async_trait::async_trait;
use buildq_core::{Error, FeatureFlags, Flag, Result, Runner, RunnerId};
use sqlx::PgPool;

use crate::DbResult;

/// Flags backed by the `feature_gates` table. A runner-specific gate wins
/// over the global gate; with neither, the flag's default applies.
pub struct PgFeatureFlags {
    pool: PgPool,
}

impl PgFeatureFlags {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Set a gate globally, or for one runner.
    pub async fn set(&self, flag: Flag, runner_id: Option<RunnerId>, enabled: bool) -> DbResult<()> {
        match runner_id {
            Some(runner_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO feature_gates (key, runner_id, enabled) VALUES ($1, $2, $3)
                    ON CONFLICT (key, runner_id) DO UPDATE SET enabled = EXCLUDED.enabled
                    "#,
                )
                .bind(flag.name())
                .bind(runner_id.get())
                .bind(enabled)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO feature_gates (key, runner_id, enabled) VALUES ($1, NULL, $2)
                    ON CONFLICT (key) WHERE runner_id IS NULL DO UPDATE SET enabled = EXCLUDED.enabled
                    "#,
                )
                .bind(flag.name())
                .bind(enabled)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn gate(&self, flag: Flag, runner_id: RunnerId) -> DbResult<Option<bool>> {
        let enabled = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT enabled FROM feature_gates
            WHERE key = $1 AND (runner_id = $2 OR runner_id IS NULL)
            ORDER BY runner_id NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(flag.name())
        .bind(runner_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(enabled)
    }
}

#[async_trait]
impl FeatureFlags for PgFeatureFlags {
    async fn enabled(&self, flag: Flag, runner: &Runner) -> Result<bool> {
        let gate = self
            .gate(flag, runner.id)
            .await
            .map_err(|e| Error::FeatureFlag(format!("{}: {}", flag, e)))?;
        Ok(gate.unwrap_or_else(|| flag.default_enabled()))
    }
}
