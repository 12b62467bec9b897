//! PostgreSQL-backed result cache shared by every scheduler and worker process.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use geoanomaly_core::{TaskId, TaskState};

use crate::cache::{ClaimKey, ResultCache};
use crate::error::QueueError;

/// Claims live in `task_claims`, statuses in `task_states`. Expiry is
/// evaluated against the database clock.
#[derive(Clone)]
pub struct PgResultCache {
    pool: PgPool,
    status_ttl: Duration,
}

impl PgResultCache {
    pub fn new(pool: PgPool, status_ttl: Duration) -> Self {
        Self { pool, status_ttl }
    }

    /// Delete expired rows. Reads already ignore them; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        let claims = sqlx::query("DELETE FROM task_claims WHERE expires_at < now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        let states = sqlx::query("DELETE FROM task_states WHERE expires_at < now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(claims + states)
    }
}

#[async_trait]
impl ResultCache for PgResultCache {
    async fn try_claim(
        &self,
        key: &ClaimKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "INSERT INTO task_claims (claim_key, holder, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (claim_key) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE task_claims.expires_at < now()",
        )
        .bind(key.to_string())
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &ClaimKey, holder: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM task_claims WHERE claim_key = $1 AND holder = $2")
            .bind(key.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_status(&self, state: &TaskState) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO task_states (task_id, status, state, expires_at)
             VALUES ($1, $2, $3, now() + make_interval(secs => $4))
             ON CONFLICT (task_id) DO UPDATE SET
                status = EXCLUDED.status,
                state = EXCLUDED.state,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(state.task_id().as_str())
        .bind(state.status.as_str())
        .bind(Json(state))
        .bind(self.status_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskState>, QueueError> {
        let row: Option<Json<TaskState>> = sqlx::query_scalar(
            "SELECT state FROM task_states WHERE task_id = $1 AND expires_at > now()",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|json| json.0))
    }

    async fn note_duplicate(&self, task_id: &TaskId) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE task_states
             SET state = jsonb_set(
                 state,
                 '{duplicate_submissions}',
                 to_jsonb(COALESCE((state->>'duplicate_submissions')::int, 0) + 1)
             )
             WHERE task_id = $1",
        )
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<TaskState>, QueueError> {
        let rows: Vec<Json<TaskState>> = sqlx::query_scalar(
            "SELECT state FROM task_states WHERE expires_at > now() ORDER BY task_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|json| json.0).collect())
    }
}
