//! PostgreSQL backend for the observation, anomaly and ledger contracts.
//!
//! Geometry is stored as GeoJSON in `JSONB` columns so the store works on a
//! plain PostgreSQL as well as PostGIS.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use geoanomaly_core::config::PostgresConfig;
use geoanomaly_core::{
    AnomalyDirection, AnomalyRecord, CellId, EvaluationMark, EvaluationOutcome, Geometry, Observation,
    SeriesKey,
};

use crate::error::StoreError;
use crate::store::{AnomalyQuery, AnomalyStore, EntityActivity, EvaluationLedger, ObservationStore};

/// Rows per multi-value INSERT during bulk loads.
const INSERT_CHUNK: usize = 1_000;

/// Open a connection pool.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.connection_url())
        .await?;
    info!(host = %config.host, database = %config.database, "PostgreSQL connected");
    Ok(pool)
}

/// Apply the bundled schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;
    info!("Database migrations applied successfully");
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ObservationRow {
    entity_id: String,
    ts: DateTime<Utc>,
    value: Option<f64>,
    geometry: Option<Json<Geometry>>,
}

impl From<ObservationRow> for Observation {
    fn from(row: ObservationRow) -> Self {
        Observation {
            entity_id: row.entity_id,
            geometry: row.geometry.map(|g| g.0),
            timestamp: row.ts,
            value: row.value.filter(|v| !v.is_nan()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnomalyRow {
    entity_id: String,
    ts: DateTime<Utc>,
    geometry: Option<Json<Geometry>>,
    observed_value: f64,
    expected_value: f64,
    lower_bound: f64,
    upper_bound: f64,
    severity_score: f64,
    direction: String,
    detected_at: DateTime<Utc>,
}

impl TryFrom<AnomalyRow> for AnomalyRecord {
    type Error = StoreError;

    fn try_from(row: AnomalyRow) -> Result<Self, Self::Error> {
        let direction: AnomalyDirection = row.direction.parse().map_err(StoreError::Corrupt)?;
        Ok(AnomalyRecord {
            entity_id: row.entity_id,
            timestamp: row.ts,
            geometry: row.geometry.map(|g| g.0),
            observed_value: row.observed_value,
            expected_value: row.expected_value,
            lower_bound: row.lower_bound,
            upper_bound: row.upper_bound,
            severity_score: row.severity_score,
            direction,
            detected_at: row.detected_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MarkRow {
    entity_id: String,
    cell_id: String,
    as_of: DateTime<Utc>,
    window_start: Option<DateTime<Utc>>,
    evaluated_at: DateTime<Utc>,
    outcome: String,
}

impl TryFrom<MarkRow> for EvaluationMark {
    type Error = StoreError;

    fn try_from(row: MarkRow) -> Result<Self, Self::Error> {
        let series_key = if row.cell_id.is_empty() {
            SeriesKey::entity(row.entity_id)
        } else {
            SeriesKey::with_cell(row.entity_id, CellId(row.cell_id))
        };
        let outcome = match row.outcome.as_str() {
            "completed" => EvaluationOutcome::Completed,
            "skipped" => EvaluationOutcome::Skipped,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown evaluation outcome '{other}'"
                )))
            }
        };
        Ok(EvaluationMark {
            series_key,
            as_of: row.as_of,
            window_start: row.window_start,
            evaluated_at: row.evaluated_at,
            outcome,
        })
    }
}

fn cell_column(key: &SeriesKey) -> &str {
    key.cell.as_ref().map_or("", |c| c.0.as_str())
}

/// Keep only the last row per `(entity_id, timestamp)`, in input order.
/// A single multi-row upsert may not touch the same key twice.
fn last_write_wins(observations: &[Observation]) -> Vec<&Observation> {
    let mut latest: HashMap<(&str, DateTime<Utc>), usize> =
        HashMap::with_capacity(observations.len());
    for (i, obs) in observations.iter().enumerate() {
        latest.insert((obs.entity_id.as_str(), obs.timestamp), i);
    }
    observations
        .iter()
        .enumerate()
        .filter(|(i, obs)| latest.get(&(obs.entity_id.as_str(), obs.timestamp)) == Some(i))
        .map(|(_, obs)| obs)
        .collect()
}

/// Shared-pool store over the `observations`, `anomalies` and
/// `series_evaluations` tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bulk load observations. A repeated `(entity_id, timestamp)` overwrites
    /// the stored row. Returns the number of rows written.
    pub async fn insert_observations(&self, observations: &[Observation]) -> Result<u64, StoreError> {
        let rows = last_write_wins(observations);
        if rows.len() < observations.len() {
            debug!(
                dropped = observations.len() - rows.len(),
                "Collapsed repeated observation keys"
            );
        }
        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO observations (entity_id, ts, value, geometry) ");
            qb.push_values(chunk.iter().copied(), |mut b, obs| {
                b.push_bind(&obs.entity_id)
                    .push_bind(obs.timestamp)
                    .push_bind(obs.finite_value())
                    .push_bind(obs.geometry.as_ref().map(Json));
            });
            qb.push(
                " ON CONFLICT (entity_id, ts) DO UPDATE \
                 SET value = EXCLUDED.value, geometry = EXCLUDED.geometry",
            );
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(written, "Inserted observations");
        Ok(written)
    }
}

#[async_trait]
impl ObservationStore for PgStore {
    async fn fetch_observations(
        &self,
        entity_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            "SELECT entity_id, ts, value, geometry
             FROM observations
             WHERE ($1::text IS NULL OR entity_id = $1)
               AND ($2::timestamptz IS NULL OR ts >= $2)
               AND ($3::timestamptz IS NULL OR ts <= $3)
             ORDER BY entity_id, ts",
        )
        .bind(entity_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Observation::from).collect())
    }

    async fn entity_activity(&self) -> Result<Vec<EntityActivity>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>, i64)> = sqlx::query_as(
            "SELECT entity_id, MAX(ts), COUNT(*)
             FROM observations
             GROUP BY entity_id
             ORDER BY entity_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(entity_id, latest_timestamp, count)| EntityActivity {
                entity_id,
                latest_timestamp,
                observation_count: count.max(0) as u64,
            })
            .collect())
    }
}

#[async_trait]
impl AnomalyStore for PgStore {
    async fn upsert_anomaly(&self, record: &AnomalyRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO anomalies (entity_id, ts, geometry, observed_value, expected_value,
                                    lower_bound, upper_bound, severity_score, direction, detected_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (entity_id, ts) DO UPDATE SET
                geometry = EXCLUDED.geometry,
                observed_value = EXCLUDED.observed_value,
                expected_value = EXCLUDED.expected_value,
                lower_bound = EXCLUDED.lower_bound,
                upper_bound = EXCLUDED.upper_bound,
                severity_score = EXCLUDED.severity_score,
                direction = EXCLUDED.direction,
                detected_at = EXCLUDED.detected_at",
        )
        .bind(&record.entity_id)
        .bind(record.timestamp)
        .bind(record.geometry.as_ref().map(Json))
        .bind(record.observed_value)
        .bind(record.expected_value)
        .bind(record.lower_bound)
        .bind(record.upper_bound)
        .bind(record.severity_score)
        .bind(record.direction.as_str())
        .bind(record.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_anomaly(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM anomalies WHERE entity_id = $1 AND ts = $2")
            .bind(entity_id)
            .bind(timestamp)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_anomalies(
        &self,
        query: &AnomalyQuery,
    ) -> Result<Vec<AnomalyRecord>, StoreError> {
        let rows = sqlx::query_as::<_, AnomalyRow>(
            "SELECT entity_id, ts, geometry, observed_value, expected_value,
                    lower_bound, upper_bound, severity_score, direction, detected_at
             FROM anomalies
             WHERE ($1::text IS NULL OR entity_id = $1)
               AND ($2::timestamptz IS NULL OR ts >= $2)
               AND ($3::timestamptz IS NULL OR ts <= $3)
               AND ($4::float8 IS NULL OR severity_score >= $4)
             ORDER BY ts DESC, entity_id",
        )
        .bind(query.entity_id.as_deref())
        .bind(query.since)
        .bind(query.until)
        .bind(query.min_severity)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AnomalyRecord::try_from).collect()
    }

    async fn latest_anomaly_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(ts) FROM anomalies")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }
}

#[async_trait]
impl EvaluationLedger for PgStore {
    async fn last_evaluation(
        &self,
        key: &SeriesKey,
    ) -> Result<Option<EvaluationMark>, StoreError> {
        let row = sqlx::query_as::<_, MarkRow>(
            "SELECT entity_id, cell_id, as_of, window_start, evaluated_at, outcome
             FROM series_evaluations
             WHERE entity_id = $1 AND cell_id = $2",
        )
        .bind(&key.entity_id)
        .bind(cell_column(key))
        .fetch_optional(&self.pool)
        .await?;

        row.map(EvaluationMark::try_from).transpose()
    }

    async fn evaluation_marks(&self) -> Result<Vec<EvaluationMark>, StoreError> {
        let rows = sqlx::query_as::<_, MarkRow>(
            "SELECT entity_id, cell_id, as_of, window_start, evaluated_at, outcome
             FROM series_evaluations
             ORDER BY entity_id, cell_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EvaluationMark::try_from).collect()
    }

    async fn record_evaluation(&self, mark: &EvaluationMark) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO series_evaluations
                (entity_id, cell_id, as_of, window_start, evaluated_at, outcome)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (entity_id, cell_id) DO UPDATE SET
                as_of = EXCLUDED.as_of,
                window_start = EXCLUDED.window_start,
                evaluated_at = EXCLUDED.evaluated_at,
                outcome = EXCLUDED.outcome
             WHERE series_evaluations.as_of <= EXCLUDED.as_of",
        )
        .bind(&mark.series_key.entity_id)
        .bind(cell_column(&mark.series_key))
        .bind(mark.as_of)
        .bind(mark.window_start)
        .bind(mark.evaluated_at)
        .bind(mark.outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn repeated_keys_keep_the_last_row() {
        let observations = vec![
            Observation::new("E1", ts(1), 1.0),
            Observation::new("E2", ts(1), 2.0),
            Observation::new("E1", ts(1), 3.0),
            Observation::new("E1", ts(2), 4.0),
        ];
        let rows = last_write_wins(&observations);
        let values: Vec<_> = rows.iter().map(|o| (o.entity_id.as_str(), o.value)).collect();
        assert_eq!(
            values,
            vec![("E2", Some(2.0)), ("E1", Some(3.0)), ("E1", Some(4.0))]
        );
    }

    #[test]
    fn distinct_keys_pass_through() {
        let observations = vec![
            Observation::new("E1", ts(1), 1.0),
            Observation::new("E1", ts(2), 2.0),
        ];
        assert_eq!(last_write_wins(&observations).len(), 2);
    }

    #[test]
    fn unsplit_series_use_the_empty_cell() {
        assert_eq!(cell_column(&SeriesKey::entity("user@example.org")), "");
        let celled = SeriesKey::with_cell("E1", CellId("0a1b".into()));
        assert_eq!(cell_column(&celled), "0a1b");
    }
}
