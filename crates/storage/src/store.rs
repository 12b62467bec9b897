//! Persistence contracts consumed by the pipeline.
//!
//! The Observation Store is read-only to the pipeline. The Anomaly Store and
//! the evaluation ledger are written only through keyed upserts, so
//! concurrent evaluation cycles need no cross-task locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use geoanomaly_core::{AnomalyRecord, EvaluationMark, Observation, SeriesKey};

use crate::error::StoreError;

/// Per-entity metadata used by the scheduler to find due series cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityActivity {
    pub entity_id: String,
    pub latest_timestamp: DateTime<Utc>,
    pub observation_count: u64,
}

/// Filter for reading anomaly records back out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyQuery {
    pub entity_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_severity: Option<f64>,
}

impl AnomalyQuery {
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &AnomalyRecord) -> bool {
        self.entity_id
            .as_deref()
            .map_or(true, |e| e == record.entity_id)
            && self.since.map_or(true, |s| record.timestamp >= s)
            && self.until.map_or(true, |u| record.timestamp <= u)
            && self.min_severity.map_or(true, |m| record.severity_score >= m)
    }
}

#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Observations ordered by `(entity_id, timestamp)`. Bounds are inclusive.
    async fn fetch_observations(
        &self,
        entity_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StoreError>;

    /// Latest timestamp and observation count per entity.
    async fn entity_activity(&self) -> Result<Vec<EntityActivity>, StoreError>;
}

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// Insert or overwrite the record keyed by `(entity_id, timestamp)`.
    async fn upsert_anomaly(&self, record: &AnomalyRecord) -> Result<(), StoreError>;

    /// Remove the record for `(entity_id, timestamp)`. Returns whether one existed.
    async fn clear_anomaly(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Matching records ordered by `(timestamp desc, entity_id)`.
    async fn query_anomalies(&self, query: &AnomalyQuery)
        -> Result<Vec<AnomalyRecord>, StoreError>;

    async fn latest_anomaly_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Persisted per-series scheduling state.
#[async_trait]
pub trait EvaluationLedger: Send + Sync {
    async fn last_evaluation(&self, key: &SeriesKey)
        -> Result<Option<EvaluationMark>, StoreError>;

    async fn evaluation_marks(&self) -> Result<Vec<EvaluationMark>, StoreError>;

    /// Record a finished evaluation. A mark never moves backwards: an older
    /// `as_of` finishing late leaves a newer mark in place.
    async fn record_evaluation(&self, mark: &EvaluationMark) -> Result<(), StoreError>;
}

/// Sort in the order `query_anomalies` promises.
pub(crate) fn sort_anomalies(records: &mut [AnomalyRecord]) {
    records.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}
