use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use geoanomaly_core::{AnomalyRecord, EvaluationMark, Observation, SeriesKey};

use crate::error::StoreError;
use crate::store::{
    sort_anomalies, AnomalyQuery, AnomalyStore, EntityActivity, EvaluationLedger,
    ObservationStore,
};

#[derive(Default)]
struct Inner {
    /// entity_id -> timestamp -> observation (last write wins).
    observations: BTreeMap<String, BTreeMap<DateTime<Utc>, Observation>>,
    anomalies: BTreeMap<(String, DateTime<Utc>), AnomalyRecord>,
    marks: HashMap<SeriesKey, EvaluationMark>,
}

/// In-process implementation of all three store contracts.
///
/// Used by tests and by `geoanomaly run`. `set_available(false)` makes every
/// call fail with [`StoreError::Unavailable`] to exercise retry paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append observations. A repeated `(entity_id, timestamp)` replaces the earlier one.
    pub async fn insert_observations(&self, observations: impl IntoIterator<Item = Observation>) {
        let mut inner = self.inner.write().await;
        let mut count = 0usize;
        for obs in observations {
            inner
                .observations
                .entry(obs.entity_id.clone())
                .or_default()
                .insert(obs.timestamp, obs);
            count += 1;
        }
        debug!(count, "Inserted observations into memory store");
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    pub async fn anomaly_count(&self) -> usize {
        self.inner.read().await.anomalies.len()
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn fetch_observations(
        &self,
        entity_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let in_range = |ts: &DateTime<Utc>| {
            since.map_or(true, |s| *ts >= s) && until.map_or(true, |u| *ts <= u)
        };

        let result = inner
            .observations
            .iter()
            .filter(|(entity, _)| entity_id.map_or(true, |e| e == entity.as_str()))
            .flat_map(|(_, by_ts)| by_ts.iter())
            .filter(|(ts, _)| in_range(ts))
            .map(|(_, obs)| obs.clone())
            .collect();
        Ok(result)
    }

    async fn entity_activity(&self) -> Result<Vec<EntityActivity>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .observations
            .iter()
            .filter_map(|(entity, by_ts)| {
                by_ts.keys().next_back().map(|latest| EntityActivity {
                    entity_id: entity.clone(),
                    latest_timestamp: *latest,
                    observation_count: by_ts.len() as u64,
                })
            })
            .collect())
    }
}

#[async_trait]
impl AnomalyStore for MemoryStore {
    async fn upsert_anomaly(&self, record: &AnomalyRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner
            .anomalies
            .insert((record.entity_id.clone(), record.timestamp), record.clone());
        Ok(())
    }

    async fn clear_anomaly(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        Ok(inner
            .anomalies
            .remove(&(entity_id.to_string(), timestamp))
            .is_some())
    }

    async fn query_anomalies(
        &self,
        query: &AnomalyQuery,
    ) -> Result<Vec<AnomalyRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut records: Vec<AnomalyRecord> = inner
            .anomalies
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        sort_anomalies(&mut records);
        Ok(records)
    }

    async fn latest_anomaly_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.anomalies.values().map(|r| r.timestamp).max())
    }
}

#[async_trait]
impl EvaluationLedger for MemoryStore {
    async fn last_evaluation(
        &self,
        key: &SeriesKey,
    ) -> Result<Option<EvaluationMark>, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().await.marks.get(key).cloned())
    }

    async fn evaluation_marks(&self) -> Result<Vec<EvaluationMark>, StoreError> {
        self.check_available()?;
        let mut marks: Vec<EvaluationMark> =
            self.inner.read().await.marks.values().cloned().collect();
        marks.sort_by(|a, b| a.series_key.cmp(&b.series_key));
        Ok(marks)
    }

    async fn record_evaluation(&self, mark: &EvaluationMark) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.marks.get(&mark.series_key) {
            Some(existing) if existing.as_of > mark.as_of => {
                debug!(series = %mark.series_key, "Keeping newer evaluation mark");
            }
            _ => {
                inner.marks.insert(mark.series_key.clone(), mark.clone());
            }
        }
        Ok(())
    }
}
