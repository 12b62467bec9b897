//! One task execution: partition, forecast, score, write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use geoanomaly_core::config::PipelineConfig;
use geoanomaly_core::{
    Clock, EvaluationMark, EvaluationOutcome, EvaluationSummary, Observation, PipelineError,
    TaskDescriptor, TaskOutcome,
};
use geoanomaly_storage::{AnomalyStore, EvaluationLedger, ObservationStore};

use crate::backends::Backends;
use crate::forecast::ForecastEngine;
use crate::partition::{partition, PartitionConfig};
use crate::scorer::AnomalyScorer;

/// Evaluates task descriptors against the stores. Holds no per-task state,
/// so one instance is shared by every worker slot.
pub struct Evaluator {
    observations: Arc<dyn ObservationStore>,
    anomalies: Arc<dyn AnomalyStore>,
    ledger: Arc<dyn EvaluationLedger>,
    clock: Arc<dyn Clock>,
    engine: Arc<ForecastEngine>,
    scorer: AnomalyScorer,
    partition: PartitionConfig,
    clear_false_positives: bool,
}

impl Evaluator {
    pub fn new(backends: &Backends, config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            observations: backends.observations.clone(),
            anomalies: backends.anomalies.clone(),
            ledger: backends.ledger.clone(),
            clock: backends.clock.clone(),
            engine: Arc::new(ForecastEngine::from_config(config)?),
            scorer: AnomalyScorer::default(),
            partition: PartitionConfig::from(config),
            clear_false_positives: config.clear_false_positives,
        })
    }

    /// Run one task and classify the result. Never panics on task errors.
    pub async fn evaluate(&self, task: &TaskDescriptor) -> TaskOutcome {
        match self.run(task).await {
            Ok((summary, start)) => {
                match self.mark(task, start, EvaluationOutcome::Completed).await {
                    Ok(()) => TaskOutcome::Success(summary),
                    Err(e) => e.into_outcome(),
                }
            }
            Err(e @ PipelineError::InsufficientData { .. }) => {
                debug!(task_id = %task.task_id, series = %task.series_key, "{e}");
                match self
                    .mark(task, task.window.start, EvaluationOutcome::Skipped)
                    .await
                {
                    Ok(()) => e.into_outcome(),
                    Err(store) => store.into_outcome(),
                }
            }
            Err(e) => e.into_outcome(),
        }
    }

    async fn run(
        &self,
        task: &TaskDescriptor,
    ) -> Result<(EvaluationSummary, Option<DateTime<Utc>>), PipelineError> {
        let key = &task.series_key;
        let observations = self
            .observations
            .fetch_observations(Some(&key.entity_id), None, Some(task.as_of()))
            .await?;

        let series = partition(observations, &self.partition)
            .get(key)
            .ok_or_else(|| PipelineError::InsufficientData {
                series: key.to_string(),
                required: self.engine.min_points(),
                available: 0,
            })?;

        let engine = Arc::clone(&self.engine);
        let window = task.window;
        let (series, forecast) = tokio::task::spawn_blocking(move || {
            let forecast = engine.forecast(&series, &window);
            (series, forecast)
        })
        .await
        .map_err(|e| PipelineError::TransientComputation(format!("forecast task aborted: {e}")))?;
        let forecast = forecast?;

        let by_ts: HashMap<DateTime<Utc>, &Observation> = series
            .observations
            .iter()
            .map(|o| (o.timestamp, o))
            .collect();

        let detected_at = self.clock.now();
        let mut summary = EvaluationSummary::default();
        for band in &forecast.points {
            let Some(obs) = by_ts.get(&band.timestamp) else {
                continue;
            };
            summary.scored += 1;
            match self.scorer.score(obs, band, detected_at) {
                Some(record) => {
                    self.anomalies.upsert_anomaly(&record).await?;
                    summary.anomalies += 1;
                }
                None if self.clear_false_positives => {
                    if self
                        .anomalies
                        .clear_anomaly(&obs.entity_id, obs.timestamp)
                        .await?
                    {
                        summary.cleared += 1;
                    }
                }
                None => {}
            }
        }

        if summary.anomalies > 0 {
            info!(
                task_id = %task.task_id,
                series = %key,
                scored = summary.scored,
                anomalies = summary.anomalies,
                "Anomalies detected"
            );
        }
        Ok((summary, Some(forecast.start)))
    }

    async fn mark(
        &self,
        task: &TaskDescriptor,
        window_start: Option<DateTime<Utc>>,
        outcome: EvaluationOutcome,
    ) -> Result<(), PipelineError> {
        let mark = EvaluationMark {
            series_key: task.series_key.clone(),
            as_of: task.as_of(),
            window_start,
            evaluated_at: self.clock.now(),
            outcome,
        };
        self.ledger.record_evaluation(&mark).await.map_err(|e| {
            warn!(task_id = %task.task_id, error = %e, "Failed to record evaluation mark");
            PipelineError::from(e)
        })
    }
}
