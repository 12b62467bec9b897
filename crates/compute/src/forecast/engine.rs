use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use geoanomaly_core::config::PipelineConfig;
use geoanomaly_core::{EvaluationWindow, PipelineError, Series, SeriesKey};

use super::{strategy_by_name, BandPoint, ForecastStrategy};

/// Bands for the scored part of one evaluation window.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastWindow {
    pub series_key: SeriesKey,
    pub as_of: DateTime<Utc>,
    /// Last training timestamp; points after it are scored.
    pub start: DateTime<Utc>,
    pub horizon: Duration,
    pub training_points: usize,
    pub points: Vec<BandPoint>,
}

/// Splits a series at the window start, fits the configured strategy on the
/// training part and predicts the scored part.
#[derive(Clone)]
pub struct ForecastEngine {
    strategy: Arc<dyn ForecastStrategy>,
    min_points: usize,
    ignore_leading_zeros: bool,
}

impl ForecastEngine {
    pub fn new(strategy: Arc<dyn ForecastStrategy>, min_points: usize) -> Self {
        Self {
            strategy,
            min_points,
            ignore_leading_zeros: false,
        }
    }

    pub fn with_leading_zero_trim(mut self, enabled: bool) -> Self {
        self.ignore_leading_zeros = enabled;
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self::new(strategy_by_name(config)?, config.min_points)
            .with_leading_zero_trim(config.ignore_leading_zeros))
    }

    pub fn strategy(&self) -> &dyn ForecastStrategy {
        self.strategy.as_ref()
    }

    pub fn min_points(&self) -> usize {
        self.min_points
    }

    /// Window start, defaulting to the `min_points`-th observation.
    pub fn resolve_start(
        &self,
        series: &Series,
        window: &EvaluationWindow,
    ) -> Option<DateTime<Utc>> {
        window.start.or_else(|| {
            series
                .observations
                .iter()
                .filter(|o| o.timestamp <= window.as_of)
                .nth(self.min_points.saturating_sub(1))
                .map(|o| o.timestamp)
        })
    }

    pub fn forecast(
        &self,
        series: &Series,
        window: &EvaluationWindow,
    ) -> Result<ForecastWindow, PipelineError> {
        let insufficient = |available: usize| PipelineError::InsufficientData {
            series: series.key.to_string(),
            required: self.min_points,
            available,
        };

        let visible = series.until(window.as_of);
        let start = self
            .resolve_start(&visible, window)
            .ok_or_else(|| insufficient(visible.len()))?;

        let mut training = visible.until(start);
        if self.ignore_leading_zeros {
            let first_nonzero = training
                .observations
                .iter()
                .position(|o| o.value.is_some_and(|v| v != 0.0))
                .unwrap_or(training.observations.len());
            training.observations.drain(..first_nonzero);
        }
        if training.len() < self.min_points {
            return Err(insufficient(training.len()));
        }

        let scored: Vec<DateTime<Utc>> = visible
            .observations
            .iter()
            .map(|o| o.timestamp)
            .filter(|ts| *ts > start)
            .collect();

        let model = self.strategy.fit(&training)?;
        let points = model.predict(&scored);

        if let Some(bad) = points.iter().find(|p| !p.is_finite()) {
            return Err(PipelineError::TransientComputation(format!(
                "{} v{} produced a non-finite band for {} at {}",
                self.strategy.name(),
                self.strategy.version(),
                series.key,
                bad.timestamp
            )));
        }

        debug!(
            series = %series.key,
            training = training.len(),
            scored = points.len(),
            strategy = self.strategy.name(),
            "Forecast computed"
        );

        Ok(ForecastWindow {
            series_key: series.key.clone(),
            as_of: window.as_of,
            start,
            horizon: window.as_of - start,
            training_points: training.len(),
            points,
        })
    }
}
