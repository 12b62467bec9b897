//! Forecast engine and its pluggable strategies.
//!
//! A strategy fits a model on a training series; the model predicts a
//! `(y, y_low, y_high)` band per requested timestamp. Strategies are a closed
//! set selected by name from configuration.

pub mod decomposition;
pub mod engine;
pub mod zscore;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use geoanomaly_core::config::PipelineConfig;
use geoanomaly_core::{PipelineError, Series};

pub use decomposition::DecompositionStrategy;
pub use engine::{ForecastEngine, ForecastWindow};
pub use zscore::ZScoreStrategy;

/// Forecast band for one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPoint {
    pub timestamp: DateTime<Utc>,
    pub y: f64,
    pub y_low: f64,
    pub y_high: f64,
}

impl BandPoint {
    pub fn is_finite(&self) -> bool {
        self.y.is_finite() && self.y_low.is_finite() && self.y_high.is_finite()
    }
}

/// A fitted model.
pub trait ForecastModel: Send {
    fn predict(&self, timestamps: &[DateTime<Utc>]) -> Vec<BandPoint>;
}

pub trait ForecastStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bumped whenever fitting or prediction changes numerically.
    fn version(&self) -> u32;

    /// Fit on a chronologically ordered series of finite values.
    fn fit(&self, training: &Series) -> Result<Box<dyn ForecastModel>, PipelineError>;
}

/// Two-sided standard normal quantile for a central interval of `confidence`.
pub fn z_for_confidence(confidence: f64) -> Result<f64, PipelineError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(PipelineError::Config(format!(
            "confidence_level must be in (0, 1), got {confidence}"
        )));
    }
    let normal =
        Normal::new(0.0, 1.0).map_err(|e| PipelineError::FatalComputation(e.to_string()))?;
    Ok(normal.inverse_cdf((1.0 + confidence) / 2.0))
}

/// Build the strategy named by `config.forecast_strategy`.
pub fn strategy_by_name(config: &PipelineConfig) -> Result<Arc<dyn ForecastStrategy>, PipelineError> {
    let z = z_for_confidence(config.confidence_level)?;
    match config.forecast_strategy.as_str() {
        "decomposition" => Ok(Arc::new(DecompositionStrategy {
            z,
            seasonal_period_days: config.seasonal_period_days,
            band_floor_ratio: config.band_floor_ratio,
        })),
        "zscore" => Ok(Arc::new(ZScoreStrategy {
            z,
            window: config.zscore_window,
        })),
        other => Err(PipelineError::Config(format!(
            "unknown forecast strategy '{other}'"
        ))),
    }
}

/// Fractional days between `origin` and `ts`.
pub(crate) fn days_since(origin: DateTime<Utc>, ts: DateTime<Utc>) -> f64 {
    (ts - origin).num_milliseconds() as f64 / 86_400_000.0
}
