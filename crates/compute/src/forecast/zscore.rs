//! Moving-window z-score band: mean ± z·stddev of the latest training values.

use chrono::{DateTime, Utc};

use geoanomaly_core::{PipelineError, Series};

use super::{BandPoint, ForecastModel, ForecastStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct ZScoreStrategy {
    pub z: f64,
    pub window: usize,
}

struct ZScoreModel {
    mean: f64,
    half_width: f64,
}

impl ForecastStrategy for ZScoreStrategy {
    fn name(&self) -> &'static str {
        "zscore"
    }

    fn version(&self) -> u32 {
        1
    }

    fn fit(&self, training: &Series) -> Result<Box<dyn ForecastModel>, PipelineError> {
        let values = training.values();
        let take = self.window.max(1).min(values.len());
        let recent = &values[values.len() - take..];
        if recent.is_empty() {
            return Err(PipelineError::InsufficientData {
                series: training.key.to_string(),
                required: 1,
                available: 0,
            });
        }

        let n = recent.len() as f64;
        let mean = recent.iter().sum::<f64>() / n;
        let stddev = if recent.len() > 1 {
            (recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Ok(Box::new(ZScoreModel {
            mean,
            half_width: self.z * stddev,
        }))
    }
}

impl ForecastModel for ZScoreModel {
    fn predict(&self, timestamps: &[DateTime<Utc>]) -> Vec<BandPoint> {
        timestamps
            .iter()
            .map(|&timestamp| BandPoint {
                timestamp,
                y: self.mean,
                y_low: self.mean - self.half_width,
                y_high: self.mean + self.half_width,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use geoanomaly_core::{Observation, SeriesKey};

    fn series(values: &[f64]) -> Series {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Series {
            key: SeriesKey::entity("E1"),
            observations: values
                .iter()
                .enumerate()
                .map(|(i, v)| Observation::new("E1", t0 + Duration::days(i as i64), *v))
                .collect(),
        }
    }

    #[test]
    fn band_uses_only_the_window() {
        let strategy = ZScoreStrategy { z: 2.0, window: 3 };
        let model = strategy.fit(&series(&[100.0, 100.0, 1.0, 2.0, 3.0])).unwrap();
        let band = model.predict(&[Utc::now()])[0];
        assert!((band.y - 2.0).abs() < 1e-12);
        assert!((band.y_high - 4.0).abs() < 1e-12);
        assert!((band.y_low - 0.0).abs() < 1e-12);
    }

    #[test]
    fn constant_history_gives_degenerate_band() {
        let strategy = ZScoreStrategy { z: 1.28, window: 30 };
        let model = strategy.fit(&series(&[5.0, 5.0, 5.0])).unwrap();
        let band = model.predict(&[Utc::now()])[0];
        assert_eq!(band.y_low, band.y_high);
    }
}
