//! Additive trend + weekly-style seasonality decomposition.
//!
//! Trend is ordinary least squares over days since the first training
//! point. Seasonality is the centered per-phase mean of the detrended
//! residuals, fitted only when the training span covers two full periods.
//! The band is the OLS prediction interval widened by a level-relative floor
//! so that a perfectly fitting history still yields a usable band.

use chrono::{DateTime, Utc};

use geoanomaly_core::{PipelineError, Series};

use super::{days_since, BandPoint, ForecastModel, ForecastStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionStrategy {
    pub z: f64,
    /// 0 disables seasonality.
    pub seasonal_period_days: u32,
    pub band_floor_ratio: f64,
}

#[derive(Debug, Clone)]
struct DecompositionModel {
    origin: DateTime<Utc>,
    intercept: f64,
    slope: f64,
    /// Per-phase offsets; empty when seasonality is off.
    seasonal: Vec<f64>,
    n: f64,
    x_mean: f64,
    sxx: f64,
    residual_var: f64,
    floor: f64,
    z: f64,
}

fn phase(x: f64, period: usize) -> usize {
    (x.floor() as i64).rem_euclid(period as i64) as usize
}

impl ForecastStrategy for DecompositionStrategy {
    fn name(&self) -> &'static str {
        "decomposition"
    }

    fn version(&self) -> u32 {
        1
    }

    fn fit(&self, training: &Series) -> Result<Box<dyn ForecastModel>, PipelineError> {
        let n = training.len();
        let origin = match training.observations.first() {
            Some(first) if n >= 2 => first.timestamp,
            _ => {
                return Err(PipelineError::InsufficientData {
                    series: training.key.to_string(),
                    required: 2,
                    available: n,
                })
            }
        };

        let xs: Vec<f64> = training
            .observations
            .iter()
            .map(|o| days_since(origin, o.timestamp))
            .collect();
        let ys = training.values();
        let nf = n as f64;

        let x_mean = xs.iter().sum::<f64>() / nf;
        let y_mean = ys.iter().sum::<f64>() / nf;
        let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
        let sxy: f64 = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (x - x_mean) * (y - y_mean))
            .sum();
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let intercept = y_mean - slope * x_mean;

        let detrended: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| y - (intercept + slope * x))
            .collect();

        let period = self.seasonal_period_days as usize;
        let span = xs.last().copied().unwrap_or(0.0);
        let mut seasonal = Vec::new();
        let mut seasonal_params = 0usize;
        if period > 0 && span >= 2.0 * period as f64 {
            let mut sums = vec![0.0; period];
            let mut counts = vec![0usize; period];
            for (x, r) in xs.iter().zip(&detrended) {
                let p = phase(*x, period);
                sums[p] += r;
                counts[p] += 1;
            }
            let observed: Vec<usize> = (0..period).filter(|&p| counts[p] > 0).collect();
            let means: Vec<f64> = (0..period)
                .map(|p| if counts[p] > 0 { sums[p] / counts[p] as f64 } else { 0.0 })
                .collect();
            let center =
                observed.iter().map(|&p| means[p]).sum::<f64>() / observed.len().max(1) as f64;
            seasonal = (0..period)
                .map(|p| if counts[p] > 0 { means[p] - center } else { 0.0 })
                .collect();
            seasonal_params = observed.len().saturating_sub(1);
        }

        let sse: f64 = xs
            .iter()
            .zip(&detrended)
            .map(|(x, r)| {
                let s = if seasonal.is_empty() { 0.0 } else { seasonal[phase(*x, period)] };
                (r - s).powi(2)
            })
            .sum();
        let dof = n.saturating_sub(2 + seasonal_params).max(1) as f64;

        Ok(Box::new(DecompositionModel {
            origin,
            intercept,
            slope,
            seasonal,
            n: nf,
            x_mean,
            sxx,
            residual_var: sse / dof,
            floor: self.band_floor_ratio * y_mean.abs(),
            z: self.z,
        }))
    }
}

impl ForecastModel for DecompositionModel {
    fn predict(&self, timestamps: &[DateTime<Utc>]) -> Vec<BandPoint> {
        timestamps
            .iter()
            .map(|&timestamp| {
                let x = days_since(self.origin, timestamp);
                let season = if self.seasonal.is_empty() {
                    0.0
                } else {
                    self.seasonal[phase(x, self.seasonal.len())]
                };
                let y = self.intercept + self.slope * x + season;

                let leverage = if self.sxx > 0.0 {
                    (x - self.x_mean).powi(2) / self.sxx
                } else {
                    0.0
                };
                let var = self.residual_var * (1.0 + 1.0 / self.n + leverage) + self.floor.powi(2);
                let half = self.z * var.sqrt();

                BandPoint {
                    timestamp,
                    y,
                    y_low: y - half,
                    y_high: y + half,
                }
            })
            .collect()
    }
}
