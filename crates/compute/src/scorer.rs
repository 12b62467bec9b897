//! Anomaly scorer: compares an observation against its forecast band.

use chrono::{DateTime, Utc};

use geoanomaly_core::{AnomalyDirection, AnomalyRecord, Observation};

use crate::forecast::BandPoint;

/// Deviation from `y` that counts as anomalous when the band has zero width.
pub const DEGENERATE_BAND_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScorer {
    pub epsilon: f64,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self {
            epsilon: DEGENERATE_BAND_EPSILON,
        }
    }
}

impl AnomalyScorer {
    /// Severity and side of a band violation, `None` when `value` is inside
    /// the closed band.
    ///
    /// Severity is the distance past the violated bound in band widths. A
    /// degenerate band (`y_high == y_low`) flags any deviation from `y`
    /// beyond `epsilon` with severity 1.0.
    pub fn severity(&self, value: f64, band: &BandPoint) -> Option<(f64, AnomalyDirection)> {
        if !value.is_finite() {
            return None;
        }
        let width = band.y_high - band.y_low;
        if width <= 0.0 {
            let deviation = value - band.y;
            if deviation.abs() <= self.epsilon {
                return None;
            }
            let direction = if deviation > 0.0 {
                AnomalyDirection::Above
            } else {
                AnomalyDirection::Below
            };
            return Some((1.0, direction));
        }

        let (excess, direction) = if value > band.y_high {
            (value - band.y_high, AnomalyDirection::Above)
        } else if value < band.y_low {
            (band.y_low - value, AnomalyDirection::Below)
        } else {
            return None;
        };
        // A value one ulp outside still has to score above zero.
        Some(((excess / width).max(f64::MIN_POSITIVE), direction))
    }

    pub fn score(
        &self,
        observation: &Observation,
        band: &BandPoint,
        detected_at: DateTime<Utc>,
    ) -> Option<AnomalyRecord> {
        let value = observation.finite_value()?;
        let (severity_score, direction) = self.severity(value, band)?;
        Some(AnomalyRecord {
            entity_id: observation.entity_id.clone(),
            timestamp: observation.timestamp,
            geometry: observation.geometry.clone(),
            observed_value: value,
            expected_value: band.y,
            lower_bound: band.y_low,
            upper_bound: band.y_high,
            severity_score,
            direction,
            detected_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn band(y_low: f64, y: f64, y_high: f64) -> BandPoint {
        BandPoint {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap(),
            y,
            y_low,
            y_high,
        }
    }

    #[test]
    fn values_on_the_bounds_are_not_anomalous() {
        let scorer = AnomalyScorer::default();
        let b = band(9.0, 10.0, 11.0);
        assert!(scorer.severity(9.0, &b).is_none());
        assert!(scorer.severity(11.0, &b).is_none());
        assert!(scorer.severity(10.0, &b).is_none());
    }

    #[test]
    fn values_just_outside_are_anomalous() {
        let scorer = AnomalyScorer::default();
        let b = band(9.0, 10.0, 11.0);

        let (sev, dir) = scorer.severity(f64::from_bits(11.0f64.to_bits() + 1), &b).unwrap();
        assert!(sev > 0.0);
        assert_eq!(dir, AnomalyDirection::Above);

        let (sev, dir) = scorer.severity(f64::from_bits(9.0f64.to_bits() - 1), &b).unwrap();
        assert!(sev > 0.0);
        assert_eq!(dir, AnomalyDirection::Below);
    }

    #[test]
    fn severity_is_in_band_widths() {
        let scorer = AnomalyScorer::default();
        let b = band(9.0, 10.0, 11.0);
        assert_eq!(scorer.severity(14.0, &b), Some((1.5, AnomalyDirection::Above)));
        assert_eq!(scorer.severity(8.0, &b), Some((0.5, AnomalyDirection::Below)));
    }

    #[test]
    fn degenerate_band_uses_epsilon() {
        let scorer = AnomalyScorer::default();
        let b = band(5.0, 5.0, 5.0);
        assert!(scorer.severity(5.0, &b).is_none());
        assert!(scorer.severity(5.0 + 1e-12, &b).is_none());
        assert_eq!(scorer.severity(5.1, &b), Some((1.0, AnomalyDirection::Above)));
        assert_eq!(scorer.severity(4.0, &b), Some((1.0, AnomalyDirection::Below)));
    }

    #[test]
    fn score_builds_record_from_observation() {
        let scorer = AnomalyScorer::default();
        let ts = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let obs = Observation::new("E1", ts, 55.0);
        let detected = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();

        let record = scorer.score(&obs, &band(10.0, 11.0, 12.0), detected).unwrap();
        assert_eq!(record.entity_id, "E1");
        assert_eq!(record.observed_value, 55.0);
        assert_eq!(record.expected_value, 11.0);
        assert_eq!(record.detected_at, detected);
        assert!(record.severity_score > 1.0);

        let missing = Observation::new("E1", ts, f64::NAN);
        assert!(scorer.score(&missing, &band(10.0, 11.0, 12.0), detected).is_none());
    }
}
