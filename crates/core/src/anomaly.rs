use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;

/// Which side of the forecast band an anomalous observation fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyDirection {
    Above,
    Below,
}

impl AnomalyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyDirection::Above => "above",
            AnomalyDirection::Below => "below",
        }
    }
}

impl std::str::FromStr for AnomalyDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "above" => Ok(AnomalyDirection::Above),
            "below" => Ok(AnomalyDirection::Below),
            other => Err(format!("unknown anomaly direction '{other}'")),
        }
    }
}

/// An observation that fell outside its forecast band.
///
/// At most one record exists per `(entity_id, timestamp)`; re-evaluation
/// overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub geometry: Option<Geometry>,
    pub observed_value: f64,
    pub expected_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Normalized band violation, always > 0 for a stored record.
    pub severity_score: f64,
    pub direction: AnomalyDirection,
    pub detected_at: DateTime<Utc>,
}

impl AnomalyRecord {
    /// Upsert key.
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.entity_id, self.timestamp)
    }
}
