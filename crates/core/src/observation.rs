use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;

/// One geolocated measurement for an entity. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub geometry: Option<Geometry>,
    pub timestamp: DateTime<Utc>,
    /// `None` for a missing measurement; NaN is normalized to `None`.
    pub value: Option<f64>,
}

impl Observation {
    pub fn new(entity_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            geometry: None,
            timestamp,
            value: if value.is_nan() { None } else { Some(value) },
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// The value if it is present and finite.
    pub fn finite_value(&self) -> Option<f64> {
        self.value.filter(|v| v.is_finite())
    }
}
