//! Series partitioner: groups raw observations into independent series.

use std::collections::btree_map;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use geoanomaly_core::config::PipelineConfig;
use geoanomaly_core::{CellId, Geometry, Observation, Series, SeriesKey};

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub min_points: usize,
    pub spatial_grouping: bool,
    /// Grid cell edge length in degrees.
    pub cell_size_deg: f64,
}

impl From<&PipelineConfig> for PartitionConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            min_points: config.min_points,
            spatial_grouping: config.spatial_grouping,
            cell_size_deg: config.spatial_cell_size_deg,
        }
    }
}

/// Deterministic grid cell of a geometry's centroid.
pub fn cell_id(geometry: &Geometry, cell_size_deg: f64) -> Option<CellId> {
    let [lon, lat] = geometry.centroid()?;
    if !(cell_size_deg > 0.0) {
        return None;
    }
    let ix = (lon / cell_size_deg).floor() as i64;
    let iy = (lat / cell_size_deg).floor() as i64;

    let mut hasher = Sha256::new();
    hasher.update(format!("{cell_size_deg}:{ix}:{iy}").as_bytes());
    let digest = hasher.finalize();
    Some(CellId(
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect(),
    ))
}

/// Per-series metadata for scheduler planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSummary {
    pub key: SeriesKey,
    pub latest_timestamp: DateTime<Utc>,
    pub len: usize,
}

/// Observations grouped by series key, each group ordered by timestamp.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    groups: BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, Observation>>,
    min_points: usize,
}

/// Group observations by entity (and cell when spatial grouping is on).
///
/// Missing and non-finite values are dropped. A repeated timestamp within a
/// series keeps the observation seen last.
pub fn partition(
    observations: impl IntoIterator<Item = Observation>,
    config: &PartitionConfig,
) -> Partition {
    let mut groups: BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, Observation>> = BTreeMap::new();
    for obs in observations {
        if obs.finite_value().is_none() {
            continue;
        }
        let cell = if config.spatial_grouping {
            obs.geometry
                .as_ref()
                .and_then(|g| cell_id(g, config.cell_size_deg))
        } else {
            None
        };
        let key = SeriesKey {
            entity_id: obs.entity_id.clone(),
            cell,
        };
        groups.entry(key).or_default().insert(obs.timestamp, obs);
    }
    Partition {
        groups,
        min_points: config.min_points,
    }
}

impl Partition {
    /// Lazily yields every series with at least `min_points` observations.
    /// Each call starts over.
    pub fn iter(&self) -> SeriesIter<'_> {
        SeriesIter {
            inner: self.groups.iter(),
            min_points: self.min_points,
        }
    }

    /// The series for `key` regardless of the eligibility threshold.
    pub fn get(&self, key: &SeriesKey) -> Option<Series> {
        self.groups.get(key).map(|by_ts| build_series(key, by_ts))
    }

    /// Keys below the eligibility threshold.
    pub fn skipped(&self) -> Vec<&SeriesKey> {
        self.groups
            .iter()
            .filter(|(_, by_ts)| by_ts.len() < self.min_points)
            .map(|(key, _)| key)
            .collect()
    }

    /// Every series, eligible or not.
    pub fn summaries(&self) -> Vec<SeriesSummary> {
        self.groups
            .iter()
            .filter_map(|(key, by_ts)| {
                by_ts.keys().next_back().map(|latest| SeriesSummary {
                    key: key.clone(),
                    latest_timestamp: *latest,
                    len: by_ts.len(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl<'a> IntoIterator for &'a Partition {
    type Item = Series;
    type IntoIter = SeriesIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SeriesIter<'a> {
    inner: btree_map::Iter<'a, SeriesKey, BTreeMap<DateTime<Utc>, Observation>>,
    min_points: usize,
}

impl Iterator for SeriesIter<'_> {
    type Item = Series;

    fn next(&mut self) -> Option<Series> {
        for (key, by_ts) in self.inner.by_ref() {
            if by_ts.len() >= self.min_points {
                return Some(build_series(key, by_ts));
            }
        }
        None
    }
}

fn build_series(key: &SeriesKey, by_ts: &BTreeMap<DateTime<Utc>, Observation>) -> Series {
    Series {
        key: key.clone(),
        observations: by_ts.values().cloned().collect(),
    }
}
