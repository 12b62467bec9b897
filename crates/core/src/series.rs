use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::observation::Observation;

/// Deterministic identifier of a spatial grid cell (hex digest prefix).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub String);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grouping key of a series: the entity, optionally restricted to one cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub entity_id: String,
    pub cell: Option<CellId>,
}

impl SeriesKey {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            cell: None,
        }
    }

    pub fn with_cell(entity_id: impl Into<String>, cell: CellId) -> Self {
        Self {
            entity_id: entity_id.into(),
            cell: Some(cell),
        }
    }

    /// Feed the structured key into a digest. Fields are length-prefixed so
    /// no two distinct keys hash the same byte stream.
    pub fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update((self.entity_id.len() as u64).to_le_bytes());
        hasher.update(self.entity_id.as_bytes());
        match &self.cell {
            Some(cell) => {
                hasher.update([1u8]);
                hasher.update((cell.0.len() as u64).to_le_bytes());
                hasher.update(cell.0.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }

    /// Short hex digest of the key, safe for broker fields that restrict
    /// their character set (SQS message groups).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Rendered as `entity` or `entity@cell`. `%` and `@` inside the entity id
/// are percent-escaped, so the last `@` always separates the cell.
impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.entity_id.chars() {
            match ch {
                '%' => f.write_str("%25")?,
                '@' => f.write_str("%40")?,
                other => write!(f, "{other}")?,
            }
        }
        if let Some(cell) = &self.cell {
            write!(f, "@{cell}")?;
        }
        Ok(())
    }
}

fn unescape_entity(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos..pos + 3)?;
        match escape {
            "%25" => out.push('%'),
            "%40" => out.push('@'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

impl FromStr for SeriesKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed =
            |why: &str| PipelineError::FatalComputation(format!("malformed series key '{s}': {why}"));

        let (entity, cell) = match s.rsplit_once('@') {
            Some((entity, cell)) => (entity, Some(cell)),
            None => (s, None),
        };
        if entity.is_empty() {
            return Err(malformed("empty entity id"));
        }
        let entity = unescape_entity(entity).ok_or_else(|| malformed("bad escape"))?;
        match cell {
            Some(c) if c.is_empty() || !c.chars().all(|ch| ch.is_ascii_hexdigit()) => {
                Err(malformed("bad cell id"))
            }
            Some(c) => Ok(SeriesKey::with_cell(entity, CellId(c.to_string()))),
            None => Ok(SeriesKey::entity(entity)),
        }
    }
}

/// An analyzable sequence of observations for one series key.
///
/// Observations are strictly ordered by timestamp, carry no duplicate
/// timestamps, and all have a finite value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub key: SeriesKey,
    pub observations: Vec<Observation>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.observations.iter().map(|o| o.timestamp).collect()
    }

    /// Values in timestamp order. Partitioned series never hold missing values.
    pub fn values(&self) -> Vec<f64> {
        self.observations
            .iter()
            .map(|o| o.value.unwrap_or(f64::NAN))
            .collect()
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|o| o.timestamp)
    }

    /// Observations with `timestamp <= cutoff`, as a new series.
    pub fn until(&self, cutoff: DateTime<Utc>) -> Series {
        Series {
            key: self.key.clone(),
            observations: self
                .observations
                .iter()
                .filter(|o| o.timestamp <= cutoff)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_parse() {
        let plain = SeriesKey::entity("ESP.1.1_1");
        assert_eq!(plain.to_string(), "ESP.1.1_1");
        assert_eq!("ESP.1.1_1".parse::<SeriesKey>().unwrap(), plain);

        let celled = SeriesKey::with_cell("E1", CellId("00ff12ab".into()));
        assert_eq!(celled.to_string(), "E1@00ff12ab");
        assert_eq!("E1@00ff12ab".parse::<SeriesKey>().unwrap(), celled);
    }

    #[test]
    fn malformed_keys_are_fatal() {
        assert!(matches!(
            "".parse::<SeriesKey>(),
            Err(PipelineError::FatalComputation(_))
        ));
        assert!(matches!(
            "E1@not-hex".parse::<SeriesKey>(),
            Err(PipelineError::FatalComputation(_))
        ));
        assert!("@abc".parse::<SeriesKey>().is_err());
        assert!("E%1".parse::<SeriesKey>().is_err());
    }

    #[test]
    fn entity_ids_with_separators_round_trip() {
        for key in [
            SeriesKey::entity("user@example.org"),
            SeriesKey::entity("site@1"),
            SeriesKey::entity("100%"),
            SeriesKey::entity("%40"),
            SeriesKey::with_cell("user@example.org", CellId("0a1b".into())),
        ] {
            assert_eq!(key.to_string().parse::<SeriesKey>().unwrap(), key);
        }

        // An entity that looks like a celled key stays a plain entity.
        let tricky = SeriesKey::entity("site@1");
        assert_eq!(tricky.to_string(), "site%401");
        assert_ne!(tricky, SeriesKey::with_cell("site", CellId("1".into())));
    }

    #[test]
    fn digest_separates_entity_and_cell() {
        let plain = SeriesKey::entity("site@1");
        let celled = SeriesKey::with_cell("site", CellId("1".into()));
        assert_ne!(plain.digest(), celled.digest());
        assert_eq!(plain.digest(), SeriesKey::entity("site@1").digest());
        assert_eq!(plain.digest().len(), 32);
        assert!(plain.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
