//! CSV observation loader: `entity_id,timestamp,value[,lon,lat]`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use geoanomaly_core::{Geometry, Observation};

#[derive(Debug, Deserialize)]
struct CsvRow {
    entity_id: String,
    timestamp: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

pub fn read_observations<R: Read>(reader: R) -> anyhow::Result<Vec<Observation>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut observations = Vec::new();
    for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
        // Header is line 1.
        let line = i + 2;
        let row = row.with_context(|| format!("CSV line {line}"))?;
        let timestamp = parse_timestamp(&row.timestamp)
            .ok_or_else(|| anyhow!("CSV line {line}: bad timestamp '{}'", row.timestamp))?;

        let value = match row.value.as_deref().map(str::trim) {
            None | Some("") => f64::NAN,
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("CSV line {line}: bad value '{raw}'"))?,
        };

        let mut obs = Observation::new(row.entity_id, timestamp, value);
        if let (Some(lon), Some(lat)) = (row.lon, row.lat) {
            obs = obs.with_geometry(Geometry::point(lon, lat));
        }
        observations.push(obs);
    }
    Ok(observations)
}

pub fn load_csv(path: &Path) -> anyhow::Result<Vec<Observation>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let observations = read_observations(file)?;
    tracing::info!(path = %path.display(), count = observations.len(), "Loaded observations");
    Ok(observations)
}
