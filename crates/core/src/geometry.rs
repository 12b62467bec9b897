use serde::{Deserialize, Serialize};

/// A (longitude, latitude) pair.
pub type Position = [f64; 2];

/// GeoJSON-shaped geometry attached to observations and anomaly records.
///
/// Serializes as `{"type": "Point", "coordinates": [lon, lat]}` and the
/// polygon equivalents, so the tile layer can consume it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    /// Exterior ring first; interior rings are ignored for centroids.
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn point(lon: f64, lat: f64) -> Self {
        Geometry::Point([lon, lat])
    }

    /// Centroid as `[lon, lat]`, or `None` for an empty geometry.
    ///
    /// Polygons use the area-weighted centroid of their exterior ring;
    /// multipolygons weight each part by its area. Rings with zero area
    /// fall back to the mean of their vertices.
    pub fn centroid(&self) -> Option<Position> {
        match self {
            Geometry::Point(p) => Some(*p),
            Geometry::Polygon(rings) => rings.first().and_then(|ring| ring_centroid(ring)),
            Geometry::MultiPolygon(parts) => {
                let mut weighted = [0.0, 0.0];
                let mut total_area = 0.0;
                let mut fallback = Vec::new();

                for ring in parts.iter().filter_map(|rings| rings.first()) {
                    let area = signed_area(ring).abs();
                    if let Some(c) = ring_centroid(ring) {
                        if area > f64::EPSILON {
                            weighted[0] += c[0] * area;
                            weighted[1] += c[1] * area;
                            total_area += area;
                        } else {
                            fallback.push(c);
                        }
                    }
                }

                if total_area > f64::EPSILON {
                    Some([weighted[0] / total_area, weighted[1] / total_area])
                } else {
                    mean_position(&fallback)
                }
            }
        }
    }
}

fn signed_area(ring: &[Position]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let [x0, y0] = ring[i];
        let [x1, y1] = ring[(i + 1) % ring.len()];
        sum += x0 * y1 - x1 * y0;
    }
    sum / 2.0
}

fn ring_centroid(ring: &[Position]) -> Option<Position> {
    let area = signed_area(ring);
    if area.abs() <= f64::EPSILON {
        return mean_position(ring);
    }

    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let [x0, y0] = ring[i];
        let [x1, y1] = ring[(i + 1) % ring.len()];
        let cross = x0 * y1 - x1 * y0;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    Some([cx / (6.0 * area), cy / (6.0 * area)])
}

fn mean_position(points: &[Position]) -> Option<Position> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    Some([sx / n, sy / n])
}
