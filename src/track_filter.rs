//! Multi-level cleanup of historical tracks (§4.G).

use crate::geo::haversine_distance_km;
use crate::model::{AircraftKind, Position, TrackPoint};
use chrono::Duration;
use serde::Serialize;

const DUPLICATE_EPSILON_DEG: f64 = 1e-6;
const TELEPORT_KM: f64 = 200.0;
const TIME_GAP_MINUTES: i64 = 30;
const SPEED_TOLERANCE: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterLevel {
    Raw = 0,
    DedupTeleport = 1,
    Segmented = 2,
    SpeedPlausible = 3,
}

impl FilterLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Raw),
            1 => Some(Self::DedupTeleport),
            2 => Some(Self::Segmented),
            3 => Some(Self::SpeedPlausible),
            _ => None,
        }
    }
}

/// Default filter level: the spec's two divergent defaults (2 vs 3) are
/// resolved in favor of 2.
pub const DEFAULT_FILTER_LEVEL: FilterLevel = FilterLevel::Segmented;

#[derive(Debug, Clone, Serialize)]
pub struct FilteredTrack {
    pub points: Vec<TrackPoint>,
    pub original_count: usize,
    pub filtered_count: usize,
    /// Indices into `points` where a new segment begins (level >= 2).
    pub segment_boundaries: Vec<usize>,
}

fn position_of(p: &TrackPoint) -> Position {
    Position { lat: p.lat, lon: p.lon }
}

fn is_duplicate(a: &TrackPoint, b: &TrackPoint) -> bool {
    (a.lat - b.lat).abs() < DUPLICATE_EPSILON_DEG
        && (a.lon - b.lon).abs() < DUPLICATE_EPSILON_DEG
        && (a.altitude_m - b.altitude_m).abs() < DUPLICATE_EPSILON_DEG
}

fn dedup_and_drop_teleports(points: &[TrackPoint]) -> Vec<TrackPoint> {
    let mut out: Vec<TrackPoint> = Vec::with_capacity(points.len());
    for p in points {
        if let Some(last) = out.last() {
            if is_duplicate(last, p) {
                continue;
            }
            let distance = haversine_distance_km(position_of(last), position_of(p));
            if distance > TELEPORT_KM {
                continue;
            }
        }
        out.push(*p);
    }
    out
}

/// Segment on time gaps > 30 min, returning the largest contiguous segment
/// and the boundary indices internal to *that* segment. A time-gap split is
/// exactly what separates one segment from the next, so the largest segment
/// is itself gap-free and carries no internal boundaries.
fn segment_by_time_gap(points: &[TrackPoint]) -> (Vec<TrackPoint>, Vec<usize>) {
    if points.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut segments: Vec<Vec<TrackPoint>> = vec![vec![points[0]]];
    for window in points.windows(2) {
        let gap = window[1].instant - window[0].instant;
        if gap > Duration::minutes(TIME_GAP_MINUTES) {
            segments.push(Vec::new());
        }
        segments.last_mut().unwrap().push(window[1]);
    }

    let largest = segments.into_iter().max_by_key(|s| s.len()).unwrap_or_default();
    (largest, Vec::new())
}

fn remove_speed_outliers(points: &[TrackPoint], kind: AircraftKind) -> Vec<TrackPoint> {
    let mut current = points.to_vec();
    loop {
        let before = current.len();
        let mut next = Vec::with_capacity(current.len());
        for i in 0..current.len() {
            if i == 0 {
                next.push(current[i]);
                continue;
            }
            let prev = next.last().copied().unwrap_or(current[i - 1]);
            let dt_hours = (current[i].instant - prev.instant).num_milliseconds().max(1) as f64 / 3_600_000.0;
            let distance = haversine_distance_km(position_of(&prev), position_of(&current[i]));
            let implied_speed = distance / dt_hours;
            if implied_speed <= SPEED_TOLERANCE * kind.max_speed_kmh() {
                next.push(current[i]);
            }
        }
        current = next;
        if current.len() == before {
            break;
        }
    }
    current
}

/// Render a filtered track as a GeoJSON `FeatureCollection`, one
/// `LineString` feature per segment so clients can render the breaks
/// `segment_boundaries` already describes (§4.J `format=geojson`).
pub fn to_geojson(track: &FilteredTrack) -> serde_json::Value {
    let len = track.points.len();
    let mut bounds: Vec<usize> = std::iter::once(0)
        .chain(track.segment_boundaries.iter().copied().filter(|&b| b > 0 && b < len))
        .chain(std::iter::once(len))
        .collect();
    bounds.dedup();

    let features: Vec<serde_json::Value> = bounds
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| {
            let segment = &track.points[w[0]..w[1]];
            let coordinates: Vec<[f64; 2]> = segment.iter().map(|p| [p.lon, p.lat]).collect();
            serde_json::json!({
                "type": "Feature",
                "geometry": { "type": "LineString", "coordinates": coordinates },
                "properties": {
                    "altitudes_m": segment.iter().map(|p| p.altitude_m).collect::<Vec<_>>(),
                    "speeds_kmh": segment.iter().map(|p| p.speed_kmh).collect::<Vec<_>>(),
                    "climbs_ms": segment.iter().map(|p| p.climb_ms).collect::<Vec<_>>(),
                    "instants": segment.iter().map(|p| p.instant.to_rfc3339()).collect::<Vec<_>>(),
                },
            })
        })
        .collect();

    serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
        "original_count": track.original_count,
        "filtered_count": track.filtered_count,
    })
}

/// Apply the requested filter level to a chronologically ordered track.
pub fn apply(points: &[TrackPoint], level: FilterLevel, kind: AircraftKind) -> FilteredTrack {
    let original_count = points.len();

    if level == FilterLevel::Raw {
        return FilteredTrack {
            points: points.to_vec(),
            original_count,
            filtered_count: original_count,
            segment_boundaries: Vec::new(),
        };
    }

    let cleaned = dedup_and_drop_teleports(points);
    if level == FilterLevel::DedupTeleport {
        let filtered_count = cleaned.len();
        return FilteredTrack {
            points: cleaned,
            original_count,
            filtered_count,
            segment_boundaries: Vec::new(),
        };
    }

    let (segmented, boundaries) = segment_by_time_gap(&cleaned);
    if level == FilterLevel::Segmented {
        let filtered_count = segmented.len();
        return FilteredTrack {
            points: segmented,
            original_count,
            filtered_count,
            segment_boundaries: boundaries,
        };
    }

    let plausible = remove_speed_outliers(&segmented, kind);
    FilteredTrack {
        filtered_count: plausible.len(),
        points: plausible,
        original_count,
        segment_boundaries: boundaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(lat: f64, lon: f64) -> TrackPoint {
        TrackPoint {
            lat,
            lon,
            altitude_m: 1000.0,
            speed_kmh: 30.0,
            climb_ms: 0.0,
            instant: Utc::now(),
        }
    }

    #[test]
    fn level1_drops_teleport_point() {
        let points = vec![point(46.0, 8.0), point(46.001, 8.0), point(50.0, 8.0), point(46.002, 8.0)];
        let result = apply(&points, FilterLevel::DedupTeleport, AircraftKind::Paraglider);
        assert_eq!(result.points.len(), 3);
        assert!(!result.points.iter().any(|p| p.lat == 50.0));
    }

    #[test]
    fn level0_is_raw_passthrough() {
        let points = vec![point(46.0, 8.0), point(46.0, 8.0)];
        let result = apply(&points, FilterLevel::Raw, AircraftKind::Glider);
        assert_eq!(result.filtered_count, 2);
    }

    #[test]
    fn default_filter_level_is_two() {
        assert_eq!(DEFAULT_FILTER_LEVEL, FilterLevel::Segmented);
    }

    #[test]
    fn geojson_emits_one_linestring_feature_per_segment() {
        let points = vec![point(46.0, 8.0), point(46.001, 8.0)];
        let track = apply(&points, FilterLevel::Segmented, AircraftKind::Paraglider);
        let geojson = to_geojson(&track);
        assert_eq!(geojson["type"], "FeatureCollection");
        assert_eq!(geojson["features"].as_array().unwrap().len(), 1);
        assert_eq!(geojson["features"][0]["geometry"]["type"], "LineString");
    }
}
