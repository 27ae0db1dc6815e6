//! Query Service (§4.J): snapshot/radius/bounds/track operations consumed
//! by the delivery layer.

use crate::error::QueryError;
use crate::geo::Bounds;
use crate::history::HistoryPort;
use crate::hot_cache::{CacheKind, HotCache};
use crate::model::{DeviceId, LiveObject, Position};
use crate::orchestrator::LiveIndex;
use crate::track_filter::{self, FilterLevel};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct KindFilters {
    pub pilots: bool,
    pub stations: bool,
    pub thermals: bool,
    pub ground_objects: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct Snapshot {
    pub pilots: Vec<LiveObject>,
    pub ground_objects: Vec<LiveObject>,
    pub thermals: Vec<LiveObject>,
    pub stations: Vec<LiveObject>,
}

pub struct QueryService {
    spatial_index: Arc<LiveIndex>,
    hot_cache: Arc<dyn HotCache>,
    history: Arc<dyn HistoryPort>,
}

pub fn validate_lat(lat: f64) -> Result<(), QueryError> {
    if (-90.0..=90.0).contains(&lat) {
        Ok(())
    } else {
        Err(QueryError::InvalidLatitude)
    }
}

pub fn validate_lon(lon: f64) -> Result<(), QueryError> {
    if (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(QueryError::InvalidLongitude)
    }
}

pub fn validate_radius(radius_km: f64) -> Result<(), QueryError> {
    if (1.0..=200.0).contains(&radius_km) {
        Ok(())
    } else {
        Err(QueryError::InvalidRadius)
    }
}

impl QueryService {
    pub fn new(spatial_index: Arc<LiveIndex>, hot_cache: Arc<dyn HotCache>, history: Arc<dyn HistoryPort>) -> Self {
        Self {
            spatial_index,
            hot_cache,
            history,
        }
    }

    /// Snapshot(center, radiusKm, filters): pilots/thermals/ground objects
    /// filtered by radius; stations returned globally since their
    /// cardinality is bounded.
    pub async fn snapshot(&self, center: Position, radius_km: f64, filters: KindFilters) -> Result<Snapshot, QueryError> {
        validate_lat(center.lat)?;
        validate_lon(center.lon)?;
        validate_radius(radius_km)?;

        let mut snapshot = Snapshot::default();
        for (_, object) in self.spatial_index.query_radius(center, radius_km) {
            match &object {
                LiveObject::Pilot(_) if filters.pilots => snapshot.pilots.push(object),
                LiveObject::GroundObject(_) if filters.ground_objects => snapshot.ground_objects.push(object),
                LiveObject::Thermal(_) if filters.thermals => snapshot.thermals.push(object),
                LiveObject::Station(_) => {}
                _ => {}
            }
        }

        if filters.stations {
            // Stations are returned globally: read the full station set from
            // the hot cache rather than filtering the spatial index by radius.
            if let Ok(all) = self.hot_cache.get_all(CacheKind::Station).await {
                snapshot.stations = all;
            }
        }

        Ok(snapshot)
    }

    pub fn by_bounds(&self, bounds: Bounds, kind: KindFilters) -> Vec<LiveObject> {
        self.spatial_index
            .query_bounds(bounds)
            .into_iter()
            .filter_map(|(_, object)| match (&object, kind) {
                (LiveObject::Pilot(_), KindFilters { pilots: true, .. }) => Some(object),
                (LiveObject::GroundObject(_), KindFilters { ground_objects: true, .. }) => Some(object),
                (LiveObject::Thermal(_), KindFilters { thermals: true, .. }) => Some(object),
                (LiveObject::Station(_), KindFilters { stations: true, .. }) => Some(object),
                _ => None,
            })
            .collect()
    }

    pub async fn track(&self, device_id: DeviceId, hours: u32, filter_level: u8) -> Result<track_filter::FilteredTrack, QueryError> {
        if !(1..=12).contains(&hours) {
            return Err(QueryError::InvalidMaxAge);
        }
        let level = FilterLevel::from_u8(filter_level).ok_or(QueryError::InvalidFormat)?;

        let cutoff = chrono::Utc::now() - chrono::Duration::hours(hours as i64);
        let points: Vec<_> = self
            .history
            .get_track_with_timestamps(device_id, 100_000)
            .map_err(|_| QueryError::HistoryUnavailable)?
            .into_iter()
            .filter(|p| p.instant >= cutoff)
            .collect();

        let live = self.spatial_index.get(device_id);
        if points.is_empty() {
            // A device with no history and no live presence has never been
            // seen at all; one with history windowed out but still live (or
            // previously known) just has nothing to report for this window.
            return Err(if live.is_none() {
                QueryError::TrackNotFound
            } else {
                QueryError::TrackEmpty
            });
        }

        let kind = live
            .and_then(|obj| match obj {
                LiveObject::Pilot(p) => Some(p.kind),
                _ => None,
            })
            .unwrap_or(crate::model::AircraftKind::Unknown);

        Ok(track_filter::apply(&points, level, kind))
    }
}
