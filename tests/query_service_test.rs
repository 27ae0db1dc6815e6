//! Query Service integration test over in-memory port fakes: snapshot
//! radius filtering and track retrieval/windowing.

use chrono::Utc;
use fanet_backend::hot_cache::InMemoryHotCache;
use fanet_backend::model::{DeviceId, LiveObject, Pilot, Position, AircraftKind};
use fanet_backend::orchestrator::LiveIndex;
use fanet_backend::query::{KindFilters, QueryService};
use std::sync::Arc;

fn pilot(id: u32, lat: f64, lon: f64) -> Pilot {
    let now = Utc::now();
    Pilot {
        device_id: DeviceId(id),
        position: Position { lat, lon },
        altitude_m: 1200.0,
        ground_speed_kmh: 35.0,
        climb_ms: 0.5,
        course_deg: 180.0,
        kind: AircraftKind::Paraglider,
        name: Some("test".into()),
        battery_pct: Some(80),
        track_online: true,
        last_update: now,
        last_movement: now,
        rssi: -70,
        snr: 8,
    }
}

#[tokio::test]
async fn snapshot_returns_only_pilots_within_radius() {
    let spatial_index = Arc::new(LiveIndex::new());
    let near = pilot(1, 46.0, 8.0);
    let far = pilot(2, 10.0, 10.0);
    spatial_index.insert(near.device_id, near.position, LiveObject::Pilot(near.clone()));
    spatial_index.insert(far.device_id, far.position, LiveObject::Pilot(far.clone()));

    let hot_cache = Arc::new(InMemoryHotCache::new());
    let history = Arc::new(fanet_backend::history::InMemoryHistory::new());
    let query_service = QueryService::new(spatial_index, hot_cache, history);

    let snapshot = query_service
        .snapshot(Position { lat: 46.0, lon: 8.0 }, 50.0, KindFilters {
            pilots: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(snapshot.pilots.len(), 1);
    assert_eq!(snapshot.pilots[0].device_id(), DeviceId(1));
}

#[tokio::test]
async fn snapshot_rejects_invalid_radius() {
    let spatial_index = Arc::new(LiveIndex::new());
    let hot_cache = Arc::new(InMemoryHotCache::new());
    let history = Arc::new(fanet_backend::history::InMemoryHistory::new());
    let query_service = QueryService::new(spatial_index, hot_cache, history);

    let err = query_service
        .snapshot(Position { lat: 46.0, lon: 8.0 }, 500.0, KindFilters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, fanet_backend::QueryError::InvalidRadius));
}

#[tokio::test]
async fn track_not_found_for_unknown_device() {
    let spatial_index = Arc::new(LiveIndex::new());
    let hot_cache = Arc::new(InMemoryHotCache::new());
    let history = Arc::new(fanet_backend::history::InMemoryHistory::new());
    let query_service = QueryService::new(spatial_index, hot_cache, history);

    let err = query_service.track(DeviceId(99), 6, 2).await.unwrap_err();
    assert!(matches!(err, fanet_backend::QueryError::TrackNotFound));
}
