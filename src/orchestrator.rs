//! Ingest Orchestrator (§4.I): binds Decoder -> Validator -> (Hot Cache +
//! History + Spatial Index + Broadcast); owns lifecycle and graceful
//! shutdown.

use crate::broadcast::BroadcastManager;
use crate::bus::BusSource;
use crate::decoder::{self, DecodeError, FrameBody};
use crate::geo;
use crate::history::HistoryPort;
use crate::hot_cache::{CacheKind, HotCache};
use crate::model::{
    AdmissionOutcome, DeviceId, GroundObject, LiveObject, Pilot, Position, Thermal, TrackPoint, UpdateAction, WeatherMeasurements, WeatherStation,
};
use crate::spatial_index::SpatialIndex;
use crate::validator::Validator;
use chrono::{DateTime, Timelike, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

const THERMAL_MERGE_RADIUS_KM: f64 = 0.5;

pub type LiveIndex = SpatialIndex<LiveObject>;

#[derive(Debug, serde::Serialize)]
pub struct HealthReport {
    pub hot_cache: bool,
    pub history: bool,
}

pub struct Orchestrator {
    validator: Validator,
    hot_cache: Arc<dyn HotCache>,
    history: Arc<dyn HistoryPort>,
    spatial_index: Arc<LiveIndex>,
    broadcast: Arc<BroadcastManager>,
    parse_error_count: AtomicU64,
    track_buffers: RwLock<std::collections::HashMap<DeviceId, Vec<TrackPoint>>>,
    names: RwLock<std::collections::HashMap<DeviceId, String>>,
}

impl Orchestrator {
    pub fn new(hot_cache: Arc<dyn HotCache>, history: Arc<dyn HistoryPort>, spatial_index: Arc<LiveIndex>, broadcast: Arc<BroadcastManager>) -> Self {
        Self {
            validator: Validator::new(Default::default()),
            hot_cache,
            history,
            spatial_index,
            broadcast,
            parse_error_count: AtomicU64::new(0),
            track_buffers: RwLock::new(std::collections::HashMap::new()),
            names: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_error_count.load(Ordering::Relaxed)
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn spatial_index(&self) -> &Arc<LiveIndex> {
        &self.spatial_index
    }

    pub fn hot_cache(&self) -> &Arc<dyn HotCache> {
        &self.hot_cache
    }

    /// Per-dependency reachability for `/health`: hot cache and history
    /// store. The bus is checked by its own connection state, not here.
    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            hot_cache: self.hot_cache.get_all(CacheKind::Station).await.is_ok(),
            history: self.history.ping(),
        }
    }

    /// Feed a position reported directly by an authenticated external user
    /// (`POST /api/v1/position`) through the same validator/admission path
    /// as a bus-decoded air-tracking packet.
    pub async fn submit_position(&self, id: DeviceId, air: decoder::AirTracking) {
        self.handle_air_tracking(id, air, Utc::now()).await;
    }

    async fn handle_decode_error(&self, err: DecodeError) {
        self.parse_error_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest.parse_errors").increment(1);
        tracing::debug!(%err, "dropping packet: decode failed");
    }

    /// Process one (topic, payload) pair. Decode failures increment the
    /// parse-error counter and are dropped without further action.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let decoded = match decoder::decode(topic, payload) {
            Ok(d) => d,
            Err(err) => {
                self.handle_decode_error(err).await;
                return;
            }
        };

        match decoded.body {
            FrameBody::AirTracking(air) => self.handle_air_tracking(decoded.source, air, decoded.envelope.instant).await,
            FrameBody::Name(name) => self.handle_name(decoded.source, name.name),
            FrameBody::Service(service) => self.handle_service(decoded.source, service).await,
            FrameBody::GroundTracking(ground) => self.handle_ground_tracking(decoded.source, ground).await,
            FrameBody::Thermal(thermal) => self.handle_thermal(decoded.source, thermal, decoded.envelope.instant).await,
            FrameBody::Minimal => {}
        }
    }

    async fn handle_air_tracking(&self, id: DeviceId, air: decoder::AirTracking, now: DateTime<Utc>) {
        let Some(position) = Position::new(air.lat, air.lon) else {
            self.parse_error_count.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let outcome = self.validator.evaluate(id, position, air.aircraft, now);
        if matches!(outcome, AdmissionOutcome::RejectKeep | AdmissionOutcome::RejectEvict) {
            if outcome == AdmissionOutcome::RejectEvict {
                self.spatial_index.remove(id);
                self.broadcast.publish(crate::model::BroadcastUpdate {
                    object: LiveObject::Pilot(self.pilot_from(id, &air, now)),
                    action: UpdateAction::Remove,
                });
            }
            return;
        }

        let name = self.names.read().expect("name cache lock poisoned").get(&id).cloned();
        let pilot = Pilot {
            name,
            ..self.pilot_from(id, &air, now)
        };

        self.spatial_index.insert(id, position, LiveObject::Pilot(pilot.clone()));

        let ttl = crate::hot_cache::default_ttl_for(&CacheKind::Pilot);
        if let Err(err) = self.hot_cache.save(CacheKind::Pilot, id, position, &LiveObject::Pilot(pilot.clone()), ttl).await {
            tracing::warn!(%err, "hot cache save failed");
        }
        if let Err(err) = self.history.upsert_last_position(id, air.lat, air.lon, air.altitude_m, now) {
            tracing::warn!(%err, "last position upsert failed");
        }

        self.broadcast.publish(crate::model::BroadcastUpdate {
            object: LiveObject::Pilot(pilot),
            action: UpdateAction::Update,
        });

        let point = TrackPoint {
            lat: air.lat,
            lon: air.lon,
            altitude_m: air.altitude_m,
            speed_kmh: air.speed_kmh,
            climb_ms: air.climb_ms,
            instant: now,
        };
        self.enqueue_track_point(id, point).await;

        if let Ok(json) = crate::hot_cache::to_json(&point) {
            let _ = self.hot_cache.append_track(id, &json).await;
        }
    }

    fn pilot_from(&self, id: DeviceId, air: &decoder::AirTracking, now: DateTime<Utc>) -> Pilot {
        Pilot {
            device_id: id,
            position: Position::new(air.lat, air.lon).unwrap_or(Position { lat: 0.0, lon: 0.0 }),
            altitude_m: air.altitude_m,
            ground_speed_kmh: air.speed_kmh,
            climb_ms: air.climb_ms,
            course_deg: air.heading_deg,
            kind: air.aircraft,
            name: None,
            battery_pct: None,
            track_online: air.track_online,
            last_update: now,
            last_movement: now,
            rssi: 0,
            snr: 0,
        }
    }

    async fn enqueue_track_point(&self, id: DeviceId, point: TrackPoint) {
        let flush_batch = {
            let mut buffers = self.track_buffers.write().expect("track buffer lock poisoned");
            let buf = buffers.entry(id).or_default();
            buf.push(point);
            if buf.len() >= 50 {
                Some(std::mem::take(buf))
            } else {
                None
            }
        };
        if let Some(batch) = flush_batch {
            if let Err(err) = self.history.insert_track_batch(id, &batch).await {
                tracing::warn!(%err, "history batch insert failed");
            }
        }
    }

    fn handle_name(&self, id: DeviceId, name: String) {
        self.names.write().expect("name cache lock poisoned").insert(id, name.clone());
        if let Err(err) = self.history.upsert_name(id, &name, Utc::now()) {
            tracing::warn!(%err, "name upsert failed");
        }
    }

    async fn handle_service(&self, id: DeviceId, service: decoder::ServiceRecord) {
        let Some(position) = Position::new(service.lat, service.lon) else { return };
        let station = WeatherStation {
            chip_id: id,
            position,
            measurements: WeatherMeasurements {
                temperature_c: service.fields.temperature_c,
                wind_speed_kmh: service.fields.wind_speed_kmh,
                wind_direction_deg: service.fields.wind_direction_deg,
                wind_gusts_kmh: service.fields.wind_gusts_kmh,
                humidity_pct: service.fields.humidity_pct,
                pressure_hpa: service.fields.pressure_hpa,
                battery_pct: service.fields.battery_pct,
            },
            last_update: Utc::now(),
        };

        self.spatial_index.insert(id, position, LiveObject::Station(station.clone()));
        let ttl = crate::hot_cache::default_ttl_for(&CacheKind::Station);
        if let Err(err) = self.hot_cache.save(CacheKind::Station, id, position, &LiveObject::Station(station.clone()), ttl).await {
            tracing::warn!(%err, "hot cache save failed for station");
        }
        if let Err(err) = self.history.upsert_station(id, service.lat, service.lon, service.fields, Utc::now()) {
            tracing::warn!(%err, "station upsert failed");
        }
        self.broadcast.publish(crate::model::BroadcastUpdate {
            object: LiveObject::Station(station),
            action: UpdateAction::Update,
        });
    }

    async fn handle_ground_tracking(&self, id: DeviceId, ground: decoder::GroundTracking) {
        let Some(position) = Position::new(ground.lat, ground.lon) else { return };
        let object = GroundObject {
            device_id: id,
            position,
            altitude_m: ground.altitude_m,
            ground_speed_kmh: ground.speed_kmh,
            course_deg: ground.heading_deg,
            kind: ground.kind,
            last_update: Utc::now(),
        };

        self.spatial_index.insert(id, position, LiveObject::GroundObject(object.clone()));
        let ttl = crate::hot_cache::default_ttl_for(&CacheKind::GroundObject);
        if let Err(err) = self.hot_cache.save(CacheKind::GroundObject, id, position, &LiveObject::GroundObject(object.clone()), ttl).await {
            tracing::warn!(%err, "hot cache save failed for ground object");
        }
        self.broadcast.publish(crate::model::BroadcastUpdate {
            object: LiveObject::GroundObject(object),
            action: UpdateAction::Update,
        });
    }

    async fn handle_thermal(&self, reporter: DeviceId, thermal: decoder::ThermalRecord, now: DateTime<Utc>) {
        let Some(position) = Position::new(thermal.lat, thermal.lon) else { return };
        let id = thermal_id(position, now);

        let nearby = self
            .spatial_index
            .query_radius(position, THERMAL_MERGE_RADIUS_KM)
            .into_iter()
            .filter_map(|(_, obj)| match obj {
                LiveObject::Thermal(t) => Some(t),
                _ => None,
            })
            .next();

        let merged = if let Some(existing) = nearby {
            merge_thermals(&existing, &Thermal {
                id: id.clone(),
                position,
                altitude_m: thermal.altitude_m,
                quality: thermal.quality,
                avg_climb_ms: thermal.avg_climb_ms,
                reporter,
                created_at: now,
            })
        } else {
            Thermal {
                id: id.clone(),
                position,
                altitude_m: thermal.altitude_m,
                quality: thermal.quality,
                avg_climb_ms: thermal.avg_climb_ms,
                reporter,
                created_at: now,
            }
        };

        self.spatial_index.insert(reporter, merged.position, LiveObject::Thermal(merged.clone()));
        let ttl = crate::hot_cache::default_ttl_for(&CacheKind::Thermal);
        if let Err(err) = self.hot_cache.save(CacheKind::Thermal, reporter, merged.position, &LiveObject::Thermal(merged.clone()), ttl).await {
            tracing::warn!(%err, "hot cache save failed for thermal");
        }
        if let Err(err) = self
            .history
            .upsert_thermal(&merged.id, merged.position.lat, merged.position.lon, merged.altitude_m, merged.quality, merged.avg_climb_ms, merged.reporter, merged.created_at)
        {
            tracing::warn!(%err, "thermal upsert failed");
        }
        self.broadcast.publish(crate::model::BroadcastUpdate {
            object: LiveObject::Thermal(merged),
            action: UpdateAction::Update,
        });
    }

    /// Drain internal channels with a deadline, flush batches, close the
    /// bus subscription and subscriber queues.
    pub async fn shutdown(&self, mut bus: Box<dyn BusSource>, deadline: StdDuration) {
        bus.close().await;

        let start = tokio::time::Instant::now();
        loop {
            let pending: usize = self
                .track_buffers
                .read()
                .expect("track buffer lock poisoned")
                .values()
                .map(|v| v.len())
                .sum();
            if pending == 0 || start.elapsed() >= deadline {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        let leftovers: Vec<(DeviceId, Vec<TrackPoint>)> = {
            let mut buffers = self.track_buffers.write().expect("track buffer lock poisoned");
            std::mem::take(&mut *buffers).into_iter().collect()
        };
        for (id, batch) in leftovers {
            let _ = self.history.insert_track_batch(id, &batch).await;
        }

        if let Err(err) = self.hot_cache.flush().await {
            tracing::warn!(%err, "final hot cache flush failed during shutdown");
        }
    }
}

/// Thermal id: geohash-7 folded with minute-of-day and a day-of-epoch
/// component, so ids remain stable within a day but do not collide across
/// days once retention grows past 24 hours.
fn thermal_id(position: Position, instant: DateTime<Utc>) -> String {
    let hash = geo::encode(position, 7);
    let minute_of_day = instant.hour() * 60 + instant.minute();
    let day_of_epoch = instant.timestamp() / 86_400;
    format!("{hash}-{minute_of_day}-{day_of_epoch}")
}

fn merge_thermals(a: &Thermal, b: &Thermal) -> Thermal {
    let higher_quality = if a.quality >= b.quality { a } else { b };
    Thermal {
        id: higher_quality.id.clone(),
        position: Position {
            lat: (a.position.lat + b.position.lat) / 2.0,
            lon: (a.position.lon + b.position.lon) / 2.0,
        },
        altitude_m: a.altitude_m.max(b.altitude_m),
        quality: ((a.quality as u16 + b.quality as u16) / 2) as u8,
        avg_climb_ms: (a.avg_climb_ms + b.avg_climb_ms) / 2.0,
        reporter: higher_quality.reporter,
        created_at: a.created_at.max(b.created_at),
    }
}

/// The per-kind TTL a live object expires after, matching the hot cache's
/// own `default_ttl_for` so the spatial index and the hot cache fall stale
/// together.
fn live_object_ttl(object: &LiveObject) -> chrono::Duration {
    use crate::model::ttl;
    let secs = match object {
        LiveObject::Pilot(_) => ttl::PILOT_SECS,
        LiveObject::GroundObject(_) => ttl::GROUND_OBJECT_SECS,
        LiveObject::Station(_) => ttl::STATION_SECS,
        LiveObject::Thermal(_) => ttl::THERMAL_SECS,
    };
    chrono::Duration::seconds(secs)
}

/// Background sweep (§4.D `ExpireOlderThan`, §4.E reconciliation): evicts
/// stale entries from the spatial index by their own kind's TTL, then drops
/// any hot cache geo-set member whose hash has already expired.
pub async fn run_expiry_sweep(orchestrator: Arc<Orchestrator>, interval: StdDuration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let removed = orchestrator.spatial_index().expire_by(live_object_ttl);
        if removed > 0 {
            tracing::debug!(removed, "spatial index sweep evicted stale entries");
        }

        for kind in [CacheKind::Pilot, CacheKind::GroundObject, CacheKind::Station, CacheKind::Thermal] {
            match orchestrator.hot_cache().reconcile_evictions(kind).await {
                Ok(removed) if removed > 0 => tracing::debug!(removed, ?kind, "hot cache sweep reconciled evictions"),
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, ?kind, "hot cache eviction reconciliation failed"),
            }
        }
    }
}

/// Drive messages from a `BusSource` into the orchestrator until the
/// cancellation token fires.
pub async fn run_ingest_loop(orchestrator: Arc<Orchestrator>, mut bus: Box<dyn BusSource>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = bus.recv() => {
                match message {
                    Some(msg) => orchestrator.handle_message(&msg.topic, &msg.payload).await,
                    None => break,
                }
            }
        }
    }
    orchestrator.shutdown(bus, StdDuration::from_secs(30)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thermal_id_is_stable_for_same_geohash_and_minute() {
        let p = Position::new(46.0, 8.0).unwrap();
        let t = Utc::now();
        assert_eq!(thermal_id(p, t), thermal_id(p, t));
    }

    #[test]
    fn merge_averages_position_and_climb_takes_higher_quality_reporter() {
        let a = Thermal {
            id: "a".into(),
            position: Position::new(46.0, 8.0).unwrap(),
            altitude_m: 1000.0,
            quality: 3,
            avg_climb_ms: 2.0,
            reporter: DeviceId(1),
            created_at: Utc::now(),
        };
        let b = Thermal {
            id: "b".into(),
            position: Position::new(46.0001, 8.0001).unwrap(),
            altitude_m: 1200.0,
            quality: 5,
            avg_climb_ms: 4.0,
            reporter: DeviceId(2),
            created_at: Utc::now(),
        };
        let merged = merge_thermals(&a, &b);
        assert_eq!(merged.quality, 4);
        assert_eq!(merged.avg_climb_ms, 3.0);
        assert_eq!(merged.reporter, DeviceId(2));
        assert_eq!(merged.altitude_m, 1200.0);
    }
}
