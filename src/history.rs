//! History Adapter (§4.F): append-only track persistence and time-bounded
//! retrieval, batch writes. Repository-per-concern, following the pool
//! wrapper idiom used for device persistence.

use crate::decoder::ServiceFields;
use crate::model::{DeviceId, TrackPoint};
use crate::schema::{device_names, device_positions, stations, thermals, track_points};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use thiserror::Error;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("history query failed: {0}")]
    QueryFailed(String),
}

/// Port the Ingest Orchestrator and Query Service depend on (§9: hot cache,
/// history, and spatial index are repository abstractions; concrete
/// adapters are injected). `HistoryRepository` is the Postgres-backed
/// default; tests can substitute an in-memory fake.
#[async_trait]
pub trait HistoryPort: Send + Sync {
    async fn insert_track_batch(&self, device_id: DeviceId, points: &[TrackPoint]) -> Result<(), HistoryError>;
    fn upsert_last_position(&self, device_id: DeviceId, lat: f64, lon: f64, altitude_m: f64, now: DateTime<Utc>) -> Result<(), HistoryError>;
    fn upsert_name(&self, device_id: DeviceId, name: &str, now: DateTime<Utc>) -> Result<(), HistoryError>;
    fn upsert_station(&self, chip_id: DeviceId, lat: f64, lon: f64, fields: ServiceFields, now: DateTime<Utc>) -> Result<(), HistoryError>;
    #[allow(clippy::too_many_arguments)]
    fn upsert_thermal(
        &self,
        id: &str,
        lat: f64,
        lon: f64,
        altitude_m: f64,
        quality: u8,
        avg_climb_ms: f64,
        reporter: DeviceId,
        created_at: DateTime<Utc>,
    ) -> Result<(), HistoryError>;
    fn get_track_with_timestamps(&self, device_id: DeviceId, limit: i64) -> Result<Vec<TrackPoint>, HistoryError>;
    fn ping(&self) -> bool;
}

#[derive(Insertable, Clone)]
#[diesel(table_name = track_points)]
struct NewTrackPoint {
    device_id: i32,
    latitude: f64,
    longitude: f64,
    altitude_m: f64,
    speed_kmh: f64,
    climb_ms: f64,
    recorded_at: DateTime<Utc>,
}

#[derive(Queryable)]
struct TrackPointRow {
    _id: i64,
    _device_id: i32,
    latitude: f64,
    longitude: f64,
    altitude_m: f64,
    speed_kmh: f64,
    climb_ms: f64,
    recorded_at: DateTime<Utc>,
}

impl From<TrackPointRow> for TrackPoint {
    fn from(row: TrackPointRow) -> Self {
        TrackPoint {
            lat: row.latitude,
            lon: row.longitude,
            altitude_m: row.altitude_m,
            speed_kmh: row.speed_kmh,
            climb_ms: row.climb_ms,
            instant: row.recorded_at,
        }
    }
}

#[derive(Clone)]
pub struct HistoryRepository {
    pool: PgPool,
}

impl HistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection, HistoryError> {
        self.pool.get().map_err(|e| HistoryError::Unavailable(e.to_string()))
    }

    /// Cheap reachability check for `/health`: does the pool still hand out a connection.
    pub fn ping(&self) -> bool {
        self.get_connection().is_ok()
    }

    /// Batch-insert admitted points in one multi-row statement, transactional
    /// per batch. Retries with exponential backoff up to 3 attempts.
    pub async fn insert_track_batch(&self, device_id: DeviceId, points: &[TrackPoint]) -> Result<(), HistoryError> {
        if points.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let rows: Vec<NewTrackPoint> = points
            .iter()
            .map(|p| NewTrackPoint {
                device_id: device_id.as_u32() as i32,
                latitude: p.lat,
                longitude: p.lon,
                altitude_m: p.altitude_m,
                speed_kmh: p.speed_kmh,
                climb_ms: p.climb_ms,
                recorded_at: p.instant,
            })
            .collect();

        let mut attempt = 0u32;
        loop {
            let rows = rows.clone();
            let pool = pool.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<(), HistoryError> {
                let mut conn = pool.get().map_err(|e| HistoryError::Unavailable(e.to_string()))?;
                conn.transaction(|conn| diesel::insert_into(track_points::table).values(&rows).execute(conn))
                    .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
                Ok(())
            })
            .await
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;

            match result {
                Ok(()) => return Ok(()),
                Err(_) if attempt < 3 => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(100 * 2u64.pow(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn upsert_last_position(&self, device_id: DeviceId, lat: f64, lon: f64, altitude_m: f64, now: DateTime<Utc>) -> Result<(), HistoryError> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(device_positions::table)
            .values((
                device_positions::device_id.eq(device_id.as_u32() as i32),
                device_positions::latitude.eq(lat),
                device_positions::longitude.eq(lon),
                device_positions::altitude_m.eq(altitude_m),
                device_positions::updated_at.eq(now),
            ))
            .on_conflict(device_positions::device_id)
            .do_update()
            .set((
                device_positions::latitude.eq(lat),
                device_positions::longitude.eq(lon),
                device_positions::altitude_m.eq(altitude_m),
                device_positions::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    pub fn upsert_name(&self, device_id: DeviceId, name: &str, now: DateTime<Utc>) -> Result<(), HistoryError> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(device_names::table)
            .values((
                device_names::device_id.eq(device_id.as_u32() as i32),
                device_names::name.eq(name),
                device_names::updated_at.eq(now),
            ))
            .on_conflict(device_names::device_id)
            .do_update()
            .set((device_names::name.eq(name), device_names::updated_at.eq(now)))
            .execute(&mut conn)
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    /// Chronologically ordered points from the last 24h for `device_id`.
    pub fn get_track_with_timestamps(&self, device_id: DeviceId, limit: i64) -> Result<Vec<TrackPoint>, HistoryError> {
        let mut conn = self.get_connection()?;
        let cutoff = Utc::now() - Duration::hours(24);

        let rows: Vec<TrackPointRow> = track_points::table
            .filter(track_points::device_id.eq(device_id.as_u32() as i32))
            .filter(track_points::recorded_at.ge(cutoff))
            .order(track_points::recorded_at.asc())
            .limit(limit)
            .select((
                track_points::id,
                track_points::device_id,
                track_points::latitude,
                track_points::longitude,
                track_points::altitude_m,
                track_points::speed_kmh,
                track_points::climb_ms,
                track_points::recorded_at,
            ))
            .load(&mut conn)
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;

        Ok(rows.into_iter().map(TrackPoint::from).collect())
    }

    pub fn upsert_station(
        &self,
        chip_id: DeviceId,
        lat: f64,
        lon: f64,
        fields: crate::decoder::ServiceFields,
        now: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(stations::table)
            .values((
                stations::chip_id.eq(chip_id.as_u32() as i32),
                stations::latitude.eq(lat),
                stations::longitude.eq(lon),
                stations::temperature_c.eq(fields.temperature_c),
                stations::wind_speed_kmh.eq(fields.wind_speed_kmh),
                stations::wind_direction_deg.eq(fields.wind_direction_deg),
                stations::wind_gusts_kmh.eq(fields.wind_gusts_kmh),
                stations::humidity_pct.eq(fields.humidity_pct),
                stations::pressure_hpa.eq(fields.pressure_hpa),
                stations::battery_pct.eq(fields.battery_pct),
                stations::updated_at.eq(now),
            ))
            .on_conflict(stations::chip_id)
            .do_update()
            .set((
                stations::latitude.eq(lat),
                stations::longitude.eq(lon),
                stations::temperature_c.eq(fields.temperature_c),
                stations::wind_speed_kmh.eq(fields.wind_speed_kmh),
                stations::wind_direction_deg.eq(fields.wind_direction_deg),
                stations::wind_gusts_kmh.eq(fields.wind_gusts_kmh),
                stations::humidity_pct.eq(fields.humidity_pct),
                stations::pressure_hpa.eq(fields.pressure_hpa),
                stations::battery_pct.eq(fields.battery_pct),
                stations::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    pub fn upsert_thermal(
        &self,
        id: &str,
        lat: f64,
        lon: f64,
        altitude_m: f64,
        quality: u8,
        avg_climb_ms: f64,
        reporter: DeviceId,
        created_at: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        let mut conn = self.get_connection()?;
        diesel::insert_into(thermals::table)
            .values((
                thermals::id.eq(id),
                thermals::latitude.eq(lat),
                thermals::longitude.eq(lon),
                thermals::altitude_m.eq(altitude_m),
                thermals::quality.eq(quality as i16),
                thermals::avg_climb_ms.eq(avg_climb_ms),
                thermals::reporter_device_id.eq(reporter.as_u32() as i32),
                thermals::created_at.eq(created_at),
            ))
            .on_conflict(thermals::id)
            .do_update()
            .set((
                thermals::latitude.eq(lat),
                thermals::longitude.eq(lon),
                thermals::altitude_m.eq(altitude_m),
                thermals::quality.eq(quality as i16),
                thermals::avg_climb_ms.eq(avg_climb_ms),
            ))
            .execute(&mut conn)
            .map_err(|e| HistoryError::QueryFailed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl HistoryPort for HistoryRepository {
    async fn insert_track_batch(&self, device_id: DeviceId, points: &[TrackPoint]) -> Result<(), HistoryError> {
        HistoryRepository::insert_track_batch(self, device_id, points).await
    }

    fn upsert_last_position(&self, device_id: DeviceId, lat: f64, lon: f64, altitude_m: f64, now: DateTime<Utc>) -> Result<(), HistoryError> {
        HistoryRepository::upsert_last_position(self, device_id, lat, lon, altitude_m, now)
    }

    fn upsert_name(&self, device_id: DeviceId, name: &str, now: DateTime<Utc>) -> Result<(), HistoryError> {
        HistoryRepository::upsert_name(self, device_id, name, now)
    }

    fn upsert_station(&self, chip_id: DeviceId, lat: f64, lon: f64, fields: ServiceFields, now: DateTime<Utc>) -> Result<(), HistoryError> {
        HistoryRepository::upsert_station(self, chip_id, lat, lon, fields, now)
    }

    fn upsert_thermal(
        &self,
        id: &str,
        lat: f64,
        lon: f64,
        altitude_m: f64,
        quality: u8,
        avg_climb_ms: f64,
        reporter: DeviceId,
        created_at: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        HistoryRepository::upsert_thermal(self, id, lat, lon, altitude_m, quality, avg_climb_ms, reporter, created_at)
    }

    fn get_track_with_timestamps(&self, device_id: DeviceId, limit: i64) -> Result<Vec<TrackPoint>, HistoryError> {
        HistoryRepository::get_track_with_timestamps(self, device_id, limit)
    }

    fn ping(&self) -> bool {
        HistoryRepository::ping(self)
    }
}

/// In-memory fake for tests that exercise the Ingest Orchestrator or Query
/// Service without a Postgres instance.
#[derive(Default)]
pub struct InMemoryHistory {
    tracks: std::sync::Mutex<std::collections::HashMap<DeviceId, Vec<TrackPoint>>>,
    names: std::sync::Mutex<std::collections::HashMap<DeviceId, String>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryPort for InMemoryHistory {
    async fn insert_track_batch(&self, device_id: DeviceId, points: &[TrackPoint]) -> Result<(), HistoryError> {
        self.tracks.lock().expect("in-memory history lock poisoned").entry(device_id).or_default().extend_from_slice(points);
        Ok(())
    }

    fn upsert_last_position(&self, _device_id: DeviceId, _lat: f64, _lon: f64, _altitude_m: f64, _now: DateTime<Utc>) -> Result<(), HistoryError> {
        Ok(())
    }

    fn upsert_name(&self, device_id: DeviceId, name: &str, _now: DateTime<Utc>) -> Result<(), HistoryError> {
        self.names.lock().expect("in-memory history lock poisoned").insert(device_id, name.to_string());
        Ok(())
    }

    fn upsert_station(&self, _chip_id: DeviceId, _lat: f64, _lon: f64, _fields: ServiceFields, _now: DateTime<Utc>) -> Result<(), HistoryError> {
        Ok(())
    }

    fn upsert_thermal(
        &self,
        _id: &str,
        _lat: f64,
        _lon: f64,
        _altitude_m: f64,
        _quality: u8,
        _avg_climb_ms: f64,
        _reporter: DeviceId,
        _created_at: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        Ok(())
    }

    fn get_track_with_timestamps(&self, device_id: DeviceId, limit: i64) -> Result<Vec<TrackPoint>, HistoryError> {
        let tracks = self.tracks.lock().expect("in-memory history lock poisoned");
        let mut points = tracks.get(&device_id).cloned().unwrap_or_default();
        points.sort_by_key(|p| p.instant);
        points.truncate(limit.max(0) as usize);
        Ok(points)
    }

    fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let manager = ConnectionManager::<PgConnection>::new(url);
        Pool::builder().build(manager).ok()
    }

    #[tokio::test]
    async fn insert_and_fetch_track_roundtrip() {
        let Some(pool) = create_test_pool() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let repo = HistoryRepository::new(pool);
        let device_id = DeviceId(0xABCDEF);
        let point = TrackPoint {
            lat: 46.0,
            lon: 8.0,
            altitude_m: 1200.0,
            speed_kmh: 40.0,
            climb_ms: 1.0,
            instant: Utc::now(),
        };
        repo.insert_track_batch(device_id, &[point]).await.unwrap();
        let track = repo.get_track_with_timestamps(device_id, 10).unwrap();
        assert!(!track.is_empty());
    }

    #[test]
    fn upsert_last_position_is_idempotent_on_conflict() {
        let Some(pool) = create_test_pool() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let repo = HistoryRepository::new(pool);
        let device_id = DeviceId(0xABCDEF);
        let now = Utc::now();
        repo.upsert_last_position(device_id, 46.0, 8.0, 1200.0, now).unwrap();
        repo.upsert_last_position(device_id, 46.1, 8.1, 1300.0, now).unwrap();
    }
}
