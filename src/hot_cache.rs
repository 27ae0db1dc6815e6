//! Hot Cache Adapter (§4.E): pipelined writes and geo-radius reads against
//! an external keyed store. The core depends on the `HotCache` port; the
//! Redis-backed adapter is the concrete, injected implementation.

use crate::model::{DeviceId, LiveObject, Position};
use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Config, Pool, Runtime};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not configure hot cache pool: {0}")]
    CouldNotConfigure(String),
    #[error("could not connect to hot cache: {0}")]
    CouldNotConnect(String),
    #[error("hot cache operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Pilot,
    GroundObject,
    Station,
    Thermal,
}

impl CacheKind {
    fn geo_key(&self) -> &'static str {
        match self {
            Self::Pilot => "pilots:geo",
            Self::GroundObject => "ground_objects:geo",
            Self::Station => "stations:geo",
            Self::Thermal => "thermals:geo",
        }
    }

    fn hash_key(&self, id: DeviceId) -> String {
        let prefix = match self {
            Self::Pilot => "pilot",
            Self::GroundObject => "ground",
            Self::Station => "station",
            Self::Thermal => "thermal",
        };
        format!("{prefix}:{id}")
    }
}

/// Store-side coordinate bounds, stricter than the data model's own bounds.
const GEO_LAT_MIN: f64 = -85.05112878;
const GEO_LAT_MAX: f64 = 85.05112878;

#[async_trait]
pub trait HotCache: Send + Sync {
    async fn save(&self, kind: CacheKind, id: DeviceId, position: Position, object: &LiveObject, ttl: Duration) -> Result<(), CacheError>;
    async fn append_track(&self, id: DeviceId, point_json: &str) -> Result<(), CacheError>;
    async fn get_in_radius(&self, kind: CacheKind, center: Position, radius_km: f64) -> Result<Vec<(DeviceId, f64, LiveObject)>, CacheError>;
    async fn get_all(&self, kind: CacheKind) -> Result<Vec<LiveObject>, CacheError>;
    async fn flush(&self) -> Result<(), CacheError>;
    async fn reconcile_evictions(&self, kind: CacheKind) -> Result<usize, CacheError>;
}

struct PendingWrite {
    kind_geo_key: &'static str,
    hash_key: String,
    geo_member: String,
    lon: f64,
    lat: f64,
    fields: String,
    ttl_secs: i64,
}

/// Pipelined Redis-backed hot cache, following the pool-plus-pipeline idiom
/// used for geo sets, hashes, and TTLs against a keyed store.
pub struct RedisHotCache {
    pool: Pool,
    flush_threshold: usize,
    idle_flush: Duration,
    pending: tokio::sync::Mutex<Vec<PendingWrite>>,
    flush_count: AtomicU64,
    batch_size_ema: std::sync::Mutex<f64>,
}

impl RedisHotCache {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::CouldNotConfigure(e.to_string()))?;
        Ok(Self {
            pool,
            flush_threshold: 100,
            idle_flush: Duration::from_millis(100),
            pending: tokio::sync::Mutex::new(Vec::new()),
            flush_count: AtomicU64::new(0),
            batch_size_ema: std::sync::Mutex::new(0.0),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool.get().await.map_err(|e| CacheError::CouldNotConnect(e.to_string()))
    }

    fn update_ema(&self, batch_size: usize) {
        const ALPHA: f64 = 0.1;
        let mut ema = self.batch_size_ema.lock().expect("ema lock poisoned");
        *ema = ALPHA * batch_size as f64 + (1.0 - ALPHA) * *ema;
        metrics::gauge!("hot_cache.batch_size_ema").set(*ema);
    }

    async fn maybe_flush(&self) -> Result<(), CacheError> {
        let should_flush = {
            let pending = self.pending.lock().await;
            pending.len() >= self.flush_threshold
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Spawn the idle-timer background task that flushes the pipeline when
    /// no write has arrived for `idle_flush`.
    pub fn spawn_idle_flusher(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let idle = self.idle_flush;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(idle).await;
                if let Err(err) = self.flush().await {
                    tracing::warn!(%err, "hot cache idle flush failed");
                }
            }
        })
    }
}

#[async_trait]
impl HotCache for RedisHotCache {
    async fn save(&self, kind: CacheKind, id: DeviceId, position: Position, object: &LiveObject, ttl: Duration) -> Result<(), CacheError> {
        let fields = serde_json::to_string(object).map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        let geo_valid = (GEO_LAT_MIN..=GEO_LAT_MAX).contains(&position.lat);

        let write = PendingWrite {
            kind_geo_key: if geo_valid { kind.geo_key() } else { "" },
            hash_key: kind.hash_key(id),
            geo_member: id.0.to_string(),
            lon: position.lon,
            lat: position.lat,
            fields,
            ttl_secs: ttl.as_secs() as i64,
        };
        self.pending.lock().await.push(write);
        self.maybe_flush().await
    }

    async fn append_track(&self, id: DeviceId, point_json: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let key = format!("track:{id}");
        let mut pipe = deadpool_redis::redis::pipe();
        pipe.atomic()
            .lpush(&key, point_json)
            .ltrim(&key, 0, 998)
            .ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn get_in_radius(&self, kind: CacheKind, center: Position, radius_km: f64) -> Result<Vec<(DeviceId, f64, LiveObject)>, CacheError> {
        let mut conn = self.conn().await?;
        let geo_key = kind.geo_key();

        let hits: Vec<(String, f64)> = deadpool_redis::redis::cmd("GEORADIUS")
            .arg(geo_key)
            .arg(center.lon)
            .arg(center.lat)
            .arg(radius_km)
            .arg("km")
            .arg("WITHDIST")
            .arg("ASC")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let hits: Vec<(DeviceId, f64)> = hits
            .into_iter()
            .filter_map(|(member, dist)| member.parse::<u32>().ok().map(|id| (DeviceId(id), dist)))
            .collect();
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = deadpool_redis::redis::pipe();
        for (id, _) in &hits {
            pipe.get(kind.hash_key(*id));
        }
        let raw: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(hits.len());
        for ((id, dist), json) in hits.into_iter().zip(raw) {
            // A missing hash means the TTL expired between the geo-sweep and
            // this fetch; skip it rather than returning a partial record.
            let Some(json) = json else { continue };
            let Ok(object): Result<LiveObject, _> = serde_json::from_str(&json) else { continue };
            out.push((id, dist, object));
        }
        Ok(out)
    }

    async fn get_all(&self, kind: CacheKind) -> Result<Vec<LiveObject>, CacheError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}:*", hash_prefix(&kind));
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = conn.mget(&keys).await.map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let batch: Vec<PendingWrite> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let batch_len = batch.len();

        let mut conn = self.conn().await?;
        let mut pipe = deadpool_redis::redis::pipe();
        pipe.atomic();
        for write in &batch {
            if !write.kind_geo_key.is_empty() {
                pipe.cmd("GEOADD").arg(write.kind_geo_key).arg(write.lon).arg(write.lat).arg(&write.geo_member).ignore();
            }
            pipe.set(&write.hash_key, &write.fields).ignore();
            pipe.expire(&write.hash_key, write.ttl_secs).ignore();
        }

        let result = pipe.query_async::<()>(&mut conn).await;
        if result.is_err() {
            // Retry the failed batch once; on repeat failure drop it, since
            // the pipeline cannot be partially committed.
            let retry = pipe.query_async::<()>(&mut conn).await;
            if let Err(err) = retry {
                tracing::error!(%err, batch_len, "hot cache pipeline flush failed twice, dropping batch");
                return Err(CacheError::OperationFailed(err.to_string()));
            }
        }

        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.update_ema(batch_len);
        metrics::counter!("hot_cache.flush_count").increment(1);
        Ok(())
    }

    async fn reconcile_evictions(&self, kind: CacheKind) -> Result<usize, CacheError> {
        let mut conn = self.conn().await?;
        let geo_key = kind.geo_key();
        let members: Vec<String> = deadpool_redis::redis::cmd("ZRANGE")
            .arg(geo_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        let mut removed = 0usize;
        for member in members {
            let Ok(id) = member.parse::<u32>() else { continue };
            let hash_key = kind.hash_key(DeviceId(id));
            let exists: bool = conn.exists(&hash_key).await.map_err(|e| CacheError::OperationFailed(e.to_string()))?;
            if !exists {
                let _: () = conn.zrem(geo_key, &member).await.map_err(|e| CacheError::OperationFailed(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn hash_prefix(kind: &CacheKind) -> &'static str {
    match kind {
        CacheKind::Pilot => "pilot",
        CacheKind::GroundObject => "ground",
        CacheKind::Station => "station",
        CacheKind::Thermal => "thermal",
    }
}

/// Helper for serializing any record destined for the hash store.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|e| CacheError::OperationFailed(e.to_string()))
}

pub fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::OperationFailed(e.to_string()))
}

pub fn default_ttl_for(kind: &CacheKind) -> Duration {
    use crate::model::ttl;
    Duration::from_secs(match kind {
        CacheKind::Pilot => ttl::PILOT_SECS as u64,
        CacheKind::GroundObject => ttl::GROUND_OBJECT_SECS as u64,
        CacheKind::Station => ttl::STATION_SECS as u64,
        CacheKind::Thermal => ttl::THERMAL_SECS as u64,
    })
}

struct InMemoryEntry {
    position: Position,
    object: LiveObject,
    expires_at: std::time::Instant,
}

/// In-memory fake for tests that exercise the Ingest Orchestrator or Query
/// Service without a Redis instance. Geo-radius lookups fall back to plain
/// haversine filtering rather than a geo-set, since there is no store to
/// pipeline against.
#[derive(Default)]
pub struct InMemoryHotCache {
    entries: std::sync::Mutex<std::collections::HashMap<(CacheKind, DeviceId), InMemoryEntry>>,
    tracks: std::sync::Mutex<std::collections::HashMap<DeviceId, Vec<String>>>,
}

impl InMemoryHotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HotCache for InMemoryHotCache {
    async fn save(&self, kind: CacheKind, id: DeviceId, position: Position, object: &LiveObject, ttl: Duration) -> Result<(), CacheError> {
        let entry = InMemoryEntry {
            position,
            object: object.clone(),
            expires_at: std::time::Instant::now() + ttl,
        };
        self.entries.lock().expect("in-memory hot cache lock poisoned").insert((kind, id), entry);
        Ok(())
    }

    async fn append_track(&self, id: DeviceId, point_json: &str) -> Result<(), CacheError> {
        let mut tracks = self.tracks.lock().expect("in-memory hot cache lock poisoned");
        let points = tracks.entry(id).or_default();
        points.insert(0, point_json.to_string());
        points.truncate(999);
        Ok(())
    }

    async fn get_in_radius(&self, kind: CacheKind, center: Position, radius_km: f64) -> Result<Vec<(DeviceId, f64, LiveObject)>, CacheError> {
        let entries = self.entries.lock().expect("in-memory hot cache lock poisoned");
        let now = std::time::Instant::now();
        let mut out: Vec<(DeviceId, f64, LiveObject)> = entries
            .iter()
            .filter(|((k, _), entry)| *k == kind && entry.expires_at > now)
            .map(|((_, id), entry)| (*id, crate::geo::haversine_distance_km(center, entry.position), entry.object.clone()))
            .filter(|(_, dist, _)| *dist <= radius_km)
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(out)
    }

    async fn get_all(&self, kind: CacheKind) -> Result<Vec<LiveObject>, CacheError> {
        let entries = self.entries.lock().expect("in-memory hot cache lock poisoned");
        let now = std::time::Instant::now();
        Ok(entries
            .iter()
            .filter(|((k, _), entry)| *k == kind && entry.expires_at > now)
            .map(|(_, entry)| entry.object.clone())
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn reconcile_evictions(&self, kind: CacheKind) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock().expect("in-memory hot cache lock poisoned");
        let now = std::time::Instant::now();
        let before = entries.len();
        entries.retain(|(k, _), entry| *k != kind || entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AircraftKind, Pilot};

    fn pilot(id: u32, lat: f64, lon: f64) -> LiveObject {
        let now = chrono::Utc::now();
        LiveObject::Pilot(Pilot {
            device_id: DeviceId(id),
            position: Position { lat, lon },
            altitude_m: 1000.0,
            ground_speed_kmh: 30.0,
            climb_ms: 0.0,
            course_deg: 90.0,
            kind: AircraftKind::Paraglider,
            name: None,
            battery_pct: None,
            track_online: true,
            last_update: now,
            last_movement: now,
            rssi: 0,
            snr: 0,
        })
    }

    #[tokio::test]
    async fn in_memory_cache_round_trips_and_filters_by_radius() {
        let cache = InMemoryHotCache::new();
        let near = pilot(1, 46.0, 8.0);
        let far = pilot(2, 10.0, 10.0);
        cache.save(CacheKind::Pilot, DeviceId(1), Position { lat: 46.0, lon: 8.0 }, &near, Duration::from_secs(60)).await.unwrap();
        cache.save(CacheKind::Pilot, DeviceId(2), Position { lat: 10.0, lon: 10.0 }, &far, Duration::from_secs(60)).await.unwrap();

        let hits = cache.get_in_radius(CacheKind::Pilot, Position { lat: 46.0, lon: 8.0 }, 50.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, DeviceId(1));
    }

    #[test]
    fn geo_member_round_trips_to_hash_key() {
        let id = DeviceId(43981);
        let member = id.0.to_string();
        let recovered: u32 = member.parse().unwrap();
        assert_eq!(CacheKind::Pilot.hash_key(DeviceId(recovered)), CacheKind::Pilot.hash_key(id));
    }

    #[tokio::test]
    async fn expired_entries_are_excluded_and_reconciled() {
        let cache = InMemoryHotCache::new();
        let obj = pilot(1, 46.0, 8.0);
        cache.save(CacheKind::Pilot, DeviceId(1), Position { lat: 46.0, lon: 8.0 }, &obj, Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get_all(CacheKind::Pilot).await.unwrap().is_empty());
        let removed = cache.reconcile_evictions(CacheKind::Pilot).await.unwrap();
        assert_eq!(removed, 1);
    }
}
