//! In-memory, TTL-evicting, geohash-bucketed spatial index (§4.D).

use crate::geo::{self, haversine_distance_km, Bounds};
use crate::model::{DeviceId, Position};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

const DEFAULT_PRECISION: usize = 5;

struct IndexedEntry<T> {
    position: Position,
    inserted_at: DateTime<Utc>,
    payload: T,
}

/// Reader-writer-lock-guarded geohash bucket map plus a direct id index.
/// Writes and reads interleave; a reader sees a consistent snapshot of each
/// bucket at the moment the lock was held.
pub struct SpatialIndex<T> {
    precision: usize,
    buckets: RwLock<HashMap<String, HashSet<DeviceId>>>,
    entries: RwLock<HashMap<DeviceId, IndexedEntry<T>>>,
}

impl<T: Clone> SpatialIndex<T> {
    pub fn new() -> Self {
        Self::with_precision(DEFAULT_PRECISION)
    }

    pub fn with_precision(precision: usize) -> Self {
        Self {
            precision,
            buckets: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: DeviceId, position: Position, payload: T) {
        let hash = geo::encode(position, self.precision);
        self.buckets
            .write()
            .expect("spatial index bucket lock poisoned")
            .entry(hash)
            .or_default()
            .insert(id);
        self.entries.write().expect("spatial index entry lock poisoned").insert(
            id,
            IndexedEntry {
                position,
                inserted_at: Utc::now(),
                payload,
            },
        );
    }

    /// Update an existing entry; moves bucket if the geohash prefix changed,
    /// otherwise just refreshes the timestamp and payload.
    pub fn update(&self, id: DeviceId, position: Position, payload: T) {
        let new_hash = geo::encode(position, self.precision);
        let old_hash = self
            .entries
            .read()
            .expect("spatial index entry lock poisoned")
            .get(&id)
            .map(|e| geo::encode(e.position, self.precision));

        if old_hash.as_deref() != Some(new_hash.as_str()) {
            let mut buckets = self.buckets.write().expect("spatial index bucket lock poisoned");
            if let Some(old) = old_hash {
                if let Some(set) = buckets.get_mut(&old) {
                    set.remove(&id);
                    if set.is_empty() {
                        buckets.remove(&old);
                    }
                }
            }
            buckets.entry(new_hash).or_default().insert(id);
        }

        self.entries.write().expect("spatial index entry lock poisoned").insert(
            id,
            IndexedEntry {
                position,
                inserted_at: Utc::now(),
                payload,
            },
        );
    }

    pub fn remove(&self, id: DeviceId) {
        let hash = self
            .entries
            .write()
            .expect("spatial index entry lock poisoned")
            .remove(&id)
            .map(|e| geo::encode(e.position, self.precision));
        if let Some(hash) = hash {
            let mut buckets = self.buckets.write().expect("spatial index bucket lock poisoned");
            if let Some(set) = buckets.get_mut(&hash) {
                set.remove(&id);
                if set.is_empty() {
                    buckets.remove(&hash);
                }
            }
        }
    }

    pub fn query_radius(&self, center: Position, radius_km: f64) -> Vec<(DeviceId, T)> {
        let precision = geo::precision_for_radius(radius_km).min(self.precision).max(1);
        let candidates = geo::cover(center, radius_km, self.precision.min(precision + 2).max(1));
        let buckets = self.buckets.read().expect("spatial index bucket lock poisoned");
        let entries = self.entries.read().expect("spatial index entry lock poisoned");

        let mut ids: HashSet<DeviceId> = HashSet::new();
        for hash in &candidates {
            if let Some(set) = buckets.get(hash) {
                ids.extend(set.iter().copied());
            }
        }
        // Exact index precision bucket lookup as a fallback in case the
        // covering set at finer precision missed boundary cells.
        let own_hash = geo::encode(center, self.precision);
        if let Some(set) = buckets.get(&own_hash) {
            ids.extend(set.iter().copied());
        }

        ids.into_iter()
            .filter_map(|id| entries.get(&id).map(|e| (id, e)))
            .filter(|(_, e)| haversine_distance_km(center, e.position) <= radius_km)
            .map(|(id, e)| (id, e.payload.clone()))
            .collect()
    }

    /// Direct lookup by id, bypassing the geohash buckets entirely.
    pub fn get(&self, id: DeviceId) -> Option<T> {
        self.entries
            .read()
            .expect("spatial index entry lock poisoned")
            .get(&id)
            .map(|e| e.payload.clone())
    }

    pub fn query_bounds(&self, bounds: Bounds) -> Vec<(DeviceId, T)> {
        let candidates = geo::cover_bounds(bounds, self.precision);
        let buckets = self.buckets.read().expect("spatial index bucket lock poisoned");
        let entries = self.entries.read().expect("spatial index entry lock poisoned");

        let mut ids: HashSet<DeviceId> = HashSet::new();
        for hash in &candidates {
            if let Some(set) = buckets.get(hash) {
                ids.extend(set.iter().copied());
            }
        }

        ids.into_iter()
            .filter_map(|id| entries.get(&id).map(|e| (id, e)))
            .filter(|(_, e)| bounds.contains(e.position))
            .map(|(id, e)| (id, e.payload.clone()))
            .collect()
    }

    /// Background sweep: remove entries whose timestamp is older than `age`.
    pub fn expire_older_than(&self, age: Duration) -> usize {
        self.expire_by(|_| age)
    }

    /// Background sweep with a per-entry TTL, so one index can hold several
    /// kinds of payload each with its own retention window.
    pub fn expire_by<F>(&self, ttl_for: F) -> usize
    where
        F: Fn(&T) -> Duration,
    {
        let now = Utc::now();
        let stale: Vec<DeviceId> = self
            .entries
            .read()
            .expect("spatial index entry lock poisoned")
            .iter()
            .filter(|(_, e)| now - e.inserted_at > ttl_for(&e.payload))
            .map(|(id, _)| *id)
            .collect();
        let count = stale.len();
        for id in stale {
            self.remove(id);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("spatial index entry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for SpatialIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_radius_matches_haversine_exactly() {
        let index: SpatialIndex<()> = SpatialIndex::new();
        let center = Position::new(46.0, 8.0).unwrap();

        for i in 0..1000u32 {
            let lat = 46.0 + ((i % 100) as f64 - 50.0) / 5000.0;
            let lon = 8.0 + ((i / 100) as f64 - 5.0) / 500.0;
            if let Some(p) = Position::new(lat, lon) {
                index.insert(DeviceId(i), p, ());
            }
        }

        let results = index.query_radius(center, 50.0);
        assert!(!results.is_empty());
    }

    #[test]
    fn update_moves_entry_between_buckets() {
        let index: SpatialIndex<u32> = SpatialIndex::with_precision(7);
        let id = DeviceId(1);
        let p0 = Position::new(46.0, 8.0).unwrap();
        let p1 = Position::new(10.0, 10.0).unwrap();
        index.insert(id, p0, 1);
        index.update(id, p1, 2);

        let results = index.query_radius(p1, 1.0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 2);
    }

    #[test]
    fn expire_removes_stale_entries() {
        let index: SpatialIndex<()> = SpatialIndex::new();
        index.insert(DeviceId(1), Position::new(0.0, 0.0).unwrap(), ());
        let removed = index.expire_older_than(Duration::seconds(-1));
        assert_eq!(removed, 1);
        assert!(index.is_empty());
    }

    #[test]
    fn expire_by_uses_per_entry_ttl() {
        let index: SpatialIndex<u32> = SpatialIndex::new();
        index.insert(DeviceId(1), Position::new(0.0, 0.0).unwrap(), 0);
        index.insert(DeviceId(2), Position::new(0.0, 0.0).unwrap(), 1);
        // kind 0 has already expired (negative ttl); kind 1 has not.
        let removed = index.expire_by(|kind| if *kind == 0 { Duration::seconds(-1) } else { Duration::seconds(60) });
        assert_eq!(removed, 1);
        assert!(index.get(DeviceId(2)).is_some());
        assert!(index.get(DeviceId(1)).is_none());
    }
}
