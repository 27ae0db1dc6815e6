//! Broadcast Manager: geohash-bucketed subscription registry, batching
//! fan-out engine, per-client backpressure (§4.H).

use crate::geo::{self, haversine_distance_km};
use crate::model::{BroadcastUpdate, Position, Subscription};
use chrono::Utc;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

const PUBLISH_CHANNEL_CAPACITY: usize = 1000;
const CLIENT_QUEUE_CAPACITY: usize = 200;
const BATCH_MAX_SIZE: usize = 50;
const BATCH_WINDOW: Duration = Duration::from_millis(100);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const SUBSCRIPTION_INACTIVITY: chrono::Duration = chrono::Duration::minutes(5);
const COVER_PRECISIONS: std::ops::Range<usize> = 3..8;

pub type ClientId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMessage {
    pub sequence: u64,
    pub updates: Vec<BroadcastUpdate>,
}

struct ClientEntry {
    subscription: Subscription,
    outbound: Sender<Arc<BatchMessage>>,
}

/// Registry of subscriptions, grouped by the geohash prefixes their cover
/// touches, plus the per-client bounded outbound queues.
pub struct BroadcastManager {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    groups: RwLock<HashMap<String, HashSet<ClientId>>>,
    publish_tx: Sender<BroadcastUpdate>,
    publish_rx: Receiver<BroadcastUpdate>,
    sequence: AtomicU64,
    dropped_producer_side: AtomicU64,
    dropped_per_client: AtomicU64,
}

impl BroadcastManager {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::bounded(PUBLISH_CHANNEL_CAPACITY);
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            publish_tx: tx,
            publish_rx: rx,
            sequence: AtomicU64::new(0),
            dropped_producer_side: AtomicU64::new(0),
            dropped_per_client: AtomicU64::new(0),
        })
    }

    /// Register a new subscriber; returns the client id and its inbound
    /// receiver for delivered batches.
    pub fn subscribe(&self, center: Position, radius_km: f64) -> (ClientId, Receiver<Arc<BatchMessage>>) {
        let precision = geo::precision_for_radius(radius_km);
        let cover = geo::cover(center, radius_km, precision);
        let subscription = Subscription {
            center,
            radius_km,
            cover: cover.clone(),
            last_active: Utc::now(),
        };

        let (tx, rx) = flume::bounded(CLIENT_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        self.clients.write().expect("client registry lock poisoned").insert(
            id,
            ClientEntry {
                subscription,
                outbound: tx,
            },
        );

        let mut groups = self.groups.write().expect("group registry lock poisoned");
        for hash in cover {
            groups.entry(hash).or_default().insert(id);
        }

        (id, rx)
    }

    pub fn unsubscribe(&self, id: ClientId) {
        let cover = {
            let mut clients = self.clients.write().expect("client registry lock poisoned");
            clients.remove(&id).map(|e| e.subscription.cover)
        };
        if let Some(cover) = cover {
            let mut groups = self.groups.write().expect("group registry lock poisoned");
            for hash in cover {
                if let Some(set) = groups.get_mut(&hash) {
                    set.remove(&id);
                    if set.is_empty() {
                        groups.remove(&hash);
                    }
                }
            }
        }
    }

    /// Publish path: push onto the bounded input channel. Producer-side
    /// backpressure drops with a warning counter when the channel is full.
    pub fn publish(&self, update: BroadcastUpdate) {
        if self.publish_tx.try_send(update).is_err() {
            self.dropped_producer_side.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("broadcast.dropped_producer_side").increment(1);
            tracing::warn!("broadcast publish channel full, dropping update");
        }
    }

    pub fn dropped_producer_side(&self) -> u64 {
        self.dropped_producer_side.load(Ordering::Relaxed)
    }

    pub fn dropped_per_client(&self) -> u64 {
        self.dropped_per_client.load(Ordering::Relaxed)
    }

    pub fn active_subscription_count(&self) -> usize {
        self.clients.read().expect("client registry lock poisoned").len()
    }

    /// Single-threaded cooperative dispatcher: accumulate into a batch until
    /// size >= 50 or 100ms elapses, then fan out.
    pub async fn run_dispatcher(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            let mut batch: Vec<BroadcastUpdate> = Vec::with_capacity(BATCH_MAX_SIZE);
            let deadline = tokio::time::Instant::now() + BATCH_WINDOW;

            loop {
                if batch.len() >= BATCH_MAX_SIZE {
                    break;
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if !batch.is_empty() {
                            self.dispatch_batch(batch).await;
                        }
                        return;
                    }
                    recv = self.publish_rx.recv_async() => {
                        match recv {
                            Ok(update) => batch.push(update),
                            Err(_) => return,
                        }
                    }
                    _ = tokio::time::sleep(remaining) => break,
                }
            }

            if !batch.is_empty() {
                self.dispatch_batch(batch).await;
            }
        }
    }

    async fn dispatch_batch(&self, batch: Vec<BroadcastUpdate>) {
        // Collapse duplicate updates per object id to the latest within the batch.
        let mut latest: HashMap<crate::model::DeviceId, BroadcastUpdate> = HashMap::new();
        for update in batch {
            latest.insert(update.object.device_id(), update);
        }
        let updates: Vec<BroadcastUpdate> = latest.into_values().collect();

        let mut hit_groups: HashMap<String, Vec<&BroadcastUpdate>> = HashMap::new();
        for update in &updates {
            let pos = update.object.position();
            for precision in COVER_PRECISIONS {
                let hash = geo::encode(pos, precision);
                hit_groups.entry(hash).or_default().push(update);
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let groups = self.groups.read().expect("group registry lock poisoned");
        let clients = self.clients.read().expect("client registry lock poisoned");

        let mut per_client_updates: HashMap<ClientId, Vec<BroadcastUpdate>> = HashMap::new();
        for (hash, members) in groups.iter() {
            let Some(group_updates) = hit_groups.get(hash) else { continue };
            for client_id in members {
                let Some(entry) = clients.get(client_id) else { continue };
                for update in group_updates {
                    let pos = update.object.position();
                    let distance = haversine_distance_km(entry.subscription.center, pos);
                    if distance <= entry.subscription.radius_km {
                        per_client_updates.entry(*client_id).or_default().push((*update).clone());
                    }
                }
            }
        }

        for (client_id, updates) in per_client_updates {
            let Some(entry) = clients.get(&client_id) else { continue };
            let mut dedup: HashMap<crate::model::DeviceId, BroadcastUpdate> = HashMap::new();
            for u in updates {
                dedup.insert(u.object.device_id(), u);
            }
            let message = Arc::new(BatchMessage {
                sequence,
                updates: dedup.into_values().collect(),
            });
            if entry.outbound.try_send(message).is_err() {
                self.dropped_per_client.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("broadcast.dropped_per_client").increment(1);
            }
        }
    }

    /// Periodic cleanup: delete groups inactive for > 5 min with no members.
    pub async fn run_cleanup(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
            }
            self.sweep_inactive();
        }
    }

    fn sweep_inactive(&self) {
        let now = Utc::now();
        let stale: Vec<ClientId> = {
            let clients = self.clients.read().expect("client registry lock poisoned");
            clients
                .iter()
                .filter(|(_, e)| now - e.subscription.last_active > SUBSCRIPTION_INACTIVITY)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.unsubscribe(id);
        }

        let mut groups = self.groups.write().expect("group registry lock poisoned");
        groups.retain(|_, members| !members.is_empty());
        metrics::gauge!("broadcast.active_groups").set(groups.len() as f64);
    }

    pub fn touch(&self, id: ClientId) {
        if let Some(entry) = self.clients.write().expect("client registry lock poisoned").get_mut(&id) {
            entry.subscription.last_active = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LiveObject, Pilot, UpdateAction};

    fn sample_update(lat: f64, lon: f64) -> BroadcastUpdate {
        BroadcastUpdate {
            object: LiveObject::Pilot(Pilot {
                device_id: crate::model::DeviceId(1),
                position: Position::new(lat, lon).unwrap(),
                altitude_m: 1000.0,
                ground_speed_kmh: 10.0,
                climb_ms: 0.0,
                course_deg: 0.0,
                kind: crate::model::AircraftKind::Paraglider,
                name: None,
                battery_pct: None,
                track_online: true,
                last_update: Utc::now(),
                last_movement: Utc::now(),
                rssi: 0,
                snr: 0,
            }),
            action: UpdateAction::Update,
        }
    }

    #[tokio::test]
    async fn subscriber_within_radius_receives_batch() {
        let mgr = BroadcastManager::new();
        let center = Position::new(46.0, 8.0).unwrap();
        let (_id, rx) = mgr.subscribe(center, 50.0);

        mgr.publish(sample_update(46.001, 8.001));
        mgr.dispatch_batch(vec![sample_update(46.001, 8.001)]).await;

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv_async()).await;
        assert!(received.is_ok());
    }

    #[test]
    fn duplicate_updates_collapse_to_latest() {
        let mgr_clients = HashMap::<crate::model::DeviceId, BroadcastUpdate>::new();
        let mut latest = mgr_clients;
        for update in [sample_update(46.0, 8.0), sample_update(46.1, 8.1), sample_update(46.2, 8.2)] {
            latest.insert(update.object.device_id(), update);
        }
        assert_eq!(latest.len(), 1);
    }
}
