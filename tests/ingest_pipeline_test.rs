//! End-to-end ingest pipeline test: decode -> validate -> spatial index ->
//! broadcast, using in-memory fakes for the hot cache and history store so
//! the test needs no Redis or Postgres instance.

use fanet_backend::broadcast::BroadcastManager;
use fanet_backend::history::InMemoryHistory;
use fanet_backend::hot_cache::InMemoryHotCache;
use fanet_backend::model::Position;
use fanet_backend::orchestrator::{LiveIndex, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn envelope_bytes(instant: u32, rssi: i16, snr: i16) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&instant.to_le_bytes());
    v.extend_from_slice(&rssi.to_le_bytes());
    v.extend_from_slice(&snr.to_le_bytes());
    v
}

/// A type-1 air-tracking payload reporting the same position each time, so
/// repeated calls look plausible to the validator.
fn air_tracking_payload(source: [u8; 3]) -> Vec<u8> {
    let lat_raw: i32 = (46.0_f64 * 93206.04).round() as i32;
    let lon_raw: i32 = (8.0_f64 * 46603.02).round() as i32;
    let alt_status: u16 = 1000 | (1 << 12) | (1 << 15);

    let mut payload = envelope_bytes(1_700_000_000, -80, 10);
    payload.push(1);
    payload.extend_from_slice(&source);
    payload.extend_from_slice(&lat_raw.to_le_bytes()[0..3]);
    payload.extend_from_slice(&lon_raw.to_le_bytes()[0..3]);
    payload.extend_from_slice(&alt_status.to_le_bytes());
    payload.push(100); // 50 km/h
    payload.push(20); // 2.0 m/s climb
    payload.push(64); // 90 deg heading
    payload
}

/// Three packets at the same position: the hysteresis validator (§4.B)
/// admits on the third (score 50 -> 65 -> 80, crossing the 70 threshold).
#[tokio::test]
async fn decoded_packets_admit_and_fan_out_to_subscribers() {
    let hot_cache = Arc::new(InMemoryHotCache::new());
    let history: Arc<dyn fanet_backend::history::HistoryPort> = Arc::new(InMemoryHistory::new());
    let spatial_index = Arc::new(LiveIndex::new());
    let broadcast = BroadcastManager::new();

    let orchestrator = Arc::new(Orchestrator::new(hot_cache, history, spatial_index.clone(), broadcast.clone()));

    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(Arc::clone(&broadcast).run_dispatcher(cancel.clone()));

    let center = Position::new(46.0, 8.0).unwrap();
    let (_client_id, rx) = broadcast.subscribe(center, 50.0);

    let topic = "fb/b/010203/f/1";
    let payload = air_tracking_payload([0x01, 0x02, 0x03]);
    for _ in 0..3 {
        orchestrator.handle_message(topic, &payload).await;
    }

    let batch = tokio::time::timeout(Duration::from_millis(500), rx.recv_async())
        .await
        .expect("subscriber should receive a batch before the timeout")
        .expect("channel should not be closed");
    assert_eq!(batch.updates.len(), 1);

    let device_id = fanet_backend::DeviceId::from_le_bytes([0x01, 0x02, 0x03]);
    assert!(spatial_index.get(device_id).is_some());

    cancel.cancel();
    let _ = dispatcher.await;
}

#[tokio::test]
async fn malformed_packets_increment_parse_error_count_without_panicking() {
    let hot_cache = Arc::new(InMemoryHotCache::new());
    let history: Arc<dyn fanet_backend::history::HistoryPort> = Arc::new(InMemoryHistory::new());
    let spatial_index = Arc::new(LiveIndex::new());
    let broadcast = BroadcastManager::new();
    let orchestrator = Orchestrator::new(hot_cache, history, spatial_index, broadcast);

    orchestrator.handle_message("not/a/valid/topic", &[0u8; 4]).await;
    orchestrator.handle_message("fb/b/010203/f/1", &[0u8; 4]).await;

    assert_eq!(orchestrator.parse_error_count(), 2);
}
