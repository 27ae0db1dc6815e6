//! Stateful per-device plausibility validator with hysteresis (§4.B).

use crate::geo::haversine_distance_km;
use crate::model::{AdmissionOutcome, AircraftKind, DeviceId, Position, ValidationState};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

const SHARD_COUNT: usize = 16;
const KIND_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct KindMetrics {
    pub kind: AircraftKind,
    pub admits: u64,
    pub rejects: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct KindCounters {
    admits: AtomicU64,
    rejects: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub max_time_delta: Duration,
    pub speed_tolerance: f64,
    pub min_packets_to_admit: u64,
    pub valid_bonus: u8,
    pub invalid_penalty: u8,
    pub admit_threshold: u8,
    pub evict_threshold: u8,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_time_delta: Duration::minutes(30),
            speed_tolerance: 1.2,
            min_packets_to_admit: 2,
            valid_bonus: 15,
            invalid_penalty: 25,
            admit_threshold: 70,
            evict_threshold: 30,
        }
    }
}

/// Device-id-sharded lock map for the validator's per-device state, so
/// writes for unrelated devices do not contend on one global lock.
pub struct Validator {
    config: ValidatorConfig,
    shards: Vec<RwLock<HashMap<DeviceId, ValidationState>>>,
    kind_counters: [KindCounters; KIND_COUNT],
}

fn kind_index(kind: AircraftKind) -> usize {
    kind as usize
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            config,
            shards,
            kind_counters: Default::default(),
        }
    }

    fn shard_for(&self, id: DeviceId) -> &RwLock<HashMap<DeviceId, ValidationState>> {
        let idx = (id.as_u32() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Evaluate one admitted-candidate air-tracking packet against the
    /// device's validation state, per the hysteresis algorithm in §4.B.
    pub fn evaluate(
        &self,
        id: DeviceId,
        position: Position,
        kind: AircraftKind,
        now: DateTime<Utc>,
    ) -> AdmissionOutcome {
        let shard = self.shard_for(id);
        let mut map = shard.write().expect("validator shard lock poisoned");

        let Some(state) = map.get_mut(&id) else {
            map.insert(id, ValidationState::new(now, kind));
            self.kind_counters[kind_index(kind)].rejects.fetch_add(1, Ordering::Relaxed);
            return AdmissionOutcome::RejectKeep;
        };

        let dt = now - state.last_instant;
        let was_plausible = if dt > self.config.max_time_delta {
            // Prior position considered stale; accept without a speed check.
            true
        } else if let Some(last) = state.last_position {
            let distance_km = haversine_distance_km(last, position);
            let hours = (dt.num_milliseconds().max(1) as f64) / 3_600_000.0;
            let implied_speed_kmh = distance_km / hours;
            implied_speed_kmh <= self.config.speed_tolerance * kind.max_speed_kmh()
        } else {
            true
        };

        if was_plausible {
            state.score = (state.score as u16 + self.config.valid_bonus as u16).min(crate::model::ValidationState::MAX_SCORE as u16) as u8;
            state.consecutive_invalid = 0;
        } else {
            state.score = state.score.saturating_sub(self.config.invalid_penalty);
            state.consecutive_invalid += 1;
        }

        state.packet_count += 1;
        state.last_position = Some(position);
        state.last_instant = now;
        state.observed_kind = kind;

        let was_admitted = state.admitted;
        let now_admitted = state.packet_count >= self.config.min_packets_to_admit
            && ((was_admitted && state.score > self.config.evict_threshold)
                || (!was_admitted && state.score >= self.config.admit_threshold));
        state.admitted = now_admitted;

        let outcome = match (was_admitted, now_admitted) {
            (false, true) => AdmissionOutcome::AdmitNew,
            (true, true) => AdmissionOutcome::AdmitContinue,
            (true, false) => AdmissionOutcome::RejectEvict,
            (false, false) => AdmissionOutcome::RejectKeep,
        };

        let counters = &self.kind_counters[kind_index(kind)];
        match outcome {
            AdmissionOutcome::AdmitNew | AdmissionOutcome::AdmitContinue => counters.admits.fetch_add(1, Ordering::Relaxed),
            AdmissionOutcome::RejectKeep => counters.rejects.fetch_add(1, Ordering::Relaxed),
            AdmissionOutcome::RejectEvict => counters.evictions.fetch_add(1, Ordering::Relaxed),
        };

        outcome
    }

    /// Per-aircraft-kind admission counters for `/api/v1/validation/metrics`.
    pub fn kind_metrics(&self) -> Vec<KindMetrics> {
        const KINDS: [AircraftKind; KIND_COUNT] = [
            AircraftKind::Unknown,
            AircraftKind::Paraglider,
            AircraftKind::Hangglider,
            AircraftKind::Balloon,
            AircraftKind::Glider,
            AircraftKind::Powered,
            AircraftKind::Helicopter,
            AircraftKind::Uav,
        ];
        KINDS
            .into_iter()
            .map(|kind| {
                let counters = &self.kind_counters[kind_index(kind)];
                KindMetrics {
                    kind,
                    admits: counters.admits.load(Ordering::Relaxed),
                    rejects: counters.rejects.load(Ordering::Relaxed),
                    evictions: counters.evictions.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Explicit invalidate: clears the admitted flag and score.
    pub fn invalidate(&self, id: DeviceId) {
        let shard = self.shard_for(id);
        let mut map = shard.write().expect("validator shard lock poisoned");
        if let Some(state) = map.get_mut(&id) {
            state.admitted = false;
            state.score = 0;
        }
    }

    pub fn state_snapshot(&self, id: DeviceId) -> Option<ValidationState> {
        let shard = self.shard_for(id);
        shard.read().expect("validator shard lock poisoned").get(&id).cloned()
    }

    /// (admitted, tracked) device counts across all shards, for `/api/v1/validation/metrics`.
    pub fn admission_counts(&self) -> (usize, usize) {
        let mut admitted = 0;
        let mut total = 0;
        for shard in &self.shards {
            let map = shard.read().expect("validator shard lock poisoned");
            total += map.len();
            admitted += map.values().filter(|s| s.admitted).count();
        }
        (admitted, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_is_not_yet_admitted() {
        let v = Validator::new(ValidatorConfig::default());
        let id = DeviceId(1);
        let p = Position::new(46.0, 8.0).unwrap();
        let outcome = v.evaluate(id, p, AircraftKind::Paraglider, Utc::now());
        assert_eq!(outcome, AdmissionOutcome::RejectKeep);
    }

    #[test]
    fn teleport_is_rejected_and_evicts_after_repeated_rejects() {
        let v = Validator::new(ValidatorConfig::default());
        let id = DeviceId(2);
        let t0 = Utc::now();
        let p0 = Position::new(46.0, 8.0).unwrap();
        v.evaluate(id, p0, AircraftKind::Paraglider, t0);

        // 50 km away 10 s later: implied speed ~18000 km/h, far above tolerance.
        let p1 = Position::new(46.45, 8.0).unwrap();
        let t1 = t0 + Duration::seconds(10);
        let outcome = v.evaluate(id, p1, AircraftKind::Paraglider, t1);
        assert_eq!(outcome, AdmissionOutcome::RejectKeep);

        let state = v.state_snapshot(id).unwrap();
        assert_eq!(state.score, 25);
    }

    #[test]
    fn score_stays_within_bounds() {
        let v = Validator::new(ValidatorConfig::default());
        let id = DeviceId(3);
        let mut now = Utc::now();
        let p = Position::new(46.0, 8.0).unwrap();
        for _ in 0..20 {
            v.evaluate(id, p, AircraftKind::Paraglider, now);
            now += Duration::seconds(5);
        }
        let state = v.state_snapshot(id).unwrap();
        assert!(state.score <= crate::model::ValidationState::MAX_SCORE);
    }
}
