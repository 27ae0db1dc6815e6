//! Binary frame encoding for the broadcast WebSocket transport and for the
//! `Accept: application/x-protobuf` HTTP content-negotiation alternative
//! (§6). Both share one `bincode`-framed payload: the spec names the
//! `Accept` header grammar but not a wire format, and the stack carries no
//! protobuf runtime for a message this shape, so bincode (already pulled in
//! for other binary framing) stands in for it.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    bincode::serialize(value).map_err(|e| FrameError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    bincode::deserialize(bytes).map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BatchMessage;
    use crate::model::{AircraftKind, BroadcastUpdate, DeviceId, LiveObject, Pilot, Position, UpdateAction};
    use chrono::Utc;

    #[test]
    fn batch_message_round_trips_through_bincode() {
        let batch = BatchMessage {
            sequence: 7,
            updates: vec![BroadcastUpdate {
                object: LiveObject::Pilot(Pilot {
                    device_id: DeviceId(0x123456),
                    position: Position::new(46.0, 8.0).unwrap(),
                    altitude_m: 1000.0,
                    ground_speed_kmh: 40.0,
                    climb_ms: 1.0,
                    course_deg: 90.0,
                    kind: AircraftKind::Paraglider,
                    name: None,
                    battery_pct: None,
                    track_online: true,
                    last_update: Utc::now(),
                    last_movement: Utc::now(),
                    rssi: -80,
                    snr: 10,
                }),
                action: UpdateAction::Update,
            }],
        };

        let bytes = encode(&batch).unwrap();
        let decoded: BatchMessage = decode(&bytes).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.updates.len(), 1);
    }
}
