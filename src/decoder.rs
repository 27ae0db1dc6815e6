//! FANET packet decoder: forwarder envelope + FANET frame -> typed records.
//!
//! Pure functions over `&[u8]`; never touches shared state.

use crate::model::{AircraftKind, DeviceId, GroundObjectKind};
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
    #[error("payload too short: need {need} bytes, got {got}")]
    PayloadTooShort { need: usize, got: usize },
    #[error("coordinate out of range: lat={lat}, lon={lon}")]
    CoordinateOutOfRange { lat: f64, lon: f64 },
}

/// The forwarder envelope preceding every FANET frame on the bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub instant: DateTime<Utc>,
    pub rssi: i16,
    pub snr: i16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirTracking {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub track_online: bool,
    pub aircraft: AircraftKind,
    pub speed_kmh: f64,
    pub climb_ms: f64,
    pub heading_deg: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameRecord {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ServiceFields {
    pub temperature_c: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_gusts_kmh: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub battery_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub lat: f64,
    pub lon: f64,
    pub fields: ServiceFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundTracking {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub kind: GroundObjectKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalRecord {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub quality: u8,
    pub avg_climb_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    AirTracking(AirTracking),
    Name(NameRecord),
    Service(ServiceRecord),
    GroundTracking(GroundTracking),
    Thermal(ThermalRecord),
    /// Types 0 (ACK), 8/10 (HW info), and any other unsupported type.
    Minimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub envelope: Envelope,
    pub source: DeviceId,
    pub frame_type: u8,
    pub body: FrameBody,
}

/// Parse `fb/b/<chip-id>/f/<topic-type>`. Returns the chip id string and the
/// topic type as parsed from the topic; the caller cross-checks the type
/// against the frame header (a mismatch is logged, not fatal).
pub fn parse_topic(topic: &str) -> Result<(String, u8), DecodeError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 5 || parts[0] != "fb" || parts[1] != "b" || parts[3] != "f" {
        return Err(DecodeError::MalformedTopic(topic.to_string()));
    }
    let topic_type: u8 = parts[4]
        .parse()
        .map_err(|_| DecodeError::MalformedTopic(topic.to_string()))?;
    Ok((parts[2].to_string(), topic_type))
}

const ENVELOPE_LEN: usize = 8;
const HEADER_ADDR_LEN: usize = 4;

/// Decode (topic, payload) into a typed record.
pub fn decode(topic: &str, payload: &[u8]) -> Result<DecodedPacket, DecodeError> {
    let (_, topic_type) = parse_topic(topic)?;

    if payload.len() < ENVELOPE_LEN + HEADER_ADDR_LEN {
        return Err(DecodeError::PayloadTooShort {
            need: ENVELOPE_LEN + HEADER_ADDR_LEN,
            got: payload.len(),
        });
    }

    let instant_secs = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let rssi = i16::from_le_bytes(payload[4..6].try_into().unwrap());
    let snr = i16::from_le_bytes(payload[6..8].try_into().unwrap());
    let envelope = Envelope {
        instant: Utc
            .timestamp_opt(instant_secs as i64, 0)
            .single()
            .unwrap_or_else(Utc::now),
        rssi,
        snr,
    };

    let header = payload[ENVELOPE_LEN];
    let frame_type = header & 0x3f;
    let source = DeviceId::from_le_bytes([
        payload[ENVELOPE_LEN + 1],
        payload[ENVELOPE_LEN + 2],
        payload[ENVELOPE_LEN + 3],
    ]);

    if frame_type != topic_type {
        tracing::debug!(frame_type, topic_type, "fanet header type does not match topic type");
    }

    let body_bytes = &payload[ENVELOPE_LEN + HEADER_ADDR_LEN..];

    let body = match frame_type {
        1 => FrameBody::AirTracking(decode_air_tracking(body_bytes)?),
        2 => FrameBody::Name(decode_name(body_bytes)),
        4 => FrameBody::Service(decode_service(body_bytes)?),
        7 => FrameBody::GroundTracking(decode_ground_tracking(body_bytes)?),
        9 => FrameBody::Thermal(decode_thermal(body_bytes)?),
        _ => FrameBody::Minimal,
    };

    Ok(DecodedPacket {
        envelope,
        source,
        frame_type,
        body,
    })
}

fn require(buf: &[u8], n: usize) -> Result<(), DecodeError> {
    if buf.len() < n {
        Err(DecodeError::PayloadTooShort { need: n, got: buf.len() })
    } else {
        Ok(())
    }
}

/// Decode a signed 24-bit little-endian integer scaled by `scale` into degrees.
fn decode_scaled_coord_24(bytes: &[u8], scale: f64) -> f64 {
    let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], if bytes[2] & 0x80 != 0 { 0xff } else { 0x00 }]);
    raw as f64 / scale
}

fn validate_coord(lat: f64, lon: f64) -> Result<(), DecodeError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(DecodeError::CoordinateOutOfRange { lat, lon })
    }
}

fn decode_air_tracking(buf: &[u8]) -> Result<AirTracking, DecodeError> {
    require(buf, 11)?;

    let lat = decode_scaled_coord_24(&buf[0..3], 93206.04);
    let lon = decode_scaled_coord_24(&buf[3..6], 46603.02);
    validate_coord(lat, lon)?;

    let alt_status = u16::from_le_bytes([buf[6], buf[7]]);
    let track_online = alt_status & 0x8000 != 0;
    let kind_bits = ((alt_status >> 12) & 0x7) as u8;
    let alt_scale4 = alt_status & 0x0800 != 0;
    let raw_alt = (alt_status & 0x07ff) as f64;
    let altitude_m = if alt_scale4 { raw_alt * 4.0 } else { raw_alt };

    let speed_byte = buf[8];
    let speed_scale5 = speed_byte & 0x80 != 0;
    let speed_raw = (speed_byte & 0x7f) as f64 * 0.5;
    let speed_kmh = if speed_scale5 { speed_raw * 5.0 } else { speed_raw };

    let climb_byte = buf[9];
    let climb_scale5 = climb_byte & 0x80 != 0;
    let climb_magnitude = climb_byte & 0x7f;
    // Explicit sign-extension at bit 6 of the 7-bit field (preserved per
    // the two divergent source paths: the sign-bit path, not direct cast).
    let climb_signed = if climb_magnitude & 0x40 != 0 {
        (climb_magnitude as i8 | !0x7f_u8 as i8) as f64
    } else {
        climb_magnitude as f64
    };
    let climb_raw = climb_signed * 0.1;
    let climb_ms = if climb_scale5 { climb_raw * 5.0 } else { climb_raw };

    let heading_byte = buf[10];
    let heading_deg = heading_byte as f64 * 360.0 / 256.0;

    Ok(AirTracking {
        lat,
        lon,
        altitude_m,
        track_online,
        aircraft: AircraftKind::from_bits(kind_bits),
        speed_kmh,
        climb_ms,
        heading_deg,
    })
}

fn decode_name(buf: &[u8]) -> NameRecord {
    let truncated = &buf[..buf.len().min(64)];
    let end = truncated.iter().position(|&b| b == 0).unwrap_or(truncated.len());
    let name = String::from_utf8_lossy(&truncated[..end]).into_owned();
    NameRecord { name }
}

fn decode_service(buf: &[u8]) -> Result<ServiceRecord, DecodeError> {
    require(buf, 7)?;
    let flags = buf[0];
    let lat = decode_scaled_coord_24(&buf[1..4], 93206.04);
    let lon = decode_scaled_coord_24(&buf[4..7], 46603.02);
    validate_coord(lat, lon)?;

    let mut fields = ServiceFields::default();
    let mut cursor = 7usize;

    if flags & 0x40 != 0 {
        require(buf, cursor + 1)?;
        let raw = buf[cursor] as i8;
        fields.temperature_c = Some(raw as f64 * 0.5);
        cursor += 1;
    }
    if flags & 0x20 != 0 {
        require(buf, cursor + 3)?;
        fields.wind_direction_deg = Some(buf[cursor] as f64 * 360.0 / 256.0);
        fields.wind_speed_kmh = Some(buf[cursor + 1] as f64 * 0.2);
        fields.wind_gusts_kmh = Some(buf[cursor + 2] as f64 * 0.2);
        cursor += 3;
    }
    if flags & 0x10 != 0 {
        require(buf, cursor + 1)?;
        fields.humidity_pct = Some(buf[cursor] as f64 / 4.0);
        cursor += 1;
    }
    if flags & 0x08 != 0 {
        require(buf, cursor + 1)?;
        fields.pressure_hpa = Some(buf[cursor] as f64 / 10.0 + 430.0);
        cursor += 1;
    }
    if flags & 0x02 != 0 {
        require(buf, cursor + 1)?;
        let low_nibble = buf[cursor] & 0x0f;
        fields.battery_pct = Some(low_nibble as f64 * 100.0 / 15.0);
        cursor += 1;
    }

    Ok(ServiceRecord { lat, lon, fields })
}

fn decode_ground_tracking(buf: &[u8]) -> Result<GroundTracking, DecodeError> {
    require(buf, 10)?;
    let lat = decode_scaled_coord_24(&buf[0..3], 93206.04);
    let lon = decode_scaled_coord_24(&buf[3..6], 46603.02);
    validate_coord(lat, lon)?;

    let altitude_m = u16::from_le_bytes([buf[6], buf[7]]) as f64;
    let combined = u16::from_le_bytes([buf[8], buf[9]]);
    let speed_kmh = (combined >> 6) as f64;
    let heading_deg = (combined & 0x3f) as f64 * 6.0;
    // An 11th byte carries the ground-object type nibble on forwarders that
    // send it; older 10-byte payloads are still valid and default to Other.
    let kind = buf.get(10).copied().map(ground_object_kind).unwrap_or(GroundObjectKind::Other);

    Ok(GroundTracking {
        lat,
        lon,
        altitude_m,
        speed_kmh,
        heading_deg,
        kind,
    })
}

fn decode_thermal(buf: &[u8]) -> Result<ThermalRecord, DecodeError> {
    require(buf, 11)?;
    let lat = decode_scaled_coord_24(&buf[0..3], 93206.04);
    let lon = decode_scaled_coord_24(&buf[3..6], 46603.02);
    validate_coord(lat, lon)?;

    let altitude_m = u16::from_le_bytes([buf[6], buf[7]]) as f64;
    let quality = buf[8].min(5);
    let climb_raw = i16::from_le_bytes([buf[9], buf[10]]);
    let avg_climb_ms = climb_raw as f64 * 0.01;

    Ok(ThermalRecord {
        lat,
        lon,
        altitude_m,
        quality,
        avg_climb_ms,
    })
}

/// Classify the ground-object type nibble, mirroring `AircraftKind::from_bits`
/// for the ground-tracking path.
fn ground_object_kind(bits: u8) -> GroundObjectKind {
    GroundObjectKind::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_bytes(instant: u32, rssi: i16, snr: i16) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&instant.to_le_bytes());
        v.extend_from_slice(&rssi.to_le_bytes());
        v.extend_from_slice(&snr.to_le_bytes());
        v
    }

    #[test]
    fn decodes_type1_air_tracking_per_worked_example() {
        let lat_raw: i32 = (46.0_f64 * 93206.04).round() as i32;
        let lon_raw: i32 = (8.0_f64 * 46603.02).round() as i32;
        let alt_status: u16 = 1000 | (1 << 12) | (1 << 15);

        let mut payload = envelope_bytes(1_700_000_000, -80, 10);
        payload.push(1); // header: type 1
        payload.extend_from_slice(&[0x01, 0x02, 0x03]); // source address

        payload.extend_from_slice(&lat_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&lon_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&alt_status.to_le_bytes());
        payload.push(100); // speed byte -> 50 km/h
        payload.push(20); // climb byte -> 20 * 0.1 m/s = 2.0 m/s
        payload.push(64); // heading byte -> 90 deg

        let decoded = decode("fb/b/010203/f/1", &payload).unwrap();
        match decoded.body {
            FrameBody::AirTracking(a) => {
                assert!((a.lat - 46.0).abs() < 0.0001);
                assert!((a.lon - 8.0).abs() < 0.0001);
                assert_eq!(a.altitude_m, 1000.0);
                assert_eq!(a.aircraft, AircraftKind::Paraglider);
                assert!(a.track_online);
                assert_eq!(a.speed_kmh, 50.0);
                assert_eq!(a.climb_ms, 2.0);
                assert_eq!(a.heading_deg, 90.0);
            }
            _ => panic!("expected air tracking"),
        }
    }

    #[test]
    fn negative_climb_sign_extends_at_bit6() {
        let climb_byte: u8 = 0b0100_0000; // magnitude 64, sign bit set -> negative
        let magnitude = climb_byte & 0x7f;
        let signed = if magnitude & 0x40 != 0 {
            (magnitude as i8 | !0x7f_u8 as i8) as f64
        } else {
            magnitude as f64
        };
        assert_eq!(signed, -64.0);
    }

    #[test]
    fn malformed_topic_rejected() {
        assert!(parse_topic("not/a/topic").is_err());
    }

    #[test]
    fn short_payload_rejected() {
        assert!(decode("fb/b/010203/f/1", &[0u8; 4]).is_err());
    }

    #[test]
    fn unsupported_type_is_minimal_not_error() {
        let mut payload = envelope_bytes(0, 0, 0);
        payload.push(0); // type 0: ACK
        payload.extend_from_slice(&[0, 0, 0]);
        let decoded = decode("fb/b/000000/f/0", &payload).unwrap();
        assert_eq!(decoded.body, FrameBody::Minimal);
    }

    #[test]
    fn decodes_type7_ground_tracking_with_kind_byte() {
        let lat_raw: i32 = (46.0_f64 * 93206.04).round() as i32;
        let lon_raw: i32 = (8.0_f64 * 46603.02).round() as i32;
        let combined: u16 = (40 << 6) | 15; // 40 km/h, heading 15*6=90 deg

        let mut payload = envelope_bytes(1_700_000_000, -70, 5);
        payload.push(7); // header: type 7
        payload.extend_from_slice(&[0x01, 0x02, 0x03]);

        payload.extend_from_slice(&lat_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&lon_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&1200u16.to_le_bytes());
        payload.extend_from_slice(&combined.to_le_bytes());
        payload.push(2); // ground type nibble -> Vehicle

        let decoded = decode("fb/b/010203/f/7", &payload).unwrap();
        match decoded.body {
            FrameBody::GroundTracking(g) => {
                assert_eq!(g.altitude_m, 1200.0);
                assert_eq!(g.speed_kmh, 40.0);
                assert_eq!(g.heading_deg, 90.0);
                assert_eq!(g.kind, GroundObjectKind::Vehicle);
            }
            _ => panic!("expected ground tracking"),
        }
    }

    #[test]
    fn ground_tracking_without_kind_byte_defaults_to_other() {
        let lat_raw: i32 = (46.0_f64 * 93206.04).round() as i32;
        let lon_raw: i32 = (8.0_f64 * 46603.02).round() as i32;

        let mut payload = envelope_bytes(1_700_000_000, -70, 5);
        payload.push(7);
        payload.extend_from_slice(&[0x01, 0x02, 0x03]);
        payload.extend_from_slice(&lat_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&lon_raw.to_le_bytes()[0..3]);
        payload.extend_from_slice(&1200u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());

        let decoded = decode("fb/b/010203/f/7", &payload).unwrap();
        match decoded.body {
            FrameBody::GroundTracking(g) => assert_eq!(g.kind, GroundObjectKind::Other),
            _ => panic!("expected ground tracking"),
        }
    }

    #[test]
    fn name_truncates_at_64_bytes() {
        let mut payload = envelope_bytes(0, 0, 0);
        payload.push(2);
        payload.extend_from_slice(&[0, 0, 0]);
        payload.extend_from_slice(&[b'a'; 70]);
        let decoded = decode("fb/b/000000/f/2", &payload).unwrap();
        match decoded.body {
            FrameBody::Name(n) => assert_eq!(n.name.len(), 64),
            _ => panic!("expected name"),
        }
    }
}
