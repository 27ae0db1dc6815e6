//! Core domain entities for the FANET telemetry backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 24-bit FANET device address, always rendered as 6 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn from_le_bytes(bytes: [u8; 3]) -> Self {
        Self(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0 & 0x00ff_ffff)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(DeviceId)
    }
}

/// Validated geographic position. Construction enforces the coordinate bounds
/// shared by every entity in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
            Some(Self { lat, lon })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AircraftKind {
    Unknown,
    Paraglider,
    Hangglider,
    Balloon,
    Glider,
    Powered,
    Helicopter,
    Uav,
}

impl AircraftKind {
    /// Decode the 3-bit aircraft-kind field from a type-1 `alt_status` word.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Self::Unknown,
            1 => Self::Paraglider,
            2 => Self::Hangglider,
            3 => Self::Balloon,
            4 => Self::Glider,
            5 => Self::Powered,
            6 => Self::Helicopter,
            7 => Self::Uav,
            _ => unreachable!(),
        }
    }

    /// Kind-specific max ground speed (km/h), used by the Validator.
    pub fn max_speed_kmh(&self) -> f64 {
        match self {
            Self::Unknown => 100.0,
            Self::Paraglider => 80.0,
            Self::Hangglider => 120.0,
            Self::Powered => 1000.0,
            Self::Glider => 300.0,
            Self::Balloon => 60.0,
            Self::Helicopter => 300.0,
            Self::Uav => 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundObjectKind {
    Other,
    Walking,
    Vehicle,
    Bike,
    Boat,
    NeedRide,
    LandedWell,
    NeedTechnicalSupport,
    NeedMedicalHelp,
    DistressCall,
    DistressCallAuto,
}

impl GroundObjectKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xf {
            0 => Self::Other,
            1 => Self::Walking,
            2 => Self::Vehicle,
            3 => Self::Bike,
            4 => Self::Boat,
            5 => Self::NeedRide,
            6 => Self::LandedWell,
            7 => Self::NeedTechnicalSupport,
            8 => Self::NeedMedicalHelp,
            9 => Self::DistressCall,
            10 => Self::DistressCallAuto,
            _ => Self::Other,
        }
    }

    /// Distress subset: the "emergency" set per the data model.
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            Self::NeedTechnicalSupport
                | Self::NeedMedicalHelp
                | Self::DistressCall
                | Self::DistressCallAuto
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pilot {
    pub device_id: DeviceId,
    pub position: Position,
    pub altitude_m: f64,
    pub ground_speed_kmh: f64,
    pub climb_ms: f64,
    pub course_deg: f64,
    pub kind: AircraftKind,
    pub name: Option<String>,
    pub battery_pct: Option<u8>,
    pub track_online: bool,
    pub last_update: DateTime<Utc>,
    pub last_movement: DateTime<Utc>,
    pub rssi: i16,
    pub snr: i16,
}

impl Pilot {
    pub fn position(&self) -> Position {
        self.position
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundObject {
    pub device_id: DeviceId,
    pub position: Position,
    pub altitude_m: f64,
    pub ground_speed_kmh: f64,
    pub course_deg: f64,
    pub kind: GroundObjectKind,
    pub last_update: DateTime<Utc>,
}

impl GroundObject {
    pub fn position(&self) -> Position {
        self.position
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WeatherMeasurements {
    pub temperature_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub wind_gusts_kmh: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub battery_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherStation {
    pub chip_id: DeviceId,
    pub position: Position,
    pub measurements: WeatherMeasurements,
    pub last_update: DateTime<Utc>,
}

impl WeatherStation {
    pub fn position(&self) -> Position {
        self.position
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thermal {
    /// Derived id: geohash-7 folded with minute-of-day and day-of-epoch.
    pub id: String,
    pub position: Position,
    pub altitude_m: f64,
    pub quality: u8,
    pub avg_climb_ms: f64,
    pub reporter: DeviceId,
    pub created_at: DateTime<Utc>,
}

impl Thermal {
    pub fn position(&self) -> Position {
        self.position
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub climb_ms: f64,
    pub instant: DateTime<Utc>,
}

/// Per-device validator state (§3 ValidationState).
#[derive(Debug, Clone, Serialize)]
pub struct ValidationState {
    pub first_seen: DateTime<Utc>,
    pub last_position: Option<Position>,
    pub last_instant: DateTime<Utc>,
    pub score: u8,
    pub consecutive_invalid: u32,
    pub packet_count: u64,
    pub admitted: bool,
    pub observed_kind: AircraftKind,
}

impl ValidationState {
    pub const MAX_SCORE: u8 = 100;
    pub const INITIAL_SCORE: u8 = 50;

    pub fn new(now: DateTime<Utc>, kind: AircraftKind) -> Self {
        Self {
            first_seen: now,
            last_position: None,
            last_instant: now,
            score: Self::INITIAL_SCORE,
            consecutive_invalid: 0,
            packet_count: 1,
            admitted: false,
            observed_kind: kind,
        }
    }
}

/// Admission decision emitted by the Validator for a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    AdmitNew,
    AdmitContinue,
    RejectKeep,
    RejectEvict,
}

/// A live broadcast subscription (§3 Subscription, §4.H).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub center: Position,
    pub radius_km: f64,
    pub cover: Vec<String>,
    pub last_active: DateTime<Utc>,
}

/// Action carried by a broadcast update (§4.H publish path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateAction {
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LiveObject {
    Pilot(Pilot),
    GroundObject(GroundObject),
    Station(WeatherStation),
    Thermal(Thermal),
}

impl LiveObject {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::Pilot(p) => p.device_id,
            Self::GroundObject(g) => g.device_id,
            Self::Station(s) => s.chip_id,
            Self::Thermal(t) => t.reporter,
        }
    }

    pub fn position(&self) -> Position {
        match self {
            Self::Pilot(p) => p.position(),
            Self::GroundObject(g) => g.position(),
            Self::Station(s) => s.position(),
            Self::Thermal(t) => t.position(),
        }
    }
}

/// A published broadcast update (§4.H step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastUpdate {
    pub object: LiveObject,
    pub action: UpdateAction,
}

/// TTLs in seconds (§3).
pub mod ttl {
    pub const PILOT_SECS: i64 = 43_200;
    pub const GROUND_OBJECT_SECS: i64 = 14_400;
    pub const THERMAL_SECS: i64 = 21_600;
    pub const STATION_SECS: i64 = 86_400;
    pub const SUBSCRIPTION_SECS: i64 = 300;
    pub const AUTH_TOKEN_SECS: i64 = 3600;
}
