//! Domain types shared by the store, the snapshot cache and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

pub type UnitId = i64;

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitType {
    #[serde(alias = "CAIXA", alias = "tank")]
    Tank,
    #[serde(alias = "CISTERNA", alias = "cistern")]
    Cistern,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tank => "TANK",
            Self::Cistern => "CISTERN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TANK" | "CAIXA" => Some(Self::Tank),
            "CISTERN" | "CISTERNA" => Some(Self::Cistern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitStatus {
    Online,
    Offline,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("ONLINE") {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert thresholds applied to a reading. Per-unit values override the
/// system-wide ones from `[thresholds]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub low_level: f64,
    pub high_temp: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_level: 20.0,
            high_temp: 75.0,
        }
    }
}

/// A provisioned site. The api key is kept out of every serialized form.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub location: String,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    pub number_of_sensors: usize,
    #[serde(skip)]
    pub api_key: String,
    pub low_level_threshold: Option<f64>,
    pub high_temp_threshold: Option<f64>,
}

impl Unit {
    pub fn thresholds(&self, system: &Thresholds) -> Thresholds {
        Thresholds {
            low_level: self.low_level_threshold.unwrap_or(system.low_level),
            high_temp: self.high_temp_threshold.unwrap_or(system.high_temp),
        }
    }

    pub fn topic(&self) -> String {
        unit_topic(self.id)
    }
}

/// Upper bound on float switches per unit.
pub const MAX_SENSORS: usize = 16;

fn default_sensor_count() -> i64 {
    4
}

/// Provisioning request, as posted by the management UI or read from the
/// `[[units]]` seed table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUnit {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "type")]
    pub unit_type: String,
    #[serde(default = "default_sensor_count")]
    pub number_of_sensors: i64,
    #[serde(default)]
    pub low_level_threshold: Option<f64>,
    #[serde(default)]
    pub high_temp_threshold: Option<f64>,
}

/// Broadcast topic carrying readings and presence changes for one unit.
pub fn unit_topic(id: UnitId) -> String {
    format!("unit-{id}")
}

/// Broadcast topic carrying provisioning events.
pub const UNITS_TOPIC: &str = "units";

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub unit_id: UnitId,
    pub water_level: f64,
    pub temperature: f64,
    #[serde(rename = "isVibrating")]
    pub vibration_detected: bool,
    pub vibration_count: u64,
    pub float_switches: Vec<bool>,
    pub is_low_level: bool,
    pub is_high_temp: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// What the current-state query returns for a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub status: UnitStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    pub water_level: f64,
    pub temperature: f64,
    pub is_vibrating: bool,
    pub is_low_level: bool,
    pub is_high_temp: bool,
    pub vibration_count: u64,
    pub float_switches: Vec<bool>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

impl CurrentState {
    pub fn new(
        status: UnitStatus,
        last_seen_at: Option<OffsetDateTime>,
        latest: Option<&Reading>,
    ) -> Self {
        match latest {
            Some(r) => Self {
                status,
                last_seen_at,
                water_level: r.water_level,
                temperature: r.temperature,
                is_vibrating: r.vibration_detected,
                is_low_level: r.is_low_level,
                is_high_temp: r.is_high_temp,
                vibration_count: r.vibration_count,
                float_switches: r.float_switches.clone(),
                timestamp: Some(r.timestamp),
            },
            None => Self {
                status,
                last_seen_at,
                water_level: 0.0,
                temperature: 0.0,
                is_vibrating: false,
                is_low_level: false,
                is_high_temp: false,
                vibration_count: 0,
                float_switches: Vec::new(),
                timestamp: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers (the store keeps unix milliseconds)
// ---------------------------------------------------------------------------

pub fn to_unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Current time truncated to millisecond precision, so values survive a
/// round-trip through the store unchanged.
pub fn now_ms_precision() -> OffsetDateTime {
    from_unix_ms(to_unix_ms(OffsetDateTime::now_utc()))
}

// ===========================================================================
// Tests
// ===========================================================================
