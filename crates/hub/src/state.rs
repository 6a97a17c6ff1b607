use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{Reading, UnitId, UnitStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

pub fn new_shared() -> SharedState {
    Arc::new(RwLock::new(HubState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral hub activity for the status endpoint. Not authoritative for
/// anything; unit state lives in the snapshot cache.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Presence,
    Unit,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub units: usize,
    pub live_clients: usize,
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            readings_accepted: 0,
            readings_rejected: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record an accepted telemetry reading.
    pub fn record_reading(&mut self, reading: &Reading) {
        self.readings_accepted += 1;
        self.push_event(
            EventKind::Reading,
            format!(
                "unit {}: level={:.1}% temp={:.1} vib={} switches={}",
                reading.unit_id,
                reading.water_level,
                reading.temperature,
                reading.vibration_detected,
                reading
                    .float_switches
                    .iter()
                    .map(|on| if *on { '1' } else { '0' })
                    .collect::<String>()
            ),
        );
    }

    /// Record a rejected submission. `detail` must not contain the credential.
    pub fn record_rejected(&mut self, detail: String) {
        self.readings_rejected += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// Record a presence transition.
    pub fn record_presence(&mut self, unit_id: UnitId, status: UnitStatus) {
        self.push_event(EventKind::Presence, format!("unit {unit_id} {status}"));
    }

    /// Record a provisioning change.
    pub fn record_unit(&mut self, detail: String) {
        self.push_event(EventKind::Unit, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, units: usize, live_clients: usize) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            units,
            live_clients,
            readings_accepted: self.readings_accepted,
            readings_rejected: self.readings_rejected,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}
