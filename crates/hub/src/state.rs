use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::phase::Phase;
use crate::zone::{IrrigationCommand, ZoneStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub last_tick_at: Option<OffsetDateTime>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Ack,
    Phase,
    Degraded,
    Timeout,
    Config,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_tick_at: Option<OffsetDateTime>,
    pub zones: Vec<ZoneStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            last_tick_at: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_command(&mut self, cmd: &IrrigationCommand) {
        self.push_event(
            EventKind::Command,
            Some(&cmd.zone_id),
            format!(
                "#{} {:?} shot in {}: {:.3} L",
                cmd.command_id,
                cmd.trigger,
                cmd.phase,
                cmd.dose.liters()
            ),
        );
    }

    pub fn record_ack(&mut self, zone_id: &str, command_id: u64, success: bool) {
        let result = if success { "executed" } else { "failed" };
        self.push_event(
            EventKind::Ack,
            Some(zone_id),
            format!("#{command_id} {result}"),
        );
    }

    pub fn record_phase(&mut self, zone_id: &str, from: Phase, to: Phase, forced: bool) {
        let how = if forced { " (forced)" } else { "" };
        self.push_event(EventKind::Phase, Some(zone_id), format!("{from} -> {to}{how}"));
    }

    pub fn record_degraded(&mut self, zone_id: &str, degraded: bool) {
        let detail = if degraded {
            "sensor data stale, irrigation suspended"
        } else {
            "sensor data fresh again"
        };
        self.push_event(EventKind::Degraded, Some(zone_id), detail.to_string());
    }

    pub fn record_timeout(&mut self, zone_id: &str, command_id: u64) {
        self.push_event(
            EventKind::Timeout,
            Some(zone_id),
            format!("#{command_id} not acknowledged, giving up"),
        );
    }

    pub fn record_config(&mut self, detail: String) {
        self.push_event(EventKind::Config, None, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, zone_id: Option<&str>, detail: String) {
        self.push_event(EventKind::Error, zone_id, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, zones: Vec<ZoneStatus>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            last_tick_at: self.last_tick_at,
            zones,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, zone_id: Option<&str>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            zone_id: zone_id.map(str::to_string),
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_events() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e25");
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_phase("z1", Phase::P0, Phase::P1, false);
        let status = st.to_status(vec![]);
        assert_eq!(status.events[0].kind, EventKind::Phase);
        assert_eq!(status.events[0].detail, "P0 -> P1");
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn zone_id_attached_and_serialized() {
        let mut st = SystemState::new();
        st.record_ack("z2", 9, false);
        st.record_config("reloaded".into());
        let json = serde_json::to_value(st.to_status(vec![])).unwrap();
        assert_eq!(json["events"][1]["zone_id"], "z2");
        assert_eq!(json["events"][1]["detail"], "#9 failed");
        assert_eq!(json["events"][1]["kind"], "ack");
        assert!(json["events"][0].get("zone_id").is_none());
    }
}
