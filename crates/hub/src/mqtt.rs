use serde::Deserialize;
use time::OffsetDateTime;

use crate::ingest::SensorReading;
use crate::zone::IrrigationCommand;

pub(crate) const SUBSTRATE_FILTER: &str = "tele/+/substrate";
pub(crate) const ACK_FILTER: &str = "irrigation/+/ack";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Payload of `tele/<zone_id>/substrate`.
#[derive(Debug, Deserialize)]
pub(crate) struct SubstrateMsg {
    /// Unix seconds.
    pub(crate) ts: i64,
    pub(crate) vwc: f32,
    pub(crate) ec: f32,
    #[serde(default = "default_true")]
    pub(crate) valid: bool,
}

impl SubstrateMsg {
    pub(crate) fn into_reading(self, zone_id: &str) -> Result<SensorReading, String> {
        let ts = OffsetDateTime::from_unix_timestamp(self.ts)
            .map_err(|e| format!("bad timestamp {}: {e}", self.ts))?;
        Ok(SensorReading {
            zone_id: zone_id.to_string(),
            ts,
            vwc: self.vwc,
            ec: self.ec,
            valid: self.valid,
        })
    }
}

/// Payload of `irrigation/<zone_id>/ack`.
#[derive(Debug, Deserialize)]
pub(crate) struct AckMsg {
    pub(crate) command_id: u64,
    pub(crate) success: bool,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Middle segment of a three-segment `<prefix>/<id>/<suffix>` topic.
fn middle_segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract zone_id from "tele/<zone_id>/substrate".
pub(crate) fn extract_substrate_zone(topic: &str) -> Option<&str> {
    middle_segment(topic, "tele", "substrate")
}

/// Extract zone_id from "irrigation/<zone_id>/ack".
pub(crate) fn extract_ack_zone(topic: &str) -> Option<&str> {
    middle_segment(topic, "irrigation", "ack")
}

pub(crate) fn command_topic(zone_id: &str) -> String {
    format!("irrigation/{zone_id}/cmd")
}

pub(crate) fn encode_command(cmd: &IrrigationCommand) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(cmd)
}

// ===========================================================================
// Tests
// ===========================================================================
