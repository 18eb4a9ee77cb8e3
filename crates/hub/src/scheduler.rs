//! Irrigation scheduler: drives the steering engine on a fixed tick and
//! turns its results into MQTT commands, journal rows and operator events.
//!
//! The engine decides; this module only carries the decisions out.
//! Commands are fire-and-forget: they are journaled, published to
//! `irrigation/<zone_id>/cmd`, and resolved later by an ack on
//! `irrigation/<zone_id>/ack` or by the engine's ack timeout.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::{CommandStatus, Db};
use crate::engine::{SteeringEngine, TickReport, ZoneOutcome};
use crate::ingest::IngestError;
use crate::mqtt::{command_topic, encode_command, AckMsg, SubstrateMsg};
use crate::state::SharedState;
use crate::zone::{AckOutcome, IrrigationCommand};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop.  Intended to be `tokio::spawn`-ed from main.
/// The tick interval is read once; a config reload does not change it.
pub async fn run(engine: Arc<SteeringEngine>, db: Db, mqtt: AsyncClient, shared: SharedState) {
    let settings = engine.config().await.settings.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.tick_interval_sec));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        tick_sec = settings.tick_interval_sec,
        workers = settings.workers,
        "scheduler started"
    );
    {
        let mut st = shared.write().await;
        st.record_system(format!(
            "scheduler started (tick {}s, {} workers)",
            settings.tick_interval_sec, settings.workers
        ));
    }

    loop {
        ticker.tick().await;
        run_tick(&engine, &db, &mqtt, &shared, OffsetDateTime::now_utc()).await;
    }
}

/// Resolve journal rows left pending by a previous run as timed out.  The
/// in-flight slot does not survive a restart, so their acks would only be
/// reported as unmatched.
pub(crate) async fn expire_pending(db: &Db, shared: &SharedState, now: OffsetDateTime) -> usize {
    let expired = match db.expire_pending(now).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("db: {e:#}");
            return 0;
        }
    };
    if expired.is_empty() {
        return 0;
    }
    let mut st = shared.write().await;
    for (command_id, zone_id) in &expired {
        warn!(zone = %zone_id, command_id, "command pending across restart, marked timeout");
        st.record_timeout(zone_id, *command_id);
    }
    expired.len()
}

/// One tick: evaluate every zone, then act on each outcome.
pub(crate) async fn run_tick(
    engine: &SteeringEngine,
    db: &Db,
    mqtt: &AsyncClient,
    shared: &SharedState,
    now: OffsetDateTime,
) -> TickReport {
    let report = engine.tick(now).await;

    for outcome in &report.outcomes {
        handle_outcome(outcome, db, mqtt, shared, now).await;
    }

    {
        let mut st = shared.write().await;
        st.last_tick_at = Some(now);
    }
    if !report.skipped_busy.is_empty() {
        debug!(zones = ?report.skipped_busy, "zones skipped (still busy)");
    }
    report
}

async fn handle_outcome(
    outcome: &ZoneOutcome,
    db: &Db,
    mqtt: &AsyncClient,
    shared: &SharedState,
    now: OffsetDateTime,
) {
    let zone_id = outcome.zone_id.as_str();
    let ev = &outcome.evaluation;

    // ── Ack timeout ─────────────────────────────────────────────
    if let Some(command_id) = ev.ack_timeout {
        warn!(zone = %zone_id, command_id, "actuator did not acknowledge, not retrying");
        if let Err(e) = db.resolve_command(command_id, CommandStatus::Timeout, now).await {
            error!(zone = %zone_id, "db: {e:#}");
        }
        shared.write().await.record_timeout(zone_id, command_id);
    }

    // ── Degraded edge ───────────────────────────────────────────
    if let Some(degraded) = ev.degraded_changed {
        if degraded {
            warn!(zone = %zone_id, "sensor data stale, zone degraded");
        } else {
            info!(zone = %zone_id, "sensor data fresh, zone recovered");
        }
        shared.write().await.record_degraded(zone_id, degraded);
    }

    // ── Phase transitions ───────────────────────────────────────
    if !ev.transitions.is_empty() {
        let mut st = shared.write().await;
        for &(from, to) in &ev.transitions {
            info!(zone = %zone_id, %from, %to, "phase transition");
            st.record_phase(zone_id, from, to, false);
        }
    }

    // ── Sizing failure ──────────────────────────────────────────
    if let Some(e) = &ev.sizing_error {
        error!(zone = %zone_id, "shot sizing failed: {e}");
        shared
            .write()
            .await
            .record_error(Some(zone_id), format!("shot sizing failed: {e}"));
    }

    // ── Command ─────────────────────────────────────────────────
    if let Some(cmd) = &ev.command {
        dispatch(cmd, db, mqtt, shared).await;
    }

    if let Err(e) = db.save_zone_state(&outcome.snapshot).await {
        error!(zone = %zone_id, "db: {e:#}");
    }
}

async fn dispatch(cmd: &IrrigationCommand, db: &Db, mqtt: &AsyncClient, shared: &SharedState) {
    info!(
        zone = %cmd.zone_id,
        command_id = cmd.command_id,
        phase = %cmd.phase,
        trigger = cmd.trigger.as_str(),
        liters = format!("{:.3}", cmd.dose.liters()),
        "irrigation command"
    );

    if let Err(e) = db.insert_command(cmd).await {
        error!(zone = %cmd.zone_id, "db: {e:#}");
    }

    let payload = match encode_command(cmd) {
        Ok(p) => p,
        Err(e) => {
            error!(zone = %cmd.zone_id, "failed to encode command: {e}");
            shared
                .write()
                .await
                .record_error(Some(&cmd.zone_id), format!("encode failed: {e}"));
            return;
        }
    };

    if let Err(e) = mqtt
        .publish(command_topic(&cmd.zone_id), QoS::AtLeastOnce, false, payload)
        .await
    {
        // The ack timeout clears the in-flight slot; no retry.
        error!(zone = %cmd.zone_id, "failed to publish command: {e}");
        shared
            .write()
            .await
            .record_error(Some(&cmd.zone_id), format!("publish failed: {e}"));
        return;
    }

    shared.write().await.record_command(cmd);
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// `tele/<zone_id>/substrate`
pub(crate) async fn handle_substrate(
    engine: &SteeringEngine,
    shared: &SharedState,
    zone_id: &str,
    payload: &[u8],
    now: OffsetDateTime,
) {
    let reading = match serde_json::from_slice::<SubstrateMsg>(payload)
        .map_err(|e| e.to_string())
        .and_then(|m| m.into_reading(zone_id))
    {
        Ok(r) => r,
        Err(e) => {
            warn!(zone = %zone_id, "bad substrate payload: {e}");
            shared
                .write()
                .await
                .record_error(Some(zone_id), format!("bad substrate payload: {e}"));
            return;
        }
    };

    match engine.ingest(reading, now).await {
        Ok(()) => {}
        Err(IngestError::OutOfOrder) => {
            debug!(zone = %zone_id, "out-of-order reading ignored");
        }
        Err(e) if e.is_sensor_fault() => {
            warn!(zone = %zone_id, "reading discarded: {e}");
        }
        Err(e) => {
            warn!(zone = %zone_id, "reading rejected: {e}");
        }
    }
}

/// `irrigation/<zone_id>/ack`
pub(crate) async fn handle_ack(
    engine: &SteeringEngine,
    db: &Db,
    shared: &SharedState,
    zone_id: &str,
    payload: &[u8],
    now: OffsetDateTime,
) {
    let msg = match serde_json::from_slice::<AckMsg>(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(zone = %zone_id, "bad ack payload: {e}");
            shared
                .write()
                .await
                .record_error(Some(zone_id), format!("bad ack payload: {e}"));
            return;
        }
    };

    match engine.acknowledge(zone_id, msg.command_id, msg.success).await {
        Ok(AckOutcome::Applied { success }) => {
            info!(zone = %zone_id, command_id = msg.command_id, success, "command acknowledged");
            let status = if success {
                CommandStatus::Executed
            } else {
                CommandStatus::Failed
            };
            if let Err(e) = db.resolve_command(msg.command_id, status, now).await {
                error!(zone = %zone_id, "db: {e:#}");
            }
            shared
                .write()
                .await
                .record_ack(zone_id, msg.command_id, success);
        }
        Ok(AckOutcome::Unmatched) => {
            warn!(zone = %zone_id, command_id = msg.command_id, "late or unknown ack ignored");
        }
        Err(e) => {
            warn!(zone = %zone_id, "ack rejected: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
