//! The steering engine: owns every zone record and the active config, and
//! fans a tick out across zones on a bounded worker pool.
//!
//! Each zone sits behind its own async mutex.  A tick takes zone locks with
//! `try_lock_owned`, so a zone still held by a slow evaluation (or an
//! operator command) is skipped rather than evaluated twice.  The zone map
//! and config locks are only held long enough to clone `Arc`s.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::ingest::{IngestError, SensorReading};
use crate::phase::Phase;
use crate::policy::PolicyEntry;
use crate::zone::{
    AckOutcome, Evaluation, IrrigationCommand, ZoneRecord, ZoneSnapshot, ZoneStatus,
};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown zone '{0}'")]
    UnknownZone(String),
    #[error("zone '{zone_id}': cannot force {from} -> {to}: {reason}")]
    IllegalPhase {
        zone_id: String,
        from: Phase,
        to: Phase,
        reason: String,
    },
    #[error("invalid policy: {}", .0.join("; "))]
    InvalidPolicy(Vec<String>),
}

type ZoneHandle = Arc<Mutex<ZoneRecord>>;

pub struct ZoneOutcome {
    pub zone_id: String,
    pub evaluation: Evaluation,
    pub snapshot: ZoneSnapshot,
}

#[derive(Default)]
pub struct TickReport {
    /// Sorted by zone id.
    pub outcomes: Vec<ZoneOutcome>,
    /// Zones still locked from an earlier evaluation or command.
    pub skipped_busy: Vec<String>,
}

impl TickReport {
    pub fn commands(&self) -> impl Iterator<Item = &IrrigationCommand> {
        self.outcomes
            .iter()
            .filter_map(|o| o.evaluation.command.as_ref())
    }
}

/// Zone-set differences after a config reload.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfigChange {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deactivated: Vec<String>,
}

pub struct SteeringEngine {
    config: RwLock<Arc<EngineConfig>>,
    zones: RwLock<HashMap<String, ZoneHandle>>,
    ids: Arc<AtomicU64>,
}

impl SteeringEngine {
    /// `next_command_id` must be above any id already journaled.
    pub fn new(config: EngineConfig, now: OffsetDateTime, next_command_id: u64) -> Self {
        let rate_window = config.settings.rate_window_min;
        let zones = config
            .zones
            .iter()
            .map(|spec| {
                let rec = ZoneRecord::new(spec.clone(), now, rate_window);
                (spec.zone_id.clone(), Arc::new(Mutex::new(rec)))
            })
            .collect();

        Self {
            config: RwLock::new(Arc::new(config)),
            zones: RwLock::new(zones),
            ids: Arc::new(AtomicU64::new(next_command_id)),
        }
    }

    pub async fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&*self.config.read().await)
    }

    async fn handle(&self, zone_id: &str) -> Option<ZoneHandle> {
        self.zones.read().await.get(zone_id).cloned()
    }

    /// Rebuild zone records from persisted snapshots.  Snapshots for zones
    /// no longer configured are ignored.  Returns how many were applied.
    pub async fn restore(&self, snapshots: &[ZoneSnapshot], now: OffsetDateTime) -> usize {
        let cfg = self.config().await;
        let mut restored = 0;
        for snap in snapshots {
            let handle = self.handle(&snap.zone_id).await;
            let (Some(spec), Some(handle)) = (cfg.zone(&snap.zone_id), handle) else {
                debug!(zone = %snap.zone_id, "snapshot for unconfigured zone ignored");
                continue;
            };
            let mut rec = handle.lock().await;
            *rec = ZoneRecord::restore(spec.clone(), snap, now, &cfg.settings);
            restored += 1;
        }
        restored
    }

    // -- Inputs -------------------------------------------------------------

    pub async fn ingest(
        &self,
        reading: SensorReading,
        now: OffsetDateTime,
    ) -> Result<(), IngestError> {
        let Some(handle) = self.handle(&reading.zone_id).await else {
            return Err(IngestError::UnknownZone(reading.zone_id));
        };
        let cfg = self.config().await;
        let mut rec = handle.lock().await;
        rec.ingest(reading, &cfg.settings, now)
    }

    pub async fn acknowledge(
        &self,
        zone_id: &str,
        command_id: u64,
        success: bool,
    ) -> Result<AckOutcome, CommandError> {
        let handle = self
            .handle(zone_id)
            .await
            .ok_or_else(|| CommandError::UnknownZone(zone_id.to_string()))?;
        let mut rec = handle.lock().await;
        Ok(rec.acknowledge(command_id, success))
    }

    // -- Tick ---------------------------------------------------------------

    pub async fn tick(&self, now: OffsetDateTime) -> TickReport {
        let cfg = self.config().await;
        let handles: Vec<(String, ZoneHandle)> = self
            .zones
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        let mut report = TickReport::default();
        let workers = Arc::new(Semaphore::new(cfg.settings.workers.max(1)));
        let mut set = JoinSet::new();

        for (zone_id, handle) in handles {
            let Ok(mut rec) = handle.try_lock_owned() else {
                debug!(zone = %zone_id, "zone busy, skipping this tick");
                report.skipped_busy.push(zone_id);
                continue;
            };
            if !rec.active {
                continue;
            }
            let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                break;
            };
            let cfg = Arc::clone(&cfg);
            let ids = Arc::clone(&self.ids);
            set.spawn(async move {
                let _permit = permit;
                let evaluation = rec.evaluate(&cfg, now, &ids);
                ZoneOutcome {
                    zone_id,
                    evaluation,
                    snapshot: rec.snapshot(now),
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => error!("zone evaluation task failed: {e}"),
            }
        }
        report.outcomes.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        report.skipped_busy.sort();
        report
    }

    // -- Operator commands --------------------------------------------------

    pub async fn force_phase(
        &self,
        zone_id: &str,
        target: Phase,
        now: OffsetDateTime,
    ) -> Result<Option<(Phase, Phase)>, CommandError> {
        let handle = self
            .handle(zone_id)
            .await
            .ok_or_else(|| CommandError::UnknownZone(zone_id.to_string()))?;
        let cfg = self.config().await;
        let mut rec = handle.lock().await;
        rec.force_phase(target, &cfg.settings, now)
    }

    /// Replace one policy cell.  Takes effect from the next tick.
    pub async fn update_policy(&self, entry: &PolicyEntry) -> Result<(), CommandError> {
        let mut guard = self.config.write().await;
        let policies = guard
            .policies
            .with_entry(entry)
            .map_err(CommandError::InvalidPolicy)?;
        let mut next = EngineConfig::clone(&guard);
        next.policies = policies;
        *guard = Arc::new(next);
        info!(
            direction = %entry.direction,
            phase = %entry.phase,
            "policy updated"
        );
        Ok(())
    }

    /// Swap in a reloaded config.  Existing zones keep their runtime state;
    /// zones dropped from the file are deactivated, not forgotten.
    pub async fn apply_config(&self, config: EngineConfig, now: OffsetDateTime) -> ConfigChange {
        let mut change = ConfigChange::default();
        let rate_window = config.settings.rate_window_min;

        {
            let mut zones = self.zones.write().await;
            for spec in &config.zones {
                match zones.get(&spec.zone_id) {
                    Some(handle) => {
                        let mut rec = handle.lock().await;
                        if !rec.active && spec.enabled {
                            rec.activated_at = now;
                        }
                        rec.active = spec.enabled;
                        rec.spec = spec.clone();
                        change.updated.push(spec.zone_id.clone());
                    }
                    None => {
                        let rec = ZoneRecord::new(spec.clone(), now, rate_window);
                        zones.insert(spec.zone_id.clone(), Arc::new(Mutex::new(rec)));
                        change.added.push(spec.zone_id.clone());
                    }
                }
            }
            for (zone_id, handle) in zones.iter() {
                if config.zone(zone_id).is_none() {
                    let mut rec = handle.lock().await;
                    if rec.active {
                        rec.active = false;
                        change.deactivated.push(zone_id.clone());
                    }
                }
            }
        }

        *self.config.write().await = Arc::new(config);
        change.added.sort();
        change.updated.sort();
        change.deactivated.sort();
        change
    }

    // -- Views --------------------------------------------------------------

    pub async fn zone_status(&self, zone_id: &str, now: OffsetDateTime) -> Option<ZoneStatus> {
        let handle = self.handle(zone_id).await?;
        let cfg = self.config().await;
        let rec = handle.lock().await;
        Some(rec.status(&cfg, now))
    }

    pub async fn statuses(&self, now: OffsetDateTime) -> Vec<ZoneStatus> {
        let cfg = self.config().await;
        let handles: Vec<ZoneHandle> = self.zones.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.status(&cfg, now));
        }
        out.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        out
    }

    pub async fn snapshots(&self, now: OffsetDateTime) -> Vec<ZoneSnapshot> {
        let handles: Vec<ZoneHandle> = self.zones.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.snapshot(now));
        }
        out.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::policy::Direction;
    use crate::zone::{ShotTrigger, VetoReason};
    use time::macros::datetime;
    use time::Duration;

    fn at(h: i64, m: i64) -> OffsetDateTime {
        datetime!(2026-03-01 00:00 UTC) + Duration::hours(h) + Duration::minutes(m)
    }

    fn reading(zone: &str, ts: OffsetDateTime, vwc: f32) -> SensorReading {
        SensorReading {
            zone_id: zone.into(),
            ts,
            vwc,
            ec: 2.0,
            valid: true,
        }
    }

    fn engine(now: OffsetDateTime) -> SteeringEngine {
        SteeringEngine::new(sample_config(), now, 1)
    }

    #[tokio::test]
    async fn tick_emits_start_shots_for_every_zone() {
        let eng = engine(at(5, 50));
        let report = eng.tick(at(6, 0)).await;

        assert_eq!(report.outcomes.len(), 2);
        let cmds: Vec<_> = report.commands().collect();
        assert_eq!(cmds.len(), 2);
        assert!(cmds.iter().all(|c| c.trigger == ShotTrigger::Start));

        // Unique, increasing ids.
        let mut ids: Vec<u64> = cmds.iter().map(|c| c.command_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        // z2: 4 L × 70 % × 6 % = 0.168 → 0.17 at 5 mL increments.
        let z2 = cmds.iter().find(|c| c.zone_id == "z2").unwrap();
        assert!((z2.dose.liters() - 0.17).abs() < 1e-4);
    }

    #[tokio::test]
    async fn second_tick_is_vetoed_by_in_flight() {
        let eng = engine(at(5, 50));
        eng.tick(at(6, 0)).await;
        eng.ingest(reading("z1", at(6, 0), 50.0), at(6, 0)).await.unwrap();

        let report = eng.tick(at(6, 1)).await;
        assert_eq!(report.commands().count(), 0);
        let z1 = report.outcomes.iter().find(|o| o.zone_id == "z1").unwrap();
        assert_eq!(
            z1.evaluation.veto,
            Some(VetoReason::InFlight { command_id: 1 })
        );
    }

    #[tokio::test]
    async fn busy_zone_is_skipped() {
        let eng = engine(at(5, 50));
        let held = eng.handle("z1").await.unwrap();
        let _guard = held.lock().await;

        let report = eng.tick(at(6, 0)).await;
        assert_eq!(report.skipped_busy, vec!["z1".to_string()]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].zone_id, "z2");
    }

    #[tokio::test]
    async fn ingest_unknown_zone_rejected() {
        let eng = engine(at(5, 50));
        let err = eng
            .ingest(reading("nope", at(6, 0), 50.0), at(6, 0))
            .await
            .unwrap_err();
        assert_eq!(err, IngestError::UnknownZone("nope".into()));
    }

    #[tokio::test]
    async fn acknowledge_routes_to_zone() {
        let eng = engine(at(5, 50));
        eng.tick(at(6, 0)).await;
        eng.ingest(reading("z1", at(6, 0), 50.0), at(6, 0)).await.unwrap();

        let out = eng.acknowledge("z1", 1, true).await.unwrap();
        assert_eq!(out, AckOutcome::Applied { success: true });
        let st = eng.zone_status("z1", at(6, 1)).await.unwrap();
        assert_eq!(st.peak_vwc, Some(50.0));
        assert_eq!(st.in_flight_command, None);

        assert!(matches!(
            eng.acknowledge("zz", 1, true).await,
            Err(CommandError::UnknownZone(_))
        ));
    }

    #[tokio::test]
    async fn force_phase_validates() {
        let eng = engine(at(7, 0));
        assert_eq!(
            eng.force_phase("z1", Phase::P2, at(7, 0)).await.unwrap(),
            Some((Phase::P0, Phase::P2))
        );
        assert!(matches!(
            eng.force_phase("z1", Phase::P1, at(7, 0)).await,
            Err(CommandError::IllegalPhase { .. })
        ));
        assert!(matches!(
            eng.force_phase("zz", Phase::P1, at(7, 0)).await,
            Err(CommandError::UnknownZone(_))
        ));
    }

    #[tokio::test]
    async fn update_policy_swaps_config() {
        let eng = engine(at(5, 50));
        let mut entry = eng
            .config()
            .await
            .policies
            .entries()
            .into_iter()
            .find(|e| e.direction == Direction::Vegetative && e.phase == Phase::P2)
            .unwrap();
        entry.min_interval_min = 45;
        eng.update_policy(&entry).await.unwrap();
        assert_eq!(
            eng.config()
                .await
                .policies
                .get(Direction::Vegetative, Phase::P2)
                .min_interval_min,
            45
        );

        entry.shot_size_pct = 150.0;
        assert!(matches!(
            eng.update_policy(&entry).await,
            Err(CommandError::InvalidPolicy(_))
        ));
        // Rejected update leaves the table as it was.
        assert_eq!(
            eng.config()
                .await
                .policies
                .get(Direction::Vegetative, Phase::P2)
                .shot_size_pct,
            5.0
        );
    }

    #[tokio::test]
    async fn reload_deactivates_removed_zone_but_keeps_record() {
        let eng = engine(at(5, 50));
        let mut next = sample_config();
        next.zones.retain(|z| z.zone_id == "z1");

        let change = eng.apply_config(next, at(5, 55)).await;
        assert_eq!(change.deactivated, vec!["z2".to_string()]);
        assert_eq!(change.updated, vec!["z1".to_string()]);
        assert!(change.added.is_empty());

        let report = eng.tick(at(6, 0)).await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].zone_id, "z1");

        let z2 = eng.zone_status("z2", at(6, 0)).await.unwrap();
        assert!(!z2.active);
    }

    #[tokio::test]
    async fn reload_adds_new_zone() {
        let mut first = sample_config();
        first.zones.retain(|z| z.zone_id == "z1");
        let eng = SteeringEngine::new(first, at(5, 0), 1);

        let change = eng.apply_config(sample_config(), at(5, 50)).await;
        assert_eq!(change.added, vec!["z2".to_string()]);
        assert_eq!(eng.statuses(at(5, 50)).await.len(), 2);
    }

    #[tokio::test]
    async fn disabled_zone_is_not_ticked() {
        let mut cfg = sample_config();
        cfg.zones[1].enabled = false;
        let eng = SteeringEngine::new(cfg, at(5, 50), 1);
        let report = eng.tick(at(6, 0)).await;
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn restore_from_snapshots() {
        let eng = engine(at(5, 50));
        eng.tick(at(6, 0)).await;
        let snaps = eng.snapshots(at(6, 0)).await;
        assert_eq!(snaps.len(), 2);

        let fresh = SteeringEngine::new(sample_config(), at(6, 5), 10);
        assert_eq!(fresh.restore(&snaps, at(6, 5)).await, 2);
        let st = fresh.zone_status("z1", at(6, 5)).await.unwrap();
        assert_eq!(st.phase, Phase::P1);
        assert_eq!(st.shots_by_phase, [0, 1, 0, 0]);
        assert_eq!(st.last_irrigation_at, Some(at(6, 0)));
    }

    #[tokio::test]
    async fn restore_of_previous_day_starts_new_photoperiod() {
        let eng = engine(at(5, 50));
        eng.tick(at(6, 0)).await;
        let snaps = eng.snapshots(at(6, 0)).await;

        // Hub comes back the next morning after lights-on.
        let next_day = at(6, 30) + Duration::days(1);
        let fresh = SteeringEngine::new(sample_config(), next_day, 10);
        assert_eq!(fresh.restore(&snaps, next_day).await, 2);
        let st = fresh.zone_status("z1", next_day).await.unwrap();
        assert_eq!(st.phase, Phase::P0);
        assert_eq!(st.shots_by_phase, [0, 0, 0, 0]);

        let report = fresh.tick(next_day).await;
        assert_eq!(report.commands().count(), 2);
        let st = fresh.zone_status("z1", next_day).await.unwrap();
        assert_eq!(st.phase, Phase::P1);
        assert_eq!(st.shots_by_phase, [0, 1, 0, 0]);
    }
}
