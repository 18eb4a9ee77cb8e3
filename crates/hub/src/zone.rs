//! Per-zone engine record and the single-zone evaluation that runs on every
//! tick: staleness check → phase advance → trigger → guard rails → size.
//!
//! Everything here is synchronous and deterministic in `now`; the engine
//! owns locking and fan-out.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::clock::{DayPlan, TimeOfDay};
use crate::config::{EngineConfig, EngineSettings, Substrate, ZoneSpec};
use crate::dryback::DrybackTracker;
use crate::engine::CommandError;
use crate::ingest::{IngestError, IngestState, SensorReading};
use crate::phase::{advance, Phase, PhaseInputs};
use crate::policy::{Direction, SteeringPolicy};
use crate::sizer::{shot_volume_l, size_shot, Dose, SizingError};

// ---------------------------------------------------------------------------
// Commands and evaluation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotTrigger {
    /// First shot of the photoperiod (P0 → P1).
    Start,
    /// P1 shot while below field capacity.
    Ramp,
    /// P2/P3 shot once the dryback target is reached.
    Dryback,
}

impl ShotTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ShotTrigger::Start => "start",
            ShotTrigger::Ramp => "ramp",
            ShotTrigger::Dryback => "dryback",
        }
    }
}

/// Published to the actuator; never mutated after emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationCommand {
    pub command_id: u64,
    pub zone_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub dose: Dose,
    pub phase: Phase,
    pub trigger: ShotTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VetoReason {
    Degraded,
    InFlight { command_id: u64 },
    MinInterval { remaining_min: i64 },
    MaxShots { max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub command_id: u64,
    pub issued_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied { success: bool },
    /// Late (already timed out) or unknown id.
    Unmatched,
}

/// What one evaluation did to a zone.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub transitions: Vec<(Phase, Phase)>,
    pub command: Option<IrrigationCommand>,
    pub veto: Option<VetoReason>,
    /// New degraded flag, only when it changed this tick.
    pub degraded_changed: Option<bool>,
    /// Command id given up on after the ack timeout.
    pub ack_timeout: Option<u64>,
    pub sizing_error: Option<SizingError>,
}

// ---------------------------------------------------------------------------
// Persisted snapshot
// ---------------------------------------------------------------------------

/// The part of a zone record that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone_id: String,
    pub phase: Phase,
    pub peak_vwc: Option<f32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_irrigation_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub p1_entered_at: Option<OffsetDateTime>,
    pub shots: [u32; 4],
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Status (operator surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub zone_id: String,
    pub name: String,
    pub substrate: Substrate,
    pub direction: Direction,
    pub active: bool,
    pub phase: Phase,
    pub lights_on: bool,
    pub day_plan: DayPlan,
    pub degraded: bool,
    pub sensor_ok: bool,
    pub vwc: Option<f32>,
    pub ec: Option<f32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_at: Option<OffsetDateTime>,
    pub rejected_readings: u64,
    pub peak_vwc: Option<f32>,
    pub dryback_pct: f32,
    pub drying_rate_pct_per_hour: Option<f32>,
    pub next_dryback_shot_in_min: Option<u32>,
    pub policy: SteeringPolicy,
    pub shots_today: u32,
    pub shots_by_phase: [u32; 4],
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_irrigation_at: Option<OffsetDateTime>,
    pub in_flight_command: Option<u64>,
}

// ---------------------------------------------------------------------------
// Zone record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ZoneRecord {
    pub spec: ZoneSpec,
    pub phase: Phase,
    pub ingest: IngestState,
    pub tracker: DrybackTracker,
    /// Staleness reference until the first good reading arrives.
    pub activated_at: OffsetDateTime,
    pub p1_entered_at: Option<OffsetDateTime>,
    pub last_irrigation_at: Option<OffsetDateTime>,
    /// Shots fired this photoperiod, indexed by phase.
    pub shots: [u32; 4],
    pub in_flight: Option<InFlight>,
    pub degraded: bool,
    pub active: bool,
    pub last_evaluated_at: Option<OffsetDateTime>,
}

impl ZoneRecord {
    pub fn new(spec: ZoneSpec, now: OffsetDateTime, rate_window_min: u32) -> Self {
        Self {
            active: spec.enabled,
            spec,
            phase: Phase::P0,
            ingest: IngestState::default(),
            tracker: DrybackTracker::new(rate_window_min),
            activated_at: now,
            p1_entered_at: None,
            last_irrigation_at: None,
            shots: [0; 4],
            in_flight: None,
            degraded: false,
            last_evaluated_at: None,
        }
    }

    /// Rebuild from a persisted snapshot.  Phase and shot counters are only
    /// carried over when lights are on and the snapshot was taken during
    /// the current photoperiod; otherwise the zone restarts in P0 and the
    /// next lights-on takes the normal P0 -> P1 edge.
    pub fn restore(
        spec: ZoneSpec,
        snap: &ZoneSnapshot,
        now: OffsetDateTime,
        settings: &EngineSettings,
    ) -> Self {
        let rate_window_min = settings.rate_window_min;
        let offset = settings.utc_offset();
        let lit = spec.schedule.facts(TimeOfDay::at(now, offset)).lights_on;
        let day_start = spec.schedule.last_lights_on(now, offset);
        let mut rec = Self {
            tracker: DrybackTracker::with_peak(rate_window_min, snap.peak_vwc),
            last_irrigation_at: snap.last_irrigation_at,
            ..Self::new(spec, now, rate_window_min)
        };
        if !lit || snap.updated_at < day_start {
            info!(
                zone = %snap.zone_id,
                phase = %snap.phase,
                "snapshot outside current photoperiod, starting from P0"
            );
        } else {
            rec.phase = snap.phase;
            rec.p1_entered_at = snap.p1_entered_at;
            rec.shots = snap.shots;
        }
        rec
    }

    pub fn zone_id(&self) -> &str {
        &self.spec.zone_id
    }

    pub fn snapshot(&self, now: OffsetDateTime) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: self.spec.zone_id.clone(),
            phase: self.phase,
            peak_vwc: self.tracker.peak(),
            last_irrigation_at: self.last_irrigation_at,
            p1_entered_at: self.p1_entered_at,
            shots: self.shots,
            updated_at: now,
        }
    }

    // -- Inputs -------------------------------------------------------------

    pub fn ingest(
        &mut self,
        reading: SensorReading,
        settings: &EngineSettings,
        now: OffsetDateTime,
    ) -> Result<(), IngestError> {
        let (ts, vwc) = (reading.ts, reading.vwc);
        self.ingest.accept(
            reading,
            now,
            settings.max_clock_skew(),
            self.spec.field_capacity_pct,
            settings.vwc_noise_tolerance_pct,
        )?;
        self.tracker
            .observe(ts, vwc, self.spec.field_capacity_pct, settings.fc_tolerance_pct);
        Ok(())
    }

    pub fn acknowledge(&mut self, command_id: u64, success: bool) -> AckOutcome {
        match self.in_flight {
            Some(f) if f.command_id == command_id => {
                self.in_flight = None;
                if success {
                    self.tracker.reset_peak();
                }
                AckOutcome::Applied { success }
            }
            _ => AckOutcome::Unmatched,
        }
    }

    /// Operator override.  Returns the edge taken, or `None` if already there.
    pub fn force_phase(
        &mut self,
        target: Phase,
        settings: &EngineSettings,
        now: OffsetDateTime,
    ) -> Result<Option<(Phase, Phase)>, CommandError> {
        let from = self.phase;
        if target == from {
            return Ok(None);
        }
        let facts = self
            .spec
            .schedule
            .facts(TimeOfDay::at(now, settings.utc_offset()));

        let illegal = |reason: &str| CommandError::IllegalPhase {
            zone_id: self.spec.zone_id.clone(),
            from,
            to: target,
            reason: reason.to_string(),
        };

        if !facts.lights_on && target != Phase::P0 {
            return Err(illegal("lights are off, only P0 is allowed"));
        }
        if facts.lights_on && target == Phase::P0 {
            return Err(illegal("lights are on"));
        }
        if facts.lights_on && target < from {
            return Err(illegal("cannot move backwards within a photoperiod"));
        }

        if from == Phase::P0 {
            self.shots = [0; 4];
        }
        if target == Phase::P1 {
            self.p1_entered_at = Some(now);
        }
        self.phase = target;
        Ok(Some((from, target)))
    }

    // -- Derived facts ------------------------------------------------------

    fn is_stale(&self, settings: &EngineSettings, now: OffsetDateTime) -> bool {
        let reference = self
            .ingest
            .last_good()
            .map(|r| r.ts)
            .unwrap_or(self.activated_at);
        now - reference > Duration::minutes(settings.staleness_window_min as i64)
    }

    fn sensor_ok(&self, settings: &EngineSettings, now: OffsetDateTime) -> bool {
        self.ingest.last_good().is_some()
            && !self.ingest.last_sample_invalid()
            && !self.is_stale(settings, now)
    }

    fn policy(&self, cfg: &EngineConfig) -> SteeringPolicy {
        cfg.policies.get(self.spec.direction, self.phase)
    }

    // -- Tick ---------------------------------------------------------------

    pub fn evaluate(
        &mut self,
        cfg: &EngineConfig,
        now: OffsetDateTime,
        ids: &AtomicU64,
    ) -> Evaluation {
        let settings = &cfg.settings;
        let mut out = Evaluation::default();
        self.last_evaluated_at = Some(now);

        if let Some(f) = self.in_flight {
            if now - f.issued_at >= Duration::seconds(settings.ack_timeout_sec as i64) {
                self.in_flight = None;
                out.ack_timeout = Some(f.command_id);
            }
        }

        let stale = self.is_stale(settings, now);
        if stale != self.degraded {
            self.degraded = stale;
            out.degraded_changed = Some(stale);
        }
        let sensor_ok = self.sensor_ok(settings, now);
        let vwc = self.ingest.last_good().map(|r| r.vwc);

        // ── Phase ───────────────────────────────────────────────────
        let inputs = PhaseInputs {
            clock: self
                .spec
                .schedule
                .facts(TimeOfDay::at(now, settings.utc_offset())),
            sensor_ok,
            primed: self.tracker.is_primed(),
            vwc,
            field_capacity_pct: self.spec.field_capacity_pct,
            fc_tolerance_pct: settings.fc_tolerance_pct,
            p1_shots: self.shots[Phase::P1.index()],
            p1_min_shots: settings.p1_min_shots,
            minutes_in_p1: self
                .p1_entered_at
                .map(|t| (now - t).whole_minutes().max(0) as u32)
                .unwrap_or(0),
            p1_ceiling_min: settings.p1_time_ceiling_min,
            p3_lead_min: settings.p3_lead_min,
        };
        let (next, edges) = advance(self.phase, &inputs);
        let started = edges.contains(&(Phase::P0, Phase::P1));
        if started {
            self.shots = [0; 4];
            self.p1_entered_at = Some(now);
        }
        self.phase = next;
        out.transitions = edges;

        // ── Trigger ─────────────────────────────────────────────────
        let policy = self.policy(cfg);
        let trigger = match self.phase {
            Phase::P0 => None,
            Phase::P1 if started => Some(ShotTrigger::Start),
            Phase::P1 => {
                let below_fc = vwc.is_some_and(|v| {
                    v < self.spec.field_capacity_pct - settings.fc_tolerance_pct
                });
                (sensor_ok && below_fc).then_some(ShotTrigger::Ramp)
            }
            Phase::P2 | Phase::P3 => {
                let due = sensor_ok
                    && self.tracker.is_primed()
                    && policy.max_shots_per_day > 0
                    && self.tracker.dryback_pct() >= policy.target_dryback_pct;
                due.then_some(ShotTrigger::Dryback)
            }
        };
        let Some(trigger) = trigger else {
            return out;
        };

        // ── Guard rails ─────────────────────────────────────────────
        if let Some(veto) = self.veto(&policy, now) {
            debug!(
                zone = %self.spec.zone_id,
                phase = %self.phase,
                ?trigger,
                ?veto,
                "shot vetoed"
            );
            out.veto = Some(veto);
            return out;
        }

        // ── Size + emit ─────────────────────────────────────────────
        let raw = shot_volume_l(
            self.spec.pot_volume_l,
            self.spec.field_capacity_pct,
            policy.shot_size_pct,
        );
        let dose = match size_shot(raw, &cfg.sizer) {
            Ok(d) => d,
            Err(e) => {
                out.sizing_error = Some(e);
                return out;
            }
        };

        let command_id = ids.fetch_add(1, Ordering::SeqCst);
        self.last_irrigation_at = Some(now);
        self.shots[self.phase.index()] += 1;
        self.in_flight = Some(InFlight {
            command_id,
            issued_at: now,
        });
        out.command = Some(IrrigationCommand {
            command_id,
            zone_id: self.spec.zone_id.clone(),
            issued_at: now,
            dose,
            phase: self.phase,
            trigger,
        });
        out
    }

    fn veto(&self, policy: &SteeringPolicy, now: OffsetDateTime) -> Option<VetoReason> {
        if self.degraded {
            return Some(VetoReason::Degraded);
        }
        if let Some(f) = self.in_flight {
            return Some(VetoReason::InFlight {
                command_id: f.command_id,
            });
        }
        if let Some(last) = self.last_irrigation_at {
            let interval = Duration::minutes(policy.min_interval_min as i64);
            let since = now - last;
            if since < interval {
                return Some(VetoReason::MinInterval {
                    remaining_min: (interval - since).whole_minutes().max(1),
                });
            }
        }
        let fired = self.shots[self.phase.index()];
        if fired >= policy.max_shots_per_day {
            return Some(VetoReason::MaxShots {
                max: policy.max_shots_per_day,
            });
        }
        None
    }

    // -- Status -------------------------------------------------------------

    pub fn status(&self, cfg: &EngineConfig, now: OffsetDateTime) -> ZoneStatus {
        let settings = &cfg.settings;
        let facts = self
            .spec
            .schedule
            .facts(TimeOfDay::at(now, settings.utc_offset()));
        let policy = self.policy(cfg);
        let last = self.ingest.last_good();

        let next_dryback_shot_in_min = match self.phase {
            Phase::P2 | Phase::P3 if policy.max_shots_per_day > 0 => {
                self.tracker.minutes_until_dryback(policy.target_dryback_pct)
            }
            _ => None,
        };

        ZoneStatus {
            zone_id: self.spec.zone_id.clone(),
            name: self.spec.name.clone(),
            substrate: self.spec.substrate,
            direction: self.spec.direction,
            active: self.active,
            phase: self.phase,
            lights_on: facts.lights_on,
            day_plan: self.spec.schedule.day_plan(settings.p3_lead_min),
            degraded: self.degraded,
            sensor_ok: self.sensor_ok(settings, now),
            vwc: last.map(|r| r.vwc),
            ec: last.map(|r| r.ec),
            last_reading_at: last.map(|r| r.ts),
            rejected_readings: self.ingest.rejected(),
            peak_vwc: self.tracker.peak(),
            dryback_pct: self.tracker.dryback_pct(),
            drying_rate_pct_per_hour: self.tracker.drying_rate_per_hour(),
            next_dryback_shot_in_min,
            policy,
            shots_today: self.shots.iter().sum(),
            shots_by_phase: self.shots,
            last_irrigation_at: self.last_irrigation_at,
            in_flight_command: self.in_flight.map(|f| f.command_id),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
