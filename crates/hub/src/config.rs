//! TOML config file loading and validation: engine tuning, sizer settings,
//! light schedules, zones and steering policies.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use time::UtcOffset;

use crate::clock::{LightSchedule, TimeOfDay};
use crate::policy::{Direction, PolicyEntry, PolicyTable};
use crate::sizer::SizerSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub sizer: SizerSettings,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
}

/// `[engine]` table.  Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub tick_interval_sec: u64,
    /// Site offset from UTC, used to turn the wall clock into time of day.
    pub utc_offset_minutes: i32,
    pub staleness_window_min: u32,
    pub p1_time_ceiling_min: u32,
    pub p1_min_shots: u32,
    pub p3_lead_min: u16,
    pub fc_tolerance_pct: f32,
    pub vwc_noise_tolerance_pct: f32,
    pub ack_timeout_sec: u64,
    pub workers: usize,
    /// Window for the drying-rate estimate.
    pub rate_window_min: u32,
    /// How far ahead of the hub clock a sensor timestamp may be.
    pub max_clock_skew_sec: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_sec: 60,
            utc_offset_minutes: 0,
            staleness_window_min: 30,
            p1_time_ceiling_min: 120,
            p1_min_shots: 2,
            p3_lead_min: 60,
            fc_tolerance_pct: 2.0,
            vwc_noise_tolerance_pct: 3.0,
            ack_timeout_sec: 120,
            workers: 4,
            rate_window_min: 240,
            max_clock_skew_sec: 300,
        }
    }
}

impl EngineSettings {
    pub fn max_clock_skew(&self) -> time::Duration {
        time::Duration::seconds(self.max_clock_skew_sec.min(i64::MAX as u64) as i64)
    }

    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC)
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub schedule_id: String,
    pub lights_on: TimeOfDay,
    pub lights_off: TimeOfDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Substrate {
    Coco,
    Rockwool,
    Soil,
    Hydro,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    pub substrate: Substrate,
    pub pot_volume_l: f32,
    pub field_capacity_pct: f32,
    pub direction: Direction,
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Resolved runtime config
// ---------------------------------------------------------------------------

/// A zone with its light schedule resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSpec {
    pub zone_id: String,
    pub name: String,
    pub substrate: Substrate,
    pub pot_volume_l: f32,
    pub field_capacity_pct: f32,
    pub direction: Direction,
    pub schedule_id: String,
    pub schedule: LightSchedule,
    pub enabled: bool,
}

/// Validated configuration the engine runs on.  Replaced wholesale on
/// reload or policy update.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settings: EngineSettings,
    pub sizer: SizerSettings,
    pub zones: Vec<ZoneSpec>,
    pub policies: PolicyTable,
}

impl EngineConfig {
    pub fn zone(&self, zone_id: &str) -> Option<&ZoneSpec> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// UTC offsets the `time` crate can represent.
const MAX_UTC_OFFSET_MIN: i32 = 18 * 60;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.sizer.validate(&mut errors);
        self.validate_schedules(&mut errors);
        self.validate_zones(&mut errors);
        if let Err(policy_errors) = PolicyTable::from_entries(&self.policies) {
            errors.extend(policy_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        if e.tick_interval_sec == 0 {
            errors.push("engine: tick_interval_sec must be positive".into());
        }
        if e.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MIN {
            errors.push(format!(
                "engine: utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MIN}, {MAX_UTC_OFFSET_MIN}]",
                e.utc_offset_minutes
            ));
        }
        if e.staleness_window_min == 0 {
            errors.push("engine: staleness_window_min must be positive".into());
        }
        if e.p1_time_ceiling_min == 0 {
            errors.push("engine: p1_time_ceiling_min must be positive".into());
        }
        if !(0.0..=100.0).contains(&e.fc_tolerance_pct) {
            errors.push(format!(
                "engine: fc_tolerance_pct {} out of range [0, 100]",
                e.fc_tolerance_pct
            ));
        }
        if !(0.0..=100.0).contains(&e.vwc_noise_tolerance_pct) {
            errors.push(format!(
                "engine: vwc_noise_tolerance_pct {} out of range [0, 100]",
                e.vwc_noise_tolerance_pct
            ));
        }
        if e.ack_timeout_sec == 0 {
            errors.push("engine: ack_timeout_sec must be positive".into());
        }
        if e.workers == 0 {
            errors.push("engine: workers must be positive".into());
        }
        if e.rate_window_min == 0 {
            errors.push("engine: rate_window_min must be positive".into());
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.schedule_id.is_empty() {
                    format!("schedules[{i}]")
                } else {
                    format!("schedule '{}'", s.schedule_id)
                }
            };

            if s.schedule_id.trim().is_empty() {
                errors.push(format!("{}: schedule_id is empty", ctx()));
            } else if !seen_ids.insert(&s.schedule_id) {
                errors.push(format!("{}: duplicate schedule_id", ctx()));
            }

            if s.lights_on == s.lights_off {
                errors.push(format!(
                    "{}: lights_on and lights_off are both {}",
                    ctx(),
                    s.lights_on
                ));
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let schedule_ids: HashSet<&str> = self
            .schedules
            .iter()
            .map(|s| s.schedule_id.as_str())
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if z.zone_id.contains(['/', '+', '#']) {
                errors.push(format!(
                    "{}: zone_id must not contain MQTT topic characters (/ + #)",
                    ctx()
                ));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Substrate geometry ──────────────────────────────
            if !(z.pot_volume_l.is_finite() && z.pot_volume_l > 0.0) {
                errors.push(format!(
                    "{}: pot_volume_l must be positive, got {}",
                    ctx(),
                    z.pot_volume_l
                ));
            }
            if !(z.field_capacity_pct > 0.0 && z.field_capacity_pct <= 100.0) {
                errors.push(format!(
                    "{}: field_capacity_pct {} out of range (0, 100]",
                    ctx(),
                    z.field_capacity_pct
                ));
            }

            // ── Schedule reference ──────────────────────────────
            if !schedule_ids.contains(z.schedule.as_str()) {
                errors.push(format!(
                    "{}: schedule '{}' does not match any defined schedule",
                    ctx(),
                    z.schedule
                ));
            }
        }
    }

    /// Validate and resolve into the engine's runtime form.
    pub fn into_engine(self) -> Result<EngineConfig> {
        self.validate()?;

        let schedules: HashMap<&str, LightSchedule> = self
            .schedules
            .iter()
            .filter_map(|s| {
                LightSchedule::new(s.lights_on, s.lights_off).map(|ls| (s.schedule_id.as_str(), ls))
            })
            .collect();

        let mut zones = Vec::with_capacity(self.zones.len());
        for z in &self.zones {
            let schedule = schedules
                .get(z.schedule.as_str())
                .copied()
                .with_context(|| format!("zone '{}': unresolved schedule", z.zone_id))?;
            zones.push(ZoneSpec {
                zone_id: z.zone_id.clone(),
                name: z.name.clone(),
                substrate: z.substrate,
                pot_volume_l: z.pot_volume_l,
                field_capacity_pct: z.field_capacity_pct,
                direction: z.direction,
                schedule_id: z.schedule.clone(),
                schedule,
                enabled: z.enabled,
            });
        }

        let policies = PolicyTable::from_entries(&self.policies)
            .map_err(|errs| anyhow::anyhow!(errs.join("; ")))?;

        Ok(EngineConfig {
            settings: self.engine,
            sizer: self.sizer,
            zones,
            policies,
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate config text.
pub fn parse_str(contents: &str) -> Result<EngineConfig> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.into_engine()
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<EngineConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse_str(&contents).with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        path,
        zones = config.zones.len(),
        tick_sec = config.settings.tick_interval_sec,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
