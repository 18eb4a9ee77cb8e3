//! Crop-steering phase state machine.
//!
//! ```text
//!        lights on                saturated + min shots              P3 lead reached
//!  P0 ───────────────▶ P1 ─────── or P1 ceiling ──────────▶ P2 ───────────────────▶ P3
//!  ▲                   (or P3 lead already reached)                                  │
//!  └──────────────────────────────── lights off (from any state) ───────────────────┘
//! ```
//!
//! Steering direction never changes this topology; it only selects the
//! numeric targets the scheduler uses inside a phase.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::ClockFacts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Dark / dormant.  Never irrigates.
    P0,
    /// Ramp-up to field capacity after lights-on.
    P1,
    /// Maintenance: dryback cycling around the policy target.
    P2,
    /// Pre-lights-off dryback.
    P3,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::P0, Phase::P1, Phase::P2, Phase::P3];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::P0 => "P0",
            Phase::P1 => "P1",
            Phase::P2 => "P2",
            Phase::P3 => "P3",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" => Ok(Phase::P0),
            "P1" => Ok(Phase::P1),
            "P2" => Ok(Phase::P2),
            "P3" => Ok(Phase::P3),
            _ => Err(format!("unknown phase '{s}' (use P0..P3)")),
        }
    }
}

/// Everything a transition decision depends on, gathered by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct PhaseInputs {
    pub clock: ClockFacts,
    /// Latest sample valid and not stale.
    pub sensor_ok: bool,
    /// Dryback baseline exists.
    pub primed: bool,
    pub vwc: Option<f32>,
    pub field_capacity_pct: f32,
    pub fc_tolerance_pct: f32,
    pub p1_shots: u32,
    pub p1_min_shots: u32,
    pub minutes_in_p1: u32,
    pub p1_ceiling_min: u32,
    pub p3_lead_min: u16,
}

/// Apply at most one edge.
pub fn step(current: Phase, i: &PhaseInputs) -> Phase {
    if !i.clock.lights_on {
        return Phase::P0;
    }
    let p3_window = i.clock.minutes_until_lights_off <= i.p3_lead_min;

    match current {
        Phase::P0 => Phase::P1,
        Phase::P1 => {
            let saturated = i.sensor_ok
                && i.primed
                && i.p1_shots >= i.p1_min_shots
                && i
                    .vwc
                    .is_some_and(|v| v >= i.field_capacity_pct - i.fc_tolerance_pct);
            let ceiling = i.minutes_in_p1 >= i.p1_ceiling_min;
            if saturated || ceiling || p3_window {
                Phase::P2
            } else {
                Phase::P1
            }
        }
        Phase::P2 if p3_window => Phase::P3,
        Phase::P2 => Phase::P2,
        Phase::P3 => Phase::P3,
    }
}

/// Apply edges until the phase settles.  Each recorded `(from, to)` pair is
/// a single legal edge, so the chain stays monotonic even when a zone comes
/// up late in the photoperiod.
pub fn advance(current: Phase, inputs: &PhaseInputs) -> (Phase, Vec<(Phase, Phase)>) {
    let mut phase = current;
    let mut edges = Vec::new();
    let mut i = *inputs;

    for _ in 0..Phase::ALL.len() {
        let next = step(phase, &i);
        if next == phase {
            break;
        }
        if phase == Phase::P0 && next == Phase::P1 {
            // Fresh photoperiod: P1 counters start from zero.
            i.p1_shots = 0;
            i.minutes_in_p1 = 0;
        }
        edges.push((phase, next));
        phase = next;
    }

    (phase, edges)
}

// ===========================================================================
// Tests
// ===========================================================================
