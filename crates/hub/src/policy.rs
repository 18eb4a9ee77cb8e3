//! Steering policies: numeric irrigation targets per (direction, phase).

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Bias toward leafy growth: small dryback, frequent shots.
    Vegetative,
    /// Bias toward flowering/fruiting: deeper dryback, fewer shots.
    Generative,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Vegetative, Direction::Generative];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Vegetative => "vegetative",
            Direction::Generative => "generative",
        })
    }
}

/// Targets for one (direction, phase) cell.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SteeringPolicy {
    pub target_dryback_pct: f32,
    /// Shot size as % of the substrate's field-capacity volume.
    pub shot_size_pct: f32,
    pub min_interval_min: u32,
    pub max_shots_per_day: u32,
}

/// One `[[policies]]` row in the config file, also the body of a policy
/// update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub direction: Direction,
    pub phase: Phase,
    pub target_dryback_pct: f32,
    pub shot_size_pct: f32,
    pub min_interval_min: u32,
    pub max_shots_per_day: u32,
}

impl PolicyEntry {
    fn policy(&self) -> SteeringPolicy {
        SteeringPolicy {
            target_dryback_pct: self.target_dryback_pct,
            shot_size_pct: self.shot_size_pct,
            min_interval_min: self.min_interval_min,
            max_shots_per_day: self.max_shots_per_day,
        }
    }
}

/// Check a single entry's numeric bounds.
pub fn validate_policy(e: &PolicyEntry, errors: &mut Vec<String>) {
    let ctx = format!("policy {}/{}", e.direction, e.phase);

    if !(0.0..=100.0).contains(&e.target_dryback_pct) {
        errors.push(format!(
            "{ctx}: target_dryback_pct {} out of range [0, 100]",
            e.target_dryback_pct
        ));
    }
    if !(0.0..=100.0).contains(&e.shot_size_pct) {
        errors.push(format!(
            "{ctx}: shot_size_pct {} out of range [0, 100]",
            e.shot_size_pct
        ));
    }
    if e.min_interval_min == 0 {
        errors.push(format!("{ctx}: min_interval_min must be positive"));
    }
    if e.max_shots_per_day > 0 && e.shot_size_pct <= 0.0 {
        errors.push(format!(
            "{ctx}: shot_size_pct must be positive when max_shots_per_day is {}",
            e.max_shots_per_day
        ));
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Complete direction × phase grid.  Only constructible from a set of
/// entries that covers every cell exactly once, so lookups never fail.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    grid: [[SteeringPolicy; 4]; 2],
}

impl PolicyTable {
    pub fn from_entries(entries: &[PolicyEntry]) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut seen: HashSet<(Direction, Phase)> = HashSet::new();
        let mut grid = [[SteeringPolicy::default(); 4]; 2];

        for e in entries {
            if !seen.insert((e.direction, e.phase)) {
                errors.push(format!("policy {}/{}: duplicate entry", e.direction, e.phase));
                continue;
            }
            validate_policy(e, &mut errors);
            grid[e.direction.index()][e.phase.index()] = e.policy();
        }

        for d in Direction::ALL {
            for p in Phase::ALL {
                if !seen.contains(&(d, p)) {
                    errors.push(format!("policy {d}/{p}: missing"));
                }
            }
        }

        if errors.is_empty() {
            Ok(Self { grid })
        } else {
            Err(errors)
        }
    }

    pub fn get(&self, direction: Direction, phase: Phase) -> SteeringPolicy {
        self.grid[direction.index()][phase.index()]
    }

    /// Copy of the table with one cell replaced, after validating the entry.
    pub fn with_entry(&self, entry: &PolicyEntry) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        validate_policy(entry, &mut errors);
        if !errors.is_empty() {
            return Err(errors);
        }
        let mut next = self.clone();
        next.grid[entry.direction.index()][entry.phase.index()] = entry.policy();
        Ok(next)
    }

    pub fn entries(&self) -> Vec<PolicyEntry> {
        let mut out = Vec::with_capacity(8);
        for d in Direction::ALL {
            for p in Phase::ALL {
                let s = self.get(d, p);
                out.push(PolicyEntry {
                    direction: d,
                    phase: p,
                    target_dryback_pct: s.target_dryback_pct,
                    shot_size_pct: s.shot_size_pct,
                    min_interval_min: s.min_interval_min,
                    max_shots_per_day: s.max_shots_per_day,
                });
            }
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
