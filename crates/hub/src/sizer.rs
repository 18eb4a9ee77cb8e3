//! Shot sizing: policy shot % → concrete irrigation dose.

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_increment_l() -> f32 {
    0.005
}

fn default_max_shot_l() -> f32 {
    2.0
}

/// `[sizer]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizerSettings {
    /// Doses are rounded to a multiple of this (liters).
    #[serde(default = "default_increment_l")]
    pub increment_l: f32,
    /// Per-shot safety ceiling (liters).
    #[serde(default = "default_max_shot_l")]
    pub max_shot_l: f32,
    /// Set for duration-based actuators; commands then carry seconds.
    #[serde(default)]
    pub flow_rate_l_per_min: Option<f32>,
}

impl Default for SizerSettings {
    fn default() -> Self {
        Self {
            increment_l: default_increment_l(),
            max_shot_l: default_max_shot_l(),
            flow_rate_l_per_min: None,
        }
    }
}

impl SizerSettings {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(self.increment_l.is_finite() && self.increment_l > 0.0) {
            errors.push(format!(
                "sizer: increment_l must be positive, got {}",
                self.increment_l
            ));
        }
        if !(self.max_shot_l.is_finite() && self.max_shot_l > 0.0) {
            errors.push(format!(
                "sizer: max_shot_l must be positive, got {}",
                self.max_shot_l
            ));
        } else if self.increment_l > 0.0 && self.max_shot_l < self.increment_l {
            errors.push(format!(
                "sizer: max_shot_l ({}) is smaller than increment_l ({})",
                self.max_shot_l, self.increment_l
            ));
        }
        if let Some(rate) = self.flow_rate_l_per_min {
            if !(rate.is_finite() && rate > 0.0) {
                errors.push(format!(
                    "sizer: flow_rate_l_per_min must be positive, got {rate}"
                ));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Dose {
    Volume { liters: f32 },
    /// Liters is kept alongside for journaling.
    Duration { seconds: u32, liters: f32 },
}

impl Dose {
    pub fn liters(&self) -> f32 {
        match *self {
            Dose::Volume { liters } | Dose::Duration { liters, .. } => liters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("raw shot volume {0} L is not positive")]
    NonPositive(f32),
    #[error("sizer settings unusable: {0}")]
    Settings(String),
}

/// potVolume × (fieldCapacity / 100) × (shotSize / 100)
pub fn shot_volume_l(pot_volume_l: f32, field_capacity_pct: f32, shot_size_pct: f32) -> f32 {
    pot_volume_l * (field_capacity_pct / 100.0) * (shot_size_pct / 100.0)
}

/// Round to the nearest increment (never below one increment) and clamp to
/// the safety ceiling.  With a flow rate, convert to whole seconds.
pub fn size_shot(raw_l: f32, s: &SizerSettings) -> Result<Dose, SizingError> {
    if !(raw_l.is_finite() && raw_l > 0.0) {
        return Err(SizingError::NonPositive(raw_l));
    }
    if !(s.increment_l.is_finite() && s.increment_l > 0.0) {
        return Err(SizingError::Settings(format!("increment_l = {}", s.increment_l)));
    }
    if !(s.max_shot_l.is_finite() && s.max_shot_l > 0.0) {
        return Err(SizingError::Settings(format!("max_shot_l = {}", s.max_shot_l)));
    }

    let steps = (raw_l / s.increment_l).round().max(1.0);
    let liters = (steps * s.increment_l).min(s.max_shot_l);

    match s.flow_rate_l_per_min {
        Some(rate) if rate.is_finite() && rate > 0.0 => {
            let seconds = (liters / rate * 60.0).round().max(1.0) as u32;
            Ok(Dose::Duration { seconds, liters })
        }
        Some(rate) => Err(SizingError::Settings(format!("flow_rate_l_per_min = {rate}"))),
        None => Ok(Dose::Volume { liters }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
