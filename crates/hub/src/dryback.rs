//! Per-zone dryback tracking.
//!
//! Dryback is the relative drop from the highest VWC seen since the last
//! irrigation:
//!
//! ```text
//! dryback % = (peak - current) / peak * 100      clamped to [0, 100]
//! ```
//!
//! A zone starts *unprimed* (no peak).  The baseline is primed either by the
//! first acknowledged irrigation or by the first reading at field capacity;
//! until then dryback is reported as 0.

use std::collections::VecDeque;

use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone)]
pub struct DrybackTracker {
    peak: Option<f32>,
    current: Option<f32>,
    last_ts: Option<OffsetDateTime>,
    /// Set by an executed irrigation: the next reading replaces the peak.
    rebaseline: bool,
    /// Recent (ts, vwc) samples used for the drying rate.
    history: VecDeque<(OffsetDateTime, f32)>,
    rate_window: Duration,
}

impl DrybackTracker {
    pub fn new(rate_window_min: u32) -> Self {
        Self {
            peak: None,
            current: None,
            last_ts: None,
            rebaseline: false,
            history: VecDeque::new(),
            rate_window: Duration::minutes(rate_window_min as i64),
        }
    }

    /// Rebuild from a persisted peak.
    pub fn with_peak(rate_window_min: u32, peak: Option<f32>) -> Self {
        Self {
            peak,
            ..Self::new(rate_window_min)
        }
    }

    /// Feed a valid reading.  Returns `false` when the sample was already
    /// seen (same or older timestamp), leaving the tracker untouched.
    pub fn observe(
        &mut self,
        ts: OffsetDateTime,
        vwc: f32,
        field_capacity_pct: f32,
        tolerance_pct: f32,
    ) -> bool {
        if self.last_ts.is_some_and(|prev| ts <= prev) {
            return false;
        }
        self.last_ts = Some(ts);
        self.current = Some(vwc);

        self.history.push_back((ts, vwc));
        let cutoff = ts - self.rate_window;
        while self.history.front().is_some_and(|(t, _)| *t < cutoff) {
            self.history.pop_front();
        }

        if std::mem::take(&mut self.rebaseline) {
            self.peak = Some(vwc);
            return true;
        }
        match self.peak {
            Some(peak) if vwc > peak => self.peak = Some(vwc),
            None if vwc >= field_capacity_pct - tolerance_pct => self.peak = Some(vwc),
            _ => {}
        }
        true
    }

    /// Re-baseline after an executed irrigation.  Until a new reading arrives
    /// the peak is the last pre-irrigation reading, so dryback reads 0; the
    /// first reading after the ack then becomes the peak even if it is lower,
    /// and the rest of the rise is picked up by the normal peak-raise rule.
    pub fn reset_peak(&mut self) {
        if let Some(current) = self.current {
            self.peak = Some(current);
            self.rebaseline = true;
        }
    }

    pub fn is_primed(&self) -> bool {
        self.peak.is_some()
    }

    pub fn peak(&self) -> Option<f32> {
        self.peak
    }

    pub fn current(&self) -> Option<f32> {
        self.current
    }

    pub fn dryback_pct(&self) -> f32 {
        match (self.peak, self.current) {
            (Some(peak), Some(current)) if peak > 0.0 => {
                ((peak - current) / peak * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// VWC points lost per hour across the rate window (positive = drying).
    pub fn drying_rate_per_hour(&self) -> Option<f32> {
        let (first_ts, first_vwc) = *self.history.front()?;
        let (last_ts, last_vwc) = *self.history.back()?;
        let hours = (last_ts - first_ts).as_seconds_f32() / 3600.0;
        if hours <= 0.0 {
            return None;
        }
        Some((first_vwc - last_vwc) / hours)
    }

    /// Estimated minutes until dryback reaches `target_pct`, from the
    /// current drying rate.  `Some(0)` when already there; `None` when the
    /// zone is unprimed or not drying.
    pub fn minutes_until_dryback(&self, target_pct: f32) -> Option<u32> {
        let peak = self.peak?;
        let current = self.current?;
        let target_vwc = peak * (1.0 - target_pct / 100.0);
        if current <= target_vwc {
            return Some(0);
        }
        let rate = self.drying_rate_per_hour()?;
        if rate <= 0.0 {
            return None;
        }
        Some(((current - target_vwc) / rate * 60.0).round() as u32)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
