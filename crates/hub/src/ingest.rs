//! Substrate sensor ingest: plausibility checks on raw VWC/EC samples and the
//! per-zone last-known-good reading.

use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// One substrate sample for a zone.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub zone_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    /// Volumetric water content, %.
    pub vwc: f32,
    /// Electrical conductivity, mS/cm.
    pub ec: f32,
    /// Sensor-side validity flag.
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("unknown zone '{0}'")]
    UnknownZone(String),
    #[error("sensor flagged the sample invalid")]
    Flagged,
    #[error("vwc {0} outside plausible range [0, 100]")]
    VwcOutOfRange(f32),
    #[error("ec {0} is not a plausible conductivity")]
    EcOutOfRange(f32),
    #[error("vwc {vwc} exceeds field capacity ceiling {ceiling}")]
    Anomalous { vwc: f32, ceiling: f32 },
    #[error("sample older than last accepted reading")]
    OutOfOrder,
    #[error("sample stamped {ahead_sec}s in the future")]
    FromFuture { ahead_sec: i64 },
}

impl IngestError {
    /// Whether the error means the sensor itself is producing bad data
    /// (as opposed to a routing or ordering problem).
    pub fn is_sensor_fault(&self) -> bool {
        !matches!(self, Self::UnknownZone(_) | Self::OutOfOrder)
    }
}

/// Check a sample against plausibility bounds for a zone whose field
/// capacity is `field_capacity_pct`.
pub fn check(
    reading: &SensorReading,
    field_capacity_pct: f32,
    noise_tolerance_pct: f32,
) -> Result<(), IngestError> {
    if !reading.valid {
        return Err(IngestError::Flagged);
    }
    if !reading.vwc.is_finite() || !(0.0..=100.0).contains(&reading.vwc) {
        return Err(IngestError::VwcOutOfRange(reading.vwc));
    }
    if !reading.ec.is_finite() || reading.ec < 0.0 {
        return Err(IngestError::EcOutOfRange(reading.ec));
    }
    let ceiling = field_capacity_pct + noise_tolerance_pct;
    if reading.vwc > ceiling {
        return Err(IngestError::Anomalous {
            vwc: reading.vwc,
            ceiling,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-zone ingest state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IngestState {
    last_good: Option<SensorReading>,
    last_sample_invalid: bool,
    rejected: u64,
}

impl IngestState {
    /// Accept or discard a sample.  A discarded sample never touches the
    /// last-known-good reading.
    ///
    /// Samples stamped more than `max_skew` ahead of `now` are a sensor
    /// fault and never become last-known-good.
    pub fn accept(
        &mut self,
        reading: SensorReading,
        now: OffsetDateTime,
        max_skew: Duration,
        field_capacity_pct: f32,
        noise_tolerance_pct: f32,
    ) -> Result<(), IngestError> {
        if let Some(prev) = &self.last_good {
            if reading.ts <= prev.ts {
                return Err(IngestError::OutOfOrder);
            }
        }
        let ahead = reading.ts - now;
        let result = if ahead > max_skew {
            Err(IngestError::FromFuture {
                ahead_sec: ahead.whole_seconds(),
            })
        } else {
            check(&reading, field_capacity_pct, noise_tolerance_pct)
        };
        if let Err(e) = result {
            self.last_sample_invalid = true;
            self.rejected += 1;
            return Err(e);
        }
        self.last_sample_invalid = false;
        self.last_good = Some(reading);
        Ok(())
    }

    pub fn last_good(&self) -> Option<&SensorReading> {
        self.last_good.as_ref()
    }

    /// True when the most recent sample was rejected as implausible.
    pub fn last_sample_invalid(&self) -> bool {
        self.last_sample_invalid
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 09:00 UTC);
    const SKEW: Duration = Duration::minutes(5);

    fn reading(vwc: f32) -> SensorReading {
        SensorReading {
            zone_id: "z1".into(),
            ts: datetime!(2026-03-01 08:00 UTC),
            vwc,
            ec: 2.4,
            valid: true,
        }
    }

    #[test]
    fn plausible_reading_passes() {
        assert_eq!(check(&reading(55.0), 65.0, 3.0), Ok(()));
    }

    #[test]
    fn vwc_out_of_range_rejected() {
        assert_eq!(
            check(&reading(-1.0), 65.0, 3.0),
            Err(IngestError::VwcOutOfRange(-1.0))
        );
        assert!(matches!(
            check(&reading(f32::NAN), 65.0, 3.0),
            Err(IngestError::VwcOutOfRange(_))
        ));
    }

    #[test]
    fn sensor_flag_rejected() {
        let r = SensorReading {
            valid: false,
            ..reading(50.0)
        };
        assert_eq!(check(&r, 65.0, 3.0), Err(IngestError::Flagged));
    }

    #[test]
    fn negative_ec_rejected() {
        let r = SensorReading {
            ec: -0.2,
            ..reading(50.0)
        };
        assert_eq!(check(&r, 65.0, 3.0), Err(IngestError::EcOutOfRange(-0.2)));
    }

    #[test]
    fn above_field_capacity_within_noise_passes() {
        assert_eq!(check(&reading(67.5), 65.0, 3.0), Ok(()));
    }

    #[test]
    fn above_field_capacity_beyond_noise_is_anomalous() {
        assert_eq!(
            check(&reading(70.0), 65.0, 3.0),
            Err(IngestError::Anomalous {
                vwc: 70.0,
                ceiling: 68.0
            })
        );
    }

    #[test]
    fn accept_updates_last_good() {
        let mut st = IngestState::default();
        st.accept(reading(50.0), NOW, SKEW, 65.0, 3.0).unwrap();
        assert_eq!(st.last_good().unwrap().vwc, 50.0);
        assert!(!st.last_sample_invalid());
    }

    #[test]
    fn rejected_sample_keeps_last_good() {
        let mut st = IngestState::default();
        st.accept(reading(50.0), NOW, SKEW, 65.0, 3.0).unwrap();

        let bad = SensorReading {
            ts: datetime!(2026-03-01 08:05 UTC),
            ..reading(150.0)
        };
        assert!(st.accept(bad, NOW, SKEW, 65.0, 3.0).is_err());

        assert_eq!(st.last_good().unwrap().vwc, 50.0);
        assert!(st.last_sample_invalid());
        assert_eq!(st.rejected(), 1);
    }

    #[test]
    fn valid_sample_clears_invalid_flag() {
        let mut st = IngestState::default();
        let _ = st.accept(reading(150.0), NOW, SKEW, 65.0, 3.0);
        assert!(st.last_sample_invalid());

        let good = SensorReading {
            ts: datetime!(2026-03-01 08:05 UTC),
            ..reading(48.0)
        };
        st.accept(good, NOW, SKEW, 65.0, 3.0).unwrap();
        assert!(!st.last_sample_invalid());
    }

    #[test]
    fn out_of_order_sample_ignored() {
        let mut st = IngestState::default();
        st.accept(reading(50.0), NOW, SKEW, 65.0, 3.0).unwrap();

        let older = SensorReading {
            ts: datetime!(2026-03-01 07:55 UTC),
            ..reading(40.0)
        };
        assert_eq!(
            st.accept(older, NOW, SKEW, 65.0, 3.0),
            Err(IngestError::OutOfOrder)
        );
        assert_eq!(st.last_good().unwrap().vwc, 50.0);
        assert!(!st.last_sample_invalid());
    }

    #[test]
    fn sensor_fault_classification() {
        assert!(IngestError::Flagged.is_sensor_fault());
        assert!(!IngestError::OutOfOrder.is_sensor_fault());
        assert!(!IngestError::UnknownZone("z9".into()).is_sensor_fault());
    }

    #[test]
    fn future_stamped_sample_rejected() {
        let mut st = IngestState::default();
        st.accept(reading(50.0), NOW, SKEW, 65.0, 3.0).unwrap();

        let ahead = SensorReading {
            ts: datetime!(2027-03-01 09:00 UTC),
            ..reading(52.0)
        };
        assert!(matches!(
            st.accept(ahead, NOW, SKEW, 65.0, 3.0),
            Err(IngestError::FromFuture { .. })
        ));
        assert_eq!(st.last_good().unwrap().vwc, 50.0);
        assert!(st.last_sample_invalid());
        assert_eq!(st.rejected(), 1);

        // Real readings keep flowing afterwards.
        let next = SensorReading {
            ts: datetime!(2026-03-01 08:59 UTC),
            ..reading(49.0)
        };
        st.accept(next, NOW, SKEW, 65.0, 3.0).unwrap();
        assert_eq!(st.last_good().unwrap().vwc, 49.0);
    }

    #[test]
    fn small_clock_skew_tolerated() {
        let mut st = IngestState::default();
        let slightly_ahead = SensorReading {
            ts: NOW + Duration::minutes(2),
            ..reading(50.0)
        };
        st.accept(slightly_ahead, NOW, SKEW, 65.0, 3.0).unwrap();
        assert!(IngestError::FromFuture { ahead_sec: 600 }.is_sensor_fault());
    }
}
