//! Light-schedule clock: phase-relevant timing facts derived from a
//! lights-on / lights-off schedule.
//!
//! Everything works in wrapped minute-of-day arithmetic (mod 1440), so a
//! photoperiod that crosses midnight needs no special casing.  Nothing here
//! reads the wall clock; callers convert `now` into a [`TimeOfDay`] first.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use time::macros::format_description;
use time::{Duration, OffsetDateTime, Time, UtcOffset};

pub const MINUTES_PER_DAY: u16 = 1440;

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// A minute of the day in `0..1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour as u16 * 60 + minute as u16))
        } else {
            None
        }
    }

    /// Parse a zero-padded `"HH:MM"` string.
    pub fn parse(s: &str) -> Result<Self, time::error::Parse> {
        let t = Time::parse(s.trim(), format_description!("[hour]:[minute]"))?;
        Ok(Self(t.hour() as u16 * 60 + t.minute() as u16))
    }

    /// Minute of day of `now` as seen from a site at `offset`.
    pub fn at(now: OffsetDateTime, offset: UtcOffset) -> Self {
        let local = now.to_offset(offset);
        Self(local.hour() as u16 * 60 + local.minute() as u16)
    }

    pub fn minute_of_day(self) -> u16 {
        self.0
    }

    /// Wrapped distance from `self` forward to `later`.
    fn minutes_until(self, later: TimeOfDay) -> u16 {
        (later.0 as i32 - self.0 as i32).rem_euclid(MINUTES_PER_DAY as i32) as u16
    }

    fn minus_minutes(self, minutes: u16) -> Self {
        let m = (self.0 as i32 - minutes as i32).rem_euclid(MINUTES_PER_DAY as i32);
        Self(m as u16)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TimeOfDay::parse(&s)
            .map_err(|e| de::Error::custom(format!("invalid time of day '{s}' (expected HH:MM): {e}")))
    }
}

// ---------------------------------------------------------------------------
// Schedule + derived facts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LightSchedule {
    pub lights_on: TimeOfDay,
    pub lights_off: TimeOfDay,
}

/// What the state machine needs to know about the light cycle right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockFacts {
    pub lights_on: bool,
    /// 0 while lights are off.
    pub minutes_since_lights_on: u16,
    /// 0 while lights are off.
    pub minutes_until_lights_off: u16,
}

/// Static shape of one photoperiod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayPlan {
    pub photoperiod_minutes: u16,
    pub lights_on: TimeOfDay,
    pub p3_starts_at: TimeOfDay,
    pub lights_off: TimeOfDay,
}

impl LightSchedule {
    /// `None` when on == off (no photoperiod).
    pub fn new(lights_on: TimeOfDay, lights_off: TimeOfDay) -> Option<Self> {
        (lights_on != lights_off).then_some(Self {
            lights_on,
            lights_off,
        })
    }

    pub fn photoperiod_minutes(&self) -> u16 {
        self.lights_on.minutes_until(self.lights_off)
    }

    pub fn facts(&self, now: TimeOfDay) -> ClockFacts {
        let since = self.lights_on.minutes_until(now);
        let photoperiod = self.photoperiod_minutes();
        if since < photoperiod {
            ClockFacts {
                lights_on: true,
                minutes_since_lights_on: since,
                minutes_until_lights_off: photoperiod - since,
            }
        } else {
            ClockFacts {
                lights_on: false,
                minutes_since_lights_on: 0,
                minutes_until_lights_off: 0,
            }
        }
    }

    /// The most recent lights-on instant at or before `now`, for a site at
    /// `offset`.
    pub fn last_lights_on(&self, now: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
        let local = now.to_offset(offset);
        let back = self.lights_on.minutes_until(TimeOfDay::at(now, offset));
        now - Duration::minutes(back as i64)
            - Duration::seconds(local.second() as i64)
            - Duration::nanoseconds(local.nanosecond() as i64)
    }

    /// P3 begins `p3_lead_min` before lights-off, but never before lights-on.
    pub fn day_plan(&self, p3_lead_min: u16) -> DayPlan {
        let photoperiod = self.photoperiod_minutes();
        DayPlan {
            photoperiod_minutes: photoperiod,
            lights_on: self.lights_on,
            p3_starts_at: self.lights_off.minus_minutes(p3_lead_min.min(photoperiod)),
            lights_off: self.lights_off,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    fn tod(h: u8, m: u8) -> TimeOfDay {
        TimeOfDay::from_hm(h, m).unwrap()
    }

    fn day_schedule() -> LightSchedule {
        LightSchedule::new(tod(6, 0), tod(18, 0)).unwrap()
    }

    fn overnight_schedule() -> LightSchedule {
        LightSchedule::new(tod(18, 0), tod(6, 0)).unwrap()
    }

    // -- TimeOfDay ----------------------------------------------------------

    #[test]
    fn parse_valid_times() {
        assert_eq!(TimeOfDay::parse("06:00").unwrap().minute_of_day(), 360);
        assert_eq!(TimeOfDay::parse("23:59").unwrap().minute_of_day(), 1439);
        assert_eq!(TimeOfDay::parse(" 00:00 ").unwrap().minute_of_day(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("12:60").is_err());
        assert!(TimeOfDay::parse("noon").is_err());
    }

    #[test]
    fn from_hm_bounds() {
        assert!(TimeOfDay::from_hm(23, 59).is_some());
        assert!(TimeOfDay::from_hm(24, 0).is_none());
        assert!(TimeOfDay::from_hm(0, 60).is_none());
    }

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(tod(6, 5).to_string(), "06:05");
    }

    #[test]
    fn at_applies_site_offset() {
        let now = datetime!(2026-03-01 04:30 UTC);
        assert_eq!(TimeOfDay::at(now, offset!(UTC)), tod(4, 30));
        assert_eq!(TimeOfDay::at(now, offset!(+2)), tod(6, 30));
        assert_eq!(TimeOfDay::at(now, offset!(-5)), tod(23, 30));
    }

    #[test]
    fn deserialize_from_toml_string() {
        #[derive(Deserialize)]
        struct W {
            t: TimeOfDay,
        }
        let w: W = toml::from_str(r#"t = "17:45""#).unwrap();
        assert_eq!(w.t, tod(17, 45));
        assert!(toml::from_str::<W>(r#"t = "5pm""#).is_err());
    }

    // -- LightSchedule --------------------------------------------------------

    #[test]
    fn degenerate_schedule_rejected() {
        assert!(LightSchedule::new(tod(6, 0), tod(6, 0)).is_none());
    }

    #[test]
    fn photoperiod_lengths() {
        assert_eq!(day_schedule().photoperiod_minutes(), 720);
        assert_eq!(overnight_schedule().photoperiod_minutes(), 720);
        let long = LightSchedule::new(tod(6, 0), tod(0, 0)).unwrap();
        assert_eq!(long.photoperiod_minutes(), 1080);
    }

    #[test]
    fn facts_mid_day() {
        let f = day_schedule().facts(tod(17, 0));
        assert!(f.lights_on);
        assert_eq!(f.minutes_since_lights_on, 660);
        assert_eq!(f.minutes_until_lights_off, 60);
    }

    #[test]
    fn facts_at_lights_on_boundary() {
        let f = day_schedule().facts(tod(6, 0));
        assert!(f.lights_on);
        assert_eq!(f.minutes_since_lights_on, 0);
        assert_eq!(f.minutes_until_lights_off, 720);
    }

    #[test]
    fn facts_at_lights_off_boundary_is_dark() {
        let f = day_schedule().facts(tod(18, 0));
        assert!(!f.lights_on);
        assert_eq!(f.minutes_since_lights_on, 0);
        assert_eq!(f.minutes_until_lights_off, 0);
    }

    #[test]
    fn facts_before_lights_on_is_dark() {
        assert!(!day_schedule().facts(tod(5, 59)).lights_on);
    }

    #[test]
    fn facts_across_midnight() {
        let s = overnight_schedule();
        let f = s.facts(tod(2, 0));
        assert!(f.lights_on);
        assert_eq!(f.minutes_since_lights_on, 480);
        assert_eq!(f.minutes_until_lights_off, 240);

        assert!(s.facts(tod(23, 0)).lights_on);
        assert!(!s.facts(tod(12, 0)).lights_on);
    }

    #[test]
    fn day_plan_p3_start() {
        let plan = day_schedule().day_plan(60);
        assert_eq!(plan.p3_starts_at, tod(17, 0));
        assert_eq!(plan.photoperiod_minutes, 720);

        let overnight = overnight_schedule().day_plan(90);
        assert_eq!(overnight.p3_starts_at, tod(4, 30));
    }

    #[test]
    fn day_plan_lead_longer_than_photoperiod_clamps_to_lights_on() {
        let short = LightSchedule::new(tod(6, 0), tod(7, 0)).unwrap();
        assert_eq!(short.day_plan(120).p3_starts_at, tod(6, 0));
    }

    // -- Photoperiod start --------------------------------------------------

    #[test]
    fn last_lights_on_same_day() {
        let at = day_schedule().last_lights_on(datetime!(2026-03-02 07:30:15 UTC), offset!(UTC));
        assert_eq!(at, datetime!(2026-03-02 06:00 UTC));
    }

    #[test]
    fn last_lights_on_exactly_at_switch() {
        let at = day_schedule().last_lights_on(datetime!(2026-03-02 06:00 UTC), offset!(UTC));
        assert_eq!(at, datetime!(2026-03-02 06:00 UTC));
    }

    #[test]
    fn last_lights_on_before_dawn_is_yesterday() {
        let at = day_schedule().last_lights_on(datetime!(2026-03-02 03:00 UTC), offset!(UTC));
        assert_eq!(at, datetime!(2026-03-01 06:00 UTC));
    }

    #[test]
    fn last_lights_on_overnight_with_offset() {
        // 18:00 local at +02:00 is 16:00 UTC.
        let at = overnight_schedule()
            .last_lights_on(datetime!(2026-03-02 01:00 UTC), offset!(+2));
        assert_eq!(at, datetime!(2026-03-01 16:00 UTC));
    }
}
