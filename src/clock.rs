//! UTC ↔ local time-of-day alignment.
//!
//! Position fixes are stamped by the receiver in UTC; inertial samples carry
//! the estimator's local clock. Everything is brought onto the local timeline
//! (seconds since local midnight) before it reaches the buffers.
//!
//! Only a whole-hour offset is applied and no date is tracked, so two fixes
//! exactly 24 h apart are indistinguishable here. Callers that need date
//! disambiguation have to add it upstream.

use chrono::{NaiveTime, Timelike};

use crate::error::{FusionError, FusionResult};
use crate::types::UtcTimeOfDay;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockAligner {
    offset_hours: i32,
}

impl ClockAligner {
    pub fn new(offset_hours: i32) -> Self {
        Self { offset_hours }
    }

    pub fn offset_hours(&self) -> i32 {
        self.offset_hours
    }

    /// Shift a UTC time of day into local time, wrapping the hour modulo 24.
    ///
    /// Minutes, seconds and sub-seconds pass through unchanged.
    pub fn to_local(&self, utc: &UtcTimeOfDay) -> FusionResult<NaiveTime> {
        if !(0..=23).contains(&utc.hour) {
            return Err(FusionError::InvalidTime(format!(
                "hour {} outside [0, 23]",
                utc.hour
            )));
        }
        if utc.microsecond >= 1_000_000 {
            return Err(FusionError::InvalidTime(format!(
                "microsecond {} out of range",
                utc.microsecond
            )));
        }

        let hour = (utc.hour + self.offset_hours).rem_euclid(24) as u32;
        NaiveTime::from_hms_micro_opt(hour, utc.minute, utc.second, utc.microsecond)
            .ok_or_else(|| FusionError::InvalidTime(format!("{} is not a time of day", utc)))
    }

    /// Inverse of [`ClockAligner::to_local`].
    pub fn to_utc(&self, local: NaiveTime) -> UtcTimeOfDay {
        let hour = (local.hour() as i32 - self.offset_hours).rem_euclid(24);
        UtcTimeOfDay {
            hour,
            minute: local.minute(),
            second: local.second(),
            microsecond: (local.nanosecond() / 1_000).min(999_999),
        }
    }

    /// UTC stamp → seconds since local midnight.
    pub fn to_local_seconds(&self, utc: &UtcTimeOfDay) -> FusionResult<f64> {
        self.to_local(utc).map(seconds_of_day)
    }

    /// Seconds since local midnight → UTC stamp.
    pub fn utc_from_local_seconds(&self, seconds: f64) -> FusionResult<UtcTimeOfDay> {
        time_of_day(seconds).map(|local| self.to_utc(local))
    }
}

/// Seconds since midnight for a wall-clock time.
pub fn seconds_of_day(time: NaiveTime) -> f64 {
    time.num_seconds_from_midnight() as f64 + f64::from(time.nanosecond()) * 1e-9
}

/// Wall-clock time for a number of seconds since midnight.
pub fn time_of_day(seconds: f64) -> FusionResult<NaiveTime> {
    if !seconds.is_finite() || !(0.0..SECONDS_PER_DAY).contains(&seconds) {
        return Err(FusionError::InvalidTime(format!(
            "{} s is outside a single day",
            seconds
        )));
    }
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e9).round() as u32).min(999_999_999);
    NaiveTime::from_num_seconds_from_midnight_opt(whole as u32, nanos)
        .ok_or_else(|| FusionError::InvalidTime(format!("{} s", seconds)))
}

impl From<NaiveTime> for UtcTimeOfDay {
    fn from(time: NaiveTime) -> Self {
        UtcTimeOfDay {
            hour: time.hour() as i32,
            minute: time.minute(),
            second: time.second(),
            microsecond: (time.nanosecond() / 1_000).min(999_999),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_offset_wraps_past_midnight() {
        let aligner = ClockAligner::new(8);
        let local = aligner
            .to_local(&UtcTimeOfDay::new(18, 15, 10, 250_000))
            .unwrap();
        assert_eq!(local.hour(), 2);
        assert_eq!(local.minute(), 15);
        assert_eq!(local.second(), 10);
        assert_eq!(local.nanosecond(), 250_000_000);
    }

    #[test]
    fn test_negative_offset_wraps_backwards() {
        let aligner = ClockAligner::new(-5);
        let local = aligner.to_local(&UtcTimeOfDay::new(3, 0, 0, 0)).unwrap();
        assert_eq!(local.hour(), 22);
    }

    #[test]
    fn test_round_trip_every_hour() {
        for offset in [-11, -3, 0, 1, 8, 13] {
            let aligner = ClockAligner::new(offset);
            for hour in 0..24 {
                let utc = UtcTimeOfDay::new(hour, 42, 7, 123_456);
                let local = aligner.to_local(&utc).unwrap();
                assert_eq!(aligner.to_utc(local), utc, "offset {offset} hour {hour}");
            }
        }
    }

    #[test]
    fn test_out_of_range_hour_rejected() {
        let aligner = ClockAligner::new(8);
        for hour in [24, -1] {
            let err = aligner
                .to_local(&UtcTimeOfDay::new(hour, 0, 0, 0))
                .unwrap_err();
            assert!(matches!(err, FusionError::InvalidTime(_)));
        }
    }

    #[test]
    fn test_out_of_range_minute_rejected() {
        let aligner = ClockAligner::new(0);
        assert!(aligner.to_local(&UtcTimeOfDay::new(1, 60, 0, 0)).is_err());
        assert!(aligner
            .to_local(&UtcTimeOfDay::new(1, 0, 0, 1_000_000))
            .is_err());
    }

    #[test]
    fn test_local_seconds() {
        let aligner = ClockAligner::new(1);
        let secs = aligner
            .to_local_seconds(&UtcTimeOfDay::new(0, 0, 1, 500_000))
            .unwrap();
        assert_abs_diff_eq!(secs, 3601.5, epsilon = 1e-9);

        let utc = aligner.utc_from_local_seconds(secs).unwrap();
        assert_eq!(utc, UtcTimeOfDay::new(0, 0, 1, 500_000));
    }

    #[test]
    fn test_time_of_day_bounds() {
        assert!(time_of_day(-0.5).is_err());
        assert!(time_of_day(SECONDS_PER_DAY).is_err());
        assert!(time_of_day(f64::NAN).is_err());
        assert_abs_diff_eq!(
            seconds_of_day(time_of_day(45_296.25).unwrap()),
            45_296.25,
            epsilon = 1e-9
        );
    }
}
