//! Hourly energy accumulation with gap/outage detection.
//!
//! Open-ended `HashMap` buckets rather than fixed-size arrays, since a
//! continuously running daemon cannot preallocate a fixed horizon.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time_utils::{date_key, top_of_hour, weekday_hour_key};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("time error: {0}")]
    Time(#[from] crate::time_utils::TimeError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnreliablePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyAverage {
    pub sum: f64,
    pub count: u64,
}

impl HourlyAverage {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Hourly energy accumulator and outage tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerTracker {
    pub buckets: HashMap<String, f64>,
    pub controlled_buckets: HashMap<String, f64>,
    pub uncontrolled_buckets: HashMap<String, f64>,
    pub hourly_budgets: HashMap<String, f64>,
    pub daily_totals: HashMap<String, f64>,
    pub hourly_averages: HashMap<String, HourlyAverage>,
    pub unreliable_periods: Vec<UnreliablePeriod>,
    pub last_power_w: Option<f64>,
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_meter_kwh: Option<f64>,
    #[serde(default)]
    pub last_meter_timestamp: Option<DateTime<Utc>>,
}

/// Minimum power step treated as significant for the meter-delta path;
/// deltas below this are ignored as noise.
pub const MIN_SIGNIFICANT_POWER_W: f64 = 5.0;

impl PowerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_snapshot(&self) -> Result<serde_json::Value, TrackerError> {
        Ok(serde_json::to_value(self).unwrap_or(serde_json::Value::Null))
    }

    pub fn from_snapshot(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Records a direct power sample. Ignores non-finite wattage and
    /// non-monotonic timestamps. Deposits the interval's energy into one or
    /// two hour buckets, splitting across a boundary; detects outages.
    ///
    /// # Arguments
    ///
    /// * 'current_power_w' - the instantaneous power reading, in watts
    /// * 'now' - the instant the sample was taken
    /// * 'zone' - the household's IANA time zone, used for bucket and daily keys
    /// * 'controlled' - whether this sample belongs to controllable load
    pub fn record_power_sample(&mut self, current_power_w: f64, now: DateTime<Utc>, zone: &str, controlled: bool) -> Result<(), TrackerError> {
        if !current_power_w.is_finite() {
            return Ok(());
        }

        let (last_w, last_ts) = match (self.last_power_w, self.last_timestamp) {
            (Some(w), Some(ts)) => (w, ts),
            _ => {
                self.last_power_w = Some(current_power_w);
                self.last_timestamp = Some(now);
                return Ok(());
            }
        };

        if now <= last_ts {
            return Ok(());
        }

        let delta = now - last_ts;
        let crosses_hour_boundary = top_of_hour(last_ts, zone) != top_of_hour(now, zone);
        let is_outage = (delta > chrono::Duration::seconds(60) && crosses_hour_boundary) || delta > chrono::Duration::hours(1);

        if is_outage {
            self.unreliable_periods.push(UnreliablePeriod { start: last_ts, end: now });
            self.unreliable_periods.sort_by_key(|p| p.start);
            self.last_power_w = Some(current_power_w);
            self.last_timestamp = Some(now);
            return Ok(());
        }

        let avg_w = (last_w + current_power_w) / 2.0;
        self.deposit_energy(avg_w, last_ts, now, zone, controlled)?;

        self.last_power_w = Some(current_power_w);
        self.last_timestamp = Some(now);

        Ok(())
    }

    /// Alternative path for devices that only expose a cumulative kWh
    /// meter reading rather than instantaneous watts.
    ///
    /// # Arguments
    ///
    /// * 'meter_kwh' - the cumulative meter reading, in kWh
    /// * 'now' - the instant the reading was taken
    /// * 'zone' - the household's IANA time zone
    /// * 'controlled' - whether this meter belongs to controllable load
    pub fn record_meter_reading(&mut self, meter_kwh: f64, now: DateTime<Utc>, zone: &str, controlled: bool) -> Result<(), TrackerError> {
        if !meter_kwh.is_finite() {
            return Ok(());
        }

        let (last_kwh, last_ts) = match (self.last_meter_kwh, self.last_meter_timestamp) {
            (Some(v), Some(ts)) => (v, ts),
            _ => {
                self.last_meter_kwh = Some(meter_kwh);
                self.last_meter_timestamp = Some(now);
                return Ok(());
            }
        };

        if now <= last_ts {
            return Ok(());
        }

        if meter_kwh < last_kwh {
            // meter reset: drop the delta, resynchronize
            self.last_meter_kwh = Some(meter_kwh);
            self.last_meter_timestamp = Some(now);
            return Ok(());
        }

        let elapsed_h = (now - last_ts).num_milliseconds() as f64 / 3_600_000.0;
        if elapsed_h <= 0.0 {
            return Ok(());
        }

        let delta_kwh = meter_kwh - last_kwh;
        let avg_w = (delta_kwh / elapsed_h) * 1000.0;

        if avg_w.abs() < MIN_SIGNIFICANT_POWER_W {
            self.last_meter_kwh = Some(meter_kwh);
            self.last_meter_timestamp = Some(now);
            return Ok(());
        }

        self.record_power_sample(avg_w, now, zone, controlled)?;

        self.last_meter_kwh = Some(meter_kwh);
        self.last_meter_timestamp = Some(now);

        Ok(())
    }

    fn deposit_energy(&mut self, avg_w: f64, start: DateTime<Utc>, end: DateTime<Utc>, zone: &str, controlled: bool) -> Result<(), TrackerError> {
        let start_hour = top_of_hour(start, zone);
        let end_hour = top_of_hour(end, zone);

        if start_hour == end_hour {
            let hours = (end - start).num_milliseconds() as f64 / 3_600_000.0;
            self.deposit_bucket(start_hour, avg_w * hours / 1000.0, zone, controlled);
        } else {
            let boundary = end_hour;
            let first_hours = (boundary - start).num_milliseconds() as f64 / 3_600_000.0;
            let second_hours = (end - boundary).num_milliseconds() as f64 / 3_600_000.0;
            self.deposit_bucket(start_hour, avg_w * first_hours / 1000.0, zone, controlled);
            self.deposit_bucket(end_hour, avg_w * second_hours / 1000.0, zone, controlled);
        }

        Ok(())
    }

    fn deposit_bucket(&mut self, hour: DateTime<Utc>, kwh: f64, zone: &str, controlled: bool) {
        let key = hour.to_rfc3339();
        *self.buckets.entry(key.clone()).or_insert(0.0) += kwh;
        if controlled {
            *self.controlled_buckets.entry(key.clone()).or_insert(0.0) += kwh;
        } else {
            *self.uncontrolled_buckets.entry(key.clone()).or_insert(0.0) += kwh;
        }

        let day = date_key(hour, zone);
        *self.daily_totals.entry(day).or_insert(0.0) += kwh;

        let wh_key = weekday_hour_key(hour, zone);
        let avg = self.hourly_averages.entry(wh_key).or_default();
        avg.sum += kwh;
        avg.count += 1;
    }

    /// Confidence score in [0,1], linear from 0 at <1 day of history to 1
    /// at 28 days, derived from the number of distinct date-keys observed.
    pub fn confidence(&self) -> f64 {
        let days = self.daily_totals.len() as f64;
        (days / 28.0).clamp(0.0, 1.0)
    }

    pub fn bucket_kwh(&self, hour: DateTime<Utc>) -> f64 {
        self.buckets.get(&hour.to_rfc3339()).copied().unwrap_or(0.0)
    }

    pub fn controlled_kwh(&self, hour: DateTime<Utc>) -> f64 {
        self.controlled_buckets.get(&hour.to_rfc3339()).copied().unwrap_or(0.0)
    }

    pub fn uncontrolled_kwh(&self, hour: DateTime<Utc>) -> f64 {
        self.uncontrolled_buckets.get(&hour.to_rfc3339()).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, s).unwrap()
    }

    #[test]
    fn first_sample_seeds_state_without_deposit() {
        let mut tracker = PowerTracker::new();
        tracker.record_power_sample(1000.0, t(7, 0, 0), "UTC", true).unwrap();
        assert!(tracker.buckets.is_empty());
    }

    #[test]
    fn deposits_kwh_for_ordinary_interval() {
        let mut tracker = PowerTracker::new();
        tracker.record_power_sample(1000.0, t(7, 0, 0), "UTC", true).unwrap();
        tracker.record_power_sample(1000.0, t(7, 30, 0), "UTC", true).unwrap();
        let kwh = tracker.bucket_kwh(t(7, 0, 0));
        assert!((kwh - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scenario_s4_outage_across_hour_boundary() {
        let mut tracker = PowerTracker::new();
        tracker.record_power_sample(1000.0, t(7, 59, 30), "UTC", true).unwrap();
        tracker.record_power_sample(1000.0, t(8, 1, 0), "UTC", true).unwrap();

        assert_eq!(tracker.unreliable_periods.len(), 1);
        assert_eq!(tracker.unreliable_periods[0].start, t(7, 59, 30));
        assert_eq!(tracker.unreliable_periods[0].end, t(8, 1, 0));
        assert_eq!(tracker.bucket_kwh(t(7, 0, 0)), 0.0);
        assert_eq!(tracker.bucket_kwh(t(8, 0, 0)), 0.0);
    }

    #[test]
    fn splits_deposit_across_hour_boundary_when_no_outage() {
        let mut tracker = PowerTracker::new();
        tracker.record_power_sample(3600.0, t(7, 45, 0), "UTC", true).unwrap();
        tracker.record_power_sample(3600.0, t(8, 15, 0), "UTC", true).unwrap();

        assert!(tracker.bucket_kwh(t(7, 0, 0)) > 0.0);
        assert!(tracker.bucket_kwh(t(8, 0, 0)) > 0.0);
    }

    #[test]
    fn meter_reset_drops_the_delta() {
        let mut tracker = PowerTracker::new();
        tracker.record_meter_reading(10.0, t(7, 0, 0), "UTC", true).unwrap();
        tracker.record_meter_reading(2.0, t(7, 30, 0), "UTC", true).unwrap();
        assert!(tracker.bucket_kwh(t(7, 0, 0)) == 0.0);
    }

    #[test]
    fn confidence_scales_linearly_with_distinct_days() {
        let mut tracker = PowerTracker::new();
        for d in 1..=14 {
            tracker.daily_totals.insert(format!("2025-06-{:02}", d), 1.0);
        }
        assert!((tracker.confidence() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut tracker = PowerTracker::new();
        tracker.record_power_sample(1000.0, t(7, 0, 0), "UTC", true).unwrap();
        tracker.record_power_sample(1000.0, t(7, 30, 0), "UTC", true).unwrap();
        let snap = tracker.to_snapshot().unwrap();
        let restored = PowerTracker::from_snapshot(snap);
        assert_eq!(restored.bucket_kwh(t(7, 0, 0)), tracker.bucket_kwh(t(7, 0, 0)));
    }
}
