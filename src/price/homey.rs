//! Homey-scheme price fetcher: sub-hour interval averaging into hour
//! buckets keyed by local date-key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::device::EnergyHost;
use crate::price::errors::PriceError;
use crate::price::models::PriceEntry;
use crate::time_utils::top_of_hour;

pub struct HomeyFetcher<'a> {
    host: &'a dyn EnergyHost,
}

impl<'a> HomeyFetcher<'a> {
    pub fn new(host: &'a dyn EnergyHost) -> Self {
        Self { host }
    }

    /// Fetches whatever sub-hour intervals the host reports for `date_key`
    /// and averages them into hour buckets.
    ///
    /// # Arguments
    ///
    /// * 'date_key' - local date-key to fetch prices for
    /// * 'zone' - IANA zone used to resolve each interval's containing hour
    pub fn fetch_day(&self, date_key: &str, zone: &str) -> Result<Vec<PriceEntry>, PriceError> {
        let intervals = self
            .host
            .fetch_dynamic_prices(date_key)
            .map_err(|e| PriceError::InvalidFlowPayload(e.to_string()))?;

        Ok(average_into_hours(&intervals, zone))
    }
}

fn average_into_hours(intervals: &[(DateTime<Utc>, f64)], zone: &str) -> Vec<PriceEntry> {
    let mut buckets: HashMap<DateTime<Utc>, (f64, usize)> = HashMap::new();

    for (instant, price) in intervals {
        if !price.is_finite() {
            continue;
        }
        let hour = top_of_hour(*instant, zone);
        let entry = buckets.entry(hour).or_insert((0.0, 0));
        entry.0 += price;
        entry.1 += 1;
    }

    let mut out: Vec<PriceEntry> = buckets
        .into_iter()
        .map(|(hour, (sum, count))| PriceEntry::bare(hour, sum / count as f64))
        .collect();
    out.sort_by_key(|e| e.starts_at);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn averages_quarter_hour_intervals_into_one_hour_bucket() {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let intervals = vec![
            (base, 1.0),
            (base + chrono::Duration::minutes(15), 2.0),
            (base + chrono::Duration::minutes(30), 3.0),
            (base + chrono::Duration::minutes(45), 4.0),
        ];
        let hours = average_into_hours(&intervals, "UTC");
        assert_eq!(hours.len(), 1);
        assert!((hours[0].total - 2.5).abs() < 1e-9);
    }

    #[test]
    fn non_finite_prices_are_dropped() {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let intervals = vec![(base, f64::NAN), (base, 2.0)];
        let hours = average_into_hours(&intervals, "UTC");
        assert_eq!(hours.len(), 1);
        assert!((hours[0].total - 2.0).abs() < 1e-9);
    }
}
