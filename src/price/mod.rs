//! Fetch, normalize, combine, and classify hourly electricity prices.

pub mod errors;
pub mod flow;
pub mod homey;
pub mod models;
pub mod nordpool;
pub mod tariff;

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde_json::json;

use crate::config::{PriceConfig, TariffFees};
use crate::device::EnergyHost;
use crate::price::errors::PriceError;
use crate::price::models::{CombinedPriceSeries, DayKind, DayPrices, PriceEntry, PriceScheme};
use crate::price::nordpool::NordPoolFetcher;
use crate::price::tariff::GridTariffFetcher;
use crate::settings::SettingsHost;
use crate::time_utils::{date_key, day_buckets};
use crate::{retry, wrapper};

pub struct PriceService {
    settings: Arc<dyn SettingsHost>,
    energy_host: Option<Arc<dyn EnergyHost>>,
    scheme: PriceScheme,
    area: String,
    zone: String,
    threshold_percent: f64,
    min_diff_ore: f64,
    tariff_fees: TariffFees,
    nettleie_fylke: String,
    nettleie_orgnr: String,
    nettleie_tariffgruppe: String,
}

impl PriceService {
    /// Returns a new price service from its static configuration.
    ///
    /// # Arguments
    ///
    /// * 'config' - the `[price]` configuration table
    /// * 'zone' - the household's IANA time zone
    /// * 'settings' - typed settings access
    /// * 'energy_host' - present only when `scheme == homey`
    pub fn new(
        config: &PriceConfig,
        zone: &str,
        settings: Arc<dyn SettingsHost>,
        energy_host: Option<Arc<dyn EnergyHost>>,
    ) -> Result<Self, PriceError> {
        let scheme: PriceScheme = config.scheme.parse()?;

        Ok(PriceService {
            settings,
            energy_host,
            scheme,
            area: config.area.clone(),
            zone: zone.to_string(),
            threshold_percent: config.threshold_percent,
            min_diff_ore: config.min_diff_ore,
            tariff_fees: config.tariff_fees.clone(),
            nettleie_fylke: String::new(),
            nettleie_orgnr: String::new(),
            nettleie_tariffgruppe: String::new(),
        })
    }

    /// Sets the grid-tariff lookup keys (`nettleie_fylke`/`_orgnr`/
    /// `_tariffgruppe`), normally loaded once from settings at startup.
    pub fn with_tariff_keys(mut self, fylke: &str, orgnr: &str, tariffgruppe: &str) -> Self {
        self.nettleie_fylke = fylke.to_string();
        self.nettleie_orgnr = orgnr.to_string();
        self.nettleie_tariffgruppe = tariffgruppe.to_string();
        self
    }

    /// Fetches today's (and, after 12:15 UTC, tomorrow's) spot prices for
    /// the `norway` scheme. No-op for other schemes. Cached when the area
    /// is unchanged and today is already present, unless `force`.
    ///
    /// # Arguments
    ///
    /// * 'force' - bypass the cache check
    /// * 'now' - current instant, used to decide the 12:15 UTC grace gate
    pub fn refresh_spot_prices(&self, force: bool, now: DateTime<Utc>) -> Result<(), PriceError> {
        if self.scheme != PriceScheme::Norway {
            return Ok(());
        }

        let today_key = date_key(now, &self.zone);
        let cached_area = self
            .settings
            .get("price_area")?
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        let have_today = self.settings.get("electricity_prices")?.is_some();

        if !force && have_today && cached_area.as_deref() == Some(self.area.as_str()) {
            return Ok(());
        }

        let fetcher = NordPoolFetcher::new(&self.area, self.tariff_fees.clone());
        let buckets = day_buckets(&today_key, &self.zone)?;
        let day_start = buckets[0];
        let day_end = *buckets.last().unwrap() + chrono::Duration::hours(1);

        let today = match retry!(|| fetcher.fetch_day(day_start, day_end, day_start.date_naive())) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("spot price fetch failed, retaining previous cache: {}", e);
                return Ok(());
            }
        };

        self.settings.set("electricity_prices", json!(today))?;
        self.settings.set("price_area", json!(self.area))?;

        let grace_cutoff = now.date_naive().and_hms_opt(12, 15, 0).unwrap();
        let past_grace = now.naive_utc() >= grace_cutoff;
        let tomorrow_key = date_key(now + chrono::Duration::hours(26), &self.zone);
        let have_tomorrow = self
            .settings
            .get("electricity_prices_tomorrow")?
            .is_some();

        if past_grace && !have_tomorrow {
            let t_buckets = day_buckets(&tomorrow_key, &self.zone)?;
            let t_start = t_buckets[0];
            let t_end = *t_buckets.last().unwrap() + chrono::Duration::hours(1);
            match retry!(|| fetcher.fetch_day(t_start, t_end, t_start.date_naive())) {
                Ok(entries) if !entries.is_empty() => {
                    self.settings.set("electricity_prices_tomorrow", json!(entries))?;
                }
                Ok(_) => self.log_tomorrow_missing(now),
                Err(e) => warn!("tomorrow spot price fetch failed: {}", e),
            }
        } else if !have_tomorrow {
            self.log_tomorrow_missing(now);
        }

        Ok(())
    }

    /// Logs the missing-tomorrow-prices condition at debug before local
    /// 13:00 (the grace window spec.md §6 documents around "by convention
    /// 13:00 local"), error afterward (spec.md §8 scenario S6).
    fn log_tomorrow_missing(&self, now: DateTime<Utc>) {
        if tomorrow_missing_is_error(now, &self.zone) {
            error!("tomorrow prices still missing after 13:00 local grace window");
        } else {
            debug!("tomorrow prices not yet published");
        }
    }

    /// Fetches hourly grid-tariff entries for today, falling back to
    /// yesterday / 7 days ago / 1 month ago when the feed is empty.
    pub fn refresh_grid_tariff_data(&self, force: bool, now: DateTime<Utc>) -> Result<(), PriceError> {
        let _ = force;
        if self.nettleie_fylke.is_empty() {
            return Ok(());
        }

        let fetcher = GridTariffFetcher::new(&self.nettleie_fylke, &self.nettleie_orgnr, &self.nettleie_tariffgruppe);
        let mut dates = vec![now.date_naive()];
        dates.extend(tariff::fallback_dates(now));

        for date in dates {
            match fetcher.fetch_day(date) {
                Ok(entries) if !entries.is_empty() => {
                    self.settings.set("nettleie_data", json!(entries.iter().map(|e| &e.date_key).collect::<Vec<_>>()))?;
                    self.settings.set("nettleie_data_full", serde_json::to_value(&entries)?)?;
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("grid tariff fetch failed for {}: {}", date, e);
                    continue;
                }
            }
        }

        warn!("grid tariff data empty for today and all fallback dates");
        Ok(())
    }

    /// Accepts a flow-card price payload for `kind` (today/tomorrow),
    /// validates it, and stores it under the local date-key. Returns the
    /// list of missing hour indices.
    ///
    /// # Arguments
    ///
    /// * 'kind' - whether this is today's or tomorrow's prices
    /// * 'raw' - the raw payload (array or hour-keyed map, possibly lenient JSON)
    /// * 'now' - current instant, used to resolve the target local date-key
    pub fn store_flow_price_data(&self, kind: DayKind, raw: &str, now: DateTime<Utc>) -> Result<Vec<usize>, PriceError> {
        let target = match kind {
            DayKind::Today => now,
            DayKind::Tomorrow => now + chrono::Duration::hours(26),
        };
        let key = date_key(target, &self.zone);
        let hours = day_buckets(&key, &self.zone)?.len();

        let prices_by_hour = flow::parse_flow_payload(raw, hours)?;
        let missing = flow::missing_hours(&prices_by_hour);

        let day_prices = DayPrices {
            date_key: key,
            prices_by_hour,
            updated_at: now,
        };

        let settings_key = match kind {
            DayKind::Today => match self.scheme {
                PriceScheme::Flow => "flow_prices_today",
                PriceScheme::Homey => "homey_prices_today",
                PriceScheme::Norway => "flow_prices_today",
            },
            DayKind::Tomorrow => match self.scheme {
                PriceScheme::Flow => "flow_prices_tomorrow",
                PriceScheme::Homey => "homey_prices_tomorrow",
                PriceScheme::Norway => "flow_prices_tomorrow",
            },
        };

        self.settings.set(settings_key, json!(day_prices))?;

        Ok(missing)
    }

    /// Fetches the Homey scheme's sub-hour prices for today (and tomorrow,
    /// once the grace window opens) through the configured `EnergyHost`.
    pub fn refresh_homey_prices(&self, now: DateTime<Utc>) -> Result<(), PriceError> {
        let Some(host) = &self.energy_host else { return Ok(()) };
        if self.scheme != PriceScheme::Homey {
            return Ok(());
        }

        let fetcher = homey::HomeyFetcher::new(host.as_ref());
        let today_key = date_key(now, &self.zone);
        let entries = fetcher.fetch_day(&today_key, &self.zone)?;
        self.settings.set("homey_prices_today", json!(entries))?;
        self.settings.set("homey_prices_currency", json!(host.currency()))?;

        Ok(())
    }

    /// Recomputes the combined hourly price series from whichever source
    /// components are currently cached, then classifies each entry.
    pub fn update_combined_prices(&self) -> Result<CombinedPriceSeries, PriceError> {
        let mut entries: Vec<PriceEntry> = match self.scheme {
            PriceScheme::Norway => {
                let mut v: Vec<PriceEntry> = self
                    .settings
                    .get("electricity_prices")?
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let tomorrow: Vec<PriceEntry> = self
                    .settings
                    .get("electricity_prices_tomorrow")?
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                v.extend(tomorrow);
                self.apply_fetched_tariff(&mut v)?;
                v
            }
            PriceScheme::Flow => self.read_day_prices("flow_prices_today", "flow_prices_tomorrow")?,
            PriceScheme::Homey => self.read_day_prices("homey_prices_today", "homey_prices_tomorrow")?,
        };

        entries.sort_by_key(|e| e.starts_at);

        classify(&mut entries, self.threshold_percent, self.min_diff_ore);

        let avg = mean(&entries);
        let series = CombinedPriceSeries {
            entries,
            avg_price: avg,
            low_threshold: avg * (1.0 - self.threshold_percent / 100.0),
            high_threshold: avg * (1.0 + self.threshold_percent / 100.0),
            threshold_percent: self.threshold_percent,
            min_diff_ore: self.min_diff_ore,
            price_scheme: self.scheme,
            price_unit: "ore/kWh".to_string(),
            last_fetched: Utc::now(),
        };

        self.settings.set("combined_prices", serde_json::to_value(&series)?)?;

        Ok(series)
    }

    /// Overlays the real fetched NVE grid-tariff entry (cached under
    /// `nettleie_data_full` by `refresh_grid_tariff_data`) onto each
    /// price's `grid_tariff_ex_vat`, replacing the static config fallback
    /// baked in at spot-price fetch time, then recomputes the entry's
    /// total - spec.md §4.B's "recompute the combined series from
    /// currently cached components ... + tariff + ...". A no-op until
    /// the grid-tariff fetcher has populated that key.
    fn apply_fetched_tariff(&self, entries: &mut [PriceEntry]) -> Result<(), PriceError> {
        let Some(raw) = self.settings.get("nettleie_data_full")? else {
            return Ok(());
        };
        let tariff_entries: Vec<tariff::GridTariffEntry> = serde_json::from_value(raw).unwrap_or_default();
        if tariff_entries.is_empty() {
            return Ok(());
        }
        let by_date: std::collections::HashMap<&str, &tariff::GridTariffEntry> =
            tariff_entries.iter().map(|e| (e.date_key.as_str(), e)).collect();

        for entry in entries.iter_mut() {
            if entry.spot_price_ex_vat.is_none() {
                continue;
            }
            let key = date_key(entry.starts_at, &self.zone);
            if let Some(t) = by_date.get(key.as_str()) {
                entry.grid_tariff_ex_vat = Some(nordpool::round_two(t.energy_fee_ex_vat));
                nordpool::recompute_total(entry, &self.tariff_fees);
            }
        }
        Ok(())
    }

    fn read_day_prices(&self, today_key: &str, tomorrow_key: &str) -> Result<Vec<PriceEntry>, PriceError> {
        let mut out = Vec::new();
        for key in [today_key, tomorrow_key] {
            if let Some(v) = self.settings.get(key)? {
                if let Ok(day) = serde_json::from_value::<DayPrices>(v) {
                    if let Ok(buckets) = day_buckets(&day.date_key, &self.zone) {
                        for (i, hour) in buckets.iter().enumerate() {
                            if let Some(Some(price)) = day.prices_by_hour.get(i) {
                                out.push(PriceEntry::bare(*hour, *price));
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn get_combined_hourly_prices(&self) -> Result<CombinedPriceSeries, PriceError> {
        let cached = self.settings.get("combined_prices")?;
        match cached {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => self.update_combined_prices(),
        }
    }

    pub fn find_cheapest_hours(&self, n: usize) -> Result<Vec<PriceEntry>, PriceError> {
        let mut series = self.get_combined_hourly_prices()?.entries;
        series.sort_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal));
        series.truncate(n);
        Ok(series)
    }

    pub fn is_current_hour_cheap(&self, now: DateTime<Utc>) -> Result<bool, PriceError> {
        let series = self.get_combined_hourly_prices()?;
        let hour = crate::time_utils::top_of_hour(now, &self.zone);
        Ok(series.entry_at(hour).map(|e| e.is_cheap).unwrap_or(false))
    }

    pub fn is_current_hour_expensive(&self, now: DateTime<Utc>) -> Result<bool, PriceError> {
        let series = self.get_combined_hourly_prices()?;
        let hour = crate::time_utils::top_of_hour(now, &self.zone);
        Ok(series.entry_at(hour).map(|e| e.is_expensive).unwrap_or(false))
    }

    pub fn get_current_hour_start_ms(&self, now: DateTime<Utc>) -> i64 {
        crate::time_utils::top_of_hour(now, &self.zone).timestamp_millis()
    }
}

/// Classification rule: mutually exclusive, idempotent.
fn classify(entries: &mut [PriceEntry], threshold_percent: f64, min_diff_ore: f64) {
    let avg = mean(entries);
    let low = avg * (1.0 - threshold_percent / 100.0);
    let high = avg * (1.0 + threshold_percent / 100.0);

    for entry in entries.iter_mut() {
        let meets = (entry.total - avg).abs() >= min_diff_ore;
        entry.is_cheap = entry.total <= low && meets;
        entry.is_expensive = entry.total >= high && meets;
    }
}

/// Whether the missing-tomorrow-prices condition should log at error
/// (local hour >= 13) rather than debug (spec.md §8 scenario S6).
fn tomorrow_missing_is_error(now: DateTime<Utc>, zone: &str) -> bool {
    crate::time_utils::local_hour(now, zone) >= 13
}

fn mean(entries: &[PriceEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    entries.iter().map(|e| e.total).sum::<f64>() / entries.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn sample_entries() -> Vec<PriceEntry> {
        let base = Utc::now();
        (0..5)
            .map(|i| PriceEntry::bare(base + chrono::Duration::hours(i), 100.0 + i as f64 * 10.0))
            .collect()
    }

    #[test]
    fn classify_is_mutually_exclusive() {
        let mut entries = sample_entries();
        classify(&mut entries, 10.0, 1.0);
        for e in &entries {
            assert!(!(e.is_cheap && e.is_expensive));
        }
    }

    #[test]
    fn classify_is_idempotent() {
        let mut entries = sample_entries();
        classify(&mut entries, 10.0, 1.0);
        let first_pass: Vec<(bool, bool)> = entries.iter().map(|e| (e.is_cheap, e.is_expensive)).collect();
        classify(&mut entries, 10.0, 1.0);
        let second_pass: Vec<(bool, bool)> = entries.iter().map(|e| (e.is_cheap, e.is_expensive)).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn flat_prices_classify_nothing() {
        let base = Utc::now();
        let mut entries: Vec<PriceEntry> = (0..5).map(|i| PriceEntry::bare(base + chrono::Duration::hours(i), 100.0)).collect();
        classify(&mut entries, 10.0, 1.0);
        assert!(entries.iter().all(|e| !e.is_cheap && !e.is_expensive));
    }

    #[test]
    fn scenario_s6_tomorrow_missing_logs_debug_before_local_thirteen() {
        // 09:00 UTC is 10:00 local in Europe/Oslo during winter (UTC+1).
        let at_ten_local = chrono::Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap();
        assert!(!tomorrow_missing_is_error(at_ten_local, "Europe/Oslo"));
    }

    #[test]
    fn scenario_s6_tomorrow_missing_logs_error_after_local_thirteen() {
        // 12:30 UTC is 13:30 local in Europe/Oslo during winter (UTC+1).
        let at_thirteen_thirty_local = chrono::Utc.with_ymd_and_hms(2025, 1, 10, 12, 30, 0).unwrap();
        assert!(tomorrow_missing_is_error(at_thirteen_thirty_local, "Europe/Oslo"));
    }

    fn test_service(settings: Arc<dyn SettingsHost>) -> PriceService {
        let config = PriceConfig {
            scheme: "norway".to_string(),
            area: "NO1".to_string(),
            threshold_percent: 10.0,
            min_diff_ore: 1.0,
            optimization_enabled: false,
            tariff_fees: TariffFees {
                vat_multiplier: 1.25,
                grid_tariff_ore: 30.0,
                ..Default::default()
            },
        };
        PriceService::new(&config, "Europe/Oslo", settings, None).unwrap()
    }

    #[test]
    fn update_combined_prices_overlays_fetched_tariff_over_static_fallback() {
        let dir = std::env::temp_dir().join(format!("mygrid-price-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let settings: Arc<dyn SettingsHost> = Arc::new(crate::settings::FileSettingsHost::open(dir.join("settings.json")).unwrap());

        let hour = chrono::Utc.with_ymd_and_hms(2025, 1, 10, 6, 0, 0).unwrap();
        let static_entry = PriceEntry {
            starts_at: hour,
            total: 0.0,
            spot_price_ex_vat: Some(0.5),
            grid_tariff_ex_vat: Some(0.30),
            provider_surcharge_ex_vat: None,
            consumption_tax_ex_vat: None,
            enova_fee_ex_vat: None,
            vat_multiplier: None,
            vat_amount: None,
            electricity_support: None,
            norgespris_adjustment: None,
            total_ex_vat: None,
            is_cheap: false,
            is_expensive: false,
        };
        settings.set("electricity_prices", json!(vec![static_entry])).unwrap();

        let fetched = tariff::GridTariffEntry {
            date_key: date_key(hour, "Europe/Oslo"),
            energy_fee_ex_vat: 0.12,
            energy_fee_inc_vat: 0.15,
            fixed_fee_ex_vat: 0.0,
            fixed_fee_inc_vat: 0.0,
        };
        settings.set("nettleie_data_full", serde_json::to_value(vec![fetched]).unwrap()).unwrap();

        let service = test_service(settings);
        let series = service.update_combined_prices().unwrap();

        let entry = series.entries.iter().find(|e| e.starts_at == hour).unwrap();
        assert_eq!(entry.grid_tariff_ex_vat, Some(0.12));
        assert!((entry.total - nordpool::round_two((0.5 + 0.12) * 1.25)).abs() < 1e-6);

        let _ = fs::remove_dir_all(dir);
    }
}
