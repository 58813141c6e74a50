//! Norway/Nord Pool day-ahead spot price fetcher.
//!
//! A direct generalization of the original single-area Nord Pool client:
//! same endpoint, same VAT/markup composition shape, widened from a fixed
//! delivery area to whichever `NO1..NO5`/`SE` area the household configures.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use ureq::Agent;

use crate::config::TariffFees;
use crate::price::errors::PriceError;
use crate::price::models::PriceEntry;

#[derive(Deserialize, Debug)]
struct EntryPerArea(std::collections::HashMap<String, f64>);

#[derive(Deserialize, Debug)]
struct MultiAreaEntry {
    #[serde(rename = "deliveryStart")]
    delivery_start: DateTime<Utc>,
    #[serde(rename = "entryPerArea")]
    entry_per_area: EntryPerArea,
}

#[derive(Deserialize, Debug)]
struct DayAheadPrices {
    #[serde(rename = "multiAreaEntries")]
    multi_area_entries: Vec<MultiAreaEntry>,
}

pub struct NordPoolFetcher {
    agent: Agent,
    area: String,
    fees: TariffFees,
}

impl NordPoolFetcher {
    /// Returns a new instance of the fetcher for a given delivery area.
    ///
    /// # Arguments
    ///
    /// * 'area' - Nord Pool delivery area, e.g. "NO1"
    /// * 'fees' - grid tariff / VAT markup configuration
    pub fn new(area: &str, fees: TariffFees) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(10)))
            .build();

        Self {
            agent: agent_config.into(),
            area: area.to_string(),
            fees,
        }
    }

    /// Fetches day-ahead prices for the local day identified by `day_date`,
    /// restricted to the `[day_start, day_end)` UTC window.
    ///
    /// # Arguments
    ///
    /// * 'day_start' - inclusive UTC start of the window
    /// * 'day_end' - exclusive UTC end of the window
    /// * 'day_date' - the calendar date to request from Nord Pool
    pub fn fetch_day(&self, day_start: DateTime<Utc>, day_end: DateTime<Utc>, day_date: NaiveDate) -> Result<Vec<PriceEntry>, PriceError> {
        let url = "https://dataportal-api.nordpoolgroup.com/api/DayAheadPrices";
        let date = format!("{}", day_date.format("%Y-%m-%d"));
        let query = vec![
            ("date", date.as_str()),
            ("market", "DayAhead"),
            ("deliveryArea", self.area.as_str()),
            ("currency", "NOK"),
        ];

        let mut response = self.agent.get(url).query_pairs(query).call()?;

        if response.status() == 204 {
            return Err(PriceError::NoContent);
        }

        let json = response.body_mut().read_to_string()?;
        let prices: DayAheadPrices = serde_json::from_str(&json)?;
        self.to_entries(&prices, day_start, day_end)
    }

    fn to_entries(&self, prices: &DayAheadPrices, day_start: DateTime<Utc>, day_end: DateTime<Utc>) -> Result<Vec<PriceEntry>, PriceError> {
        let n = prices.multi_area_entries.len();
        if n < 20 {
            return Err(PriceError::ContentLength(20, n));
        }

        let area = self.area.as_str();
        let day_avg = prices
            .multi_area_entries
            .iter()
            .filter_map(|e| e.entry_per_area.0.get(area))
            .sum::<f64>()
            / n as f64
            / 1000.0;

        let mut result = Vec::new();
        for e in &prices.multi_area_entries {
            if e.delivery_start >= day_start && e.delivery_start < day_end {
                if let Some(spot_per_mwh) = e.entry_per_area.0.get(area) {
                    result.push(self.markup(day_avg, *spot_per_mwh, e.delivery_start));
                }
            }
        }

        Ok(result)
    }

    /// Composes VAT and other markups on top of the raw spot price.
    ///
    /// # Arguments
    ///
    /// * 'day_avg' - average spot price for the day, NOK/kWh ex-VAT
    /// * 'spot_per_mwh' - the raw spot price, NOK/MWh
    /// * 'starts_at' - the hour this price applies to
    fn markup(&self, day_avg: f64, spot_per_mwh: f64, starts_at: DateTime<Utc>) -> PriceEntry {
        let spot_ex_vat = spot_per_mwh / 1000.0;
        let _ = day_avg;

        let mut entry = PriceEntry {
            starts_at,
            total: 0.0,
            spot_price_ex_vat: Some(round_two(spot_ex_vat)),
            grid_tariff_ex_vat: Some(round_two(self.fees.grid_tariff_ore / 100.0)),
            provider_surcharge_ex_vat: Some(round_two(self.fees.provider_surcharge_ore / 100.0)),
            consumption_tax_ex_vat: Some(round_two(self.fees.consumption_tax_ore / 100.0)),
            enova_fee_ex_vat: Some(round_two(self.fees.enova_fee_ore / 100.0)),
            vat_multiplier: None,
            vat_amount: None,
            electricity_support: None,
            norgespris_adjustment: None,
            total_ex_vat: None,
            is_cheap: false,
            is_expensive: false,
        };
        recompute_total(&mut entry, &self.fees);
        entry
    }
}

pub(crate) fn round_two(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Recomputes `total`/`total_ex_vat`/`vat_amount`/`electricity_support`/
/// `norgespris_adjustment` from an entry's ex-VAT breakdown fields and the
/// given fee configuration - the sole place that formula lives, so both a
/// fresh Nord Pool fetch and a later grid-tariff overlay
/// (`PriceService::apply_fetched_tariff`) agree on it.
///
/// `total ≈ (spot + tariff + surcharge + tax + enova) × vat − support +
/// norgespris`, matching spec.md:39's invariant. Support compensates the
/// share of spot price above a threshold; Norgespris, when enabled, caps
/// the total at a flat incl-VAT price via the adjustment field.
pub(crate) fn recompute_total(entry: &mut PriceEntry, fees: &TariffFees) {
    let spot_ex_vat = entry.spot_price_ex_vat.unwrap_or(0.0);
    let grid_tariff_ex_vat = entry.grid_tariff_ex_vat.unwrap_or(0.0);
    let provider_surcharge_ex_vat = entry.provider_surcharge_ex_vat.unwrap_or(0.0);
    let consumption_tax_ex_vat = entry.consumption_tax_ex_vat.unwrap_or(0.0);
    let enova_fee_ex_vat = entry.enova_fee_ex_vat.unwrap_or(0.0);
    let vat_multiplier = if fees.vat_multiplier > 0.0 { fees.vat_multiplier } else { 1.25 };

    let total_ex_vat = spot_ex_vat + grid_tariff_ex_vat + provider_surcharge_ex_vat + consumption_tax_ex_vat + enova_fee_ex_vat;

    let electricity_support = if fees.electricity_support_enabled {
        let threshold_ex_vat = fees.electricity_support_threshold_ore / 100.0;
        Some(round_two((spot_ex_vat - threshold_ex_vat).max(0.0) * fees.electricity_support_rate))
    } else {
        None
    };

    let total_before_norgespris = round_two(total_ex_vat * vat_multiplier) - electricity_support.unwrap_or(0.0);

    let norgespris_adjustment = if fees.norgespris_enabled {
        let norgespris_price = fees.norgespris_price_ore / 100.0;
        Some(round_two(norgespris_price - total_before_norgespris))
    } else {
        None
    };

    entry.total_ex_vat = Some(round_two(total_ex_vat));
    entry.vat_multiplier = Some(vat_multiplier);
    entry.vat_amount = Some(round_two(total_ex_vat * (vat_multiplier - 1.0)));
    entry.electricity_support = electricity_support;
    entry.norgespris_adjustment = norgespris_adjustment;
    entry.total = round_two(total_before_norgespris + norgespris_adjustment.unwrap_or(0.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_composes_ex_vat_components() {
        let fetcher = NordPoolFetcher::new("NO1", TariffFees {
            vat_multiplier: 1.25,
            grid_tariff_ore: 30.0,
            provider_surcharge_ore: 5.0,
            consumption_tax_ore: 10.0,
            enova_fee_ore: 1.0,
            ..Default::default()
        });
        let entry = fetcher.markup(0.5, 500.0, Utc::now());
        assert!((entry.total_ex_vat.unwrap() - 0.96).abs() < 1e-6);
        assert!((entry.total - 1.2).abs() < 1e-6);
        assert!(entry.electricity_support.is_none());
        assert!(entry.norgespris_adjustment.is_none());
    }

    #[test]
    fn electricity_support_deducts_share_of_spot_above_threshold() {
        let fetcher = NordPoolFetcher::new("NO1", TariffFees {
            vat_multiplier: 1.25,
            electricity_support_enabled: true,
            electricity_support_threshold_ore: 73.0,
            electricity_support_rate: 0.9,
            ..Default::default()
        });
        // spot_ex_vat = 1.50 NOK/kWh = 150 ore, well above the 73 ore threshold.
        let entry = fetcher.markup(0.0, 1500.0, Utc::now());
        let expected_support = (1.50 - 0.73) * 0.9;
        assert!((entry.electricity_support.unwrap() - expected_support).abs() < 1e-6);
        assert!((entry.total - (round_two(1.50 * 1.25) - round_two(expected_support))).abs() < 1e-6);
    }

    #[test]
    fn electricity_support_is_zero_below_threshold() {
        let fetcher = NordPoolFetcher::new("NO1", TariffFees {
            vat_multiplier: 1.25,
            electricity_support_enabled: true,
            electricity_support_threshold_ore: 73.0,
            electricity_support_rate: 0.9,
            ..Default::default()
        });
        // spot_ex_vat = 0.50 NOK/kWh, below the 0.73 threshold.
        let entry = fetcher.markup(0.0, 500.0, Utc::now());
        assert_eq!(entry.electricity_support, Some(0.0));
    }

    #[test]
    fn norgespris_caps_total_at_the_flat_price() {
        let fetcher = NordPoolFetcher::new("NO1", TariffFees {
            vat_multiplier: 1.25,
            grid_tariff_ore: 30.0,
            norgespris_enabled: true,
            norgespris_price_ore: 40.0,
            ..Default::default()
        });
        let entry = fetcher.markup(0.0, 1500.0, Utc::now());
        assert!((entry.total - 0.40).abs() < 1e-6);
        assert!(entry.norgespris_adjustment.unwrap() < 0.0);
    }
}
