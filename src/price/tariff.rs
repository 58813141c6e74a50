//! Grid-tariff fetch and normalization.
//!
//! The upstream feed uses Norwegian field names (`energileddEks/Ink`,
//! `fastleddEks/Ink`, `datoId`); this module normalizes them into the
//! English snake-case fields the rest of the crate expects, the same
//! header-mapping style the Nord Pool fetcher uses for its own payload.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::price::errors::PriceError;

#[derive(Deserialize, Debug)]
struct RawTariffEntry {
    #[serde(rename = "datoId")]
    dato_id: String,
    #[serde(rename = "energileddEks")]
    energiledd_eks: f64,
    #[serde(rename = "energileddInk")]
    energiledd_ink: f64,
    #[serde(rename = "fastleddEks")]
    fastledd_eks: f64,
    #[serde(rename = "fastleddInk")]
    fastledd_ink: f64,
}

/// Normalized grid-tariff entry, cached under `nettleie_data_full` and
/// read back by `PriceService::apply_fetched_tariff` to overlay the real
/// fetched tariff onto each price's `grid_tariff_ex_vat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTariffEntry {
    pub date_key: String,
    pub energy_fee_ex_vat: f64,
    pub energy_fee_inc_vat: f64,
    pub fixed_fee_ex_vat: f64,
    pub fixed_fee_inc_vat: f64,
}

pub struct GridTariffFetcher {
    agent: ureq::Agent,
    fylke: String,
    orgnr: String,
    tariffgruppe: String,
}

impl GridTariffFetcher {
    /// Returns a new fetcher for the configured county/grid-owner/tariff
    /// group triple (`nettleie_fylke`/`_orgnr`/`_tariffgruppe`).
    pub fn new(fylke: &str, orgnr: &str, tariffgruppe: &str) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(10)))
            .build();

        Self {
            agent: agent_config.into(),
            fylke: fylke.to_string(),
            orgnr: orgnr.to_string(),
            tariffgruppe: tariffgruppe.to_string(),
        }
    }

    /// Fetches hourly grid-tariff entries for `date`. Callers retry with
    /// yesterday / 7 days ago / 1 month ago, in that order, when this
    /// returns an empty vector.
    ///
    /// # Arguments
    ///
    /// * 'date' - the calendar date to fetch tariff data for
    pub fn fetch_day(&self, date: NaiveDate) -> Result<Vec<GridTariffEntry>, PriceError> {
        let url = "https://www.nve.no/api/nettleie";
        let date_str = date.format("%Y-%m-%d").to_string();
        let query = vec![
            ("fylke", self.fylke.as_str()),
            ("orgnr", self.orgnr.as_str()),
            ("tariffgruppe", self.tariffgruppe.as_str()),
            ("dato", date_str.as_str()),
        ];

        let mut response = self.agent.get(url).query_pairs(query).call()?;
        if response.status() == 204 {
            return Ok(Vec::new());
        }

        let json = response.body_mut().read_to_string()?;
        let raw: Vec<RawTariffEntry> = serde_json::from_str(&json).unwrap_or_default();

        Ok(raw.into_iter().map(normalize).collect())
    }
}

fn normalize(raw: RawTariffEntry) -> GridTariffEntry {
    GridTariffEntry {
        date_key: raw.dato_id,
        energy_fee_ex_vat: raw.energiledd_eks,
        energy_fee_inc_vat: raw.energiledd_ink,
        fixed_fee_ex_vat: raw.fastledd_eks,
        fixed_fee_inc_vat: raw.fastledd_ink,
    }
}

/// Returns the fallback calendar dates to retry a tariff fetch against, in
/// order: yesterday, 7 days ago, 1 month ago - relative to `reference`.
pub fn fallback_dates(reference: DateTime<Utc>) -> Vec<NaiveDate> {
    let today = reference.date_naive();
    vec![
        today - chrono::Duration::days(1),
        today - chrono::Duration::days(7),
        today - chrono::Months::new(1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_norwegian_field_names() {
        let raw = RawTariffEntry {
            dato_id: "2025-06-01".to_string(),
            energiledd_eks: 0.3,
            energiledd_ink: 0.375,
            fastledd_eks: 50.0,
            fastledd_ink: 62.5,
        };
        let n = normalize(raw);
        assert_eq!(n.date_key, "2025-06-01");
        assert!((n.energy_fee_inc_vat - 0.375).abs() < 1e-9);
    }
}
