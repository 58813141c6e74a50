use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable price record keyed by the start of a clock hour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceEntry {
    pub starts_at: DateTime<Utc>,
    pub total: f64,
    pub spot_price_ex_vat: Option<f64>,
    pub grid_tariff_ex_vat: Option<f64>,
    pub provider_surcharge_ex_vat: Option<f64>,
    pub consumption_tax_ex_vat: Option<f64>,
    pub enova_fee_ex_vat: Option<f64>,
    pub vat_multiplier: Option<f64>,
    pub vat_amount: Option<f64>,
    pub electricity_support: Option<f64>,
    pub norgespris_adjustment: Option<f64>,
    pub total_ex_vat: Option<f64>,
    pub is_cheap: bool,
    pub is_expensive: bool,
}

impl PriceEntry {
    /// Builds a bare entry carrying only a total - used for flow/homey
    /// sources that never supply a breakdown.
    pub fn bare(starts_at: DateTime<Utc>, total: f64) -> Self {
        PriceEntry {
            starts_at,
            total,
            spot_price_ex_vat: None,
            grid_tariff_ex_vat: None,
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
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceScheme {
    Norway,
    Flow,
    Homey,
}

impl std::str::FromStr for PriceScheme {
    type Err = super::errors::PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "norway" => Ok(PriceScheme::Norway),
            "flow" => Ok(PriceScheme::Flow),
            "homey" => Ok(PriceScheme::Homey),
            other => Err(super::errors::PriceError::UnknownScheme(other.to_string())),
        }
    }
}

/// The recomputed, combined hourly price series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedPriceSeries {
    pub entries: Vec<PriceEntry>,
    pub avg_price: f64,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub threshold_percent: f64,
    pub min_diff_ore: f64,
    pub price_scheme: PriceScheme,
    pub price_unit: String,
    pub last_fetched: DateTime<Utc>,
}

impl CombinedPriceSeries {
    pub fn empty(scheme: PriceScheme, threshold_percent: f64, min_diff_ore: f64, now: DateTime<Utc>) -> Self {
        CombinedPriceSeries {
            entries: Vec::new(),
            avg_price: 0.0,
            low_threshold: 0.0,
            high_threshold: 0.0,
            threshold_percent,
            min_diff_ore,
            price_scheme: scheme,
            price_unit: "ore/kWh".to_string(),
            last_fetched: now,
        }
    }

    pub fn entry_at(&self, hour_start: DateTime<Utc>) -> Option<&PriceEntry> {
        self.entries.iter().find(|e| e.starts_at == hour_start)
    }
}

/// An external flow/Homey source's per-hour mapping for a single day,
/// persisted under `flow_prices_today`/`flow_prices_tomorrow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayPrices {
    pub date_key: String,
    pub prices_by_hour: Vec<Option<f64>>, // index 0..23 (or 0..24/25 on DST days)
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayKind {
    Today,
    Tomorrow,
}
