use std::collections::HashMap;
use std::fs;
use log::LevelFilter;
use serde::Deserialize;

use crate::errors::ConfigError;

/// Household location, used only to resolve the configured time zone.
#[derive(Deserialize, Clone)]
pub struct GeoRef {
    pub time_zone: String,
}

/// Instantaneous-kW capacity guard configuration.
#[derive(Deserialize, Clone)]
pub struct Capacity {
    pub limit_kw: f64,
    pub soft_margin_kw: f64,
    #[serde(default = "default_hysteresis_margin_kw")]
    pub hysteresis_margin_kw: f64,
    #[serde(default = "default_sustained_clear_ms")]
    pub sustained_clear_ms: i64,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_hysteresis_margin_kw() -> f64 {
    0.2
}

fn default_sustained_clear_ms() -> i64 {
    60_000
}

/// Daily kWh budget configuration.
#[derive(Deserialize, Clone)]
pub struct DailyBudget {
    pub daily_budget_kwh: f64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub price_shaping_enabled: bool,
    #[serde(default)]
    pub breakdown_enabled: bool,
    #[serde(default = "default_controlled_weight")]
    pub controlled_weight: f64,
    #[serde(default = "default_flex_share")]
    pub price_flex_share: f64,
    #[serde(default = "default_observed_peak_margin")]
    pub observed_peak_margin_ratio: f64,
}

fn default_controlled_weight() -> f64 {
    1.0
}
fn default_flex_share() -> f64 {
    0.3
}
fn default_observed_peak_margin() -> f64 {
    0.1
}

/// Price scheme/classification configuration.
#[derive(Deserialize, Clone)]
pub struct PriceConfig {
    pub scheme: String, // "norway" | "flow" | "homey"
    #[serde(default)]
    pub area: String, // e.g. "NO1".."NO5"
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f64,
    #[serde(default = "default_min_diff_ore")]
    pub min_diff_ore: f64,
    #[serde(default)]
    pub optimization_enabled: bool,
    #[serde(default)]
    pub tariff_fees: TariffFees,
}

fn default_threshold_percent() -> f64 {
    10.0
}
fn default_min_diff_ore() -> f64 {
    5.0
}

/// Grid tariff / VAT markup fees, same composition as the Nord Pool
/// manager's price but decoupled from `[price]` so the grid-tariff
/// fetcher can reuse it too.
#[derive(Deserialize, Clone, Default)]
pub struct TariffFees {
    #[serde(default)]
    pub vat_multiplier: f64,
    #[serde(default)]
    pub grid_tariff_ore: f64,
    #[serde(default)]
    pub provider_surcharge_ore: f64,
    #[serde(default)]
    pub consumption_tax_ore: f64,
    #[serde(default)]
    pub enova_fee_ore: f64,
    /// Whether the spot-above-threshold electricity support ("strømstøtte")
    /// deduction is computed and folded into `Price::total`.
    #[serde(default)]
    pub electricity_support_enabled: bool,
    /// Ex-VAT spot price (øre/kWh) above which support compensates.
    #[serde(default = "default_support_threshold_ore")]
    pub electricity_support_threshold_ore: f64,
    /// Share of the above-threshold amount compensated, e.g. 0.9 = 90%.
    #[serde(default = "default_support_rate")]
    pub electricity_support_rate: f64,
    /// Whether the flat-price Norgespris cap replaces the spot-derived
    /// total via `norgespris_adjustment`.
    #[serde(default)]
    pub norgespris_enabled: bool,
    /// Flat incl-VAT price (øre/kWh) Norgespris caps the total at.
    #[serde(default = "default_norgespris_price_ore")]
    pub norgespris_price_ore: f64,
}

fn default_support_threshold_ore() -> f64 {
    73.0
}
fn default_support_rate() -> f64 {
    0.9
}
fn default_norgespris_price_ore() -> f64 {
    40.0
}

/// Grid-tariff lookup keys (`nettleie_fylke`/`_orgnr`/`_tariffgruppe`),
/// loaded once at startup and handed to the price service.
#[derive(Deserialize, Clone, Default)]
pub struct Nettleie {
    #[serde(default)]
    pub fylke: String,
    #[serde(default)]
    pub orgnr: String,
    #[serde(default)]
    pub tariffgruppe: String,
}

/// One controllable or observed device, statically declared here since
/// device-brand enumeration is out of scope and the in-process
/// `InMemoryDeviceHost` needs a fleet to seed.
#[derive(Deserialize, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub zone: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub priority: i32,
    #[serde(default)]
    pub controllable: bool,
    #[serde(default)]
    pub price_optimizable: bool,
    #[serde(default = "default_overshoot_policy")]
    pub overshoot_policy: String,
    #[serde(default)]
    pub target_temperature: Option<f64>,
    #[serde(default)]
    pub cheap_delta: f64,
    #[serde(default)]
    pub expensive_delta: f64,
    #[serde(default)]
    pub overshoot_delta: f64,
    #[serde(default)]
    pub expected_power_kw_fallback: f64,
}

fn default_overshoot_policy() -> String {
    "power_off".to_string()
}

#[derive(Deserialize, Clone)]
pub struct MailParameters {
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_endpoint: String,
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Clone)]
pub struct Files {
    pub state_dir: String,
}

#[derive(Deserialize, Clone)]
pub struct General {
    pub log_path: String,
    pub log_level: LevelFilter,
    pub log_to_stdout: bool,
}

/// Scheduler tick intervals, all in milliseconds.
#[derive(Deserialize, Clone)]
pub struct Intervals {
    #[serde(default = "default_fast_tick_ms")]
    pub fast_tick_ms: u64,
    #[serde(default = "default_hourly_rebuild_ms")]
    pub hourly_rebuild_ms: u64,
    #[serde(default = "default_price_refresh_ms")]
    pub price_refresh_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub settings_debounce_ms: u64,
}

fn default_fast_tick_ms() -> u64 {
    3_000
}
fn default_hourly_rebuild_ms() -> u64 {
    3_600_000
}
fn default_price_refresh_ms() -> u64 {
    3 * 3_600_000
}
fn default_debounce_ms() -> u64 {
    250
}

impl Default for Intervals {
    fn default() -> Self {
        Intervals {
            fast_tick_ms: default_fast_tick_ms(),
            hourly_rebuild_ms: default_hourly_rebuild_ms(),
            price_refresh_ms: default_price_refresh_ms(),
            settings_debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub geo_ref: GeoRef,
    pub capacity: Capacity,
    pub daily_budget: DailyBudget,
    pub price: PriceConfig,
    #[serde(default)]
    pub nettleie: Nettleie,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default = "default_operating_mode")]
    pub operating_mode: String,
    /// Per-mode target-temperature overrides (`mode -> device_id -> target`),
    /// the config-file default for the `mode_device_targets` persisted key;
    /// a runtime write to that key (flow-card driven) takes precedence.
    #[serde(default)]
    pub modes: HashMap<String, HashMap<String, f64>>,
    pub mail: MailParameters,
    pub files: Files,
    pub general: General,
    #[serde(default)]
    pub intervals: Intervals,
}

fn default_operating_mode() -> String {
    "normal".to_string()
}

/// Loads the configuration file and returns a struct with all configuration
/// items.
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub fn load_config(config_path: &str) -> Result<Config, ConfigError> {
    let toml = fs::read_to_string(config_path)?;
    let config: Config = toml::from_str(&toml)?;

    Ok(config)
}
