use std::sync::PoisonError;
use thiserror::Error;

use crate::notify::NotifyError;

/// Errors that occur during startup, before the orchestrator's loops exist.
#[derive(Error, Debug)]
pub enum ControlInitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::errors::SettingsError),
    #[error("price service error: {0}")]
    Price(#[from] crate::price::errors::PriceError),
    #[error("missing or malformed --config= argument")]
    MissingConfigArg,
    #[error("lock poisoned during startup: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for ControlInitError {
    fn from(e: PoisonError<T>) -> Self {
        ControlInitError::Poisoned(e.to_string())
    }
}

/// Errors surfaced by the orchestrator's tick loops. These are
/// logged and, where the loop can recover (a failed price refresh, a single
/// bad tick), do not stop the orchestrator - only startup-time variants are
/// fatal.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("price service error: {0}")]
    Price(#[from] crate::price::errors::PriceError),
    #[error("power tracker error: {0}")]
    Tracker(#[from] crate::power_tracker::TrackerError),
    #[error("budget planner error: {0}")]
    Planner(#[from] crate::budget_planner::PlannerError),
    #[error("device plan error: {0}")]
    DevicePlan(#[from] crate::device_plan::DevicePlanError),
    #[error("capacity guard error: {0}")]
    Guard(#[from] crate::capacity_guard::GuardError),
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::errors::SettingsError),
    #[error("device host error: {0}")]
    Device(#[from] crate::device::errors::DeviceError),
    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),
    #[error("time error: {0}")]
    Time(#[from] crate::time_utils::TimeError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for OrchestratorError {
    fn from(e: PoisonError<T>) -> Self {
        OrchestratorError::Poisoned(e.to_string())
    }
}

/// Errors that occur while loading or validating configuration, kept
/// separate from `ControlInitError` since `logging::setup_logger` also
/// needs to report failures before the rest of startup runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("log configuration error: {0}")]
    LogConfig(#[from] log4rs::config::runtime::ConfigErrors),
    #[error("logger already initialized: {0}")]
    LoggerInit(#[from] log::SetLoggerError),
    #[error("{0}")]
    Invalid(String),
}

impl From<&str> for ConfigError {
    fn from(e: &str) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}
