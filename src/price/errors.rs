use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriceError {
    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Network(#[from] ureq::Error),
    #[error("no content returned")]
    NoContent,
    #[error("unexpected content length, expected at least {0} entries, got {1}")]
    ContentLength(usize, usize),
    #[error("unknown price scheme: {0}")]
    UnknownScheme(String),
    #[error("invalid flow payload: {0}")]
    InvalidFlowPayload(String),
    #[error("missing hours in flow payload: {0:?}")]
    MissingHours(Vec<usize>),
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::errors::SettingsError),
    #[error("time error: {0}")]
    Time(#[from] crate::time_utils::TimeError),
}
