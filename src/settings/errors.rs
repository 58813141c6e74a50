use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SettingsError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SettingsError::Poisoned(e.to_string())
    }
}
