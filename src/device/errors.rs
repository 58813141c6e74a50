use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("capability not present: {0} on device {1}")]
    CapabilityMissing(String, String),
    #[error("device call failed for {device_id}: {source}")]
    CallFailed { device_id: String, source: String },
    #[error("energy host error: {0}")]
    EnergyHost(String),
}
