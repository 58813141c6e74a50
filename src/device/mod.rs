//! Device/energy host contracts.
//!
//! Two small traits so any home-automation host can be plugged in without
//! a per-brand struct or a deep inheritance chain; device-brand-specific
//! quirks stay out of scope.

pub mod errors;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::device::errors::DeviceError;

pub type DeviceId = String;
pub type CapabilityId = String;

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CapabilityValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CapabilityValue::Number(n) => Some(*n),
            CapabilityValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            CapabilityValue::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            CapabilityValue::Number(n) => Some(*n != 0.0),
            CapabilityValue::Text(_) => None,
        }
    }
}

/// A device as enumerated by the host, with the capability ids it actually
/// exposes - a runtime feature-probe rather than a compile-time trait object
/// per brand.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub zone: String,
    pub capabilities: Vec<CapabilityId>,
}

impl DeviceDescriptor {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

pub const CAP_ONOFF: &str = "onoff";
pub const CAP_MEASURE_POWER: &str = "measure_power";
pub const CAP_METER_POWER: &str = "meter_power";
pub const CAP_TARGET_TEMPERATURE: &str = "target_temperature";

/// Enumeration, capability read/write, and change subscription over a
/// fleet of devices.
pub trait DeviceHost: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;
    fn get_capability(&self, device_id: &DeviceId, cap: &CapabilityId) -> Result<CapabilityValue, DeviceError>;
    fn set_capability(&self, device_id: &DeviceId, cap: &CapabilityId, value: CapabilityValue) -> Result<(), DeviceError>;
}

/// Dynamic price fetch and currency lookup for the Homey price scheme.
pub trait EnergyHost: Send + Sync {
    fn fetch_dynamic_prices(&self, date_key: &str) -> Result<Vec<(DateTime<Utc>, f64)>, DeviceError>;
    fn currency(&self) -> String;
}

/// In-process reference implementation of `DeviceHost`, suitable for local
/// runs and tests; production deployments plug in their own host-SDK-backed
/// implementation.
pub struct InMemoryDeviceHost {
    devices: std::sync::RwLock<HashMap<DeviceId, DeviceDescriptor>>,
    state: std::sync::RwLock<HashMap<(DeviceId, CapabilityId), CapabilityValue>>,
}

impl InMemoryDeviceHost {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        let mut map = HashMap::new();
        for d in devices {
            map.insert(d.id.clone(), d);
        }
        Self {
            devices: std::sync::RwLock::new(map),
            state: std::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl DeviceHost for InMemoryDeviceHost {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.devices.read().unwrap().values().cloned().collect())
    }

    fn get_capability(&self, device_id: &DeviceId, cap: &CapabilityId) -> Result<CapabilityValue, DeviceError> {
        let devices = self.devices.read().unwrap();
        let descriptor = devices.get(device_id).ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;
        if !descriptor.has_capability(cap) {
            return Err(DeviceError::CapabilityMissing(cap.clone(), device_id.clone()));
        }
        drop(devices);

        let state = self.state.read().unwrap();
        Ok(state.get(&(device_id.clone(), cap.clone())).cloned().unwrap_or(CapabilityValue::Bool(false)))
    }

    fn set_capability(&self, device_id: &DeviceId, cap: &CapabilityId, value: CapabilityValue) -> Result<(), DeviceError> {
        let devices = self.devices.read().unwrap();
        let descriptor = devices.get(device_id).ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;
        if !descriptor.has_capability(cap) {
            return Err(DeviceError::CapabilityMissing(cap.clone(), device_id.clone()));
        }
        drop(devices);

        self.state.write().unwrap().insert((device_id.clone(), cap.clone()), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            id: "dev-1".to_string(),
            name: "Floor heater".to_string(),
            zone: "Bathroom".to_string(),
            capabilities: vec![CAP_ONOFF.to_string(), CAP_MEASURE_POWER.to_string()],
        }
    }

    #[test]
    fn set_then_get_capability_round_trips() {
        let host = InMemoryDeviceHost::new(vec![descriptor()]);
        host.set_capability(&"dev-1".to_string(), &CAP_ONOFF.to_string(), CapabilityValue::Bool(true)).unwrap();
        let v = host.get_capability(&"dev-1".to_string(), &CAP_ONOFF.to_string()).unwrap();
        assert_eq!(v.as_bool(), Some(true));
    }

    #[test]
    fn missing_capability_degrades_to_error_not_panic() {
        let host = InMemoryDeviceHost::new(vec![descriptor()]);
        let err = host.get_capability(&"dev-1".to_string(), &CAP_TARGET_TEMPERATURE.to_string());
        assert!(err.is_err());
    }

    #[test]
    fn unknown_device_is_reported() {
        let host = InMemoryDeviceHost::new(vec![]);
        let err = host.get_capability(&"missing".to_string(), &CAP_ONOFF.to_string());
        assert!(matches!(err, Err(DeviceError::NotFound(_))));
    }
}
