use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::config::{load_config, Config, DeviceConfig};
use crate::device::{CapabilityId, DeviceDescriptor, DeviceHost, InMemoryDeviceHost};
use crate::device_plan::{DevicePolicy, OvershootPolicy};
use crate::errors::ControlInitError;
use crate::logging::setup_logger;
use crate::notify::{MailNotifier, Notifier};
use crate::orchestrator::Orchestrator;
use crate::price::PriceService;
use crate::settings::{FileSettingsHost, SettingsHost};

/// Everything `main` needs to hand off to the orchestrator once started.
pub struct Mgr {
    pub orchestrator: Arc<Orchestrator>,
}

/// Loads configuration, wires the settings/device/price/notifier
/// collaborators, and returns a ready-to-spawn orchestrator.
///
/// # Arguments
///
/// * none - the config path is read from the process's `--config=` argument
pub fn init() -> Result<(Config, Mgr), ControlInitError> {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .iter()
        .find(|p| p.starts_with("--config="))
        .ok_or(ControlInitError::MissingConfigArg)?
        .split_once('=')
        .ok_or(ControlInitError::MissingConfigArg)?
        .1;

    let config = load_config(config_path)?;

    let _ = setup_logger(&config.general.log_path, config.general.log_level, config.general.log_to_stdout)?;

    info!("starting mygrid control version: {}", env!("CARGO_PKG_VERSION"));

    let settings: Arc<dyn SettingsHost> =
        Arc::new(FileSettingsHost::open(Path::new(&config.files.state_dir).join("settings.json"))?);

    let device_host: Arc<dyn DeviceHost> = Arc::new(InMemoryDeviceHost::new(
        config.devices.iter().map(device_descriptor).collect(),
    ));

    let price_service = Arc::new(
        PriceService::new(&config.price, &config.geo_ref.time_zone, settings.clone(), None)?
            .with_tariff_keys(&config.nettleie.fylke, &config.nettleie.orgnr, &config.nettleie.tariffgruppe),
    );

    let notifier: Option<Arc<dyn Notifier>> = Some(Arc::new(MailNotifier::new(&config.mail)?));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        settings,
        device_host,
        None,
        price_service,
        notifier,
    ));
    orchestrator.set_policies(device_policies(&config.devices));

    Ok((config, Mgr { orchestrator }))
}

fn device_descriptor(d: &DeviceConfig) -> DeviceDescriptor {
    DeviceDescriptor {
        id: d.id.clone(),
        name: d.name.clone(),
        zone: d.zone.clone(),
        capabilities: d.capabilities.iter().map(|c| CapabilityId::from(c.as_str())).collect(),
    }
}

fn device_policies(devices: &[DeviceConfig]) -> HashMap<String, DevicePolicy> {
    devices
        .iter()
        .map(|d| {
            let policy = DevicePolicy {
                priority: d.priority,
                controllable: d.controllable,
                price_optimizable: d.price_optimizable,
                overshoot_policy: match d.overshoot_policy.as_str() {
                    "set_temperature" => OvershootPolicy::SetTemperature,
                    _ => OvershootPolicy::PowerOff,
                },
                target_temperature: d.target_temperature,
                cheap_delta: d.cheap_delta,
                expensive_delta: d.expensive_delta,
                overshoot_delta: d.overshoot_delta,
                expected_power_kw_fallback: d.expected_power_kw_fallback,
            };
            (d.id.clone(), policy)
        })
        .collect()
}
