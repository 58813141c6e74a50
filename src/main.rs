use std::thread;
use std::time::Duration;

use anyhow::Result;
use rayon::ThreadPoolBuilder;

use crate::initialization::init;

mod budget_planner;
mod capacity_guard;
mod config;
mod device;
mod device_plan;
mod errors;
mod initialization;
mod logging;
mod macros;
mod notify;
mod orchestrator;
mod power_tracker;
mod price;
mod settings;
mod time_utils;

/// Entry point for the continuously running control service. All
/// CLI/packaging glue beyond a bare `--config=` flag is out of scope - the
/// process runs until killed, there is no graceful-shutdown signal handling
/// here.
fn main() -> Result<()> {
    ThreadPoolBuilder::new().num_threads(2).build_global()?;

    // Load config and wire every collaborator. If initialization fails we
    // are pretty much out of luck and can't even log or notify.
    let (_config, mgr) = match init() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("initialization failed: {}", e);
            return Err(e)?;
        }
    };

    // `spawn` starts the fast tick, hourly rebuild, price refresh, settings
    // listener and CPU-spike monitor threads; the handle is only needed to
    // release them on an orderly shutdown, which this long-running service
    // never initiates on its own.
    let _handle = mgr.orchestrator.clone().spawn();

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

