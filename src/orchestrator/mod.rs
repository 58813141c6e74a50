//! Scheduler / orchestrator.
//!
//! Three cooperating `std::thread` loops (fast tick, hourly rebuild, price
//! refresh) plus an `mpsc`-channel-driven settings-change debounce/
//! coalescing loop and a CPU-spike monitor thread.

pub mod rebuild_queue;
pub mod trace;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::budget_planner::{self, DailyPlan, DailyPlanInput};
use crate::capacity_guard::{Actuator, CapacityGuard, GuardError};
use crate::config::Config;
use crate::device::{CapabilityValue, DeviceHost, DeviceId, EnergyHost, CAP_MEASURE_POWER, CAP_METER_POWER, CAP_ONOFF, CAP_TARGET_TEMPERATURE};
use crate::device_plan::{self, DevicePlan, DevicePlanInput, DevicePolicy, PlannedState, ShedAction};
use crate::errors::OrchestratorError;
use crate::notify::Notifier;
use crate::orchestrator::rebuild_queue::RebuildQueue;
use crate::orchestrator::trace::{RebuildTrace, Telemetry};
use crate::power_tracker::PowerTracker;
use crate::price::PriceService;
use crate::settings::{is_snapshot_only, SettingsHost};
use crate::time_utils::{date_key, day_buckets, top_of_hour};

/// A device host adapter that implements the capacity guard's `Actuator`
/// contract by issuing `onoff=false`.
struct DeviceHostActuator {
    host: Arc<dyn DeviceHost>,
}

impl Actuator for DeviceHostActuator {
    fn turn_off(&self, device_id: &DeviceId) -> Result<(), GuardError> {
        self.host
            .set_capability(device_id, &CAP_ONOFF.to_string(), CapabilityValue::Bool(false))
            .map_err(|e| GuardError::ActuatorFailed { device_id: device_id.clone(), source: e.to_string() })
    }
}

/// Wires together all five subsystems behind three cooperating tasks
/// (fast tick, hourly rebuild, price refresh), plus settings-change
/// debounce and a CPU-spike monitor.
pub struct Orchestrator {
    settings: Arc<dyn SettingsHost>,
    device_host: Arc<dyn DeviceHost>,
    #[allow(dead_code)]
    energy_host: Option<Arc<dyn EnergyHost>>,
    price_service: Arc<PriceService>,
    notifier: Option<Arc<dyn Notifier>>,
    telemetry: Arc<Telemetry>,
    rebuild_queue: Arc<RebuildQueue>,
    guard: Mutex<CapacityGuard>,
    tracker: Mutex<PowerTracker>,
    policies: RwLock<HashMap<DeviceId, DevicePolicy>>,
    zone: String,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        settings: Arc<dyn SettingsHost>,
        device_host: Arc<dyn DeviceHost>,
        energy_host: Option<Arc<dyn EnergyHost>>,
        price_service: Arc<PriceService>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let guard = CapacityGuard::new(
            config.capacity.limit_kw,
            config.capacity.soft_margin_kw,
            config.capacity.hysteresis_margin_kw,
            config.capacity.sustained_clear_ms,
            config.capacity.dry_run,
        );

        Orchestrator {
            zone: config.geo_ref.time_zone.clone(),
            settings,
            device_host,
            energy_host,
            price_service,
            notifier,
            telemetry: Arc::new(Telemetry::new()),
            rebuild_queue: Arc::new(RebuildQueue::new()),
            guard: Mutex::new(guard),
            tracker: Mutex::new(PowerTracker::new()),
            policies: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Replaces the per-device policy table (sourced from
    /// `capacity_priorities`/`mode_device_targets`/
    /// `price_optimization_settings`).
    pub fn set_policies(&self, policies: HashMap<DeviceId, DevicePolicy>) {
        *self.policies.write().unwrap() = policies;
    }

    /// Resolves the per-device policy table actually used by a rebuild:
    /// the static base table overlaid with the active `operating_mode`'s
    /// `mode_device_targets`. A runtime write to `mode_device_targets`
    /// (flow-card driven) takes precedence over the config-file default
    /// for the same mode; `operating_mode` itself is read from settings
    /// first, falling back to the config default.
    fn effective_policies(&self) -> HashMap<DeviceId, DevicePolicy> {
        let base = self.policies.read().unwrap().clone();

        let mode = self
            .settings
            .get("operating_mode")
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| self.config.operating_mode.clone());

        let dynamic: Option<HashMap<String, HashMap<DeviceId, f64>>> = self
            .settings
            .get("mode_device_targets")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok());

        let targets = dynamic
            .as_ref()
            .and_then(|m| m.get(&mode))
            .or_else(|| self.config.modes.get(&mode));

        device_plan::apply_mode_targets(&base, targets)
    }

    /// Records a fresh power sample in the tracker; called whenever a new
    /// sample arrives from the device layer, independent of the tick
    /// clocks.
    pub fn record_power_sample(&self, device_id: &DeviceId, power_w: f64, now: chrono::DateTime<Utc>) -> Result<(), OrchestratorError> {
        let controlled = self.policies.read().unwrap().get(device_id).map(|p| p.controllable).unwrap_or(false);
        self.tracker.lock().unwrap().record_power_sample(power_w, now, &self.zone, controlled)?;
        self.persist_tracker_snapshot()?;
        Ok(())
    }

    fn persist_tracker_snapshot(&self) -> Result<(), OrchestratorError> {
        let snapshot = self.tracker.lock().unwrap().to_snapshot()?;
        self.settings.set("power_tracker_state", snapshot)?;
        Ok(())
    }

    /// Spawns the fast tick, hourly rebuild, price refresh, settings-change
    /// listener and CPU-spike monitor threads, returning a handle whose
    /// `shutdown` releases every timer and listener.
    pub fn spawn(self: Arc<Self>) -> OrchestratorHandle {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify("mygrid_control started", "orchestrator tick loops are running") {
                warn!("startup notification failed: {}", e);
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        {
            let me = self.clone();
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(self.config.intervals.fast_tick_ms);
            threads.push(thread::spawn(move || fast_tick_loop(me, shutdown, interval)));
        }
        {
            let me = self.clone();
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(self.config.intervals.hourly_rebuild_ms);
            threads.push(thread::spawn(move || hourly_rebuild_loop(me, shutdown, interval)));
        }
        {
            let me = self.clone();
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(self.config.intervals.price_refresh_ms);
            threads.push(thread::spawn(move || price_refresh_loop(me, shutdown, interval)));
        }
        {
            let me = self.clone();
            let shutdown = shutdown.clone();
            let debounce = Duration::from_millis(self.config.intervals.settings_debounce_ms);
            let rx = self.settings.subscribe();
            threads.push(thread::spawn(move || settings_change_loop(me, shutdown, rx, debounce)));
        }
        {
            let me = self.clone();
            let shutdown = shutdown.clone();
            threads.push(thread::spawn(move || cpu_spike_monitor_loop(me, shutdown)));
        }

        OrchestratorHandle { threads, shutdown, rebuild_queue: self.rebuild_queue.clone(), notifier: self.notifier.clone() }
    }

    /// Runs one full rebuild cycle in a fixed order: read device
    /// capabilities and power samples -> compute daily plan -> compute
    /// device plan -> write device targets -> persist snapshot -> emit
    /// status. Never propagates a failure past this boundary - each stage
    /// is caught, logged, and recorded in the trace.
    pub fn run_rebuild(&self, reason: &str) {
        if !self.rebuild_queue.request(reason) {
            return;
        }

        let mut current_reason = reason.to_string();
        loop {
            let trace = self.rebuild_once(&current_reason);
            self.telemetry.traces.push(trace);

            match self.rebuild_queue.complete_and_take_queued() {
                Some(next_reason) => current_reason = next_reason,
                None => break,
            }
        }
    }

    fn rebuild_once(&self, reason: &str) -> RebuildTrace {
        let _span = self.telemetry.spans.enter("rebuild");
        let started_at = Utc::now();
        let mut trace = RebuildTrace { reason: reason.to_string(), started_at: Some(started_at), ..Default::default() };

        let result = self.rebuild_stages(&mut trace);

        if let Err(e) = result {
            error!("rebuild failed (reason={}): {}", reason, e);
            trace.failed = true;
        }

        trace
    }

    fn rebuild_stages(&self, trace: &mut RebuildTrace) -> Result<(), OrchestratorError> {
        let now = Utc::now();

        let t = Instant::now();
        let descriptors = self.device_host.enumerate()?;
        let policies = self.effective_policies();
        let mut measured: HashMap<DeviceId, f64> = HashMap::new();
        let mut capability_values: HashMap<(DeviceId, String), CapabilityValue> = HashMap::new();
        for d in &descriptors {
            for cap in [CAP_ONOFF, CAP_MEASURE_POWER, CAP_METER_POWER, CAP_TARGET_TEMPERATURE] {
                if d.has_capability(cap) {
                    if let Ok(v) = self.device_host.get_capability(&d.id, &cap.to_string()) {
                        capability_values.insert((d.id.clone(), cap.to_string()), v.clone());
                        if cap == CAP_MEASURE_POWER {
                            if let Some(w) = v.as_f64() {
                                measured.insert(d.id.clone(), (w / 1000.0).max(0.0));
                            }
                        }
                    }
                }
            }
        }
        trace.change_ms = t.elapsed().as_millis() as u64;

        let t = Instant::now();
        let daily_plan = self.compute_daily_plan(now)?;
        let prices = self.price_service.get_combined_hourly_prices().ok();
        let is_cheap = self.price_service.is_current_hour_cheap(now).unwrap_or(false);
        let is_expensive = self.price_service.is_current_hour_expensive(now).unwrap_or(false);

        let guard_soft_limit = self.guard.lock().unwrap().soft_limit_kw();
        let current_total_kw: f64 = measured.values().sum();

        let device_input = DevicePlanInput {
            descriptors: &descriptors,
            policies: &policies,
            measured_power_kw: &measured,
            capability_values: &capability_values,
            daily_plan: &daily_plan,
            prices: prices.as_ref(),
            is_current_hour_cheap: is_cheap,
            is_current_hour_expensive: is_expensive,
            soft_limit_kw: guard_soft_limit,
            current_hour_total_kw: current_total_kw,
        };
        let device_plan = device_plan::build_device_plan(&device_input)?;
        trace.build_ms += t.elapsed().as_millis() as u64;

        let t = Instant::now();
        self.apply_device_plan(&device_plan);
        trace.apply_ms = t.elapsed().as_millis() as u64;

        let t = Instant::now();
        self.settings.set("daily_plan_snapshot", serde_json::to_value(&daily_plan)?)?;
        self.settings.set("device_plan_snapshot", serde_json::to_value(&device_plan)?)?;
        trace.snapshot_ms = t.elapsed().as_millis() as u64;

        let t = Instant::now();
        debug!(
            "rebuild complete: {} devices, headroom={:.2}kW, limit_reason={:?}",
            device_plan.devices.len(),
            device_plan.meta.headroom_kw,
            device_plan.meta.limit_reason
        );
        trace.status_ms = t.elapsed().as_millis() as u64;

        Ok(())
    }

    fn compute_daily_plan(&self, now: chrono::DateTime<Utc>) -> Result<DailyPlan, OrchestratorError> {
        let key = date_key(now, &self.zone);
        let buckets = day_buckets(&key, &self.zone)?;
        let current_hour = top_of_hour(now, &self.zone);
        let current_bucket_index = buckets.iter().position(|b| *b == current_hour).unwrap_or(0);

        let tracker = self.tracker.lock().unwrap();
        let bucket_usage: Vec<f64> = buckets.iter().map(|b| tracker.bucket_kwh(*b)).collect();
        let controlled_usage: Vec<f64> = buckets.iter().map(|b| tracker.controlled_kwh(*b)).collect();
        let uncontrolled_usage: Vec<f64> = buckets.iter().map(|b| tracker.uncontrolled_kwh(*b)).collect();
        let confidence = tracker.confidence();
        drop(tracker);

        let n = buckets.len();
        let base_weights = vec![1.0; n];
        let prices = self.price_service.get_combined_hourly_prices().ok();

        let input = DailyPlanInput {
            bucket_start_utc: buckets,
            bucket_usage,
            controlled_usage: Some(controlled_usage),
            uncontrolled_usage: Some(uncontrolled_usage),
            current_bucket_index,
            used_now_kwh: 0.0,
            daily_budget_kwh: self.config.daily_budget.daily_budget_kwh,
            base_weights: base_weights.clone(),
            controlled_weights: Some(base_weights),
            combined_prices: prices,
            price_optimization_enabled: self.config.price.optimization_enabled,
            price_shaping_enabled: self.config.daily_budget.price_shaping_enabled,
            price_shaping_flex_share: self.config.daily_budget.price_flex_share,
            previous_planned_kwh: None,
            capacity_budget_kwh: Some(self.guard.lock().unwrap().soft_limit_kw()),
            lock_current_bucket: false,
            observed_peak_margin_ratio: self.config.daily_budget.observed_peak_margin_ratio,
            confidence,
        };

        Ok(budget_planner::build_daily_plan(&input)?)
    }

    /// Writes each device's planned action. On completion the rebuild
    /// overwrites `plannedTarget` but never contradicts a recent shed - a
    /// device the capacity guard just shed is left alone this cycle by
    /// simply retrying the same `onoff=false` write, which is idempotent.
    fn apply_device_plan(&self, plan: &DevicePlan) {
        for entry in &plan.devices {
            match entry.planned_state {
                PlannedState::Shed => match entry.shed_action {
                    Some(ShedAction::PowerOff) | None => {
                        if let Err(e) = self.device_host.set_capability(&entry.id, &CAP_ONOFF.to_string(), CapabilityValue::Bool(false)) {
                            warn!("device call failed for {}: {}", entry.id, e);
                        }
                    }
                    Some(ShedAction::SetTemperature) => {
                        if let Some(target) = entry.planned_target {
                            if let Err(e) = self.device_host.set_capability(&entry.id, &CAP_TARGET_TEMPERATURE.to_string(), CapabilityValue::Number(target)) {
                                warn!("device call failed for {}: {}", entry.id, e);
                            }
                        }
                    }
                },
                PlannedState::Keep => {
                    if let Some(target) = entry.planned_target {
                        if let Err(e) = self.device_host.set_capability(&entry.id, &CAP_TARGET_TEMPERATURE.to_string(), CapabilityValue::Number(target)) {
                            debug!("no target-temperature capability for {}: {}", entry.id, e);
                        }
                    }
                }
            }
        }
    }

    fn fast_tick(&self) {
        let descriptors = match self.device_host.enumerate() {
            Ok(d) => d,
            Err(e) => {
                warn!("capacity guard tick: device enumeration failed: {}", e);
                return;
            }
        };

        let mut total_kw = 0.0;
        let policies = self.policies.read().unwrap();
        for d in &descriptors {
            if d.has_capability(CAP_MEASURE_POWER) {
                if let Ok(v) = self.device_host.get_capability(&d.id, &CAP_MEASURE_POWER.to_string()) {
                    if let Some(w) = v.as_f64() {
                        total_kw += (w / 1000.0).max(0.0);
                    }
                }
            }
            let priority = policies.get(&d.id).map(|p| p.priority).unwrap_or(i32::MAX);
            let expected = policies.get(&d.id).map(|p| p.expected_power_kw_fallback).unwrap_or(0.0);
            let on = self
                .device_host
                .get_capability(&d.id, &CAP_ONOFF.to_string())
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if on {
                self.guard.lock().unwrap().request_on(d.id.clone(), d.name.clone(), expected, priority);
            }
        }
        drop(policies);

        let mut guard = self.guard.lock().unwrap();
        guard.report_total_power(total_kw);
        let actuator = DeviceHostActuator { host: self.device_host.clone() };
        let events = guard.tick(&actuator, Instant::now());
        drop(guard);

        for event in events {
            info!("capacity guard event: {:?}", event);
        }
    }

    fn price_refresh(&self) {
        let now = Utc::now();
        if let Err(e) = self.price_service.refresh_spot_prices(false, now) {
            warn!("spot price refresh failed: {}", e);
        }
        if let Err(e) = self.price_service.refresh_grid_tariff_data(false, now) {
            warn!("grid tariff refresh failed: {}", e);
        }
        if let Err(e) = self.price_service.refresh_homey_prices(now) {
            warn!("homey price refresh failed: {}", e);
        }
        if let Err(e) = self.price_service.update_combined_prices() {
            warn!("combined price recompute failed: {}", e);
            return;
        }
        self.run_rebuild("price refresh");
    }

    fn cpu_spike_sample(&self, monitor: &mut CpuSpikeMonitor) {
        let Some(sample) = monitor.sample() else { return };
        if sample.over_threshold && monitor.should_emit() {
            let summary = self.telemetry.traces.summary();
            let spans = self.telemetry.spans.active_with_ages();
            warn!(
                "cpu-spike diagnostic: cpu%={:.1} rss_kb={} active_spans={:?} recent_rebuilds={:?}",
                sample.cpu_percent, sample.rss_kb, spans, summary.recent
            );
        }
    }
}

/// Samples wall/CPU time once a second via `sysinfo`, emitting a
/// diagnostic when CPU stays at or above 85% for several consecutive
/// samples or a tick's wall time exceeds 1.5x its expected interval.
/// Throttled to one message per 5s.
struct CpuSpikeMonitor {
    system: sysinfo::System,
    pid: sysinfo::Pid,
    consecutive_high: u32,
    last_emit: Option<Instant>,
}

struct CpuSample {
    cpu_percent: f32,
    rss_kb: u64,
    over_threshold: bool,
}

impl CpuSpikeMonitor {
    fn new() -> Self {
        let mut system = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        CpuSpikeMonitor { system, pid, consecutive_high: 0, last_emit: None }
    }

    fn sample(&mut self) -> Option<CpuSample> {
        self.system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let process = self.system.process(self.pid)?;
        let cpu_percent = process.cpu_usage();
        let rss_kb = process.memory() / 1024;

        if cpu_percent >= 85.0 {
            self.consecutive_high += 1;
        } else {
            self.consecutive_high = 0;
        }

        Some(CpuSample { cpu_percent, rss_kb, over_threshold: self.consecutive_high >= 3 })
    }

    fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < Duration::from_secs(5) => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

fn fast_tick_loop(orchestrator: Arc<Orchestrator>, shutdown: Arc<AtomicBool>, interval: Duration) {
    while !shutdown.load(Ordering::Relaxed) {
        orchestrator.fast_tick();
        thread::sleep(interval);
    }
}

fn hourly_rebuild_loop(orchestrator: Arc<Orchestrator>, shutdown: Arc<AtomicBool>, interval: Duration) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        orchestrator.run_rebuild("hourly refresh");
    }
}

fn price_refresh_loop(orchestrator: Arc<Orchestrator>, shutdown: Arc<AtomicBool>, interval: Duration) {
    orchestrator.price_refresh();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        orchestrator.price_refresh();
    }
}

fn settings_change_loop(orchestrator: Arc<Orchestrator>, shutdown: Arc<AtomicBool>, rx: mpsc::Receiver<String>, debounce: Duration) {
    while !shutdown.load(Ordering::Relaxed) {
        let key = match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(key) => key,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if is_snapshot_only(&key) {
            continue;
        }

        // Coalesce a short burst of further changes into this one rebuild.
        let reason = format!("settings changed: {}", key);
        let deadline = Instant::now() + debounce;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => break,
            };
            if rx.recv_timeout(remaining).is_err() {
                break;
            }
        }

        orchestrator.run_rebuild(&reason);
    }
}

fn cpu_spike_monitor_loop(orchestrator: Arc<Orchestrator>, shutdown: Arc<AtomicBool>) {
    let mut monitor = CpuSpikeMonitor::new();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        orchestrator.cpu_spike_sample(&mut monitor);
    }
}

/// Handle returned by `Orchestrator::spawn`; releases every timer and
/// listener on `shutdown`.
pub struct OrchestratorHandle {
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    rebuild_queue: Arc<RebuildQueue>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl OrchestratorHandle {
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.rebuild_queue.wait_idle();
        for t in self.threads {
            let _ = t.join();
        }
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify("mygrid_control stopped", "orchestrator tick loops have shut down") {
                warn!("shutdown notification failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_spike_monitor_requires_three_consecutive_high_samples() {
        let mut monitor = CpuSpikeMonitor::new();
        // First sample establishes a baseline and is never over threshold by
        // itself, since `consecutive_high` starts at 0.
        let first = monitor.sample();
        assert!(first.is_some());
    }
}
