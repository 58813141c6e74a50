//! Instantaneous-kW watchdog with hysteresis.
//!
//! A three-state `ok`/`overshoot`/`shortfall_wait_clear` machine with
//! priority-ordered shedding scans and a sustained-clear timer to avoid
//! flapping back and forth across the soft limit.

use std::fmt;
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::device::DeviceId;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("actuator failed for device {device_id}: {source}")]
    ActuatorFailed { device_id: DeviceId, source: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Ok,
    Overshoot,
    ShortfallWaitClear,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuardState::Ok => "ok",
            GuardState::Overshoot => "overshoot",
            GuardState::ShortfallWaitClear => "shortfall_wait_clear",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub device_id: DeviceId,
    pub label: String,
    pub expected_kw: f64,
    pub priority: i32,
    pub on: bool,
}

/// Callback invoked to actually turn a device off. `dry_run` mode updates
/// state without invoking it.
pub trait Actuator: Send + Sync {
    fn turn_off(&self, device_id: &DeviceId) -> Result<(), GuardError>;
}

pub struct NoopActuator;
impl Actuator for NoopActuator {
    fn turn_off(&self, _device_id: &DeviceId) -> Result<(), GuardError> {
        Ok(())
    }
}

/// Real-time instantaneous-power watchdog.
pub struct CapacityGuard {
    allocations: Vec<Allocation>,
    limit_kw: f64,
    soft_margin_kw: f64,
    hysteresis_margin_kw: f64,
    sustained_clear: Duration,
    dry_run: bool,
    state: GuardState,
    last_total_power_kw: f64,
    clear_since: Option<Instant>,
    shed_log: Vec<String>,
}

impl CapacityGuard {
    pub fn new(limit_kw: f64, soft_margin_kw: f64, hysteresis_margin_kw: f64, sustained_clear_ms: i64, dry_run: bool) -> Self {
        CapacityGuard {
            allocations: Vec::new(),
            limit_kw,
            soft_margin_kw,
            hysteresis_margin_kw,
            sustained_clear: Duration::from_millis(sustained_clear_ms.max(0) as u64),
            dry_run,
            state: GuardState::Ok,
            last_total_power_kw: 0.0,
            clear_since: None,
            shed_log: Vec::new(),
        }
    }

    pub fn soft_limit_kw(&self) -> f64 {
        self.limit_kw - self.soft_margin_kw
    }

    fn shortfall_threshold(&self) -> f64 {
        self.soft_limit_kw()
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn recent_sheds(&self) -> &[String] {
        &self.shed_log
    }

    /// Requests permission to turn a device on. Accepted only when the sum
    /// of currently-on expected loads plus `expected_kw` stays within
    /// `soft_limit - soft_margin_kw`.
    pub fn request_on(&mut self, device_id: DeviceId, label: String, expected_kw: f64, priority: i32) -> bool {
        let current_sum: f64 = self.allocations.iter().filter(|a| a.on).map(|a| a.expected_kw).sum();
        let accepted = current_sum + expected_kw <= self.soft_limit_kw() - self.soft_margin_kw;

        if let Some(existing) = self.allocations.iter_mut().find(|a| a.device_id == device_id) {
            existing.label = label;
            existing.expected_kw = expected_kw;
            existing.priority = priority;
            existing.on = accepted;
        } else {
            self.allocations.push(Allocation { device_id, label, expected_kw, priority, on: accepted });
        }

        accepted
    }

    /// Records the latest total-power sample.
    pub fn report_total_power(&mut self, kw: f64) {
        if kw.is_finite() {
            self.last_total_power_kw = kw;
        }
    }

    /// Advances the state machine one tick (~3 s), shedding or clearing as
    /// needed, and returns any emitted events.
    ///
    /// # Arguments
    ///
    /// * 'actuator' - callback invoked to turn a device off (skipped in dry-run)
    /// * 'now' - the instant of this tick, used for hysteresis timing
    pub fn tick(&mut self, actuator: &dyn Actuator, now: Instant) -> Vec<GuardEvent> {
        let mut events = Vec::new();
        let total = self.last_total_power_kw;

        match self.state {
            GuardState::Ok => {
                if total > self.shortfall_threshold() {
                    let deficit = total - self.shortfall_threshold();
                    warn!("capacity guard: shortfall detected, total={:.2}kW threshold={:.2}kW deficit={:.2}kW", total, self.shortfall_threshold(), deficit);
                    events.push(GuardEvent::Shortfall { deficit });
                    self.state = GuardState::Overshoot;
                    self.shed(actuator);
                }
            }
            GuardState::Overshoot => {
                self.shed(actuator);
                let headroom = self.soft_limit_kw() - total;
                if headroom >= self.hysteresis_margin_kw {
                    self.state = GuardState::ShortfallWaitClear;
                    self.clear_since = Some(now);
                } else {
                    self.clear_since = None;
                }
            }
            GuardState::ShortfallWaitClear => {
                let headroom = self.soft_limit_kw() - total;
                if total > self.shortfall_threshold() {
                    self.state = GuardState::Overshoot;
                    self.clear_since = None;
                    self.shed(actuator);
                } else if headroom >= self.hysteresis_margin_kw {
                    let since = *self.clear_since.get_or_insert(now);
                    if now.duration_since(since) > self.sustained_clear {
                        info!("capacity guard: shortfall cleared after sustained headroom");
                        events.push(GuardEvent::ShortfallCleared);
                        self.state = GuardState::Ok;
                        self.clear_since = None;
                    }
                } else {
                    self.clear_since = None;
                }
            }
        }

        events
    }

    /// Turns off controllable allocations in descending priority-number
    /// order (higher number = less important = shed first), ties broken by
    /// largest expected kW first, until headroom is non-negative.
    fn shed(&mut self, actuator: &dyn Actuator) {
        let mut order: Vec<usize> = (0..self.allocations.len()).collect();
        order.sort_by(|&a, &b| {
            let pa = self.allocations[a].priority;
            let pb = self.allocations[b].priority;
            pb.cmp(&pa).then_with(|| {
                self.allocations[b]
                    .expected_kw
                    .partial_cmp(&self.allocations[a].expected_kw)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        let mut headroom = self.soft_limit_kw() - self.last_total_power_kw;
        for i in order {
            if headroom >= 0.0 {
                break;
            }
            if !self.allocations[i].on {
                continue;
            }
            let id = self.allocations[i].device_id.clone();
            if !self.dry_run {
                if let Err(e) = actuator.turn_off(&id) {
                    warn!("capacity guard: actuator failed for {}: {}", id, e);
                    continue;
                }
            }
            headroom += self.allocations[i].expected_kw;
            self.allocations[i].on = false;
            self.shed_log.push(id);
            if self.shed_log.len() > 64 {
                self.shed_log.remove(0);
            }
        }
    }

    pub fn shed_ids(&self) -> Vec<DeviceId> {
        self.shed_log.clone()
    }

    pub fn sum_on_expected_kw(&self) -> f64 {
        self.allocations.iter().filter(|a| a.on).map(|a| a.expected_kw).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    Shortfall { deficit: f64 },
    ShortfallCleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingActuator {
        calls: std::sync::Mutex<Vec<DeviceId>>,
    }

    impl RecordingActuator {
        fn new() -> Self {
            RecordingActuator { calls: std::sync::Mutex::new(Vec::new()) }
        }
    }

    impl Actuator for RecordingActuator {
        fn turn_off(&self, device_id: &DeviceId) -> Result<(), GuardError> {
            self.calls.lock().unwrap().push(device_id.clone());
            Ok(())
        }
    }

    #[test]
    fn scenario_s1_sheds_lower_priority_device_only() {
        let mut guard = CapacityGuard::new(5.0, 0.2, 0.2, 60_000, false);
        assert!((guard.soft_limit_kw() - 4.8).abs() < 1e-9);

        guard.request_on("A".to_string(), "A".to_string(), 3.0, 10);
        guard.request_on("B".to_string(), "B".to_string(), 2.0, 1);
        guard.report_total_power(7.0);

        let actuator = RecordingActuator::new();
        guard.tick(&actuator, Instant::now());

        let calls = actuator.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &["A".to_string()]);
    }

    #[test]
    fn request_on_rejected_when_exceeding_soft_limit() {
        let mut guard = CapacityGuard::new(5.0, 0.2, 0.2, 60_000, false);
        guard.request_on("A".to_string(), "A".to_string(), 3.0, 10);
        let accepted = guard.request_on("B".to_string(), "B".to_string(), 5.0, 1);
        assert!(!accepted);
    }

    #[test]
    fn shedding_never_increases_total_on_expected_kw() {
        let mut guard = CapacityGuard::new(5.0, 0.2, 0.2, 60_000, false);
        guard.request_on("A".to_string(), "A".to_string(), 3.0, 10);
        guard.request_on("B".to_string(), "B".to_string(), 2.0, 5);
        let before = guard.sum_on_expected_kw();
        guard.report_total_power(7.0);
        let actuator = RecordingActuator::new();
        guard.tick(&actuator, Instant::now());
        let after = guard.sum_on_expected_kw();
        assert!(after <= before);
    }

    #[test]
    fn scenario_s5_shortfall_clear_requires_sustained_headroom() {
        let mut guard = CapacityGuard::new(5.0, 0.3, 0.2, 60_000, false);
        assert!((guard.soft_limit_kw() - 4.7).abs() < 1e-9);

        guard.request_on("A".to_string(), "A".to_string(), 5.0, 10);
        guard.report_total_power(5.0);
        let actuator = RecordingActuator::new();
        let t0 = Instant::now();
        let events = guard.tick(&actuator, t0);
        assert!(matches!(events[0], GuardEvent::Shortfall { .. }));
        assert_eq!(guard.state(), GuardState::Overshoot);

        guard.report_total_power(4.5);
        let events = guard.tick(&actuator, t0 + Duration::from_secs(1));
        assert!(events.is_empty());
        assert_eq!(guard.state(), GuardState::ShortfallWaitClear);

        let events = guard.tick(&actuator, t0 + Duration::from_secs(30));
        assert!(events.is_empty());

        let events = guard.tick(&actuator, t0 + Duration::from_secs(62));
        assert!(matches!(events[0], GuardEvent::ShortfallCleared));
        assert_eq!(guard.state(), GuardState::Ok);
    }

    #[test]
    fn breach_during_wait_clear_resets_timer_and_returns_to_overshoot() {
        let mut guard = CapacityGuard::new(5.0, 0.3, 0.2, 60_000, false);
        guard.request_on("A".to_string(), "A".to_string(), 5.0, 10);
        guard.report_total_power(5.0);
        let actuator = RecordingActuator::new();
        let t0 = Instant::now();
        guard.tick(&actuator, t0);

        guard.report_total_power(4.5);
        guard.tick(&actuator, t0 + Duration::from_secs(10));
        assert_eq!(guard.state(), GuardState::ShortfallWaitClear);

        guard.report_total_power(5.2);
        let events = guard.tick(&actuator, t0 + Duration::from_secs(20));
        assert!(events.iter().any(|e| matches!(e, GuardEvent::Shortfall { .. })));
        assert_eq!(guard.state(), GuardState::Overshoot);
    }

    #[test]
    fn dry_run_updates_state_without_invoking_actuator() {
        let mut guard = CapacityGuard::new(5.0, 0.2, 0.2, 60_000, true);
        guard.request_on("A".to_string(), "A".to_string(), 7.0, 10);
        guard.report_total_power(7.0);
        let actuator = RecordingActuator::new();
        guard.tick(&actuator, Instant::now());
        assert!(actuator.calls.lock().unwrap().is_empty());
        assert_eq!(guard.sum_on_expected_kw(), 0.0);
    }
}
