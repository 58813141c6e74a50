//! Per-device keep/shed decision builder.
//!
//! Typed states with `Display`-friendly enums and a `reason`-carrying
//! entry per device, covering a fleet rather than a single controlled
//! load.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget_planner::DailyPlan;
use crate::device::{CapabilityValue, CapabilityId, DeviceDescriptor, DeviceId, CAP_MEASURE_POWER, CAP_METER_POWER, CAP_ONOFF, CAP_TARGET_TEMPERATURE};
use crate::price::models::CombinedPriceSeries;

#[derive(Error, Debug)]
pub enum DevicePlanError {
    #[error("device host error: {0}")]
    Device(#[from] crate::device::errors::DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentState {
    On,
    Off,
    Heating,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedState {
    Keep,
    Shed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedAction {
    PowerOff,
    SetTemperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvershootPolicy {
    PowerOff,
    SetTemperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    None,
    Hourly,
    Daily,
    Both,
}

/// Static per-device policy, sourced from the `capacity_priorities` /
/// `mode_device_targets` / `price_optimization_settings` persisted keys.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub priority: i32,
    pub controllable: bool,
    pub price_optimizable: bool,
    pub overshoot_policy: OvershootPolicy,
    pub target_temperature: Option<f64>,
    pub cheap_delta: f64,
    pub expensive_delta: f64,
    pub overshoot_delta: f64,
    pub expected_power_kw_fallback: f64,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        DevicePolicy {
            priority: i32::MAX,
            controllable: false,
            price_optimizable: false,
            overshoot_policy: OvershootPolicy::PowerOff,
            target_temperature: None,
            cheap_delta: 0.0,
            expensive_delta: 0.0,
            overshoot_delta: 0.0,
            expected_power_kw_fallback: 0.0,
        }
    }
}

/// One device's planned action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePlanEntry {
    pub id: DeviceId,
    pub name: String,
    pub zone: String,
    pub priority: i32,
    pub controllable: bool,
    pub current_state: CurrentState,
    pub planned_state: PlannedState,
    pub shed_action: Option<ShedAction>,
    pub planned_target: Option<f64>,
    pub expected_power_kw: f64,
    pub measured_power_kw: f64,
    pub reason: String,
}

/// Plan-wide aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePlanMeta {
    pub headroom_kw: f64,
    pub soft_limit_kw: f64,
    pub controlled_kw: f64,
    pub uncontrolled_kw: f64,
    pub used_kwh: f64,
    pub daily_budget_used_kwh: f64,
    pub daily_budget_allowed_kwh_now: f64,
    pub daily_budget_remaining_kwh: f64,
    pub daily_budget_pressure: f64,
    pub daily_budget_exceeded: bool,
    pub hourly_budget_exhausted: bool,
    pub limit_reason: LimitReason,
    pub shedding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePlan {
    pub devices: Vec<DevicePlanEntry>,
    pub meta: DevicePlanMeta,
}

/// Everything the builder needs to decide each device's action.
pub struct DevicePlanInput<'a> {
    pub descriptors: &'a [DeviceDescriptor],
    pub policies: &'a HashMap<DeviceId, DevicePolicy>,
    pub measured_power_kw: &'a HashMap<DeviceId, f64>,
    pub capability_values: &'a HashMap<(DeviceId, CapabilityId), CapabilityValue>,
    pub daily_plan: &'a DailyPlan,
    pub prices: Option<&'a CombinedPriceSeries>,
    pub is_current_hour_cheap: bool,
    pub is_current_hour_expensive: bool,
    pub soft_limit_kw: f64,
    pub current_hour_total_kw: f64,
}

/// Applies a named operating mode's per-device target-temperature
/// overrides onto the base policy table (spec's `mode_device_targets`
/// persisted key). Devices absent from `mode_targets`, or when no mode
/// table applies, keep their base `target_temperature`.
pub fn apply_mode_targets(
    base: &HashMap<DeviceId, DevicePolicy>,
    mode_targets: Option<&HashMap<String, f64>>,
) -> HashMap<DeviceId, DevicePolicy> {
    let mut out = base.clone();
    if let Some(targets) = mode_targets {
        for (id, policy) in out.iter_mut() {
            if let Some(t) = targets.get(id) {
                policy.target_temperature = Some(*t);
            }
        }
    }
    out
}

/// Builds the device plan for the current tick.
pub fn build_device_plan(input: &DevicePlanInput) -> Result<DevicePlan, DevicePlanError> {
    let idx = input.daily_plan.current_bucket_index.min(input.daily_plan.planned_kwh.len().saturating_sub(1));
    let used_now_kwh = input.daily_plan.actual_kwh.get(idx).copied().unwrap_or(0.0);
    let allowed_now_kwh = input.daily_plan.allowed_cum_kwh.get(idx).copied().unwrap_or(0.0);
    let daily_budget_remaining = (input.daily_plan.daily_budget_kwh - used_now_kwh).max(0.0);
    let daily_budget_exceeded = used_now_kwh > allowed_now_kwh + 1e-9;
    let daily_budget_pressure = if input.daily_plan.daily_budget_kwh > 0.0 {
        (used_now_kwh / input.daily_plan.daily_budget_kwh).clamp(0.0, 2.0)
    } else {
        0.0
    };

    let hourly_budget_exhausted = input
        .daily_plan
        .planned_kwh
        .get(idx)
        .map(|cap| used_now_kwh >= *cap - 1e-9 && *cap > 0.0)
        .unwrap_or(false);

    let controlled_kw: f64 = input
        .policies
        .iter()
        .filter(|(_, p)| p.controllable)
        .map(|(id, _)| input.measured_power_kw.get(id).copied().unwrap_or(0.0))
        .sum();
    let uncontrolled_kw: f64 = input
        .policies
        .iter()
        .filter(|(_, p)| !p.controllable)
        .map(|(id, _)| input.measured_power_kw.get(id).copied().unwrap_or(0.0))
        .sum();

    let total_kw: f64 = input.measured_power_kw.values().sum();
    let headroom_kw = input.soft_limit_kw - total_kw;

    // Sort devices descending by priority number (least important first)
    // so shedding picks from the front when over headroom - "most
    // important" means lowest priority number, and must remain on longest.
    let mut by_priority: Vec<&DeviceDescriptor> = input.descriptors.iter().collect();
    by_priority.sort_by(|a, b| {
        let pa = input.policies.get(&a.id).map(|p| p.priority).unwrap_or(i32::MAX);
        let pb = input.policies.get(&b.id).map(|p| p.priority).unwrap_or(i32::MAX);
        pb.cmp(&pa).then_with(|| {
            let ea = input.measured_power_kw.get(&a.id).copied().unwrap_or(0.0);
            let eb = input.measured_power_kw.get(&b.id).copied().unwrap_or(0.0);
            eb.partial_cmp(&ea).unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let mut over_capacity = headroom_kw < 0.0;
    let mut deficit = -headroom_kw;

    let mut entries = Vec::with_capacity(input.descriptors.len());
    let mut any_shed_daily = false;
    let mut any_shed_capacity = false;

    for device in by_priority.iter() {
        let policy = input.policies.get(&device.id).cloned().unwrap_or_default();
        let current_state = resolve_current_state(device, input.capability_values);
        let measured_power_kw = input.measured_power_kw.get(&device.id).copied().unwrap_or(0.0);
        let expected_power_kw = expected_power(device, &policy, input.capability_values, measured_power_kw);

        let mut shed_for_capacity = false;
        if policy.controllable && over_capacity && matches!(current_state, CurrentState::On | CurrentState::Heating) {
            shed_for_capacity = true;
            deficit -= expected_power_kw;
            if deficit <= 0.0 {
                over_capacity = false;
            }
            any_shed_capacity = true;
        }

        let shed_for_daily = policy.controllable
            && policy.price_optimizable
            && daily_budget_exceeded
            && !input.is_current_hour_cheap
            && matches!(current_state, CurrentState::On | CurrentState::Heating);
        if shed_for_daily {
            any_shed_daily = true;
        }

        let shed = shed_for_capacity || shed_for_daily;

        let (planned_state, shed_action, reason) = if shed {
            let action = if device.has_capability(CAP_TARGET_TEMPERATURE) && policy.overshoot_policy == OvershootPolicy::SetTemperature {
                ShedAction::SetTemperature
            } else {
                ShedAction::PowerOff
            };
            let reason = match (shed_for_capacity, shed_for_daily) {
                (true, true) => "capacity and daily budget pressure".to_string(),
                (true, false) => "capacity headroom exceeded".to_string(),
                (false, true) => "daily budget exceeded at non-cheap price".to_string(),
                (false, false) => unreachable!(),
            };
            (PlannedState::Shed, Some(action), reason)
        } else {
            (PlannedState::Keep, None, "within limits".to_string())
        };

        let planned_target = if shed_action == Some(ShedAction::SetTemperature) {
            policy.target_temperature.map(|t| t - policy.overshoot_delta.abs())
        } else if !shed {
            Some(adjusted_target(&policy, input.is_current_hour_cheap, input.is_current_hour_expensive))
        } else {
            None
        };

        entries.push(DevicePlanEntry {
            id: device.id.clone(),
            name: device.name.clone(),
            zone: device.zone.clone(),
            priority: policy.priority,
            controllable: policy.controllable,
            current_state,
            planned_state,
            shed_action,
            planned_target,
            expected_power_kw,
            measured_power_kw,
            reason,
        });
    }

    entries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.zone.cmp(&b.zone)).then_with(|| a.name.cmp(&b.name)));

    let limit_reason = match (any_shed_capacity, any_shed_daily) {
        (true, true) => LimitReason::Both,
        (true, false) => LimitReason::Hourly,
        (false, true) => LimitReason::Daily,
        (false, false) => LimitReason::None,
    };

    let meta = DevicePlanMeta {
        headroom_kw,
        soft_limit_kw: input.soft_limit_kw,
        controlled_kw,
        uncontrolled_kw,
        used_kwh: used_now_kwh,
        daily_budget_used_kwh: used_now_kwh,
        daily_budget_allowed_kwh_now: allowed_now_kwh,
        daily_budget_remaining_kwh: daily_budget_remaining,
        daily_budget_pressure,
        daily_budget_exceeded,
        hourly_budget_exhausted,
        limit_reason,
        shedding: any_shed_capacity || any_shed_daily,
    };

    Ok(DevicePlan { devices: entries, meta })
}

fn resolve_current_state(device: &DeviceDescriptor, values: &HashMap<(DeviceId, CapabilityId), CapabilityValue>) -> CurrentState {
    if device.has_capability(CAP_ONOFF) {
        let on = values
            .get(&(device.id.clone(), CAP_ONOFF.to_string()))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !on {
            return CurrentState::Off;
        }
        if device.has_capability(CAP_TARGET_TEMPERATURE) {
            return CurrentState::Heating;
        }
        return CurrentState::On;
    }
    CurrentState::Idle
}

/// Estimates expected power from the last on-state measurement, falling
/// back to the device policy's configured expected load, then zero.
fn expected_power(
    device: &DeviceDescriptor,
    policy: &DevicePolicy,
    values: &HashMap<(DeviceId, CapabilityId), CapabilityValue>,
    measured_power_kw: f64,
) -> f64 {
    if measured_power_kw > 0.0 {
        return measured_power_kw;
    }
    if device.has_capability(CAP_MEASURE_POWER) {
        if let Some(v) = values.get(&(device.id.clone(), CAP_MEASURE_POWER.to_string())).and_then(|v| v.as_f64()) {
            if v > 0.0 {
                return v / 1000.0;
            }
        }
    }
    if device.has_capability(CAP_METER_POWER) {
        if let Some(v) = values.get(&(device.id.clone(), CAP_METER_POWER.to_string())).and_then(|v| v.as_f64()) {
            if v > 0.0 {
                return v / 1000.0;
            }
        }
    }
    policy.expected_power_kw_fallback
}

/// Adjusts a mode's target temperature by the cheap/expensive deltas.
fn adjusted_target(policy: &DevicePolicy, cheap: bool, expensive: bool) -> f64 {
    let base = policy.target_temperature.unwrap_or(0.0);
    if cheap {
        base + policy.cheap_delta
    } else if expensive {
        base - policy.expensive_delta
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;

    fn plan_with(budget: f64, used: f64, cap_now: f64) -> DailyPlan {
        DailyPlan {
            bucket_start_utc: vec![chrono::Utc::now()],
            planned_kwh: vec![cap_now],
            planned_uncontrolled_kwh: vec![0.0],
            planned_controlled_kwh: vec![cap_now],
            actual_kwh: vec![used],
            allowed_cum_kwh: vec![cap_now],
            current_bucket_index: 0,
            daily_budget_kwh: budget,
            price_shaping_active: false,
            effective_price_shaping_flex_share: 0.0,
            confidence: 1.0,
            frozen: false,
        }
    }

    fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            zone: "Zone".to_string(),
            capabilities: vec![CAP_ONOFF.to_string(), CAP_MEASURE_POWER.to_string()],
        }
    }

    #[test]
    fn sheds_lower_priority_device_first_when_over_capacity() {
        let descriptors = vec![descriptor("a"), descriptor("b")];
        let mut policies = HashMap::new();
        policies.insert("a".to_string(), DevicePolicy { priority: 10, controllable: true, ..Default::default() });
        policies.insert("b".to_string(), DevicePolicy { priority: 1, controllable: true, ..Default::default() });

        let mut measured = HashMap::new();
        measured.insert("a".to_string(), 3.0);
        measured.insert("b".to_string(), 2.0);

        let mut caps = HashMap::new();
        caps.insert(("a".to_string(), CAP_ONOFF.to_string()), CapabilityValue::Bool(true));
        caps.insert(("b".to_string(), CAP_ONOFF.to_string()), CapabilityValue::Bool(true));

        let daily_plan = plan_with(100.0, 0.0, 100.0);

        let input = DevicePlanInput {
            descriptors: &descriptors,
            policies: &policies,
            measured_power_kw: &measured,
            capability_values: &caps,
            daily_plan: &daily_plan,
            prices: None,
            is_current_hour_cheap: false,
            is_current_hour_expensive: false,
            soft_limit_kw: 4.8,
            current_hour_total_kw: 5.0,
        };

        let plan = build_device_plan(&input).unwrap();
        let a = plan.devices.iter().find(|d| d.id == "a").unwrap();
        let b = plan.devices.iter().find(|d| d.id == "b").unwrap();
        assert_eq!(a.planned_state, PlannedState::Shed);
        assert_eq!(b.planned_state, PlannedState::Keep);
    }

    #[test]
    fn sheds_for_daily_budget_pressure_only_when_not_cheap() {
        let descriptors = vec![descriptor("a")];
        let mut policies = HashMap::new();
        policies.insert("a".to_string(), DevicePolicy { priority: 10, controllable: true, price_optimizable: true, ..Default::default() });
        let mut measured = HashMap::new();
        measured.insert("a".to_string(), 1.0);
        let mut caps = HashMap::new();
        caps.insert(("a".to_string(), CAP_ONOFF.to_string()), CapabilityValue::Bool(true));

        let daily_plan = plan_with(5.0, 6.0, 5.0);

        let input = DevicePlanInput {
            descriptors: &descriptors,
            policies: &policies,
            measured_power_kw: &measured,
            capability_values: &caps,
            daily_plan: &daily_plan,
            prices: None,
            is_current_hour_cheap: false,
            is_current_hour_expensive: false,
            soft_limit_kw: 10.0,
            current_hour_total_kw: 1.0,
        };

        let plan = build_device_plan(&input).unwrap();
        assert_eq!(plan.devices[0].planned_state, PlannedState::Shed);
        assert_eq!(plan.meta.limit_reason, LimitReason::Daily);
    }

    #[test]
    fn mode_targets_override_base_policy_target_for_named_devices_only() {
        let mut base = HashMap::new();
        base.insert("a".to_string(), DevicePolicy { target_temperature: Some(20.0), ..Default::default() });
        base.insert("b".to_string(), DevicePolicy { target_temperature: Some(18.0), ..Default::default() });

        let mut mode_targets = HashMap::new();
        mode_targets.insert("a".to_string(), 16.0);

        let out = apply_mode_targets(&base, Some(&mode_targets));
        assert_eq!(out["a"].target_temperature, Some(16.0));
        assert_eq!(out["b"].target_temperature, Some(18.0));
    }

    #[test]
    fn mode_targets_absent_leaves_base_policy_untouched() {
        let mut base = HashMap::new();
        base.insert("a".to_string(), DevicePolicy { target_temperature: Some(20.0), ..Default::default() });
        let out = apply_mode_targets(&base, None);
        assert_eq!(out["a"].target_temperature, Some(20.0));
    }

    #[test]
    fn keeps_device_when_daily_exceeded_but_current_hour_cheap() {
        let descriptors = vec![descriptor("a")];
        let mut policies = HashMap::new();
        policies.insert("a".to_string(), DevicePolicy { priority: 10, controllable: true, price_optimizable: true, ..Default::default() });
        let mut measured = HashMap::new();
        measured.insert("a".to_string(), 1.0);
        let mut caps = HashMap::new();
        caps.insert(("a".to_string(), CAP_ONOFF.to_string()), CapabilityValue::Bool(true));

        let daily_plan = plan_with(5.0, 6.0, 5.0);

        let input = DevicePlanInput {
            descriptors: &descriptors,
            policies: &policies,
            measured_power_kw: &measured,
            capability_values: &caps,
            daily_plan: &daily_plan,
            prices: None,
            is_current_hour_cheap: true,
            is_current_hour_expensive: false,
            soft_limit_kw: 10.0,
            current_hour_total_kw: 1.0,
        };

        let plan = build_device_plan(&input).unwrap();
        assert_eq!(plan.devices[0].planned_state, PlannedState::Keep);
    }
}
