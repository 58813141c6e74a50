//! Per-bucket daily kWh allocation under caps, floors and price shaping.
//!
//! A closed-form weighted proportional allocation with iterative overflow
//! redistribution: buckets at their cap donate the excess proportionally
//! to uncapped peers until the budget is fully placed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::price::models::CombinedPriceSeries;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("bucket_start_utc, bucket_usage and base_weights must all have the same length")]
    LengthMismatch,
    #[error("daily_budget_kwh must be finite and non-negative")]
    InvalidBudget,
}

/// Everything the planner needs for one local day.
pub struct DailyPlanInput {
    pub bucket_start_utc: Vec<DateTime<Utc>>,
    pub bucket_usage: Vec<f64>,
    pub controlled_usage: Option<Vec<f64>>,
    pub uncontrolled_usage: Option<Vec<f64>>,
    pub current_bucket_index: usize,
    pub used_now_kwh: f64,
    pub daily_budget_kwh: f64,
    pub base_weights: Vec<f64>,
    pub controlled_weights: Option<Vec<f64>>,
    pub combined_prices: Option<CombinedPriceSeries>,
    pub price_optimization_enabled: bool,
    pub price_shaping_enabled: bool,
    pub price_shaping_flex_share: f64,
    pub previous_planned_kwh: Option<Vec<f64>>,
    pub capacity_budget_kwh: Option<f64>,
    pub lock_current_bucket: bool,
    pub observed_peak_margin_ratio: f64,
    pub confidence: f64,
}

/// One day's allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPlan {
    pub bucket_start_utc: Vec<DateTime<Utc>>,
    pub planned_kwh: Vec<f64>,
    pub planned_uncontrolled_kwh: Vec<f64>,
    pub planned_controlled_kwh: Vec<f64>,
    pub actual_kwh: Vec<f64>,
    pub allowed_cum_kwh: Vec<f64>,
    pub current_bucket_index: usize,
    pub daily_budget_kwh: f64,
    pub price_shaping_active: bool,
    pub effective_price_shaping_flex_share: f64,
    pub confidence: f64,
    pub frozen: bool,
}

const EPSILON: f64 = 1e-6;

/// Builds the daily plan from `input` via a six-step algorithm: price
/// factors, composite weights, pin past buckets, caps, floors, then
/// proportional allocation.
pub fn build_daily_plan(input: &DailyPlanInput) -> Result<DailyPlan, PlannerError> {
    let n = input.bucket_start_utc.len();
    if input.bucket_usage.len() != n || input.base_weights.len() != n {
        return Err(PlannerError::LengthMismatch);
    }
    if !input.daily_budget_kwh.is_finite() || input.daily_budget_kwh < 0.0 {
        return Err(PlannerError::InvalidBudget);
    }

    let split_complete = match (&input.controlled_usage, &input.uncontrolled_usage, &input.controlled_weights) {
        (Some(c), Some(u), Some(w)) => c.len() == n && u.len() == n && w.len() == n,
        _ => false,
    };

    // Step 1: price factors.
    let (price_factors, price_spread_factor, prices_complete) = price_factors(input, n);
    let price_shaping_active = input.price_shaping_enabled && prices_complete && price_spread_factor > EPSILON;
    let effective_flex_share = if price_shaping_active {
        (input.price_shaping_flex_share * price_spread_factor).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Step 2: composite weights.
    let base_for_blend: Vec<f64> = if split_complete {
        input.controlled_weights.clone().unwrap()
    } else {
        input.base_weights.clone()
    };
    let composite = composite_weights(&base_for_blend, &price_factors, effective_flex_share);

    // Step 3: pin past buckets (and optionally the current one) to previous
    // plan / observed actuals.
    let mut pinned = vec![false; n];
    let mut pinned_kwh = vec![0.0; n];
    for i in 0..n {
        let is_past = i < input.current_bucket_index;
        let is_current_locked = i == input.current_bucket_index && input.lock_current_bucket;
        if is_past || is_current_locked {
            pinned[i] = true;
            pinned_kwh[i] = input
                .previous_planned_kwh
                .as_ref()
                .and_then(|p| p.get(i).copied())
                .unwrap_or_else(|| input.bucket_usage.get(i).copied().unwrap_or(0.0))
                .max(0.0);
        }
    }

    // Caps: capacity budget intersected with observed-peak-derived cap for
    // split profiles.
    let caps: Vec<f64> = (0..n)
        .map(|i| {
            let mut cap = input.capacity_budget_kwh.unwrap_or(f64::INFINITY);
            if split_complete {
                let observed_peak = input.controlled_usage.as_ref().unwrap()[i].max(0.0);
                let peak_cap = observed_peak * (1.0 + input.observed_peak_margin_ratio.max(0.0));
                if peak_cap > EPSILON {
                    cap = cap.min(peak_cap);
                }
            }
            cap.max(0.0)
        })
        .collect();

    // Step 4: floors from observed minima, scaled down proportionally if
    // their sum exceeds what remains after pinning.
    let pinned_total: f64 = (0..n).filter(|&i| pinned[i]).map(|i| pinned_kwh[i]).sum();
    let remaining_budget = (input.daily_budget_kwh - pinned_total).max(0.0);

    let mut floors = vec![0.0; n];
    if split_complete {
        let controlled = input.controlled_usage.as_ref().unwrap();
        let uncontrolled = input.uncontrolled_usage.as_ref().unwrap();
        for i in 0..n {
            if !pinned[i] {
                floors[i] = (controlled[i].max(0.0) + uncontrolled[i].max(0.0)).min(caps[i]);
            }
        }
    }
    let floor_total: f64 = floors.iter().sum();
    if floor_total > remaining_budget + EPSILON && floor_total > 0.0 {
        let scale = remaining_budget / floor_total;
        for f in floors.iter_mut() {
            *f *= scale;
        }
    }

    // Step 5: proportional allocation with iterative cap redistribution.
    let mut planned = pinned_kwh.clone();
    let unpinned: Vec<usize> = (0..n).filter(|&i| !pinned[i]).collect();
    let allocation = allocate(&unpinned, &composite, &floors, &caps, remaining_budget);
    for (i, v) in allocation {
        planned[i] = v;
    }

    // Step 6: split planned kWh back into controlled/uncontrolled.
    let mut planned_controlled = vec![0.0; n];
    let mut planned_uncontrolled = vec![0.0; n];
    for i in 0..n {
        if pinned[i] {
            if split_complete {
                let controlled = input.controlled_usage.as_ref().unwrap()[i].max(0.0);
                let uncontrolled = input.uncontrolled_usage.as_ref().unwrap()[i].max(0.0);
                let total = controlled + uncontrolled;
                if total > EPSILON {
                    planned_controlled[i] = planned[i] * controlled / total;
                    planned_uncontrolled[i] = planned[i] * uncontrolled / total;
                } else {
                    planned_uncontrolled[i] = planned[i];
                }
            } else {
                planned_uncontrolled[i] = planned[i];
            }
            continue;
        }
        if split_complete {
            let controlled = input.controlled_usage.as_ref().unwrap()[i].max(0.0);
            let uncontrolled = input.uncontrolled_usage.as_ref().unwrap()[i].max(0.0);
            let total = controlled + uncontrolled;
            if total > EPSILON {
                planned_controlled[i] = planned[i] * controlled / total;
                planned_uncontrolled[i] = planned[i] - planned_controlled[i];
            } else {
                planned_controlled[i] = planned[i];
            }
        } else {
            planned_controlled[i] = planned[i];
        }
    }

    let allowed_cum_kwh = cumulative(&planned);

    Ok(DailyPlan {
        bucket_start_utc: input.bucket_start_utc.clone(),
        planned_kwh: planned,
        planned_uncontrolled_kwh: planned_uncontrolled,
        planned_controlled_kwh: planned_controlled,
        actual_kwh: input.bucket_usage.clone(),
        allowed_cum_kwh,
        current_bucket_index: input.current_bucket_index,
        daily_budget_kwh: input.daily_budget_kwh,
        price_shaping_active,
        effective_price_shaping_flex_share: effective_flex_share,
        confidence: input.confidence.clamp(0.0, 1.0),
        frozen: input.lock_current_bucket,
    })
}

/// Per-bucket price multiplier plus the global spread factor. Cheap hours
/// (below the remaining-day average) get a factor above 1; expensive hours
/// get a factor below 1.
fn price_factors(input: &DailyPlanInput, n: usize) -> (Vec<f64>, f64, bool) {
    if !input.price_optimization_enabled {
        return (vec![1.0; n], 0.0, false);
    }

    let Some(series) = &input.combined_prices else {
        return (vec![1.0; n], 0.0, false);
    };

    let mut remaining_prices = Vec::with_capacity(n);
    let mut complete = true;
    for i in input.current_bucket_index..n {
        let hour = input.bucket_start_utc[i];
        match series.entry_at(hour) {
            Some(e) if e.total.is_finite() => remaining_prices.push(e.total),
            _ => {
                complete = false;
                break;
            }
        }
    }

    if !complete || remaining_prices.is_empty() {
        return (vec![1.0; n], 0.0, false);
    }

    let avg = remaining_prices.iter().sum::<f64>() / remaining_prices.len() as f64;
    let min = remaining_prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = remaining_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let spread = if avg.abs() > EPSILON { (max - min) / avg.abs() } else { 0.0 };
    let price_spread_factor = spread.clamp(0.0, 1.0);

    let mut factors = vec![1.0; n];
    for i in 0..n {
        let hour = input.bucket_start_utc[i];
        if let Some(entry) = series.entry_at(hour) {
            if entry.total.is_finite() && avg.abs() > EPSILON {
                factors[i] = (avg / entry.total).clamp(0.25, 4.0);
            }
        }
    }

    (factors, price_spread_factor, true)
}

/// Blends base weights with per-bucket price factors by `flex`, then
/// normalizes the result to sum to 1.
fn composite_weights(base: &[f64], price_factors: &[f64], flex: f64) -> Vec<f64> {
    let n = base.len();
    let mut w: Vec<f64> = (0..n)
        .map(|i| {
            let b = base[i].max(0.0);
            b * (1.0 - flex) + b * price_factors.get(i).copied().unwrap_or(1.0) * flex
        })
        .collect();

    let sum: f64 = w.iter().sum();
    if sum > EPSILON {
        for v in w.iter_mut() {
            *v /= sum;
        }
    } else {
        let even = if n > 0 { 1.0 / n as f64 } else { 0.0 };
        w = vec![even; n];
    }
    w
}

/// Distributes `budget` across `indices` proportional to `weights`,
/// respecting per-bucket `floors` and `caps` via iterative overflow
/// redistribution: any bucket at its cap donates its
/// overflow proportionally to uncapped peers until either all are capped
/// or none exceed caps; zero-weight buckets fall back to even allocation
/// of residuals.
fn allocate(indices: &[usize], weights: &[f64], floors: &[f64], caps: &[f64], budget: f64) -> Vec<(usize, f64)> {
    use std::collections::HashMap;

    if indices.is_empty() {
        return Vec::new();
    }

    // Floors are guaranteed first (already scaled to fit inside `budget`).
    let floor_total: f64 = indices.iter().map(|&i| floors[i]).sum();
    let mut pool = (budget - floor_total).max(0.0);
    let mut result: HashMap<usize, f64> = indices.iter().map(|&i| (i, floors[i])).collect();
    let mut open: Vec<usize> = indices.to_vec();

    loop {
        if open.is_empty() || pool <= EPSILON {
            break;
        }

        let weight_sum: f64 = open.iter().map(|&i| weights[i].max(0.0)).sum();
        let mut leftover = 0.0;
        let mut any_capped = false;
        let mut still_open = Vec::new();

        for &i in &open {
            let share = if weight_sum > EPSILON {
                pool * weights[i].max(0.0) / weight_sum
            } else {
                pool / open.len() as f64
            };

            let current = result[&i];
            let cap = caps[i];
            let want = current + share;

            if want >= cap - EPSILON {
                leftover += want - cap;
                result.insert(i, cap);
                any_capped = true;
            } else {
                result.insert(i, want);
                still_open.push(i);
            }
        }

        pool = leftover;
        open = still_open;

        if !any_capped {
            break;
        }
    }

    indices.iter().map(|&i| (i, result[&i])).collect()
}

fn cumulative(planned: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(planned.len());
    let mut running = 0.0;
    for &v in planned {
        running += v.max(0.0);
        out.push(running);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hours(n: usize) -> Vec<DateTime<Utc>> {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| base + chrono::Duration::hours(i as i64)).collect()
    }

    fn base_input(n: usize, budget: f64) -> DailyPlanInput {
        DailyPlanInput {
            bucket_start_utc: hours(n),
            bucket_usage: vec![0.0; n],
            controlled_usage: None,
            uncontrolled_usage: None,
            current_bucket_index: 0,
            used_now_kwh: 0.0,
            daily_budget_kwh: budget,
            base_weights: vec![1.0; n],
            controlled_weights: None,
            combined_prices: None,
            price_optimization_enabled: false,
            price_shaping_enabled: false,
            price_shaping_flex_share: 0.0,
            previous_planned_kwh: None,
            capacity_budget_kwh: None,
            lock_current_bucket: false,
            observed_peak_margin_ratio: 0.1,
            confidence: 1.0,
        }
    }

    #[test]
    fn property_sum_never_exceeds_budget_and_split_sums_to_total() {
        let plan = build_daily_plan(&base_input(24, 8.0)).unwrap();
        let total: f64 = plan.planned_kwh.iter().sum();
        assert!(total <= 8.0 + 1e-6);
        for i in 0..24 {
            assert!(plan.planned_kwh[i] >= 0.0);
            assert!((plan.planned_uncontrolled_kwh[i] + plan.planned_controlled_kwh[i] - plan.planned_kwh[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn uniform_weights_split_budget_evenly() {
        let plan = build_daily_plan(&base_input(4, 8.0)).unwrap();
        for v in &plan.planned_kwh {
            assert!((v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn scenario_s2_capped_at_budget_under_uncontrolled_floors() {
        let n = 8;
        let mut input = base_input(n, 8.0);
        input.controlled_usage = Some(vec![0.0; n]);
        input.uncontrolled_usage = Some(vec![4.0, 4.0, 4.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        input.controlled_weights = Some(vec![1.0; n]);
        input.capacity_budget_kwh = Some(100.0);

        let plan = build_daily_plan(&input).unwrap();
        let sum: f64 = plan.planned_kwh.iter().sum();
        assert!((sum - 8.0).abs() < 1e-6);
        for i in 0..4 {
            assert!((plan.planned_kwh[i] - 2.0).abs() < 0.25, "bucket {} = {}", i, plan.planned_kwh[i]);
        }
    }

    #[test]
    fn scenario_s3_flat_prices_keep_price_shaping_inactive() {
        let n = 24;
        let mut input = base_input(n, 8.0);
        input.price_optimization_enabled = true;
        input.price_shaping_enabled = true;
        input.price_shaping_flex_share = 0.3;
        let entries: Vec<crate::price::models::PriceEntry> = input
            .bucket_start_utc
            .iter()
            .map(|h| crate::price::models::PriceEntry::bare(*h, 100.0))
            .collect();
        input.combined_prices = Some(CombinedPriceSeries {
            entries,
            avg_price: 100.0,
            low_threshold: 90.0,
            high_threshold: 110.0,
            threshold_percent: 10.0,
            min_diff_ore: 5.0,
            price_scheme: crate::price::models::PriceScheme::Norway,
            price_unit: "ore/kWh".to_string(),
            last_fetched: Utc::now(),
        });

        let baseline = build_daily_plan(&base_input(n, 8.0)).unwrap();
        let shaped = build_daily_plan(&input).unwrap();

        assert_eq!(shaped.effective_price_shaping_flex_share, 0.0);
        for i in 0..n {
            assert!((shaped.planned_kwh[i] - baseline.planned_kwh[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn cap_redistribution_respects_caps_and_conserves_total() {
        let n = 4;
        let mut input = base_input(n, 10.0);
        input.capacity_budget_kwh = None;
        input.base_weights = vec![0.0, 1.0, 1.0, 1.0];
        input.controlled_usage = Some(vec![0.0; n]);
        input.uncontrolled_usage = Some(vec![0.0; n]);
        input.controlled_weights = Some(input.base_weights.clone());
        let plan = build_daily_plan(&input).unwrap();
        let sum: f64 = plan.planned_kwh.iter().sum();
        assert!((sum - 10.0).abs() < 1e-6);
    }

    #[test]
    fn past_buckets_are_pinned_to_observed_actuals() {
        let n = 4;
        let mut input = base_input(n, 8.0);
        input.current_bucket_index = 2;
        input.bucket_usage = vec![1.5, 1.0, 0.0, 0.0];
        let plan = build_daily_plan(&input).unwrap();
        assert!((plan.planned_kwh[0] - 1.5).abs() < 1e-9);
        assert!((plan.planned_kwh[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_clamped_into_unit_interval() {
        let mut input = base_input(4, 8.0);
        input.confidence = 1.7;
        let plan = build_daily_plan(&input).unwrap();
        assert_eq!(plan.confidence, 1.0);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut input = base_input(4, 8.0);
        input.base_weights = vec![1.0; 3];
        assert!(matches!(build_daily_plan(&input), Err(PlannerError::LengthMismatch)));
    }
}
