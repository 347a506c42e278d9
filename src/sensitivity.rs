//! Conversions between a temporary target, the sensitivity percentage the dosing
//! algorithm consumes, and the half-basal target that anchors the two.
//!
//! Every function here is pure. Degenerate inputs never produce NaN or infinity;
//! each guard falls back to the value documented on the function.

use crate::models::SliderBoundsConfig;
use serde::{Deserialize, Serialize};

pub const MIN_PERCENTAGE: f64 = 10.0;
pub const MAX_PERCENTAGE: f64 = 200.0;

const RATIO_EPSILON: f64 = 1e-9;
const MAX_WHOLE_TARGET: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderBounds {
    pub low: f64,
    pub high: f64,
}

impl SliderBounds {
    pub fn neutral() -> Self {
        Self {
            low: 100.0,
            high: 100.0,
        }
    }

    pub fn contains(&self, percentage: f64) -> bool {
        percentage >= self.low && percentage <= self.high
    }
}

/// Half-basal target that makes `target` yield `percentage` sensitivity.
///
/// At 100 % the formula has a singularity; that is the no-adjustment case and
/// returns `configured_default`. The result is rounded to a whole mg/dL.
pub fn compute_half_basal_target(
    target: f64,
    percentage: f64,
    normal_target: f64,
    configured_default: f64,
) -> f64 {
    let ratio = percentage / 100.0;
    if !ratio.is_finite() || (ratio - 1.0).abs() < RATIO_EPSILON {
        return configured_default;
    }

    let half_basal = (2.0 * ratio * normal_target - normal_target - ratio * target) / (ratio - 1.0);
    if half_basal.is_finite() {
        half_basal.round()
    } else {
        configured_default
    }
}

/// Sensitivity percentage produced by `target` under `half_basal_target`, capped at `max_ratio`.
pub fn compute_adjusted_percentage(
    half_basal_target: f64,
    target: f64,
    normal_target: f64,
    max_ratio: f64,
) -> f64 {
    let deviation = half_basal_target - normal_target;
    let denominator = deviation + (target - normal_target);

    let ratio = if deviation * denominator <= 0.0 {
        max_ratio
    } else {
        (deviation / denominator).min(max_ratio)
    };
    let ratio = if ratio.is_finite() { ratio } else { max_ratio };

    (ratio * 100.0).round()
}

pub fn is_adjustment_eligible(
    target: f64,
    normal_target: f64,
    low_target_lowers_sensitivity: bool,
    high_target_raises_sensitivity: bool,
    exercise_mode_active: bool,
) -> bool {
    if target < normal_target {
        low_target_lowers_sensitivity
    } else if target > normal_target {
        high_target_raises_sensitivity || exercise_mode_active
    } else {
        false
    }
}

pub fn compute_slider_bounds(
    target: f64,
    normal_target: f64,
    max_ratio: f64,
    config: &SliderBoundsConfig,
) -> SliderBounds {
    if target < normal_target {
        SliderBounds {
            low: config.below_normal_floor,
            high: (max_ratio * 100.0).max(config.below_normal_floor),
        }
    } else if target > normal_target {
        SliderBounds {
            low: config.above_normal_floor,
            high: config.above_normal_ceiling,
        }
    } else {
        SliderBounds::neutral()
    }
}

/// Snaps an unaligned percentage to a multiple of `step` on the side closer to
/// 100, never crossing it, then clamps to the allowed range.
pub fn round_percentage_to_step(percentage: f64, step: f64) -> f64 {
    if !percentage.is_finite() {
        return 100.0;
    }
    if !step.is_finite() || step <= 0.0 {
        return percentage.clamp(MIN_PERCENTAGE, MAX_PERCENTAGE);
    }

    let quotient = percentage / step;
    let snapped = if (quotient - quotient.round()).abs() < RATIO_EPSILON {
        quotient.round() * step
    } else if percentage > 100.0 {
        (quotient.floor() * step).max(100.0)
    } else {
        (quotient.ceil() * step).min(100.0)
    };

    snapped.clamp(MIN_PERCENTAGE, MAX_PERCENTAGE)
}

/// Raises a target by the shortfall of its whole part to the next multiple of
/// `step`. The fractional part is kept; targets too large or not finite come
/// back unchanged.
pub fn round_target_to_step(target: f64, step: u32) -> f64 {
    let Some(whole) = whole_target(target) else {
        return target;
    };
    if step == 0 {
        return target;
    }

    let step = i64::from(step);
    let remainder = whole.rem_euclid(step);
    if remainder == 0 {
        target
    } else {
        target + (step - remainder) as f64
    }
}

fn whole_target(target: f64) -> Option<i64> {
    if !target.is_finite() || target.abs() > MAX_WHOLE_TARGET {
        return None;
    }
    Some(target.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::{
        compute_adjusted_percentage, compute_half_basal_target, compute_slider_bounds, is_adjustment_eligible,
        round_percentage_to_step, round_target_to_step, SliderBounds,
    };
    use crate::models::SliderBoundsConfig;

    #[test]
    fn half_basal_matches_reference_scenarios() {
        assert_eq!(compute_half_basal_target(120.0, 75.0, 100.0, 160.0), 160.0);
        assert_eq!(compute_half_basal_target(140.0, 60.0, 100.0, 160.0), 160.0);
    }

    #[test]
    fn half_basal_singularity_returns_default() {
        assert_eq!(compute_half_basal_target(150.0, 100.0, 100.0, 175.0), 175.0);
        assert_eq!(compute_half_basal_target(150.0, f64::NAN, 100.0, 175.0), 175.0);
    }

    #[test]
    fn adjusted_percentage_inverts_half_basal() {
        for (target, percentage) in [(120.0, 75.0), (140.0, 60.0), (90.0, 110.0), (150.0, 85.0), (130.0, 70.0)] {
            let half_basal = compute_half_basal_target(target, percentage, 100.0, 160.0);
            let back = compute_adjusted_percentage(half_basal, target, 100.0, 1.2);
            assert!(
                (back - percentage).abs() <= 1.0,
                "target {target} percentage {percentage} came back as {back}"
            );
        }
    }

    #[test]
    fn adjusted_percentage_guards_sign_flip_and_caps() {
        // Half-basal below normal with a high target flips the sign.
        assert_eq!(compute_adjusted_percentage(90.0, 140.0, 100.0, 1.2), 120.0);
        // Degenerate denominator.
        assert_eq!(compute_adjusted_percentage(160.0, 40.0, 100.0, 1.2), 120.0);
        // Raw ratio above the cap is clamped.
        assert_eq!(compute_adjusted_percentage(160.0, 80.0, 100.0, 1.2), 120.0);
        assert!(compute_adjusted_percentage(100.0, 100.0, 100.0, 1.2).is_finite());
    }

    #[test]
    fn eligibility_follows_policy_flags() {
        assert!(is_adjustment_eligible(80.0, 100.0, true, false, false));
        assert!(!is_adjustment_eligible(80.0, 100.0, false, true, true));
        assert!(is_adjustment_eligible(140.0, 100.0, false, true, false));
        assert!(is_adjustment_eligible(140.0, 100.0, false, false, true));
        assert!(!is_adjustment_eligible(140.0, 100.0, true, false, false));
        assert!(!is_adjustment_eligible(100.0, 100.0, true, true, true));
    }

    #[test]
    fn slider_bounds_depend_on_target_side() {
        let config = SliderBoundsConfig::default();
        let low = compute_slider_bounds(80.0, 100.0, 1.2, &config);
        assert_eq!(low, SliderBounds { low: 105.0, high: 120.0 });
        let high = compute_slider_bounds(150.0, 100.0, 1.2, &config);
        assert_eq!(high, SliderBounds { low: 15.0, high: 95.0 });
        assert_eq!(compute_slider_bounds(100.0, 100.0, 1.2, &config), SliderBounds::neutral());
    }

    #[test]
    fn percentage_snaps_toward_neutral() {
        assert_eq!(round_percentage_to_step(107.0, 5.0), 105.0);
        assert_eq!(round_percentage_to_step(93.0, 5.0), 95.0);
        assert_eq!(round_percentage_to_step(110.0, 5.0), 110.0);
        assert_eq!(round_percentage_to_step(3.0, 5.0), 10.0);
        assert_eq!(round_percentage_to_step(240.0, 5.0), 200.0);
        assert_eq!(round_percentage_to_step(102.0, 7.0), 100.0);
    }

    #[test]
    fn target_rounds_up_to_step() {
        assert_eq!(round_target_to_step(123.0, 5), 125.0);
        assert_eq!(round_target_to_step(125.0, 5), 125.0);
        assert_eq!(round_target_to_step(99.4, 1), 99.4);
        assert_eq!(round_target_to_step(125.5, 5), 125.5);
        assert_eq!(round_target_to_step(123.5, 5), 125.5);
        assert!(round_target_to_step(121.5, 5) >= 121.5);
        assert_eq!(round_target_to_step(121.0, 0), 121.0);
        assert!(round_target_to_step(f64::NAN, 5).is_nan());
        assert_eq!(round_target_to_step(f64::INFINITY, 5), f64::INFINITY);
    }
}
