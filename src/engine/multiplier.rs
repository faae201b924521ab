//! The multiplier model (§3): `multiplier = clamp(MIN..MAX, (1 -
//! HOUSE_EDGE) / P(hit))`, where `P(hit)` is a Gaussian-decay hit
//! probability in row distance from the current row, penalized by the
//! remaining time to target (more time outstanding means more trajectory
//! uncertainty, so the spread widens and probability falls).
//!
//! Computed server-side at admission and rounded to 4 decimals; clients
//! never supply it.

use crate::config::{HOUSE_EDGE, MAX_MULTIPLIER, MIN_MULTIPLIER};

/// Row-distance standard deviation grows with the square root of the
/// remaining time, the textbook scaling for a diffusing trajectory.
const BASE_SIGMA_PER_SQRT_SEC: f64 = 0.9;
const MIN_SIGMA: f64 = 0.35;
const MIN_HIT_PROBABILITY: f64 = (1.0 - HOUSE_EDGE) / MAX_MULTIPLIER;

pub fn hit_probability(current_row: f64, target_row: f64, remaining_time: f64) -> f64 {
    let remaining = remaining_time.max(0.05);
    let sigma = (BASE_SIGMA_PER_SQRT_SEC * remaining.sqrt()).max(MIN_SIGMA);
    let distance = (target_row - current_row).abs();
    let exponent = -0.5 * (distance / sigma).powi(2);
    exponent.exp().clamp(MIN_HIT_PROBABILITY, 1.0)
}

/// Server-side multiplier for a bet placed now, rounded to 4 decimals.
pub fn compute_multiplier(current_row: f64, target_row: f64, remaining_time: f64) -> f64 {
    let p_hit = hit_probability(current_row, target_row, remaining_time);
    let raw = (1.0 - HOUSE_EDGE) / p_hit;
    let clamped = raw.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
    (clamped * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_is_low_for_a_near_certain_hit() {
        let m = compute_multiplier(6.5, 6.5, 0.1);
        assert!(m >= MIN_MULTIPLIER);
        assert!(m < 2.0);
    }

    #[test]
    fn multiplier_rises_with_row_distance() {
        let near = compute_multiplier(6.5, 6.5, 5.0);
        let far = compute_multiplier(6.5, 12.0, 5.0);
        assert!(far > near);
    }

    #[test]
    fn multiplier_stays_within_bounds() {
        let m = compute_multiplier(0.0, 13.0, 0.1);
        assert!((MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&m));
    }

    #[test]
    fn multiplier_is_finite_and_positive() {
        let m = compute_multiplier(3.0, 9.0, 30.0);
        assert!(m.is_finite());
        assert!(m > 0.0);
    }
}
