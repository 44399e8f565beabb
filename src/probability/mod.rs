//! Lognormal probability model for the underlying spot price.
//!
//! Geometric Brownian motion with mu=0 (so `E[S_T] = S_0`):
//! `ln(S_T / S_0) ~ Normal(-0.5*sigma^2*t, sigma^2*t)`. Time is converted to
//! year fractions using a 365-day year.
//!
//! Ported from `examples/original_source/src/kalshi_bot/models/probability.py`.

use statrs::distribution::{ContinuousCDF, Normal};

pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;
pub const EPS: f64 = 1e-12;

fn clamp_prob(prob: f64) -> f64 {
    prob.max(EPS).min(1.0 - EPS)
}

fn year_fraction(horizon_seconds: f64) -> f64 {
    horizon_seconds / SECONDS_PER_YEAR
}

fn norm_cdf(x: f64) -> f64 {
    Normal::new(0.0, 1.0)
        .expect("standard normal parameters are always valid")
        .cdf(x)
}

fn step_prob(spot: f64, threshold: f64, greater: bool) -> Option<f64> {
    if spot <= 0.0 {
        return None;
    }
    if greater {
        Some(if spot >= threshold { 1.0 } else { 0.0 })
    } else {
        Some(if spot <= threshold { 1.0 } else { 0.0 })
    }
}

/// Unclamped `P(S_T <= K)` under mu=0 GBM. `horizon_seconds <= 0` returns a
/// deterministic step at spot. Invalid inputs (spot<=0, K<=0, sigma<=0)
/// return `None` once the horizon is positive.
pub fn prob_less_equal_raw(spot: f64, k: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    if horizon_seconds <= 0.0 {
        return step_prob(spot, k, false);
    }
    if spot <= 0.0 || sigma_annualized <= 0.0 || k <= 0.0 {
        return None;
    }
    let t = year_fraction(horizon_seconds);
    if t <= 0.0 {
        return step_prob(spot, k, false);
    }
    let sigma_t = sigma_annualized * t.sqrt();
    if sigma_t <= 0.0 {
        return None;
    }
    let z = ((k / spot).ln() + 0.5 * sigma_t * sigma_t) / sigma_t;
    Some(norm_cdf(z))
}

pub fn prob_greater_equal_raw(spot: f64, k: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    if horizon_seconds <= 0.0 {
        return step_prob(spot, k, true);
    }
    let p = prob_less_equal_raw(spot, k, horizon_seconds, sigma_annualized)?;
    Some(1.0 - p)
}

/// Boundary convention is `[lower, upper)`.
pub fn prob_between_raw(spot: f64, lower: f64, upper: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    if upper <= lower {
        return None;
    }
    if horizon_seconds <= 0.0 {
        if spot <= 0.0 {
            return None;
        }
        return Some(if lower <= spot && spot < upper { 1.0 } else { 0.0 });
    }
    let upper_raw = prob_less_equal_raw(spot, upper, horizon_seconds, sigma_annualized)?;
    let lower_raw = prob_less_equal_raw(spot, lower, horizon_seconds, sigma_annualized)?;
    Some(upper_raw - lower_raw)
}

pub fn prob_less_equal(spot: f64, k: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    prob_less_equal_raw(spot, k, horizon_seconds, sigma_annualized).map(clamp_prob)
}

pub fn prob_greater_equal(spot: f64, k: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    prob_greater_equal_raw(spot, k, horizon_seconds, sigma_annualized).map(clamp_prob)
}

pub fn prob_between(spot: f64, lower: f64, upper: f64, horizon_seconds: f64, sigma_annualized: f64) -> Option<f64> {
    if upper <= lower {
        return None;
    }
    if horizon_seconds <= 0.0 {
        if spot <= 0.0 {
            return None;
        }
        return Some(clamp_prob(if lower <= spot && spot < upper { 1.0 } else { 0.0 }));
    }
    let upper_prob = prob_less_equal(spot, upper, horizon_seconds, sigma_annualized)?;
    let lower_prob = prob_less_equal(spot, lower, horizon_seconds, sigma_annualized)?;
    Some(clamp_prob(upper_prob - lower_prob))
}

/// Strike shape a contract's YES payoff is defined over, matching
/// `events::ContractUpdatePayload::strike_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeType {
    Less,
    Greater,
    Between,
}

impl StrikeType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "less" => Some(Self::Less),
            "greater" => Some(Self::Greater),
            "between" => Some(Self::Between),
            _ => None,
        }
    }
}

/// YES probability per contract shape, unclamped diagnostic form.
pub fn prob_yes_for_contract_raw(
    spot: f64,
    sigma: f64,
    horizon_seconds: f64,
    strike_type: StrikeType,
    lower: Option<f64>,
    upper: Option<f64>,
) -> Option<f64> {
    match strike_type {
        StrikeType::Less => {
            let upper = upper?;
            if upper <= 0.0 {
                return None;
            }
            prob_less_equal_raw(spot, upper, horizon_seconds, sigma)
        }
        StrikeType::Greater => {
            let lower = lower?;
            if lower <= 0.0 {
                return None;
            }
            prob_greater_equal_raw(spot, lower, horizon_seconds, sigma)
        }
        StrikeType::Between => {
            let (lower, upper) = (lower?, upper?);
            if lower <= 0.0 || upper <= 0.0 || upper <= lower {
                return None;
            }
            prob_between_raw(spot, lower, upper, horizon_seconds, sigma)
        }
    }
}

/// YES probability per contract shape, clamped to `[EPS, 1-EPS]`.
pub fn prob_yes_for_contract(
    spot: f64,
    sigma: f64,
    horizon_seconds: f64,
    strike_type: StrikeType,
    lower: Option<f64>,
    upper: Option<f64>,
) -> Option<f64> {
    match strike_type {
        StrikeType::Less => {
            let upper = upper?;
            if upper <= 0.0 {
                return None;
            }
            prob_less_equal(spot, upper, horizon_seconds, sigma)
        }
        StrikeType::Greater => {
            let lower = lower?;
            if lower <= 0.0 {
                return None;
            }
            prob_greater_equal(spot, lower, horizon_seconds, sigma)
        }
        StrikeType::Between => {
            let (lower, upper) = (lower?, upper?);
            if lower <= 0.0 || upper <= 0.0 || upper <= lower {
                return None;
            }
            prob_between(spot, lower, upper, horizon_seconds, sigma)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_bounds_are_clamped() {
        let p = prob_less_equal(100.0, 1e9, 3600.0, 0.5).unwrap();
        assert!(p >= EPS && p <= 1.0 - EPS);
        let p2 = prob_less_equal(100.0, 1e-9, 3600.0, 0.5).unwrap();
        assert!(p2 >= EPS && p2 <= 1.0 - EPS);
    }

    #[test]
    fn complementarity_holds() {
        let greater = prob_greater_equal_raw(100.0, 95.0, 3600.0, 0.5).unwrap();
        let less = prob_less_equal_raw(100.0, 95.0, 3600.0, 0.5).unwrap();
        assert!((greater + less - 1.0).abs() < 1e-12);
    }

    #[test]
    fn between_additivity_holds() {
        let between = prob_between_raw(100.0, 90.0, 110.0, 3600.0, 0.5).unwrap();
        let upper = prob_less_equal_raw(100.0, 110.0, 3600.0, 0.5).unwrap();
        let lower = prob_less_equal_raw(100.0, 90.0, 3600.0, 0.5).unwrap();
        assert!((between - (upper - lower)).abs() < 1e-12);
    }

    #[test]
    fn less_is_monotone_in_upper_strike() {
        let small = prob_less_equal(100.0, 99.0, 3600.0, 0.5).unwrap();
        let large = prob_less_equal(100.0, 150.0, 3600.0, 0.5).unwrap();
        assert!(large >= small);
    }

    #[test]
    fn zero_horizon_is_a_deterministic_step() {
        assert_eq!(prob_less_equal(100.0, 110.0, 0.0, 0.5), Some(1.0 - EPS));
        assert_eq!(prob_less_equal(100.0, 90.0, 0.0, 0.5), Some(EPS));
        assert_eq!(prob_greater_equal(100.0, 90.0, 0.0, 0.5), Some(1.0 - EPS));
    }

    #[test]
    fn invalid_inputs_return_none() {
        assert!(prob_less_equal(-1.0, 100.0, 3600.0, 0.5).is_none());
        assert!(prob_less_equal(100.0, -1.0, 3600.0, 0.5).is_none());
        assert!(prob_less_equal(100.0, 100.0, 3600.0, -0.5).is_none());
        assert!(prob_between(100.0, 110.0, 90.0, 3600.0, 0.5).is_none());
    }

    #[test]
    fn s1_greater_contract_yes_ev_scenario() {
        // S1: sigma=0.5, S=100, horizon=3600, greater contract lower=95.
        let prob_yes =
            prob_yes_for_contract(100.0, 0.5, 3600.0, StrikeType::Greater, Some(95.0), None).unwrap();
        assert!(prob_yes > 0.5);
    }
}
