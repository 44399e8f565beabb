//! Volatility estimator: resample-to-bucket, EWMA variance, annualization,
//! and quality classification with a "last good sigma" fallback tier.
//!
//! Ported from `examples/original_source/src/kalshi_bot/models/volatility.py`
//! and the sigma-state construction in
//! `examples/original_source/src/kalshi_bot/strategy/edge_state_engine.py`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const SECONDS_PER_YEAR: f64 = 365.0 * 86_400.0;

/// Closed set of reasons a sigma estimate fell back, mirrored field-for-field
/// from the source system so downstream consumers (opportunity gating) can
/// match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaReason {
    MissingStep,
    BadStepSeconds,
    InsufficientPoints,
    InsufficientHistorySpan,
    SigmaEwmaMissing,
    NonfiniteSigma,
    NonpositiveSigma,
    OutOfBounds,
    SigmaMissing,
}

impl SigmaReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingStep => "missing_step",
            Self::BadStepSeconds => "bad_step_seconds",
            Self::InsufficientPoints => "insufficient_points",
            Self::InsufficientHistorySpan => "insufficient_history_span",
            Self::SigmaEwmaMissing => "sigma_ewma_missing",
            Self::NonfiniteSigma => "nonfinite_sigma",
            Self::NonpositiveSigma => "nonpositive_sigma",
            Self::OutOfBounds => "out_of_bounds",
            Self::SigmaMissing => "sigma_missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaSource {
    Ewma,
    History,
    Default,
}

impl SigmaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ewma => "ewma",
            Self::History => "history",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaQuality {
    Ok,
    FallbackHistory,
    FallbackDefault,
}

impl SigmaQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FallbackHistory => "fallback_history",
            Self::FallbackDefault => "fallback_default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SigmaEstimate {
    pub sigma: f64,
    pub sigma_unclamped: Option<f64>,
    pub sigma_source: SigmaSource,
    pub sigma_ok: bool,
    pub sigma_reason: Option<SigmaReason>,
    pub sigma_reason_context: Option<String>,
    pub sigma_quality: SigmaQuality,
    pub sigma_points_used: usize,
    pub sigma_lookback_seconds_used: i64,
    pub min_sigma_points: usize,
    pub min_sigma_lookback_seconds: i64,
    pub step_seconds: f64,
    pub raw_points: usize,
    pub resampled_points: usize,
}

#[derive(Debug, Clone)]
pub struct VolatilityParams {
    pub lookback_seconds: i64,
    pub max_spot_points: usize,
    pub ewma_lambda: f64,
    pub min_points: usize,
    pub min_sigma_lookback_seconds: i64,
    pub resample_seconds: i64,
    pub sigma_default: f64,
    pub sigma_max: f64,
}

impl Default for VolatilityParams {
    fn default() -> Self {
        Self {
            lookback_seconds: 3600,
            max_spot_points: 20_000,
            ewma_lambda: 0.94,
            min_points: 30,
            min_sigma_lookback_seconds: 120,
            resample_seconds: 10,
            sigma_default: 0.5,
            sigma_max: 5.0,
        }
    }
}

/// Resample a raw `(ts, price)` series onto a uniform grid with step
/// `bucket_seconds`, last-price-in-bucket. Ported from
/// `resample_last_price_series`.
pub fn resample_last_price_series(
    timestamps: &[i64],
    prices: &[f64],
    bucket_seconds: i64,
) -> (Vec<i64>, Vec<f64>) {
    if timestamps.is_empty() || bucket_seconds <= 0 {
        return (Vec::new(), Vec::new());
    }
    let mut out_ts = Vec::new();
    let mut out_px = Vec::new();
    let first_bucket = timestamps[0] / bucket_seconds;
    let mut current_bucket = first_bucket;
    let mut last_price = prices[0];
    for (ts, px) in timestamps.iter().zip(prices.iter()) {
        let bucket = ts / bucket_seconds;
        if bucket != current_bucket {
            out_ts.push(current_bucket * bucket_seconds);
            out_px.push(last_price);
            current_bucket = bucket;
        }
        last_price = *px;
    }
    out_ts.push(current_bucket * bucket_seconds);
    out_px.push(last_price);
    (out_ts, out_px)
}

/// Log returns over cleaned (positive) prices.
pub fn compute_log_returns(prices: &[f64]) -> Vec<f64> {
    let cleaned: Vec<f64> = prices.iter().copied().filter(|p| *p > 0.0).collect();
    if cleaned.len() < 2 {
        return Vec::new();
    }
    cleaned
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

/// EWMA volatility per sqrt(step) via the variance recursion
/// `v_t = lambda*v_{t-1} + (1-lambda)*r_t^2`.
pub fn ewma_volatility(returns: &[f64], lambda: f64) -> Option<f64> {
    if returns.is_empty() {
        return None;
    }
    if !(0.0 < lambda && lambda < 1.0) {
        return None;
    }
    let mut var = returns[0] * returns[0];
    for r in &returns[1..] {
        var = lambda * var + (1.0 - lambda) * (r * r);
    }
    Some(var.sqrt())
}

pub fn annualize_vol(vol_per_sqrt_step: f64, step_seconds: f64) -> Option<f64> {
    if step_seconds <= 0.0 {
        return None;
    }
    Some(vol_per_sqrt_step * (SECONDS_PER_YEAR / step_seconds).sqrt())
}

fn estimate_step_seconds(timestamps: &[i64]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }
    let mut diffs: Vec<i64> = timestamps
        .windows(2)
        .filter_map(|w| if w[1] > w[0] { Some(w[1] - w[0]) } else { None })
        .collect();
    if diffs.is_empty() {
        return None;
    }
    diffs.sort_unstable();
    Some(diffs[diffs.len() / 2] as f64)
}

fn sigma_reason_context(
    reason: SigmaReason,
    history_span_seconds: i64,
    min_sigma_lookback_seconds: i64,
    sigma_points_used: usize,
    min_points: usize,
    sigma_raw: Option<f64>,
    sigma_max: f64,
    step_seconds: f64,
) -> String {
    match reason {
        SigmaReason::InsufficientHistorySpan => format!(
            "history_span_seconds={history_span_seconds} < min_sigma_lookback_seconds={min_sigma_lookback_seconds}"
        ),
        SigmaReason::InsufficientPoints => {
            format!("sigma_points_used={sigma_points_used} < min_points={min_points}")
        }
        SigmaReason::OutOfBounds => {
            format!("sigma_unclamped={:?} > sigma_max={sigma_max}", sigma_raw)
        }
        SigmaReason::NonfiniteSigma => format!("sigma_unclamped={:?} is not finite", sigma_raw),
        SigmaReason::NonpositiveSigma => format!("sigma_unclamped={:?} <= 0", sigma_raw),
        SigmaReason::SigmaEwmaMissing => "ewma_volatility returned no estimate".to_string(),
        SigmaReason::BadStepSeconds => format!("step_seconds={step_seconds} outside [1, 3600]"),
        SigmaReason::MissingStep => "resample step is missing or invalid".to_string(),
        SigmaReason::SigmaMissing => "sigma estimate unexpectedly missing".to_string(),
    }
}

/// Tracks the most recent accepted (`sigma_ok`) sigma, so a tick whose gates
/// fail can fall back to `fallback_history` instead of the hard default.
#[derive(Debug, Default, Clone)]
pub struct SigmaMemory {
    pub last_good_sigma: Option<f64>,
}

/// Caps a raw spot-history fetch: expand the lookback window up to 6 times
/// if the only reason the span is short is that the row-count cap truncated
/// it, capped at 200_000 points total. Returns the (possibly expanded)
/// points to use.
pub fn expand_history_if_capped<F>(
    mut lookback_seconds: i64,
    max_spot_points: usize,
    mut fetch: F,
) -> (Vec<i64>, Vec<f64>, i64)
where
    F: FnMut(i64) -> (Vec<i64>, Vec<f64>),
{
    const MAX_ATTEMPTS: usize = 6;
    const HARD_POINT_CAP: usize = 200_000;
    let (mut ts, mut px) = fetch(lookback_seconds);
    let mut attempts = 0;
    while attempts < MAX_ATTEMPTS
        && max_spot_points > 0
        && ts.len() >= max_spot_points
        && ts.len() < HARD_POINT_CAP
    {
        lookback_seconds = lookback_seconds.saturating_mul(2);
        let (next_ts, next_px) = fetch(lookback_seconds);
        if next_ts.len() <= ts.len() {
            break;
        }
        ts = next_ts;
        px = next_px;
        attempts += 1;
    }
    (ts, px, lookback_seconds)
}

/// Warning rate limiter: at most one log line per reason per 15 minutes,
/// for the two commonest reasons (insufficient_history_span,
/// insufficient_points).
pub struct SigmaWarningGate {
    last_logged: HashMap<&'static str, Instant>,
    interval: Duration,
}

impl Default for SigmaWarningGate {
    fn default() -> Self {
        Self {
            last_logged: HashMap::new(),
            interval: Duration::from_secs(15 * 60),
        }
    }
}

const THROTTLED_REASONS: &[&str] = &["insufficient_history_span", "insufficient_points"];

impl SigmaWarningGate {
    /// Returns true if a warning for `reason` should be logged now.
    pub fn should_log(&mut self, reason: &'static str) -> bool {
        if !THROTTLED_REASONS.contains(&reason) {
            return true;
        }
        let now = Instant::now();
        match self.last_logged.get(reason) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_logged.insert(reason, now);
                true
            }
        }
    }
}

/// Compute an annualized sigma estimate from a raw `(ts, price)` spot
/// history window, with quality gating and last-good fallback.
pub fn estimate_sigma(
    raw_timestamps: &[i64],
    raw_prices: &[f64],
    memory: &mut SigmaMemory,
    params: &VolatilityParams,
) -> SigmaEstimate {
    let mut raw_timestamps = raw_timestamps.to_vec();
    let mut raw_prices = raw_prices.to_vec();
    if params.max_spot_points > 0 && raw_timestamps.len() > params.max_spot_points {
        let start = raw_timestamps.len() - params.max_spot_points;
        raw_timestamps = raw_timestamps[start..].to_vec();
        raw_prices = raw_prices[start..].to_vec();
    }

    let history_span_seconds = if raw_timestamps.len() >= 2 {
        raw_timestamps[raw_timestamps.len() - 1] - raw_timestamps[0]
    } else {
        0
    };

    let mut reason: Option<SigmaReason> = None;
    let mut sigma_raw: Option<f64> = None;
    let mut step_seconds = params.resample_seconds as f64;
    let mut sigma_points_used = 0usize;
    let raw_points = raw_timestamps.len();
    let mut resampled_points = 0usize;

    if raw_timestamps.is_empty() {
        reason = Some(SigmaReason::InsufficientPoints);
    } else {
        let bucket_seconds = params.resample_seconds.max(1);
        let (resampled_ts, resampled_px) =
            resample_last_price_series(&raw_timestamps, &raw_prices, bucket_seconds);
        resampled_points = resampled_ts.len();

        match estimate_step_seconds(&resampled_ts) {
            None => reason = Some(SigmaReason::MissingStep),
            Some(step) => step_seconds = step,
        }
        if reason.is_none() && !(1.0..=3600.0).contains(&step_seconds) {
            reason = Some(SigmaReason::BadStepSeconds);
        }

        let returns = if reason.is_none() {
            compute_log_returns(&resampled_px)
        } else {
            Vec::new()
        };
        sigma_points_used = returns.len();
        if reason.is_none() && sigma_points_used < params.min_points {
            reason = Some(SigmaReason::InsufficientPoints);
        }
        if reason.is_none() && history_span_seconds < params.min_sigma_lookback_seconds {
            reason = Some(SigmaReason::InsufficientHistorySpan);
        }
        if reason.is_none() {
            match ewma_volatility(&returns, params.ewma_lambda) {
                None => reason = Some(SigmaReason::SigmaEwmaMissing),
                Some(vol_step) => {
                    let annualized = annualize_vol(vol_step, step_seconds).unwrap_or(f64::NAN);
                    sigma_raw = Some(annualized);
                    if !annualized.is_finite() {
                        reason = Some(SigmaReason::NonfiniteSigma);
                    } else if annualized <= 0.0 {
                        reason = Some(SigmaReason::NonpositiveSigma);
                    } else if annualized > params.sigma_max {
                        reason = Some(SigmaReason::OutOfBounds);
                    }
                }
            }
        }
    }

    let (sigma, sigma_source, sigma_ok) = if reason.is_none() {
        let s = sigma_raw.expect("sigma_raw set whenever reason is None");
        memory.last_good_sigma = Some(s);
        (s, SigmaSource::Ewma, true)
    } else if let Some(last_good) = memory.last_good_sigma {
        (last_good, SigmaSource::History, false)
    } else {
        (params.sigma_default, SigmaSource::Default, false)
    };

    let sigma_quality = if reason.is_none() {
        SigmaQuality::Ok
    } else if sigma_source == SigmaSource::History {
        SigmaQuality::FallbackHistory
    } else {
        SigmaQuality::FallbackDefault
    };

    let sigma_reason_context = reason.map(|r| {
        sigma_reason_context(
            r,
            history_span_seconds,
            params.min_sigma_lookback_seconds,
            sigma_points_used,
            params.min_points,
            sigma_raw,
            params.sigma_max,
            step_seconds,
        )
    });

    SigmaEstimate {
        sigma,
        sigma_unclamped: sigma_raw,
        sigma_source,
        sigma_ok,
        sigma_reason: reason,
        sigma_reason_context,
        sigma_quality,
        sigma_points_used,
        sigma_lookback_seconds_used: history_span_seconds,
        min_sigma_points: params.min_points,
        min_sigma_lookback_seconds: params.min_sigma_lookback_seconds,
        step_seconds,
        raw_points,
        resampled_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize, step: i64, start_price: f64, drift: f64) -> (Vec<i64>, Vec<f64>) {
        let ts = (0..n as i64).map(|i| i * step).collect();
        let px = (0..n).map(|i| start_price + drift * i as f64).collect();
        (ts, px)
    }

    #[test]
    fn resample_takes_last_price_in_bucket() {
        let ts = vec![0, 1, 9, 10, 19];
        let px = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let (out_ts, out_px) = resample_last_price_series(&ts, &px, 10);
        assert_eq!(out_ts, vec![0, 10, 10]);
        assert_eq!(out_px, vec![2.0, 3.0, 5.0]);
    }

    #[test]
    fn ok_sigma_when_gates_pass() {
        let (ts, px) = series(200, 10, 50_000.0, 0.01);
        let mut memory = SigmaMemory::default();
        let params = VolatilityParams {
            min_sigma_lookback_seconds: 100,
            ..Default::default()
        };
        let est = estimate_sigma(&ts, &px, &mut memory, &params);
        assert!(est.sigma_ok);
        assert_eq!(est.sigma_source, SigmaSource::Ewma);
        assert_eq!(est.sigma_quality, SigmaQuality::Ok);
    }

    #[test]
    fn s2_short_history_falls_back_to_default() {
        // S2: 4 spot ticks within a 20-second span, min_sigma_lookback_seconds=120.
        let ts = vec![0, 5, 12, 20];
        let px = vec![50_000.0, 50_010.0, 50_005.0, 50_020.0];
        let mut memory = SigmaMemory::default();
        let params = VolatilityParams {
            min_sigma_lookback_seconds: 120,
            resample_seconds: 1,
            min_points: 1,
            ..Default::default()
        };
        let est = estimate_sigma(&ts, &px, &mut memory, &params);
        assert_eq!(est.sigma_source, SigmaSource::Default);
        assert_eq!(est.sigma_reason, Some(SigmaReason::InsufficientHistorySpan));
        assert!(!est.sigma_ok);
    }

    #[test]
    fn falls_back_to_history_when_last_good_exists() {
        let (ts, px) = series(200, 10, 50_000.0, 0.01);
        let mut memory = SigmaMemory::default();
        let params = VolatilityParams {
            min_sigma_lookback_seconds: 100,
            ..Default::default()
        };
        let first = estimate_sigma(&ts, &px, &mut memory, &params);
        assert!(first.sigma_ok);

        // Next tick: starve the gates (too few points) but memory retains last good.
        let params_strict = VolatilityParams {
            min_points: 10_000,
            ..params
        };
        let second = estimate_sigma(&ts, &px, &mut memory, &params_strict);
        assert!(!second.sigma_ok);
        assert_eq!(second.sigma_source, SigmaSource::History);
        assert_eq!(second.sigma, first.sigma);
    }

    #[test]
    fn warning_gate_rate_limits_throttled_reasons() {
        let mut gate = SigmaWarningGate::default();
        assert!(gate.should_log("insufficient_points"));
        assert!(!gate.should_log("insufficient_points"));
        assert!(gate.should_log("bad_step_seconds"));
        assert!(gate.should_log("bad_step_seconds"));
    }

    #[test]
    fn expand_history_stops_once_row_cap_is_not_the_bottleneck() {
        let calls = std::cell::RefCell::new(0);
        let (ts, _px, lookback) = expand_history_if_capped(60, 10, |lookback| {
            *calls.borrow_mut() += 1;
            let n = (lookback / 10).min(10) as usize;
            let ts: Vec<i64> = (0..n as i64).map(|i| i * 10).collect();
            let px = vec![1.0; n];
            (ts, px)
        });
        assert!(lookback >= 60);
        assert!(ts.len() <= 10);
        assert!(*calls.borrow() <= 7);
    }
}
