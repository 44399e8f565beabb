//! Health summary computation: side-effect-free arithmetic over the
//! projection counts the persistence store exposes.
//!
//! Ported from `examples/original_source/src/kalshi_bot/app/live_stack_health.py`
//! (`_collect_live_health_postgres_sync` / `format_live_health`), the
//! richer of the two variants there since it already reports execution
//! reject rate alongside staleness ages — the one this crate's
//! SQLite-backed projections line up with.

use crate::persistence::HealthProjectionCounts;

#[derive(Debug, Clone)]
pub struct StalenessThresholds {
    pub spot_seconds: i64,
    pub quote_seconds: i64,
    pub snapshot_seconds: i64,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            spot_seconds: 120,
            quote_seconds: 120,
            snapshot_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthStaleness {
    pub spot: bool,
    pub quote: bool,
    pub snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub now_ts: i64,
    pub window_minutes: i64,
    pub spot_tick_age_seconds: Option<i64>,
    pub quote_age_seconds: Option<i64>,
    pub snapshot_age_seconds: Option<i64>,
    pub snapshots_last_window: i64,
    pub opportunities_last_window: i64,
    pub execution_orders_last_window: i64,
    pub execution_rejects_last_window: i64,
    pub execution_reject_rate_last_window: Option<f64>,
    pub stale: HealthStaleness,
    pub ok: bool,
}

fn age(now_ts: i64, ts: Option<i64>) -> Option<i64> {
    ts.map(|ts| (now_ts - ts).max(0))
}

/// Build a `HealthSummary` from raw projection counts. Pure: no I/O, no
/// counter mutation — callers run the query, then call this.
pub fn compute(
    now_ts: i64,
    window_minutes: i64,
    counts: &HealthProjectionCounts,
    thresholds: &StalenessThresholds,
) -> HealthSummary {
    let spot_tick_age_seconds = age(now_ts, counts.latest_spot_ts);
    let quote_age_seconds = age(now_ts, counts.latest_quote_ts);
    let snapshot_age_seconds = age(now_ts, counts.latest_snapshot_ts);

    let stale = HealthStaleness {
        spot: spot_tick_age_seconds.is_none_or(|a| a > thresholds.spot_seconds),
        quote: quote_age_seconds.is_none_or(|a| a > thresholds.quote_seconds),
        snapshot: snapshot_age_seconds.is_none_or(|a| a > thresholds.snapshot_seconds),
    };
    let ok = !stale.spot && !stale.quote && !stale.snapshot;

    let execution_reject_rate_last_window = if counts.execution_orders_last_window > 0 {
        Some(counts.execution_rejects_last_window as f64 / counts.execution_orders_last_window as f64)
    } else {
        None
    };

    HealthSummary {
        now_ts,
        window_minutes: window_minutes.max(1),
        spot_tick_age_seconds,
        quote_age_seconds,
        snapshot_age_seconds,
        snapshots_last_window: counts.snapshots_last_window,
        opportunities_last_window: counts.opportunities_last_window,
        execution_orders_last_window: counts.execution_orders_last_window,
        execution_rejects_last_window: counts.execution_rejects_last_window,
        execution_reject_rate_last_window,
        stale,
        ok,
    }
}

fn fmt_age(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "NA".to_string())
}

fn fmt_ratio(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_else(|| "NA".to_string())
}

impl HealthSummary {
    /// One human-readable line, matching `format_live_health`'s field order.
    pub fn render(&self) -> String {
        format!(
            "health spot_age_s={} quote_age_s={} snapshot_age_s={} window_m={} \
             snapshots={} opportunities={} exec_orders={} exec_rejects={} exec_reject_rate={} ok={}",
            fmt_age(self.spot_tick_age_seconds),
            fmt_age(self.quote_age_seconds),
            fmt_age(self.snapshot_age_seconds),
            self.window_minutes,
            self.snapshots_last_window,
            self.opportunities_last_window,
            self.execution_orders_last_window,
            self.execution_rejects_last_window,
            fmt_ratio(self.execution_reject_rate_last_window),
            self.ok,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> HealthProjectionCounts {
        HealthProjectionCounts {
            latest_spot_ts: Some(900),
            latest_quote_ts: Some(950),
            latest_snapshot_ts: Some(980),
            snapshots_last_window: 12,
            opportunities_last_window: 3,
            execution_orders_last_window: 4,
            execution_rejects_last_window: 1,
        }
    }

    #[test]
    fn fresh_state_is_ok() {
        let summary = compute(1000, 10, &counts(), &StalenessThresholds::default());
        assert_eq!(summary.spot_tick_age_seconds, Some(100));
        assert!(summary.ok);
        assert_eq!(summary.execution_reject_rate_last_window, Some(0.25));
    }

    #[test]
    fn missing_spot_data_is_stale_and_not_ok() {
        let mut c = counts();
        c.latest_spot_ts = None;
        let summary = compute(1000, 10, &c, &StalenessThresholds::default());
        assert!(summary.stale.spot);
        assert!(!summary.ok);
        assert_eq!(summary.spot_tick_age_seconds, None);
    }

    #[test]
    fn stale_threshold_trips_on_age_past_limit() {
        let mut c = counts();
        c.latest_quote_ts = Some(0);
        let thresholds = StalenessThresholds {
            spot_seconds: 120,
            quote_seconds: 60,
            snapshot_seconds: 120,
        };
        let summary = compute(1000, 10, &c, &thresholds);
        assert!(summary.stale.quote);
        assert!(!summary.ok);
    }

    #[test]
    fn render_matches_expected_field_order() {
        let summary = compute(1000, 10, &counts(), &StalenessThresholds::default());
        let line = summary.render();
        assert!(line.starts_with("health spot_age_s=100"));
        assert!(line.contains("exec_reject_rate=0.250"));
    }

    #[test]
    fn no_orders_means_no_reject_rate() {
        let mut c = counts();
        c.execution_orders_last_window = 0;
        c.execution_rejects_last_window = 0;
        let summary = compute(1000, 10, &c, &StalenessThresholds::default());
        assert_eq!(summary.execution_reject_rate_last_window, None);
    }
}
