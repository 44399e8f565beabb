//! Opportunity engine: per-contract, per-side EV gating over one tick's
//! batch of edge snapshots, producing TAKE/PASS decisions.
//!
//! Ported from
//! `examples/original_source/src/kalshi_bot/strategy/opportunity_engine.py`
//! (`build_opportunities_from_snapshots`). Where the Python version reads
//! sigma diagnostics back out of a snapshot's `raw_json` blob, this version
//! takes the `SigmaEstimate` the edge engine already computed for the tick
//! directly, since both live in the same process.

use serde_json::json;

use crate::edge::EdgeSnapshotRow;
use crate::volatility::SigmaEstimate;

#[derive(Debug, Clone)]
pub struct OpportunityConfig {
    pub min_ev: f64,
    pub min_ask_cents: f64,
    pub max_ask_cents: f64,
    pub max_spot_age_seconds: Option<i64>,
    pub max_quote_age_seconds: Option<i64>,
    pub top_n: Option<usize>,
    pub emit_passes: bool,
    pub best_side_only: bool,
    pub model_version: i64,
}

impl Default for OpportunityConfig {
    fn default() -> Self {
        Self {
            min_ev: 0.03,
            min_ask_cents: 1.0,
            max_ask_cents: 99.0,
            max_spot_age_seconds: None,
            max_quote_age_seconds: None,
            top_n: None,
            emit_passes: false,
            best_side_only: true,
            model_version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

/// Matches `events::OpportunityDecisionPayload` field-for-field (minus
/// `raw_json`, exposed via `OpportunityRow::raw_json`).
#[derive(Debug, Clone)]
pub struct OpportunityRow {
    pub ts_eval: i64,
    pub market_id: String,
    pub settlement_ts: Option<i64>,
    pub strike: Option<String>,
    pub spot_price: Option<f64>,
    pub sigma: Option<f64>,
    pub tau_minutes: Option<f64>,
    pub p_model: Option<f64>,
    pub p_market: Option<f64>,
    pub best_yes_bid: Option<f64>,
    pub best_yes_ask: Option<f64>,
    pub best_no_bid: Option<f64>,
    pub best_no_ask: Option<f64>,
    pub spread: Option<f64>,
    pub eligible: bool,
    pub reason_not_eligible: Option<String>,
    pub would_trade: bool,
    pub side: Side,
    pub ev_raw: Option<f64>,
    pub ev_net: Option<f64>,
    pub cost_buffer: Option<f64>,
    pub model_version: i64,
    decision: &'static str,
    decision_reason: Option<String>,
    diagnostics: RowDiagnostics,
}

#[derive(Debug, Clone)]
struct RowDiagnostics {
    spot_ts: i64,
    quote_ts: Option<i64>,
    spot_age_seconds: i64,
    quote_age_seconds: Option<i64>,
    price_used_cents: Option<f64>,
    prob_yes: f64,
    prob_yes_raw: Option<f64>,
    sigma_source: &'static str,
    sigma_ok: bool,
    sigma_reason: Option<&'static str>,
    sigma_reason_context: Option<String>,
    sigma_points_used: usize,
    min_sigma_points: usize,
    sigma_lookback_seconds_used: i64,
    min_sigma_lookback_seconds: i64,
}

impl OpportunityRow {
    /// Canonical JSON metadata blob, matching the Python `raw_json` payload
    /// (`_snapshot_meta`'s companion writer) field-for-field.
    pub fn raw_json(&self) -> String {
        let d = &self.diagnostics;
        json!({
            "asof_ts": self.ts_eval,
            "spot_ts": d.spot_ts,
            "quote_ts": d.quote_ts,
            "spot_age_seconds": d.spot_age_seconds,
            "quote_age_seconds": d.quote_age_seconds,
            "price_used_cents": d.price_used_cents,
            "prob_yes": d.prob_yes,
            "prob_yes_raw": d.prob_yes_raw,
            "sigma_source": d.sigma_source,
            "sigma_ok": d.sigma_ok,
            "sigma_reason": d.sigma_reason,
            "sigma_reason_context": d.sigma_reason_context,
            "sigma_points_used": d.sigma_points_used,
            "min_sigma_points": d.min_sigma_points,
            "sigma_lookback_seconds_used": d.sigma_lookback_seconds_used,
            "min_sigma_lookback_seconds": d.min_sigma_lookback_seconds,
            "decision": self.decision,
            "decision_reason": self.decision_reason,
            "model_version": self.model_version,
        })
        .to_string()
    }

    pub fn decision(&self) -> &'static str {
        self.decision
    }
}

/// Typed reason counters, matching the Python `counters` dict one field at
/// a time rather than a stringly-typed map.
#[derive(Debug, Clone, Default)]
pub struct OpportunityCounters {
    pub snapshots_total: u64,
    pub takes: u64,
    pub passes: u64,
    pub skipped: u64,
    pub missing_prob: u64,
    pub spot_stale: u64,
    pub quote_stale: u64,
    pub sigma_not_ready: u64,
    pub sigma_points_short: u64,
    pub sigma_history_short: u64,
    pub missing_yes_ask: u64,
    pub missing_no_ask: u64,
    pub ev_below_threshold: u64,
    pub top_n_cutoff: u64,
}

fn ask_tradable(ask: Option<f64>, min_ask: f64, max_ask: f64) -> bool {
    match ask {
        Some(a) => a >= min_ask && a <= max_ask,
        None => false,
    }
}

fn spread(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    match (bid, ask) {
        (Some(b), Some(a)) => Some(a - b),
        _ => None,
    }
}

struct EvaluatedSide {
    row: Option<OpportunityRow>,
    reason: Option<String>,
    side: Side,
}

struct RowBuilder<'a> {
    snap: &'a EdgeSnapshotRow,
    sigma: &'a SigmaEstimate,
    config: &'a OpportunityConfig,
}

impl<'a> RowBuilder<'a> {
    fn p_market(&self) -> Option<f64> {
        if let Some(yes_mid) = self.snap.yes_mid {
            Some(yes_mid / 100.0)
        } else {
            self.snap.no_mid.map(|no_mid| 1.0 - no_mid / 100.0)
        }
    }

    fn diagnostics(&self) -> RowDiagnostics {
        RowDiagnostics {
            spot_ts: self.snap.spot_ts,
            quote_ts: self.snap.quote_ts,
            spot_age_seconds: self.snap.spot_age_seconds,
            quote_age_seconds: self.snap.quote_age_seconds,
            price_used_cents: None,
            prob_yes: self.snap.prob_yes,
            prob_yes_raw: self.snap.prob_yes_raw,
            sigma_source: self.sigma.sigma_source.as_str(),
            sigma_ok: self.sigma.sigma_ok,
            sigma_reason: self.sigma.sigma_reason.map(|r| r.as_str()),
            sigma_reason_context: self.sigma.sigma_reason_context.clone(),
            sigma_points_used: self.sigma.sigma_points_used,
            min_sigma_points: self.sigma.min_sigma_points,
            sigma_lookback_seconds_used: self.sigma.sigma_lookback_seconds_used,
            min_sigma_lookback_seconds: self.sigma.min_sigma_lookback_seconds,
        }
    }

    fn build(
        &self,
        side: Side,
        ev: Option<f64>,
        ask: Option<f64>,
        mut reason: Option<String>,
    ) -> OpportunityRow {
        let tau_minutes = Some(self.snap.horizon_seconds as f64 / 60.0);
        let side_spread = match side {
            Side::Yes => spread(self.snap.yes_bid, self.snap.yes_ask),
            Side::No => spread(self.snap.no_bid, self.snap.no_ask),
        };

        let eligible = reason.is_none();
        let would_trade = ev.is_some_and(|v| v >= self.config.min_ev);
        let decision = if would_trade { "TAKE" } else { "PASS" };
        if reason.is_none() && !would_trade {
            reason = Some("ev_below_threshold".to_string());
        }

        let mut diagnostics = self.diagnostics();
        diagnostics.price_used_cents = ask;

        OpportunityRow {
            ts_eval: self.snap.asof_ts,
            market_id: self.snap.market_id.clone(),
            settlement_ts: Some(self.snap.settlement_ts),
            strike: self.snap.strike.clone(),
            spot_price: Some(self.snap.spot_price),
            sigma: Some(self.snap.sigma_annualized),
            tau_minutes,
            p_model: Some(self.snap.prob_yes),
            p_market: self.p_market(),
            best_yes_bid: self.snap.yes_bid,
            best_yes_ask: self.snap.yes_ask,
            best_no_bid: self.snap.no_bid,
            best_no_ask: self.snap.no_ask,
            spread: side_spread,
            eligible,
            reason_not_eligible: reason.clone(),
            would_trade,
            side,
            ev_raw: ev,
            ev_net: ev,
            cost_buffer: None,
            model_version: self.config.model_version,
            decision,
            decision_reason: reason,
            diagnostics,
        }
    }
}

fn evaluate_side(
    builder: &RowBuilder,
    side: Side,
    global_reason: Option<&str>,
    counters: &mut OpportunityCounters,
) -> EvaluatedSide {
    let snap = builder.snap;

    if let Some(reason) = global_reason {
        return EvaluatedSide {
            row: None,
            reason: Some(reason.to_string()),
            side,
        };
    }

    match side {
        Side::Yes => {
            if !ask_tradable(snap.yes_ask, builder.config.min_ask_cents, builder.config.max_ask_cents) {
                counters.missing_yes_ask += 1;
                return EvaluatedSide {
                    row: None,
                    reason: Some("missing_yes_ask".to_string()),
                    side,
                };
            }
            let ev = snap
                .ev_take_yes
                .or_else(|| Some(snap.prob_yes - snap.yes_ask.unwrap() / 100.0));
            let row = builder.build(Side::Yes, ev, snap.yes_ask, None);
            EvaluatedSide {
                row: Some(row),
                reason: None,
                side,
            }
        }
        Side::No => {
            if !ask_tradable(snap.no_ask, builder.config.min_ask_cents, builder.config.max_ask_cents) {
                counters.missing_no_ask += 1;
                return EvaluatedSide {
                    row: None,
                    reason: Some("missing_no_ask".to_string()),
                    side,
                };
            }
            let ev = snap
                .ev_take_no
                .or_else(|| Some((1.0 - snap.prob_yes) - snap.no_ask.unwrap() / 100.0));
            let row = builder.build(Side::No, ev, snap.no_ask, None);
            EvaluatedSide {
                row: Some(row),
                reason: None,
                side,
            }
        }
    }
}

/// Evaluate one tick's edge-snapshot batch into opportunity rows.
/// `sigma` is the single `SigmaEstimate` the edge engine produced for this
/// tick (shared across every row in the batch, since all snapshots in one
/// pass come from the same product).
pub fn build_opportunities_from_snapshots(
    snapshots: &[EdgeSnapshotRow],
    sigma: &SigmaEstimate,
    config: &OpportunityConfig,
) -> (Vec<OpportunityRow>, OpportunityCounters) {
    let mut counters = OpportunityCounters {
        snapshots_total: snapshots.len() as u64,
        ..Default::default()
    };

    let mut take_rows: Vec<OpportunityRow> = Vec::new();
    let mut pass_rows: Vec<OpportunityRow> = Vec::new();

    for snap in snapshots {
        let builder = RowBuilder { snap, sigma, config };

        let mut global_reasons: Vec<&'static str> = Vec::new();
        if !snap.prob_yes.is_finite() {
            counters.missing_prob += 1;
            global_reasons.push("missing_prob");
        }
        if let Some(max_spot_age) = config.max_spot_age_seconds {
            if snap.spot_age_seconds > max_spot_age {
                counters.spot_stale += 1;
                global_reasons.push("spot_stale");
            }
        }
        if let Some(max_quote_age) = config.max_quote_age_seconds {
            if snap.quote_age_seconds.is_none_or(|age| age > max_quote_age) {
                counters.quote_stale += 1;
                global_reasons.push("quote_stale");
            }
        }
        if !sigma.sigma_ok {
            counters.sigma_not_ready += 1;
            global_reasons.push("sigma_not_ready");
        }
        if sigma.sigma_points_used < sigma.min_sigma_points {
            counters.sigma_points_short += 1;
            global_reasons.push("sigma_points_short");
        }
        if sigma.sigma_lookback_seconds_used < sigma.min_sigma_lookback_seconds {
            counters.sigma_history_short += 1;
            global_reasons.push("sigma_history_short");
        }
        let global_reason = if global_reasons.is_empty() {
            None
        } else {
            Some(global_reasons.join(","))
        };

        let yes = evaluate_side(&builder, Side::Yes, global_reason.as_deref(), &mut counters);
        let no = evaluate_side(&builder, Side::No, global_reason.as_deref(), &mut counters);
        let evaluated = [yes, no];

        if config.best_side_only {
            let mut best: Option<(OpportunityRow, Option<f64>, Option<String>, Side)> = None;
            for e in evaluated {
                match e.row {
                    None => {}
                    Some(row) => {
                        let ev_val = row.ev_raw;
                        let better = match &best {
                            None => true,
                            Some((_, best_ev, _, _)) => {
                                ev_val.is_some() && best_ev.is_some_and(|b| ev_val.unwrap() > b)
                            }
                        };
                        if better {
                            best = Some((row, ev_val, e.reason, e.side));
                        }
                    }
                }
            }
            if let Some((row, ev_val, _reason, _side)) = best {
                if ev_val.is_some_and(|v| v >= config.min_ev) {
                    take_rows.push(row);
                } else if config.emit_passes {
                    pass_rows.push(row);
                }
            } else if config.emit_passes {
                let fallback_reason = evaluated_fallback_reason(snapshots, snap, &builder, global_reason.as_deref(), &mut counters);
                if let Some(row) = fallback_reason {
                    pass_rows.push(row);
                }
            }
        } else {
            for e in evaluated {
                match e.row {
                    Some(mut row) if row.ev_raw.is_some() => {
                        if row.ev_raw.unwrap() >= config.min_ev {
                            take_rows.push(row);
                        } else if config.emit_passes {
                            row.would_trade = false;
                            row.reason_not_eligible = Some("ev_below_threshold".to_string());
                            row.decision_reason = Some("ev_below_threshold".to_string());
                            row.decision = "PASS";
                            pass_rows.push(row);
                        }
                    }
                    _ => {
                        if config.emit_passes {
                            let reason = e.reason.unwrap_or_else(|| "missing_quote".to_string());
                            pass_rows.push(builder.build(e.side, None, None, Some(reason)));
                        }
                    }
                }
            }
        }
    }

    if let Some(top_n) = config.top_n {
        if top_n > 0 && take_rows.len() > top_n {
            take_rows.sort_by(|a, b| {
                b.ev_raw
                    .unwrap_or(0.0)
                    .partial_cmp(&a.ev_raw.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let dropped = take_rows.split_off(top_n);
            if config.emit_passes {
                for mut row in dropped {
                    counters.top_n_cutoff += 1;
                    row.would_trade = false;
                    row.reason_not_eligible = Some("top_n_cutoff".to_string());
                    row.decision_reason = Some("top_n_cutoff".to_string());
                    row.decision = "PASS";
                    pass_rows.push(row);
                }
            }
        }
    }

    counters.takes = take_rows.len() as u64;
    counters.passes = pass_rows.len() as u64;

    let mut rows = take_rows;
    if config.emit_passes {
        rows.extend(pass_rows);
    }
    (rows, counters)
}

/// Both sides failed their gates and `best_side_only` is set: emit a single
/// PASS row carrying the first side's gate reason, matching the Python
/// fallback (`best_reason`/`best_side` from the first-seen failing side).
fn evaluated_fallback_reason(
    _all_snapshots: &[EdgeSnapshotRow],
    snap: &EdgeSnapshotRow,
    builder: &RowBuilder,
    global_reason: Option<&str>,
    counters: &mut OpportunityCounters,
) -> Option<OpportunityRow> {
    let reason = global_reason.map(str::to_string).unwrap_or_else(|| {
        if !ask_tradable(snap.yes_ask, builder.config.min_ask_cents, builder.config.max_ask_cents) {
            counters.missing_yes_ask += 1;
            "missing_yes_ask".to_string()
        } else {
            "missing_no_ask".to_string()
        }
    });
    Some(builder.build(Side::Yes, None, None, Some(reason)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volatility::{SigmaQuality, SigmaReason, SigmaSource};

    fn ok_sigma() -> SigmaEstimate {
        SigmaEstimate {
            sigma: 0.5,
            sigma_unclamped: Some(0.5),
            sigma_source: SigmaSource::Ewma,
            sigma_ok: true,
            sigma_reason: None,
            sigma_reason_context: None,
            sigma_quality: SigmaQuality::Ok,
            sigma_points_used: 100,
            sigma_lookback_seconds_used: 3600,
            min_sigma_points: 30,
            min_sigma_lookback_seconds: 120,
            step_seconds: 10.0,
            raw_points: 200,
            resampled_points: 100,
        }
    }

    fn base_snapshot() -> EdgeSnapshotRow {
        EdgeSnapshotRow {
            asof_ts: 1_000,
            market_id: "BTC-CLOSE".to_string(),
            settlement_ts: 4_600,
            spot_ts: 990,
            spot_price: 50_000.0,
            sigma_annualized: 0.5,
            prob_yes: 0.6,
            prob_yes_raw: Some(0.6),
            horizon_seconds: 3600,
            strike: Some("between".to_string()),
            quote_ts: Some(995),
            yes_bid: Some(58.0),
            yes_ask: Some(62.0),
            no_bid: Some(36.0),
            no_ask: Some(40.0),
            yes_mid: Some(60.0),
            no_mid: Some(38.0),
            ev_take_yes: None,
            ev_take_no: None,
            spot_age_seconds: 10,
            quote_age_seconds: Some(5),
        }
    }

    #[test]
    fn s4_ev_below_threshold_is_a_pass() {
        // S4: ev_take_yes computed as 0.02 (via fallback, no fee), min_ev=0.05 -> PASS.
        let mut snap = base_snapshot();
        snap.prob_yes = 0.62;
        snap.yes_ask = Some(60.0); // 0.62 - 0.60 = 0.02
        let sigma = ok_sigma();
        let config = OpportunityConfig {
            min_ev: 0.05,
            emit_passes: true,
            ..Default::default()
        };
        let (rows, counters) = build_opportunities_from_snapshots(&[snap], &sigma, &config);
        assert_eq!(counters.takes, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision(), "PASS");
        assert_eq!(rows[0].reason_not_eligible.as_deref(), Some("ev_below_threshold"));
    }

    #[test]
    fn ev_above_threshold_is_a_take() {
        let mut snap = base_snapshot();
        snap.no_ask = Some(30.0); // ev_no = 0.4 - 0.30 = 0.10
        let sigma = ok_sigma();
        let config = OpportunityConfig {
            min_ev: 0.01,
            ..Default::default()
        };
        let (rows, counters) = build_opportunities_from_snapshots(&[snap], &sigma, &config);
        assert_eq!(counters.takes, 1);
        assert_eq!(rows[0].decision(), "TAKE");
        assert_eq!(rows[0].side, Side::No);
    }

    #[test]
    fn sigma_not_ready_gates_every_side() {
        let snap = base_snapshot();
        let mut sigma = ok_sigma();
        sigma.sigma_ok = false;
        let config = OpportunityConfig {
            min_ev: 0.0,
            emit_passes: true,
            ..Default::default()
        };
        let (rows, counters) = build_opportunities_from_snapshots(&[snap], &sigma, &config);
        assert_eq!(counters.takes, 0);
        assert_eq!(counters.sigma_not_ready, 1);
        assert_eq!(
            rows[0].reason_not_eligible.as_deref(),
            Some("sigma_not_ready")
        );
    }

    #[test]
    fn top_n_cutoff_demotes_lowest_ev_takes() {
        let mut a = base_snapshot();
        a.market_id = "A".to_string();
        a.no_ask = Some(30.0); // higher EV on NO
        let mut b = base_snapshot();
        b.market_id = "B".to_string();
        b.no_ask = Some(39.0); // lower EV on NO
        let sigma = ok_sigma();
        let config = OpportunityConfig {
            min_ev: 0.0,
            top_n: Some(1),
            emit_passes: true,
            ..Default::default()
        };
        let (rows, counters) = build_opportunities_from_snapshots(&[a, b], &sigma, &config);
        assert_eq!(counters.takes, 1);
        assert_eq!(counters.top_n_cutoff, 1);
        let take = rows.iter().find(|r| r.decision() == "TAKE").unwrap();
        assert_eq!(take.market_id, "A");
    }
}
