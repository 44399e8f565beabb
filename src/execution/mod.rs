//! Paper execution engine: turns `opportunity_decision` TAKEs into
//! `execution_order`/`execution_fill` events under open-position, cooldown,
//! dedup, and kill-switch gating, and closes positions on settlement.
//!
//! Ported from `examples/original_source/scripts/run_paper_execution.py`.
//! The Python script interleaves this state machine with NATS I/O and a
//! polling loop; here the state machine is pure (`process_opportunity`/
//! `process_contract_update` return a typed outcome rather than publishing
//! directly), so the orchestrator's worker loop supplies the bus/clock and
//! this module stays unit-testable without a runtime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::events::{ContractUpdatePayload, ExecutionFillPayload, ExecutionOrderPayload, OpportunityDecisionPayload};

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub market_id: String,
    pub side: String,
    pub ts_open: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionCounters {
    pub processed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicate_decisions: u64,
    pub non_take_decisions: u64,
    pub parse_errors: u64,
    pub event_publish_failures: u64,
    pub position_closed: u64,
    pub dropped_opportunity_events: u64,
    pub dropped_contract_events: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_open_positions: usize,
    pub cooldown_seconds: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 1,
            cooldown_seconds: 120,
        }
    }
}

/// Tracks open paper positions, the recent-takes cooldown window, and the
/// dedup set of decision keys already acted on. Ported from
/// `_PaperExecutionState`.
#[derive(Debug, Default)]
pub struct PaperExecutionState {
    open_positions: HashMap<String, OpenPosition>,
    recent_takes: VecDeque<(i64, (String, String))>,
    seen_decisions: HashSet<String>,
}

impl PaperExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn open_position(&self, market_id: &str) -> Option<&OpenPosition> {
        self.open_positions.get(market_id)
    }

    fn prune_recent(&mut self, now_ts: i64, cooldown_seconds: i64) {
        if cooldown_seconds <= 0 {
            self.recent_takes.clear();
            return;
        }
        let cutoff = now_ts - cooldown_seconds;
        while self.recent_takes.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.recent_takes.pop_front();
        }
    }

    pub fn has_seen_decision(&self, key: &str) -> bool {
        self.seen_decisions.contains(key)
    }

    pub fn mark_seen_decision(&mut self, key: String) {
        self.seen_decisions.insert(key);
    }

    /// Reject-reason priority order, exactly as `_PaperExecutionState.reject_reason`:
    /// kill switch, then side validity, then open-position conflicts, then
    /// cooldown, then the position cap.
    pub fn reject_reason(
        &mut self,
        market_id: &str,
        side: &str,
        now_ts: i64,
        cooldown_seconds: i64,
        max_open_positions: usize,
        kill_switch_active: bool,
    ) -> Option<&'static str> {
        if kill_switch_active {
            return Some("kill_switch_active");
        }
        if side != "YES" && side != "NO" {
            return Some("missing_side");
        }

        if let Some(open) = self.open_positions.get(market_id) {
            return Some(if open.side == side {
                "position_open"
            } else {
                "position_open_opposite_side"
            });
        }

        self.prune_recent(now_ts, cooldown_seconds);
        if cooldown_seconds > 0 {
            let key = (market_id.to_string(), side.to_string());
            if self.recent_takes.iter().any(|(_, existing)| *existing == key) {
                return Some("cooldown_active");
            }
        }

        if max_open_positions > 0 && self.open_positions.len() >= max_open_positions {
            return Some("max_open_positions");
        }
        None
    }

    pub fn accept(&mut self, market_id: String, side: String, ts_open: i64) {
        self.recent_takes
            .push_back((ts_open, (market_id.clone(), side.clone())));
        self.open_positions.insert(
            market_id.clone(),
            OpenPosition {
                market_id,
                side,
                ts_open,
                quantity: 1,
            },
        );
    }

    pub fn close_market(&mut self, market_id: &str) -> Option<OpenPosition> {
        self.open_positions.remove(market_id)
    }
}

fn price_from_decision_payload(payload: &OpportunityDecisionPayload) -> Option<f64> {
    let price = match payload.side.as_deref() {
        Some("YES") => payload.best_yes_ask,
        Some("NO") => payload.best_no_ask,
        _ => None,
    };
    if price.is_some() {
        return price;
    }
    let raw = payload.raw_json.as_deref()?;
    let metadata: serde_json::Value = serde_json::from_str(raw).ok()?;
    metadata.get("price_used_cents").and_then(|v| v.as_f64())
}

fn build_order_payload(
    ts_order: i64,
    order_id: String,
    payload: &OpportunityDecisionPayload,
    status: &str,
    reason: Option<String>,
    opportunity_idempotency_key: String,
) -> ExecutionOrderPayload {
    ExecutionOrderPayload {
        ts_order,
        order_id,
        market_id: payload.market_id.clone(),
        side: payload.side.clone().unwrap_or_default(),
        action: "open".to_string(),
        quantity: 1,
        price_cents: price_from_decision_payload(payload),
        status: status.to_string(),
        reason,
        opportunity_idempotency_key: Some(opportunity_idempotency_key),
        paper: true,
    }
}

fn build_open_fill_payload(
    ts_fill: i64,
    fill_id: String,
    order_id: String,
    payload: &OpportunityDecisionPayload,
) -> ExecutionFillPayload {
    ExecutionFillPayload {
        ts_fill,
        fill_id,
        order_id,
        market_id: payload.market_id.clone(),
        side: payload.side.clone().unwrap_or_default(),
        action: "open".to_string(),
        quantity: 1,
        price_cents: price_from_decision_payload(payload),
        outcome: None,
        reason: None,
        paper: true,
    }
}

/// Settlement close-fill price: `100` if the held side settled in the
/// money, else `0`. Undefined (`None`) when `outcome` is neither `0` nor
/// `1`.
fn settlement_price_cents(side: &str, outcome: Option<i64>) -> Option<f64> {
    match outcome {
        Some(0) if side == "NO" => Some(100.0),
        Some(0) if side == "YES" => Some(0.0),
        Some(1) if side == "YES" => Some(100.0),
        Some(1) if side == "NO" => Some(0.0),
        _ => None,
    }
}

fn build_close_fill_payload(
    ts_fill: i64,
    market_id: String,
    side: String,
    outcome: Option<i64>,
    reason: &str,
) -> ExecutionFillPayload {
    let price_cents = settlement_price_cents(&side, outcome);
    ExecutionFillPayload {
        fill_id: format!("settle:{market_id}:{side}:{ts_fill}"),
        order_id: format!("settle:{market_id}:{side}"),
        ts_fill,
        market_id,
        side,
        action: "close".to_string(),
        quantity: 1,
        price_cents,
        outcome,
        reason: Some(reason.to_string()),
        paper: true,
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Ignored,
    Rejected {
        order: ExecutionOrderPayload,
    },
    Accepted {
        order: ExecutionOrderPayload,
        fill: ExecutionFillPayload,
    },
    Closed {
        fill: ExecutionFillPayload,
    },
}

/// Process one `opportunity_decision` envelope. `idempotency_key` is the
/// envelope's own key (always present, so unlike the Python fallback to a
/// synthesized key there is nothing to reconstruct here).
pub fn process_opportunity(
    state: &mut PaperExecutionState,
    counters: &mut ExecutionCounters,
    idempotency_key: &str,
    payload: &OpportunityDecisionPayload,
    now_ts: i64,
    config: &ExecutionConfig,
    kill_switch_active: bool,
) -> ExecutionOutcome {
    if !payload.would_trade || !payload.eligible {
        counters.non_take_decisions += 1;
        return ExecutionOutcome::Ignored;
    }

    counters.processed += 1;
    let decision_key = idempotency_key.to_string();
    if state.has_seen_decision(&decision_key) {
        counters.duplicate_decisions += 1;
        return ExecutionOutcome::Ignored;
    }

    let market_id = payload.market_id.clone();
    let side = payload.side.clone().unwrap_or_default();
    let order_id = format!("paper:{decision_key}");

    let reject_reason = state.reject_reason(
        &market_id,
        &side,
        now_ts,
        config.cooldown_seconds,
        config.max_open_positions,
        kill_switch_active,
    );

    if let Some(reason) = reject_reason {
        let order = build_order_payload(
            now_ts,
            order_id,
            payload,
            "rejected",
            Some(reason.to_string()),
            decision_key.clone(),
        );
        state.mark_seen_decision(decision_key);
        counters.rejected += 1;
        return ExecutionOutcome::Rejected { order };
    }

    let fill_id = format!("{order_id}:open");
    let order = build_order_payload(now_ts, order_id.clone(), payload, "filled", None, decision_key.clone());
    let fill = build_open_fill_payload(now_ts, fill_id, order_id, payload);
    state.accept(market_id, side, now_ts);
    state.mark_seen_decision(decision_key);
    counters.accepted += 1;
    ExecutionOutcome::Accepted { order, fill }
}

/// Process one `contract_update` envelope: closes the open position for
/// its ticker (if any) once the contract carries a settlement signal
/// (`outcome` or `settled_ts`). Close-fill timestamp uses `settled_ts`
/// when present, falling back to wall-clock `now_ts` — preserved exactly
/// as the source system's `int(contract_payload.settled_ts or time.time())`.
pub fn process_contract_update(
    state: &mut PaperExecutionState,
    counters: &mut ExecutionCounters,
    payload: &ContractUpdatePayload,
    now_ts: i64,
) -> ExecutionOutcome {
    if payload.outcome.is_none() && payload.settled_ts.is_none() {
        return ExecutionOutcome::Ignored;
    }
    let Some(position) = state.close_market(&payload.ticker) else {
        return ExecutionOutcome::Ignored;
    };
    let ts_fill = payload.settled_ts.unwrap_or(now_ts);
    let fill = build_close_fill_payload(ts_fill, position.market_id, position.side, payload.outcome, "settled");
    counters.position_closed += 1;
    ExecutionOutcome::Closed { fill }
}

#[derive(Debug, Clone)]
pub struct RejectRateAlertConfig {
    pub threshold: f64,
    pub min_orders: u64,
    pub cooldown: Duration,
}

impl Default for RejectRateAlertConfig {
    fn default() -> Self {
        Self {
            threshold: 0.50,
            min_orders: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Rolling reject-rate alert over a processed/rejected counter baseline,
/// rate-limited the same way `SigmaWarningGate` throttles volatility
/// warnings. Ported from the windowed alert block in `_run`.
#[derive(Debug, Default)]
pub struct RejectRateAlertGate {
    baseline_processed: u64,
    baseline_rejected: u64,
    last_alert_at: Option<Instant>,
}

impl RejectRateAlertGate {
    /// Returns `Some(reject_rate)` and resets the baseline/cooldown clock
    /// if an alert should fire now.
    pub fn check(&mut self, counters: &ExecutionCounters, config: &RejectRateAlertConfig) -> Option<f64> {
        let window_processed = counters.processed.saturating_sub(self.baseline_processed);
        if window_processed == 0 || window_processed < config.min_orders {
            return None;
        }
        let window_rejected = counters.rejected.saturating_sub(self.baseline_rejected);
        let rate = window_rejected as f64 / window_processed as f64;
        let cooldown_elapsed = self
            .last_alert_at
            .is_none_or(|t| t.elapsed() >= config.cooldown);
        if rate > config.threshold && cooldown_elapsed {
            self.last_alert_at = Some(Instant::now());
            self.baseline_processed = counters.processed;
            self.baseline_rejected = counters.rejected;
            Some(rate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take_payload(market_id: &str, side: &str) -> OpportunityDecisionPayload {
        OpportunityDecisionPayload {
            ts_eval: 1000,
            market_id: market_id.to_string(),
            eligible: true,
            would_trade: true,
            side: Some(side.to_string()),
            reason_not_eligible: None,
            ev_raw: Some(0.1),
            ev_net: Some(0.1),
            settlement_ts: Some(5000),
            strike: None,
            spot_price: None,
            sigma: None,
            tau: None,
            p_model: None,
            p_market: None,
            best_yes_bid: None,
            best_yes_ask: Some(60.0),
            best_no_bid: None,
            best_no_ask: Some(40.0),
            spread: None,
            cost_buffer: None,
            raw_json: None,
            strategy_version: None,
        }
    }

    #[test]
    fn s5_duplicate_decision_is_suppressed() {
        let mut state = PaperExecutionState::new();
        let mut counters = ExecutionCounters::default();
        let config = ExecutionConfig::default();
        let payload = take_payload("BTC-CLOSE", "YES");

        let first = process_opportunity(&mut state, &mut counters, "key-1", &payload, 1000, &config, false);
        assert!(matches!(first, ExecutionOutcome::Accepted { .. }));

        state.close_market("BTC-CLOSE");
        let second = process_opportunity(&mut state, &mut counters, "key-1", &payload, 1001, &config, false);
        assert!(matches!(second, ExecutionOutcome::Ignored));
        assert_eq!(counters.duplicate_decisions, 1);
    }

    #[test]
    fn at_most_one_open_position_per_market() {
        let mut state = PaperExecutionState::new();
        let mut counters = ExecutionCounters::default();
        let config = ExecutionConfig::default();
        let payload = take_payload("BTC-CLOSE", "YES");

        process_opportunity(&mut state, &mut counters, "key-a", &payload, 1000, &config, false);
        let conflict = process_opportunity(&mut state, &mut counters, "key-b", &payload, 1001, &config, false);
        assert!(matches!(conflict, ExecutionOutcome::Rejected { .. }));
        if let ExecutionOutcome::Rejected { order } = conflict {
            assert_eq!(order.reason.as_deref(), Some("position_open"));
        }
        assert_eq!(state.open_position_count(), 1);
    }

    #[test]
    fn reject_reason_priority_order_is_kill_switch_first() {
        let mut state = PaperExecutionState::new();
        let reason = state.reject_reason("BTC-CLOSE", "YES", 1000, 0, 1, true);
        assert_eq!(reason, Some("kill_switch_active"));
    }

    #[test]
    fn cooldown_blocks_reentry_within_window() {
        let mut state = PaperExecutionState::new();
        state.accept("BTC-CLOSE".to_string(), "YES".to_string(), 1000);
        state.close_market("BTC-CLOSE");
        let reason = state.reject_reason("BTC-CLOSE", "YES", 1050, 120, 1, false);
        assert_eq!(reason, Some("cooldown_active"));
        let reason_after = state.reject_reason("BTC-CLOSE", "YES", 2000, 120, 1, false);
        assert_eq!(reason_after, None);
    }

    #[test]
    fn max_open_positions_rejects_new_markets() {
        let mut state = PaperExecutionState::new();
        state.accept("A".to_string(), "YES".to_string(), 1000);
        let reason = state.reject_reason("B", "YES", 1000, 0, 1, false);
        assert_eq!(reason, Some("max_open_positions"));
    }

    #[test]
    fn settlement_close_emits_correct_price_for_winning_yes() {
        let mut state = PaperExecutionState::new();
        let mut counters = ExecutionCounters::default();
        state.accept("BTC-CLOSE".to_string(), "YES".to_string(), 1000);

        let contract = ContractUpdatePayload {
            ticker: "BTC-CLOSE".to_string(),
            lower: None,
            upper: None,
            strike_type: None,
            close_ts: None,
            expected_expiration_ts: None,
            expiration_ts: None,
            settled_ts: Some(5000),
            outcome: Some(1),
            force: false,
        };
        let outcome = process_contract_update(&mut state, &mut counters, &contract, 6000);
        match outcome {
            ExecutionOutcome::Closed { fill } => {
                assert_eq!(fill.ts_fill, 5000);
                assert_eq!(fill.price_cents, Some(100.0));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(counters.position_closed, 1);
        assert_eq!(state.open_position_count(), 0);
    }

    #[test]
    fn reject_rate_alert_fires_once_per_cooldown() {
        let mut counters = ExecutionCounters {
            processed: 20,
            rejected: 15,
            ..Default::default()
        };
        let mut gate = RejectRateAlertGate::default();
        let config = RejectRateAlertConfig {
            threshold: 0.5,
            min_orders: 10,
            cooldown: Duration::from_secs(300),
        };
        assert!(gate.check(&counters, &config).is_some());
        assert!(gate.check(&counters, &config).is_none());
        counters.processed += 20;
        counters.rejected += 15;
        assert!(gate.check(&counters, &config).is_none());
    }
}
