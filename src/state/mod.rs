//! Live market state: bounded spot history, latest quotes, merged
//! contract/market lifecycle view, and universe selection.
//!
//! Ported from the source system's `state/live_market_state.py`.

use std::collections::{HashMap, VecDeque};

use crate::events::{ContractUpdatePayload, MarketLifecyclePayload, QuoteUpdatePayload};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotValue {
    pub ts: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QuoteState {
    pub ts: i64,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
    pub no_bid: Option<f64>,
    pub no_ask: Option<f64>,
}

/// Market lifecycle attributes, field-by-field COALESCE-overwritten as
/// events arrive (never clobber a known value with a missing one).
#[derive(Debug, Clone, Default)]
pub struct MarketAttrs {
    pub status: Option<String>,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settlement_ts: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ContractAttrs {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub strike_type: Option<String>,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settled_ts: Option<i64>,
    pub outcome: Option<i64>,
}

/// The merged, read-time view `get_contract` returns: contract fields
/// win when both contract and market lifecycle have a value; market
/// fields only fill gaps the contract leaves unset.
#[derive(Debug, Clone, Default)]
pub struct MergedContract {
    pub status: Option<String>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub strike_type: Option<String>,
    pub close_ts: Option<i64>,
    pub expected_expiration_ts: Option<i64>,
    pub expiration_ts: Option<i64>,
    pub settlement_ts: Option<i64>,
    pub outcome: Option<i64>,
}

/// Monotone outcome update: once an outcome is set, a same-valued update
/// is a no-op and a conflicting one is ignored unless `force` is asserted,
/// matching `dao.py::update_contract_outcome`'s CASE logic.
fn apply_outcome(current: &mut Option<i64>, incoming: Option<i64>, force: bool) {
    let Some(new_outcome) = incoming else {
        return;
    };
    match *current {
        None => *current = Some(new_outcome),
        Some(existing) if existing == new_outcome => {}
        Some(_) if force => *current = Some(new_outcome),
        Some(_) => {}
    }
}

fn normalize_market_status(status: &str) -> String {
    match status {
        "active" => "open".to_string(),
        other => other.to_string(),
    }
}

pub struct LiveMarketState {
    max_spot_points: usize,
    spot_history: HashMap<String, VecDeque<SpotValue>>,
    spot_latest: HashMap<String, SpotValue>,
    quotes: HashMap<String, QuoteState>,
    markets: HashMap<String, MarketAttrs>,
    contracts: HashMap<String, ContractAttrs>,
    market_event_ts: HashMap<String, i64>,
    contract_event_ts: HashMap<String, i64>,
}

impl Default for LiveMarketState {
    fn default() -> Self {
        Self::new(20_000)
    }
}

impl LiveMarketState {
    pub fn new(max_spot_points: usize) -> Self {
        Self {
            max_spot_points,
            spot_history: HashMap::new(),
            spot_latest: HashMap::new(),
            quotes: HashMap::new(),
            markets: HashMap::new(),
            contracts: HashMap::new(),
            market_event_ts: HashMap::new(),
            contract_event_ts: HashMap::new(),
        }
    }

    pub fn apply_spot_tick(&mut self, payload: &crate::events::SpotTickPayload) {
        let history = self
            .spot_history
            .entry(payload.product_id.clone())
            .or_default();
        history.push_back(SpotValue {
            ts: payload.ts,
            price: payload.price,
        });
        while history.len() > self.max_spot_points {
            history.pop_front();
        }

        let should_update = self
            .spot_latest
            .get(&payload.product_id)
            .map(|latest| payload.ts >= latest.ts)
            .unwrap_or(true);
        if should_update {
            self.spot_latest.insert(
                payload.product_id.clone(),
                SpotValue {
                    ts: payload.ts,
                    price: payload.price,
                },
            );
        }
    }

    pub fn apply_quote_update(&mut self, payload: &QuoteUpdatePayload) {
        if let Some(prev) = self.quotes.get(&payload.market_id) {
            if payload.ts < prev.ts {
                return;
            }
        }
        self.quotes.insert(
            payload.market_id.clone(),
            QuoteState {
                ts: payload.ts,
                yes_bid: payload.yes_bid,
                yes_ask: payload.yes_ask,
                no_bid: payload.no_bid,
                no_ask: payload.no_ask,
            },
        );
    }

    pub fn apply_market_lifecycle(&mut self, payload: &MarketLifecyclePayload, ts_event: i64) {
        if let Some(&prev_ts) = self.market_event_ts.get(&payload.market_id) {
            if ts_event < prev_ts {
                return;
            }
        }
        self.market_event_ts
            .insert(payload.market_id.clone(), ts_event);

        let entry = self.markets.entry(payload.market_id.clone()).or_default();
        entry.status = Some(normalize_market_status(&payload.status));
        if payload.close_ts.is_some() {
            entry.close_ts = payload.close_ts;
        }
        if payload.expected_expiration_ts.is_some() {
            entry.expected_expiration_ts = payload.expected_expiration_ts;
        }
        if payload.expiration_ts.is_some() {
            entry.expiration_ts = payload.expiration_ts;
        }
        if payload.settlement_ts.is_some() {
            entry.settlement_ts = payload.settlement_ts;
        }
    }

    pub fn apply_contract_update(&mut self, payload: &ContractUpdatePayload, ts_event: i64) {
        if let Some(&prev_ts) = self.contract_event_ts.get(&payload.ticker) {
            if ts_event < prev_ts {
                return;
            }
        }
        self.contract_event_ts
            .insert(payload.ticker.clone(), ts_event);

        let entry = self.contracts.entry(payload.ticker.clone()).or_default();
        if payload.lower.is_some() {
            entry.lower = payload.lower;
        }
        if payload.upper.is_some() {
            entry.upper = payload.upper;
        }
        if payload.strike_type.is_some() {
            entry.strike_type = payload.strike_type.clone();
        }
        if payload.close_ts.is_some() {
            entry.close_ts = payload.close_ts;
        }
        if payload.expected_expiration_ts.is_some() {
            entry.expected_expiration_ts = payload.expected_expiration_ts;
        }
        if payload.expiration_ts.is_some() {
            entry.expiration_ts = payload.expiration_ts;
        }
        if payload.settled_ts.is_some() {
            entry.settled_ts = payload.settled_ts;
        }
        apply_outcome(&mut entry.outcome, payload.outcome, payload.force);
    }

    pub fn latest_spot(&self, product_id: &str) -> Option<SpotValue> {
        self.spot_latest.get(product_id).copied()
    }

    pub fn spot_history(&self, product_id: &str, now_ts: i64, lookback_seconds: i64) -> Vec<SpotValue> {
        let cutoff = now_ts - lookback_seconds;
        self.spot_history
            .get(product_id)
            .map(|h| h.iter().filter(|v| v.ts >= cutoff).copied().collect())
            .unwrap_or_default()
    }

    pub fn get_quote(&self, market_id: &str) -> Option<&QuoteState> {
        self.quotes.get(market_id)
    }

    /// Merged contract view: contract field wins when present, market
    /// lifecycle field fills gaps.
    pub fn get_contract(&self, ticker: &str) -> Option<MergedContract> {
        let contract = self.contracts.get(ticker);
        let market = self.markets.get(ticker);
        if contract.is_none() && market.is_none() {
            return None;
        }
        let c = contract.cloned().unwrap_or_default();
        let m = market.cloned().unwrap_or_default();
        Some(MergedContract {
            status: m.status,
            lower: c.lower,
            upper: c.upper,
            strike_type: c.strike_type,
            close_ts: c.close_ts.or(m.close_ts),
            expected_expiration_ts: c.expected_expiration_ts.or(m.expected_expiration_ts),
            expiration_ts: c.expiration_ts.or(m.expiration_ts),
            settlement_ts: c.settled_ts.or(m.settlement_ts),
            outcome: c.outcome,
        })
    }

    pub fn contract_tickers(&self) -> Vec<String> {
        self.contracts.keys().cloned().collect()
    }

    pub fn quote(&self, market_id: &str) -> Option<&QuoteState> {
        self.quotes.get(market_id)
    }
}

mod selection;
pub use selection::{select_relevant_market_ids, SelectionConfig, SelectionSummary};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SpotTickPayload;

    fn tick(ts: i64, price: f64) -> SpotTickPayload {
        SpotTickPayload {
            ts,
            product_id: "BTC-USD".into(),
            price,
            best_bid: None,
            best_ask: None,
            bid_qty: None,
            ask_qty: None,
            sequence_num: None,
        }
    }

    #[test]
    fn spot_latest_only_advances_forward() {
        let mut state = LiveMarketState::default();
        state.apply_spot_tick(&tick(100, 50_000.0));
        state.apply_spot_tick(&tick(90, 49_000.0));
        assert_eq!(state.latest_spot("BTC-USD").unwrap().price, 50_000.0);
    }

    #[test]
    fn spot_history_is_bounded() {
        let mut state = LiveMarketState::new(3);
        for i in 0..10 {
            state.apply_spot_tick(&tick(i, 100.0 + i as f64));
        }
        let history = state.spot_history("BTC-USD", 100, 1000);
        assert_eq!(history.len(), 3);
        assert_eq!(history.first().unwrap().ts, 7);
    }

    #[test]
    fn quote_update_ignores_stale_ts() {
        let mut state = LiveMarketState::default();
        state.apply_quote_update(&QuoteUpdatePayload {
            ts: 100,
            market_id: "M1".into(),
            source_msg_id: None,
            yes_bid: Some(40.0),
            yes_ask: Some(42.0),
            no_bid: Some(58.0),
            no_ask: Some(60.0),
            yes_mid: None,
            no_mid: None,
            p_mid: None,
        });
        state.apply_quote_update(&QuoteUpdatePayload {
            ts: 90,
            market_id: "M1".into(),
            source_msg_id: None,
            yes_bid: Some(10.0),
            yes_ask: Some(12.0),
            no_bid: Some(88.0),
            no_ask: Some(90.0),
            yes_mid: None,
            no_mid: None,
            p_mid: None,
        });
        assert_eq!(state.get_quote("M1").unwrap().yes_bid, Some(40.0));
    }

    #[test]
    fn contract_fields_win_over_market_fields() {
        let mut state = LiveMarketState::default();
        state.apply_market_lifecycle(
            &MarketLifecyclePayload {
                market_id: "TICK".into(),
                status: "active".into(),
                close_ts: Some(1000),
                expected_expiration_ts: None,
                expiration_ts: None,
                settlement_ts: None,
            },
            1,
        );
        state.apply_contract_update(
            &ContractUpdatePayload {
                ticker: "TICK".into(),
                lower: Some(1.0),
                upper: Some(2.0),
                strike_type: Some("between".into()),
                close_ts: Some(2000),
                expected_expiration_ts: None,
                expiration_ts: None,
                settled_ts: None,
                outcome: None,
                force: false,
            },
            1,
        );
        let merged = state.get_contract("TICK").unwrap();
        assert_eq!(merged.status.as_deref(), Some("open"));
        assert_eq!(merged.close_ts, Some(2000));
    }

    #[test]
    fn lifecycle_apply_is_monotonic_in_ts_event() {
        let mut state = LiveMarketState::default();
        state.apply_market_lifecycle(
            &MarketLifecyclePayload {
                market_id: "TICK".into(),
                status: "open".into(),
                close_ts: None,
                expected_expiration_ts: None,
                expiration_ts: None,
                settlement_ts: None,
            },
            10,
        );
        state.apply_market_lifecycle(
            &MarketLifecyclePayload {
                market_id: "TICK".into(),
                status: "closed".into(),
                close_ts: None,
                expected_expiration_ts: None,
                expiration_ts: None,
                settlement_ts: None,
            },
            5,
        );
        let merged = state.get_contract("TICK").unwrap();
        assert_eq!(merged.status.as_deref(), Some("open"));
    }

    fn outcome_update(ticker: &str, outcome: Option<i64>, force: bool) -> ContractUpdatePayload {
        ContractUpdatePayload {
            ticker: ticker.into(),
            lower: None,
            upper: None,
            strike_type: None,
            close_ts: None,
            expected_expiration_ts: None,
            expiration_ts: None,
            settled_ts: None,
            outcome,
            force,
        }
    }

    #[test]
    fn outcome_is_monotone_same_value_is_noop() {
        let mut state = LiveMarketState::default();
        state.apply_contract_update(&outcome_update("TICK", Some(1), false), 1);
        state.apply_contract_update(&outcome_update("TICK", Some(1), false), 2);
        assert_eq!(state.get_contract("TICK").unwrap().outcome, Some(1));
    }

    #[test]
    fn conflicting_outcome_is_ignored_without_force() {
        let mut state = LiveMarketState::default();
        state.apply_contract_update(&outcome_update("TICK", Some(1), false), 1);
        state.apply_contract_update(&outcome_update("TICK", Some(0), false), 2);
        assert_eq!(state.get_contract("TICK").unwrap().outcome, Some(1));
    }

    #[test]
    fn conflicting_outcome_overwrites_with_force() {
        let mut state = LiveMarketState::default();
        state.apply_contract_update(&outcome_update("TICK", Some(1), false), 1);
        state.apply_contract_update(&outcome_update("TICK", Some(0), true), 2);
        assert_eq!(state.get_contract("TICK").unwrap().outcome, Some(0));
    }
}
