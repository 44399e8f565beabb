//! Probability and EV edge computation: for each contract in the
//! selected universe, compute the model YES probability, per-side taker
//! EV, and crossed-market/tradability checks, then assemble an edge
//! snapshot row.
//!
//! Ported from `examples/original_source/src/kalshi_bot/strategy/edge_engine.py`
//! (`compute_edge_for_market`, `prob_yes_for_contract[_raw]`) and
//! `strategy/edge_state_engine.py` (`compute_edges_from_live_state`), with
//! fees from `kalshi/fees.py::taker_fee_dollars` and EV from
//! `strategy/edge_math.py::ev_take_yes`/`ev_take_no`.

use std::collections::HashMap;

use crate::probability::{self, StrikeType};
use crate::state::{select_relevant_market_ids, LiveMarketState, MergedContract, SelectionConfig};
use crate::volatility::{estimate_sigma, SigmaEstimate, SigmaMemory, VolatilityParams};

/// Taker fee in dollars for `contracts` lots bought at `price_cents`.
/// `None` on any invalid input (non-finite, out of `[0, 100]`, non-positive
/// contract count); `0.0` exactly at the `0`/`100` boundary.
pub fn taker_fee_dollars(price_cents: Option<f64>, contracts: i64) -> Option<f64> {
    let price_cents = price_cents?;
    if contracts <= 0 {
        return None;
    }
    if !price_cents.is_finite() || !(0.0..=100.0).contains(&price_cents) {
        return None;
    }
    if price_cents == 0.0 || price_cents == 100.0 {
        return Some(0.0);
    }
    let price = price_cents / 100.0;
    let raw = 0.07 * contracts as f64 * price * (1.0 - price);
    Some((raw * 100.0).ceil() / 100.0)
}

fn ev_buy(prob_yes: Option<f64>, price_cents: Option<f64>, contracts: i64) -> Option<f64> {
    let prob_yes = prob_yes?;
    let price_cents = price_cents?;
    let cost = (price_cents / 100.0) * contracts as f64;
    let payout = prob_yes * contracts as f64;
    let fees = taker_fee_dollars(Some(price_cents), contracts)?;
    Some(payout - cost - fees)
}

/// EV of buying YES at the ask.
pub fn ev_take_yes(prob_yes: Option<f64>, yes_ask_cents: Option<f64>, contracts: i64) -> Option<f64> {
    ev_buy(prob_yes, yes_ask_cents, contracts)
}

/// EV of buying NO at the ask.
pub fn ev_take_no(prob_yes: Option<f64>, no_ask_cents: Option<f64>, contracts: i64) -> Option<f64> {
    let prob_no = prob_yes.map(|p| 1.0 - p);
    ev_buy(prob_no, no_ask_cents, contracts)
}

#[derive(Debug, Clone)]
pub struct EdgeEngineConfig {
    pub product_id: String,
    pub volatility: VolatilityParams,
    pub selection: SelectionConfig,
    pub freshness_seconds: i64,
    pub contracts: i64,
}

/// Per-contract snapshot row, matching `events::EdgeSnapshotPayload`
/// field-for-field (minus `raw_json`, assembled by the caller since it
/// also folds in sigma diagnostics).
#[derive(Debug, Clone)]
pub struct EdgeSnapshotRow {
    pub asof_ts: i64,
    pub market_id: String,
    pub settlement_ts: i64,
    pub spot_ts: i64,
    pub spot_price: f64,
    pub sigma_annualized: f64,
    pub prob_yes: f64,
    pub prob_yes_raw: Option<f64>,
    pub horizon_seconds: i64,
    pub strike: Option<String>,
    pub quote_ts: Option<i64>,
    pub yes_bid: Option<f64>,
    pub yes_ask: Option<f64>,
    pub no_bid: Option<f64>,
    pub no_ask: Option<f64>,
    pub yes_mid: Option<f64>,
    pub no_mid: Option<f64>,
    pub ev_take_yes: Option<f64>,
    pub ev_take_no: Option<f64>,
    pub spot_age_seconds: i64,
    pub quote_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeEngineOutcome {
    pub error: Option<&'static str>,
    pub relevant_total: usize,
    pub edges_inserted: usize,
    pub skipped: usize,
    pub skip_reasons: HashMap<&'static str, usize>,
    pub max_spot_age_seconds: Option<i64>,
    pub max_quote_age_seconds: Option<i64>,
    pub sigma: Option<SigmaEstimate>,
}

fn mid(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    match (bid, ask) {
        (Some(b), Some(a)) => Some((b + a) / 2.0),
        _ => None,
    }
}

fn valid_ask(value: Option<f64>) -> bool {
    matches!(value, Some(v) if (0.0..=100.0).contains(&v))
}

fn tradable_ask(value: Option<f64>, bid: Option<f64>, min_ask_cents: f64, max_ask_cents: f64) -> bool {
    let Some(v) = value else { return false };
    if !(0.0..=100.0).contains(&v) {
        return false;
    }
    if v == 0.0 || v == 100.0 {
        return true;
    }
    if v < min_ask_cents || v > max_ask_cents {
        return false;
    }
    match bid {
        Some(b) => v - b >= 0.0,
        None => false,
    }
}

fn resolved_settlement_ts(contract: &MergedContract) -> Option<i64> {
    contract
        .close_ts
        .or(contract.expected_expiration_ts)
        .or(contract.settlement_ts)
}

/// Run one edge-computation pass over the current live state. Only the
/// latest `spot_tick` for `product_id` feeds the pass; callers that drain
/// a batch of ticks between ticks must only invoke this once per batch,
/// keyed on the latest observed `asof_ts`, per the pipeline's "last batch
/// wins" rule.
pub fn compute_edges_from_live_state(
    state: &LiveMarketState,
    sigma_memory: &mut SigmaMemory,
    config: &EdgeEngineConfig,
    now_ts: i64,
) -> (EdgeEngineOutcome, Vec<EdgeSnapshotRow>) {
    let Some(latest) = state.latest_spot(&config.product_id) else {
        return (
            EdgeEngineOutcome {
                error: Some("spot_missing"),
                ..Default::default()
            },
            Vec::new(),
        );
    };

    let spot_ts = latest.ts;
    let spot_price = latest.price;

    let raw_history = state.spot_history(&config.product_id, now_ts, config.volatility.lookback_seconds);
    let raw_ts: Vec<i64> = raw_history.iter().map(|v| v.ts).collect();
    let raw_px: Vec<f64> = raw_history.iter().map(|v| v.price).collect();
    let sigma_state = estimate_sigma(&raw_ts, &raw_px, sigma_memory, &config.volatility);
    let sigma = sigma_state.sigma;

    let mut selection_config = config.selection.clone();
    selection_config.now_ts = now_ts;
    selection_config.spot_price = spot_price;
    selection_config.freshness_seconds = config.freshness_seconds;
    let (relevant_ids, _selection_summary) = select_relevant_market_ids(state, &selection_config);

    if relevant_ids.is_empty() {
        return (
            EdgeEngineOutcome {
                error: Some("no_relevant_markets"),
                relevant_total: 0,
                sigma: Some(sigma_state),
                ..Default::default()
            },
            Vec::new(),
        );
    }

    let mut outcome = EdgeEngineOutcome {
        relevant_total: relevant_ids.len(),
        ..Default::default()
    };
    let mut rows = Vec::new();

    for market_id in relevant_ids {
        let Some(contract) = state.get_contract(&market_id) else {
            *outcome.skip_reasons.entry("missing_contract").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        };

        let Some(settlement_ts) = resolved_settlement_ts(&contract) else {
            *outcome.skip_reasons.entry("missing_settlement_ts").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        };

        if settlement_ts - now_ts < -5 {
            *outcome.skip_reasons.entry("expired_contract").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        }
        let horizon_seconds = (settlement_ts - spot_ts).max(0);

        let Some(quote) = state.get_quote(&market_id) else {
            *outcome.skip_reasons.entry("missing_quote").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        };
        let (mut yes_ask, mut no_ask) = (quote.yes_ask, quote.no_ask);
        let (yes_bid, no_bid) = (quote.yes_bid, quote.no_bid);
        let quote_ts = quote.ts;

        if valid_ask(yes_ask) && valid_ask(no_ask) {
            let crossed = yes_ask.unwrap() + no_ask.unwrap() < 100.0;
            if crossed {
                *outcome.skip_reasons.entry("crossed_market").or_insert(0) += 1;
                outcome.skipped += 1;
                continue;
            }
        }

        let min_ask = config.selection.min_ask_cents;
        let max_ask = config.selection.max_ask_cents;
        let yes_tradable = tradable_ask(yes_ask, yes_bid, min_ask, max_ask);
        let no_tradable = tradable_ask(no_ask, no_bid, min_ask, max_ask);
        if !yes_tradable && !no_tradable {
            *outcome.skip_reasons.entry("missing_both_sides").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        }
        if !yes_tradable {
            yes_ask = None;
        }
        if !no_tradable {
            no_ask = None;
        }

        let Some(strike_type) = contract.strike_type.as_deref().and_then(StrikeType::from_str) else {
            *outcome.skip_reasons.entry("invalid_edge").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        };
        let prob_yes_raw = probability::prob_yes_for_contract_raw(
            spot_price,
            sigma,
            horizon_seconds as f64,
            strike_type,
            contract.lower,
            contract.upper,
        );
        let Some(prob_yes) = probability::prob_yes_for_contract(
            spot_price,
            sigma,
            horizon_seconds as f64,
            strike_type,
            contract.lower,
            contract.upper,
        ) else {
            *outcome.skip_reasons.entry("invalid_edge").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        };

        let ev_yes = ev_take_yes(Some(prob_yes), yes_ask, config.contracts);
        let ev_no = ev_take_no(Some(prob_yes), no_ask, config.contracts);
        if ev_yes.is_none() && ev_no.is_none() {
            *outcome.skip_reasons.entry("invalid_edge").or_insert(0) += 1;
            outcome.skipped += 1;
            continue;
        }

        let spot_age_seconds = now_ts - spot_ts;
        let quote_age_seconds = Some(now_ts - quote_ts);
        outcome.max_spot_age_seconds = Some(
            outcome
                .max_spot_age_seconds
                .map_or(spot_age_seconds, |m| m.max(spot_age_seconds)),
        );
        if let Some(qa) = quote_age_seconds {
            outcome.max_quote_age_seconds =
                Some(outcome.max_quote_age_seconds.map_or(qa, |m| m.max(qa)));
        }

        rows.push(EdgeSnapshotRow {
            asof_ts: now_ts,
            market_id,
            settlement_ts,
            spot_ts,
            spot_price,
            sigma_annualized: sigma,
            prob_yes,
            prob_yes_raw,
            horizon_seconds,
            strike: contract.strike_type.clone(),
            quote_ts: Some(quote_ts),
            yes_bid,
            yes_ask,
            no_bid,
            no_ask,
            yes_mid: mid(yes_bid, yes_ask),
            no_mid: mid(no_bid, no_ask),
            ev_take_yes: ev_yes,
            ev_take_no: ev_no,
            spot_age_seconds,
            quote_age_seconds,
        });
        outcome.edges_inserted += 1;
    }

    outcome.sigma = Some(sigma_state);
    (outcome, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ContractUpdatePayload, QuoteUpdatePayload, SpotTickPayload};

    fn base_config() -> EdgeEngineConfig {
        EdgeEngineConfig {
            product_id: "BTC-USD".into(),
            volatility: VolatilityParams {
                min_sigma_lookback_seconds: 100,
                ..Default::default()
            },
            selection: SelectionConfig {
                series: "BTC-CLOSE".into(),
                status: None,
                max_horizon_seconds: 7200,
                grace_seconds: 3600,
                pct_band: 5.0,
                require_quotes: true,
                ..Default::default()
            },
            freshness_seconds: 60,
            contracts: 1,
        }
    }

    fn seeded_state() -> LiveMarketState {
        let mut state = LiveMarketState::default();
        for i in 0..200i64 {
            state.apply_spot_tick(&SpotTickPayload {
                ts: i * 10,
                product_id: "BTC-USD".into(),
                price: 50_000.0 + i as f64,
                best_bid: None,
                best_ask: None,
                bid_qty: None,
                ask_qty: None,
                sequence_num: None,
            });
        }
        state.apply_contract_update(
            &ContractUpdatePayload {
                ticker: "BTC-CLOSE".into(),
                lower: Some(49_000.0),
                upper: Some(51_500.0),
                strike_type: Some("between".into()),
                close_ts: Some(3000),
                expected_expiration_ts: None,
                expiration_ts: None,
                settled_ts: None,
                outcome: None,
                force: false,
            },
            1,
        );
        state.apply_quote_update(&QuoteUpdatePayload {
            ts: 1990,
            market_id: "BTC-CLOSE".into(),
            source_msg_id: None,
            yes_bid: Some(40.0),
            yes_ask: Some(45.0),
            no_bid: Some(54.0),
            no_ask: Some(59.0),
            yes_mid: None,
            no_mid: None,
            p_mid: None,
        });
        state
    }

    #[test]
    fn spot_missing_returns_error_outcome() {
        let state = LiveMarketState::default();
        let mut memory = SigmaMemory::default();
        let (outcome, rows) =
            compute_edges_from_live_state(&state, &mut memory, &base_config(), 1990);
        assert_eq!(outcome.error, Some("spot_missing"));
        assert!(rows.is_empty());
    }

    #[test]
    fn produces_one_snapshot_row_for_a_tradable_contract() {
        let state = seeded_state();
        let mut memory = SigmaMemory::default();
        let (outcome, rows) =
            compute_edges_from_live_state(&state, &mut memory, &base_config(), 1990);
        assert_eq!(outcome.error, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(outcome.edges_inserted, 1);
        let row = &rows[0];
        assert_eq!(row.market_id, "BTC-CLOSE");
        assert!(row.prob_yes > 0.0 && row.prob_yes < 1.0);
    }

    #[test]
    fn s3_expired_contract_produces_zero_snapshots() {
        // S3: settlement_ts is more than 5 seconds in the past relative to
        // now_ts -> the contract is excluded as expired, never emitted.
        let mut state = seeded_state();
        state.apply_contract_update(
            &ContractUpdatePayload {
                ticker: "BTC-CLOSE".into(),
                lower: None,
                upper: None,
                strike_type: None,
                close_ts: Some(100),
                expected_expiration_ts: None,
                expiration_ts: None,
                settled_ts: None,
                outcome: None,
                force: false,
            },
            2,
        );
        let mut memory = SigmaMemory::default();
        let (outcome, rows) =
            compute_edges_from_live_state(&state, &mut memory, &base_config(), 1990);
        assert!(rows.is_empty());
        assert_eq!(outcome.skip_reasons.get("expired_contract"), Some(&1));
    }

    #[test]
    fn crossed_market_is_skipped() {
        let mut state = seeded_state();
        state.apply_quote_update(&QuoteUpdatePayload {
            ts: 1991,
            market_id: "BTC-CLOSE".into(),
            source_msg_id: None,
            yes_bid: Some(40.0),
            yes_ask: Some(45.0),
            no_bid: Some(54.0),
            no_ask: Some(50.0),
            yes_mid: None,
            no_mid: None,
            p_mid: None,
        });
        let mut memory = SigmaMemory::default();
        let (outcome, rows) =
            compute_edges_from_live_state(&state, &mut memory, &base_config(), 1990);
        assert!(rows.is_empty());
        assert_eq!(outcome.skip_reasons.get("crossed_market"), Some(&1));
    }

    #[test]
    fn fee_is_zero_at_boundary_prices() {
        assert_eq!(taker_fee_dollars(Some(0.0), 1), Some(0.0));
        assert_eq!(taker_fee_dollars(Some(100.0), 1), Some(0.0));
    }

    #[test]
    fn fee_matches_ceil_to_cent_formula() {
        let fee = taker_fee_dollars(Some(50.0), 10).unwrap();
        // 0.07 * 10 * 0.5 * 0.5 = 0.175 -> ceil to cent -> 0.18
        assert!((fee - 0.18).abs() < 1e-9);
    }

    #[test]
    fn ev_take_yes_subtracts_cost_and_fees() {
        let ev = ev_take_yes(Some(0.6), Some(50.0), 1).unwrap();
        let fee = taker_fee_dollars(Some(50.0), 1).unwrap();
        assert!((ev - (0.6 - 0.5 - fee)).abs() < 1e-9);
    }
}
