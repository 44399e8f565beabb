//! Universe selection: which contracts in a series are close enough to
//! the spot price, within the configured horizon, and (optionally)
//! currently tradable, to be worth computing an edge for.
//!
//! Ported from `state/live_market_state.py::select_relevant_market_ids`.

use super::{LiveMarketState, MergedContract};

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub series: String,
    pub status: Option<String>,
    pub now_ts: i64,
    pub spot_price: f64,
    pub max_horizon_seconds: i64,
    pub grace_seconds: i64,
    pub pct_band: f64,
    pub top_n: usize,
    pub require_quotes: bool,
    pub min_ask_cents: f64,
    pub max_ask_cents: f64,
    pub freshness_seconds: i64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            series: String::new(),
            status: Some("open".to_string()),
            now_ts: 0,
            spot_price: 0.0,
            max_horizon_seconds: 3600,
            grace_seconds: 3600,
            pct_band: 2.0,
            top_n: 0,
            require_quotes: false,
            min_ask_cents: 1.0,
            max_ask_cents: 99.0,
            freshness_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionSummary {
    pub selected_count: usize,
    pub excluded_expired: usize,
    pub excluded_horizon_out_of_range: usize,
    pub excluded_missing_bounds: usize,
    pub excluded_missing_close_ts: usize,
    pub excluded_missing_recent_quote: usize,
    pub excluded_untradable: usize,
    pub method: &'static str,
    pub selection_samples: Vec<String>,
    pub series: String,
    pub status: Option<String>,
    pub require_quotes: bool,
}

struct Candidate {
    ticker: String,
    distance_pct: f64,
}

fn market_matches_series(ticker: &str, series: &str) -> bool {
    if series.is_empty() {
        return true;
    }
    ticker == series || ticker.starts_with(&format!("{series}-"))
}

fn resolved_close_ts(contract: &MergedContract) -> Option<i64> {
    contract
        .close_ts
        .or(contract.expected_expiration_ts)
        .or(contract.settlement_ts)
}

fn ask_tradable(ask: Option<f64>, bid: Option<f64>, min_ask_cents: f64, max_ask_cents: f64) -> bool {
    let Some(ask) = ask else { return false };
    if !(0.0..=100.0).contains(&ask) {
        return false;
    }
    if ask == 0.0 || ask == 100.0 {
        return true;
    }
    if ask < min_ask_cents || ask > max_ask_cents {
        return false;
    }
    let Some(bid) = bid else { return false };
    ask - bid >= 0.0
}

pub fn select_relevant_market_ids(
    state: &LiveMarketState,
    config: &SelectionConfig,
) -> (Vec<String>, SelectionSummary) {
    let cutoff_min = config.now_ts - 5;
    let cutoff_max = config.now_ts + config.max_horizon_seconds + config.grace_seconds;

    let mut summary = SelectionSummary {
        series: config.series.clone(),
        status: config.status.clone(),
        require_quotes: config.require_quotes,
        method: "pct_band",
        ..Default::default()
    };

    let mut candidates: Vec<Candidate> = Vec::new();

    for ticker in state.contract_tickers() {
        let Some(contract) = state.get_contract(&ticker) else {
            continue;
        };

        if !market_matches_series(&ticker, &config.series) {
            continue;
        }

        if let Some(want_status) = &config.status {
            if let Some(have_status) = &contract.status {
                if have_status != want_status {
                    continue;
                }
            }
            // lenient when status is unknown (bus-replay race)
        }

        let strike_type = match contract.strike_type.as_deref() {
            Some(s @ ("between" | "less" | "greater")) => s,
            _ => continue,
        };

        let has_bounds = match strike_type {
            "between" => contract.lower.is_some() && contract.upper.is_some(),
            "less" => contract.upper.is_some(),
            "greater" => contract.lower.is_some(),
            _ => false,
        };
        if !has_bounds {
            summary.excluded_missing_bounds += 1;
            continue;
        }

        let Some(close_ts) = resolved_close_ts(&contract) else {
            summary.excluded_missing_close_ts += 1;
            continue;
        };

        if close_ts < cutoff_min {
            summary.excluded_expired += 1;
            continue;
        }
        if close_ts > cutoff_max {
            summary.excluded_horizon_out_of_range += 1;
            continue;
        }

        if config.require_quotes {
            let quote = state.quote(&ticker);
            let Some(quote) = quote else {
                summary.excluded_missing_recent_quote += 1;
                continue;
            };
            if quote.ts < config.now_ts - config.freshness_seconds {
                summary.excluded_missing_recent_quote += 1;
                continue;
            }
            let tradable = ask_tradable(
                quote.yes_ask,
                quote.yes_bid,
                config.min_ask_cents,
                config.max_ask_cents,
            ) || ask_tradable(
                quote.no_ask,
                quote.no_bid,
                config.min_ask_cents,
                config.max_ask_cents,
            );
            if !tradable {
                summary.excluded_untradable += 1;
                continue;
            }
        }

        if config.spot_price <= 0.0 {
            continue;
        }

        let price_ref = match strike_type {
            "between" => {
                (contract.lower.unwrap_or_default() + contract.upper.unwrap_or_default()) / 2.0
            }
            "less" => contract.upper.unwrap_or_default(),
            "greater" => contract.lower.unwrap_or_default(),
            _ => continue,
        };

        let distance_pct = ((price_ref - config.spot_price).abs() / config.spot_price) * 100.0;

        candidates.push(Candidate {
            ticker,
            distance_pct,
        });
    }

    candidates.sort_by(|a, b| {
        a.distance_pct
            .partial_cmp(&b.distance_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });

    let mut selected: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.distance_pct <= config.pct_band)
        .collect();

    if config.top_n > 0 && selected.len() < config.top_n.min(candidates.len()) {
        selected = candidates.iter().take(config.top_n).collect();
        summary.method = "top_n";
    }

    summary.selected_count = selected.len();
    summary.selection_samples = selected
        .iter()
        .take(5)
        .map(|c| c.ticker.clone())
        .collect();

    let selected_ids = selected.into_iter().map(|c| c.ticker.clone()).collect();

    (selected_ids, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ContractUpdatePayload, QuoteUpdatePayload};

    fn with_contract(ticker: &str, lower: f64, upper: f64, close_ts: i64) -> LiveMarketState {
        let mut state = LiveMarketState::default();
        state.apply_contract_update(
            &ContractUpdatePayload {
                ticker: ticker.into(),
                lower: Some(lower),
                upper: Some(upper),
                strike_type: Some("between".into()),
                close_ts: Some(close_ts),
                expected_expiration_ts: None,
                expiration_ts: None,
                settled_ts: None,
                outcome: None,
                force: false,
            },
            1,
        );
        state
    }

    #[test]
    fn selects_within_pct_band() {
        let state = with_contract("BTC-CLOSE", 49_000.0, 51_000.0, 1000);
        let config = SelectionConfig {
            series: "BTC-CLOSE".into(),
            status: None,
            now_ts: 0,
            spot_price: 50_000.0,
            pct_band: 5.0,
            ..Default::default()
        };
        let (ids, summary) = select_relevant_market_ids(&state, &config);
        assert_eq!(ids, vec!["BTC-CLOSE".to_string()]);
        assert_eq!(summary.method, "pct_band");
    }

    #[test]
    fn excludes_out_of_horizon_contracts() {
        let state = with_contract("BTC-CLOSE", 49_000.0, 51_000.0, 100_000);
        let config = SelectionConfig {
            series: "BTC-CLOSE".into(),
            status: None,
            now_ts: 0,
            spot_price: 50_000.0,
            max_horizon_seconds: 3600,
            grace_seconds: 3600,
            ..Default::default()
        };
        let (ids, summary) = select_relevant_market_ids(&state, &config);
        assert!(ids.is_empty());
        assert_eq!(summary.excluded_horizon_out_of_range, 1);
    }

    #[test]
    fn falls_back_to_top_n_when_pct_band_under_fills() {
        let mut state = LiveMarketState::default();
        for (i, (lo, hi)) in [(60_000.0, 61_000.0), (70_000.0, 71_000.0)].iter().enumerate() {
            state.apply_contract_update(
                &ContractUpdatePayload {
                    ticker: format!("BTC-CLOSE-{i}"),
                    lower: Some(*lo),
                    upper: Some(*hi),
                    strike_type: Some("between".into()),
                    close_ts: Some(1000),
                    expected_expiration_ts: None,
                    expiration_ts: None,
                    settled_ts: None,
                    outcome: None,
                    force: false,
                },
                1,
            );
        }
        let config = SelectionConfig {
            series: "BTC-CLOSE".into(),
            status: None,
            now_ts: 0,
            spot_price: 50_000.0,
            pct_band: 1.0,
            top_n: 2,
            ..Default::default()
        };
        let (ids, summary) = select_relevant_market_ids(&state, &config);
        assert_eq!(ids.len(), 2);
        assert_eq!(summary.method, "top_n");
    }

    #[test]
    fn excludes_tradable_but_stale_quote() {
        let mut state = with_contract("BTC-CLOSE", 49_000.0, 51_000.0, 1000);
        state.apply_quote_update(&QuoteUpdatePayload {
            ts: 100,
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
        let config = SelectionConfig {
            series: "BTC-CLOSE".into(),
            status: None,
            now_ts: 200,
            spot_price: 50_000.0,
            pct_band: 5.0,
            require_quotes: true,
            freshness_seconds: 60,
            ..Default::default()
        };
        let (ids, summary) = select_relevant_market_ids(&state, &config);
        assert!(ids.is_empty());
        assert_eq!(summary.excluded_missing_recent_quote, 1);
    }
}
