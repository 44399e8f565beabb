//! Event type registry: schema versions, subjects, stream specs, and
//! idempotency-key derivation.
//!
//! Ported from the source system's `events/event_contracts.py`. One gap in
//! that source is fixed here rather than reproduced: `execution_order` and
//! `execution_fill` are dispatchable event types and have dedicated
//! subjects in the default stream specs, but were never added to the
//! schema-version/subject maps there. We add them (schema version 1,
//! subjects `execution.orders` / `execution.fills`) so every event type the
//! persistence projector and bus can see is uniformly addressable. See
//! DESIGN.md.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::EventType;

pub const DLQ_SUBJECT_PREFIX: &str = "dlq";

pub fn schema_version_for_event(event_type: EventType) -> u32 {
    1
}

pub fn subject_for_event(event_type: EventType) -> &'static str {
    match event_type {
        EventType::SpotTick => "market.spot_ticks",
        EventType::QuoteUpdate => "market.quote_updates",
        EventType::MarketLifecycle => "market.lifecycle",
        EventType::ContractUpdate => "market.contract_updates",
        EventType::EdgeSnapshot => "strategy.edge_snapshots",
        EventType::OpportunityDecision => "strategy.opportunity_decisions",
        EventType::ExecutionOrder => "execution.orders",
        EventType::ExecutionFill => "execution.fills",
    }
}

pub fn dlq_subject_for_event(event_type: EventType) -> String {
    format!("{DLQ_SUBJECT_PREFIX}.{}", subject_for_event(event_type))
}

#[derive(Debug, Clone)]
pub struct JetStreamStreamSpec {
    pub name: &'static str,
    pub subjects: &'static [&'static str],
    pub description: &'static str,
}

pub fn default_stream_specs() -> Vec<JetStreamStreamSpec> {
    vec![
        JetStreamStreamSpec {
            name: "MARKET_EVENTS",
            subjects: &[
                "market.spot_ticks",
                "market.quote_updates",
                "market.lifecycle",
                "market.contract_updates",
            ],
            description: "Spot, quote, and market lifecycle inputs",
        },
        JetStreamStreamSpec {
            name: "STRATEGY_EVENTS",
            subjects: &["strategy.edge_snapshots", "strategy.opportunity_decisions"],
            description: "Strategy outputs",
        },
        JetStreamStreamSpec {
            name: "EXECUTION_EVENTS",
            subjects: &["execution.orders", "execution.fills"],
            description: "Execution events",
        },
        JetStreamStreamSpec {
            name: "DEAD_LETTER",
            subjects: &["dlq.>"],
            description: "Dead-letter events",
        },
    ]
}

/// Canonical, stably-ordered JSON used as the idempotency fallback source
/// and for any debug serialization that must be diff-stable.
pub fn stable_json(payload: &serde_json::Value) -> String {
    fn sort_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort_value).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort_value(payload)).unwrap_or_default()
}

fn coerce_part(value: Option<&serde_json::Value>) -> Option<String> {
    let v = value?;
    if v.is_null() {
        return None;
    }
    let text = match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parts_for_idempotency(event_type: EventType, payload: &serde_json::Value) -> Vec<String> {
    let get = |k: &str| coerce_part(payload.get(k));

    match event_type {
        EventType::SpotTick => {
            let parts = [get("product_id"), get("ts"), get("sequence_num")];
            if parts.iter().all(Option::is_some) {
                parts.into_iter().flatten().collect()
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::QuoteUpdate => {
            let parts = [get("market_id"), get("ts"), get("source_msg_id")];
            if parts.iter().all(Option::is_some) {
                parts.into_iter().flatten().collect()
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::MarketLifecycle => {
            let market_id = get("market_id");
            let status = get("status");
            if market_id.is_some() && status.is_some() {
                vec![
                    market_id.unwrap_or_default(),
                    status.unwrap_or_default(),
                    get("close_ts").unwrap_or_default(),
                    get("expected_expiration_ts").unwrap_or_default(),
                    get("expiration_ts").unwrap_or_default(),
                    get("settlement_ts").unwrap_or_default(),
                ]
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::ContractUpdate => {
            let ticker = get("ticker");
            if ticker.is_some() {
                vec![
                    ticker.unwrap_or_default(),
                    get("close_ts").unwrap_or_default(),
                    get("expected_expiration_ts").unwrap_or_default(),
                    get("expiration_ts").unwrap_or_default(),
                    get("settled_ts").unwrap_or_default(),
                    get("outcome").unwrap_or_default(),
                ]
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::EdgeSnapshot => {
            let asof_ts = get("asof_ts");
            let market_id = get("market_id");
            if asof_ts.is_some() && market_id.is_some() {
                vec![
                    asof_ts.unwrap_or_default(),
                    market_id.unwrap_or_default(),
                    get("strategy_version").unwrap_or_else(|| "v1".to_string()),
                ]
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::OpportunityDecision => {
            let ts_eval = get("ts_eval");
            let market_id = get("market_id");
            let side = get("side");
            if ts_eval.is_some() && market_id.is_some() && side.is_some() {
                vec![
                    ts_eval.unwrap_or_default(),
                    market_id.unwrap_or_default(),
                    side.unwrap_or_default(),
                    get("strategy_version").unwrap_or_else(|| "v1".to_string()),
                ]
            } else {
                vec![stable_json(payload)]
            }
        }
        EventType::ExecutionOrder => match get("order_id") {
            Some(order_id) => vec![order_id],
            None => vec![stable_json(payload)],
        },
        EventType::ExecutionFill => match get("fill_id") {
            Some(fill_id) => vec![fill_id],
            None => vec![stable_json(payload)],
        },
    }
}

pub fn build_idempotency_key(
    event_type: EventType,
    payload: &serde_json::Value,
    schema_version: u32,
) -> String {
    let parts = parts_for_idempotency(event_type, payload);
    let digest_source = parts.join("|");
    let mut hasher = Sha256::new();
    hasher.update(digest_source.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let truncated = &digest[..24.min(digest.len())];
    format!(
        "{}:v{}:{}",
        event_type.as_str(),
        schema_version,
        truncated
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn idempotency_key_is_stable_for_equivalent_payloads() {
        let payload = json!({"product_id": "BTC-USD", "ts": 100, "sequence_num": 7, "price": 1.0});
        let k1 = build_idempotency_key(EventType::SpotTick, &payload, 1);
        let k2 = build_idempotency_key(EventType::SpotTick, &payload, 1);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("spot_tick:v1:"));
        assert_eq!(k1.len(), "spot_tick:v1:".len() + 24);
    }

    #[test]
    fn idempotency_key_falls_back_to_stable_json_when_parts_missing() {
        let payload = json!({"product_id": "BTC-USD", "price": 1.0});
        let key = build_idempotency_key(EventType::SpotTick, &payload, 1);
        assert!(key.starts_with("spot_tick:v1:"));
    }

    #[test]
    fn dlq_subject_is_prefixed() {
        assert_eq!(
            dlq_subject_for_event(EventType::QuoteUpdate),
            "dlq.market.quote_updates"
        );
    }

    #[test]
    fn execution_order_key_is_derived_from_order_id_alone() {
        let a = json!({"order_id": "ord-1", "ts_order": 1, "status": "filled"});
        let b = json!({"order_id": "ord-1", "ts_order": 2, "status": "rejected"});
        let ka = build_idempotency_key(EventType::ExecutionOrder, &a, 1);
        let kb = build_idempotency_key(EventType::ExecutionOrder, &b, 1);
        assert_eq!(ka, kb);
    }

    #[test]
    fn execution_fill_key_is_derived_from_fill_id_alone() {
        let payload = json!({"fill_id": "fill-1", "order_id": "ord-1"});
        let key = build_idempotency_key(EventType::ExecutionFill, &payload, 1);
        assert!(key.starts_with("execution_fill:v1:"));
    }
}
