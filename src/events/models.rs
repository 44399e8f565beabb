//! Typed event envelope and per-event payload structs.
//!
//! Ported from the source system's `events/models.py`. One strict payload
//! struct per event type, a tagged `Event` enum, and a single
//! `parse_event` entry point — the Rust equivalent of dynamic-dispatch
//! `EVENT_MODEL_BY_TYPE` lookup described in spec.md's design notes.

use serde::{Deserialize, Serialize};

use super::contracts::{build_idempotency_key, schema_version_for_event};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SpotTick,
    QuoteUpdate,
    MarketLifecycle,
    ContractUpdate,
    EdgeSnapshot,
    OpportunityDecision,
    ExecutionOrder,
    ExecutionFill,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SpotTick => "spot_tick",
            EventType::QuoteUpdate => "quote_update",
            EventType::MarketLifecycle => "market_lifecycle",
            EventType::ContractUpdate => "contract_update",
            EventType::EdgeSnapshot => "edge_snapshot",
            EventType::OpportunityDecision => "opportunity_decision",
            EventType::ExecutionOrder => "execution_order",
            EventType::ExecutionFill => "execution_fill",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "spot_tick" => EventType::SpotTick,
            "quote_update" => EventType::QuoteUpdate,
            "market_lifecycle" => EventType::MarketLifecycle,
            "contract_update" => EventType::ContractUpdate,
            "edge_snapshot" => EventType::EdgeSnapshot,
            "opportunity_decision" => EventType::OpportunityDecision,
            "execution_order" => EventType::ExecutionOrder,
            "execution_fill" => EventType::ExecutionFill,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpotTickPayload {
    pub ts: i64,
    pub product_id: String,
    pub price: f64,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub bid_qty: Option<f64>,
    #[serde(default)]
    pub ask_qty: Option<f64>,
    #[serde(default)]
    pub sequence_num: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QuoteUpdatePayload {
    pub ts: i64,
    pub market_id: String,
    #[serde(default)]
    pub source_msg_id: Option<String>,
    #[serde(default)]
    pub yes_bid: Option<f64>,
    #[serde(default)]
    pub yes_ask: Option<f64>,
    #[serde(default)]
    pub no_bid: Option<f64>,
    #[serde(default)]
    pub no_ask: Option<f64>,
    #[serde(default)]
    pub yes_mid: Option<f64>,
    #[serde(default)]
    pub no_mid: Option<f64>,
    #[serde(default)]
    pub p_mid: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MarketLifecyclePayload {
    pub market_id: String,
    pub status: String,
    #[serde(default)]
    pub close_ts: Option<i64>,
    #[serde(default)]
    pub expected_expiration_ts: Option<i64>,
    #[serde(default)]
    pub expiration_ts: Option<i64>,
    #[serde(default)]
    pub settlement_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ContractUpdatePayload {
    pub ticker: String,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub strike_type: Option<String>,
    #[serde(default)]
    pub close_ts: Option<i64>,
    #[serde(default)]
    pub expected_expiration_ts: Option<i64>,
    #[serde(default)]
    pub expiration_ts: Option<i64>,
    #[serde(default)]
    pub settled_ts: Option<i64>,
    #[serde(default)]
    pub outcome: Option<i64>,
    /// Asserts that `outcome` should overwrite a conflicting, already-set
    /// outcome rather than being ignored. See the monotone-outcome
    /// invariant in `state::LiveMarketState::apply_contract_update`.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EdgeSnapshotPayload {
    pub asof_ts: i64,
    pub market_id: String,
    pub prob_yes: f64,
    pub ev_take_yes: f64,
    pub ev_take_no: f64,
    pub sigma_annualized: f64,
    pub spot_price: f64,
    #[serde(default)]
    pub quote_ts: Option<i64>,
    #[serde(default)]
    pub spot_ts: Option<i64>,
    #[serde(default)]
    pub settlement_ts: Option<i64>,
    #[serde(default)]
    pub horizon_seconds: Option<i64>,
    #[serde(default)]
    pub strike: Option<String>,
    #[serde(default)]
    pub prob_yes_raw: Option<f64>,
    #[serde(default)]
    pub yes_bid: Option<f64>,
    #[serde(default)]
    pub yes_ask: Option<f64>,
    #[serde(default)]
    pub no_bid: Option<f64>,
    #[serde(default)]
    pub no_ask: Option<f64>,
    #[serde(default)]
    pub yes_mid: Option<f64>,
    #[serde(default)]
    pub no_mid: Option<f64>,
    #[serde(default)]
    pub spot_age_seconds: Option<i64>,
    #[serde(default)]
    pub quote_age_seconds: Option<i64>,
    #[serde(default)]
    pub raw_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OpportunityDecisionPayload {
    pub ts_eval: i64,
    pub market_id: String,
    pub eligible: bool,
    pub would_trade: bool,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub reason_not_eligible: Option<String>,
    #[serde(default)]
    pub ev_raw: Option<f64>,
    #[serde(default)]
    pub ev_net: Option<f64>,
    #[serde(default)]
    pub settlement_ts: Option<i64>,
    #[serde(default)]
    pub strike: Option<String>,
    #[serde(default)]
    pub spot_price: Option<f64>,
    #[serde(default)]
    pub sigma: Option<f64>,
    #[serde(default)]
    pub tau: Option<f64>,
    #[serde(default)]
    pub p_model: Option<f64>,
    #[serde(default)]
    pub p_market: Option<f64>,
    #[serde(default)]
    pub best_yes_bid: Option<f64>,
    #[serde(default)]
    pub best_yes_ask: Option<f64>,
    #[serde(default)]
    pub best_no_bid: Option<f64>,
    #[serde(default)]
    pub best_no_ask: Option<f64>,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub cost_buffer: Option<f64>,
    #[serde(default)]
    pub raw_json: Option<String>,
    #[serde(default)]
    pub strategy_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionOrderPayload {
    pub ts_order: i64,
    pub order_id: String,
    pub market_id: String,
    pub side: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price_cents: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub opportunity_idempotency_key: Option<String>,
    #[serde(default = "default_paper")]
    pub paper: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionFillPayload {
    pub ts_fill: i64,
    pub fill_id: String,
    pub order_id: String,
    pub market_id: String,
    pub side: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price_cents: Option<f64>,
    #[serde(default)]
    pub outcome: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_paper")]
    pub paper: bool,
}

fn default_action() -> String {
    "open".to_string()
}
fn default_quantity() -> i64 {
    1
}
fn default_paper() -> bool {
    true
}

macro_rules! define_event_enum {
    ($( $variant:ident ( $payload:ty ) => $event_type:expr ),+ $(,)?) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        #[serde(tag = "event_type", rename_all = "snake_case")]
        pub enum Event {
            $( $variant(Envelope<$payload>), )+
        }

        impl Event {
            pub fn event_type(&self) -> EventType {
                match self {
                    $( Event::$variant(_) => $event_type, )+
                }
            }

            pub fn ts_event(&self) -> i64 {
                match self {
                    $( Event::$variant(e) => e.ts_event, )+
                }
            }

            pub fn idempotency_key(&self) -> &str {
                match self {
                    $( Event::$variant(e) => &e.idempotency_key, )+
                }
            }
        }
    };
}

define_event_enum! {
    SpotTick(SpotTickPayload) => EventType::SpotTick,
    QuoteUpdate(QuoteUpdatePayload) => EventType::QuoteUpdate,
    MarketLifecycle(MarketLifecyclePayload) => EventType::MarketLifecycle,
    ContractUpdate(ContractUpdatePayload) => EventType::ContractUpdate,
    EdgeSnapshot(EdgeSnapshotPayload) => EventType::EdgeSnapshot,
    OpportunityDecision(OpportunityDecisionPayload) => EventType::OpportunityDecision,
    ExecutionOrder(ExecutionOrderPayload) => EventType::ExecutionOrder,
    ExecutionFill(ExecutionFillPayload) => EventType::ExecutionFill,
}

/// Generic envelope shared by every event type. `#[serde(deny_unknown_fields)]`
/// on each payload struct plays the role of the source models' `extra="forbid"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<P> {
    pub schema_version: u32,
    pub ts_event: i64,
    pub source: String,
    pub idempotency_key: String,
    pub payload: P,
}

impl<P: Serialize> Envelope<P> {
    /// Build an envelope for `event_type`, deriving the idempotency key
    /// from the payload when one is not supplied explicitly.
    pub fn new(
        event_type: EventType,
        ts_event: i64,
        source: impl Into<String>,
        payload: P,
    ) -> Result<Self, PipelineError> {
        let schema_version = schema_version_for_event(event_type);
        let payload_value = serde_json::to_value(&payload)
            .map_err(|e| PipelineError::ValidationError(e.to_string()))?;
        let idempotency_key = build_idempotency_key(event_type, &payload_value, schema_version);
        Ok(Self {
            schema_version,
            ts_event,
            source: source.into(),
            idempotency_key,
            payload,
        })
    }
}

/// Parse a raw JSON value into a strictly-typed `Event`, the single entry
/// point every consumer of the bus goes through. Unknown `event_type`
/// values and any field mismatch are parse errors, never panics.
pub fn parse_event(raw: &serde_json::Value) -> Result<Event, PipelineError> {
    let event_type = raw
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::ParseError("missing event_type".to_string()))?;

    if EventType::from_str(event_type).is_none() {
        return Err(PipelineError::ParseError(format!(
            "unknown event_type: {event_type}"
        )));
    }

    serde_json::from_value(raw.clone())
        .map_err(|e| PipelineError::ParseError(format!("{event_type}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_spot_tick() {
        let raw = json!({
            "event_type": "spot_tick",
            "schema_version": 1,
            "ts_event": 100,
            "source": "coinbase",
            "idempotency_key": "spot_tick:v1:abc",
            "payload": {"ts": 100, "product_id": "BTC-USD", "price": 50000.0}
        });
        let event = parse_event(&raw).expect("should parse");
        assert_eq!(event.event_type(), EventType::SpotTick);
    }

    #[test]
    fn rejects_unknown_event_type() {
        let raw = json!({"event_type": "not_a_real_type", "payload": {}});
        assert!(parse_event(&raw).is_err());
    }

    #[test]
    fn rejects_unknown_payload_fields() {
        let raw = json!({
            "event_type": "spot_tick",
            "schema_version": 1,
            "ts_event": 100,
            "source": "coinbase",
            "idempotency_key": "spot_tick:v1:abc",
            "payload": {"ts": 100, "product_id": "BTC-USD", "price": 50000.0, "bogus": 1}
        });
        assert!(parse_event(&raw).is_err());
    }

    #[test]
    fn envelope_derives_idempotency_key_deterministically() {
        let payload = SpotTickPayload {
            ts: 100,
            product_id: "BTC-USD".to_string(),
            price: 50000.0,
            best_bid: None,
            best_ask: None,
            bid_qty: None,
            ask_qty: None,
            sequence_num: Some(7),
        };
        let e1 = Envelope::new(EventType::SpotTick, 100, "coinbase", payload.clone()).unwrap();
        let e2 = Envelope::new(EventType::SpotTick, 100, "coinbase", payload).unwrap();
        assert_eq!(e1.idempotency_key, e2.idempotency_key);
    }
}
