//! Event contracts: typed envelopes, payload schemas, idempotency-key
//! derivation, and subject/stream routing metadata.

pub mod contracts;
pub mod models;

pub use contracts::{
    build_idempotency_key, default_stream_specs, dlq_subject_for_event, schema_version_for_event,
    stable_json, subject_for_event, JetStreamStreamSpec, DLQ_SUBJECT_PREFIX,
};
pub use models::{
    parse_event, ContractUpdatePayload, EdgeSnapshotPayload, Envelope, Event, EventType,
    ExecutionFillPayload, ExecutionOrderPayload, MarketLifecyclePayload,
    OpportunityDecisionPayload, QuoteUpdatePayload, SpotTickPayload,
};
