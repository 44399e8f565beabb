//! Edge engine: the probability/EV edge computation stage of the
//! prediction-market pipeline. See `engine` for the per-tick computation.

pub mod engine;

pub use engine::{
    compute_edges_from_live_state, ev_take_no, ev_take_yes, taker_fee_dollars, EdgeEngineConfig,
    EdgeEngineOutcome, EdgeSnapshotRow,
};
