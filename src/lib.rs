//! Edge & paper-execution pipeline library surface.
//!
//! Exposes the modules that make up the pipeline (event contracts, bus
//! adapter, live state, volatility, probability, edge/opportunity/execution
//! engines, persistence, orchestrator) for use by `main` and by integration
//! tests.

pub mod bus;
pub mod config;
pub mod edge;
pub mod error;
pub mod events;
pub mod execution;
pub mod opportunity;
pub mod orchestrator;
pub mod persistence;
pub mod probability;
pub mod state;
pub mod volatility;
