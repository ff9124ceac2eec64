//! Replay Harness Library
//!
//! Deterministic replay coordination for a market-data/order-execution
//! test harness: event bus, quiescence registry, virtual clock and the
//! replay scheduler that ties them together.

pub mod replay;

pub use replay::{ReplayConfig, ReplayContext, ReplayScheduler};
