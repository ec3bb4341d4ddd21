//! # Multileg
//!
//! Atomic multi-leg order execution across independent, unreliable trading
//! venues. Places matched legs concurrently, hedges lagging legs when one
//! leg fills, and performs a cancel-first rollback when a leg cannot be
//! completed, so that every execution converges to a bounded, known
//! exposure state even under partial failure.
//!
//! ## Architecture
//!
//! - `config`: Engine configuration and validation
//! - `venue`: Venue client contract, order types, and the mock venue
//! - `pricing`: Best-bid/offer fetching and passive price selection
//! - `execution`: Strategies, reconciliation, preflight, hedge, rollback,
//!   and the top-level atomic executor
//! - `notify`: Fire-and-forget execution event stream
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod execution;
pub mod notify;
pub mod pricing;
pub mod utils;
pub mod venue;

pub use config::ExecutorConfig;
pub use execution::{AtomicExecutor, GroupResult};
