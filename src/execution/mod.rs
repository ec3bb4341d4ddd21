//! Atomic multi-leg execution across independent venues.

pub mod error;
pub mod executor;
pub mod hedge;
pub mod preflight;
pub mod reconcile;
pub mod rollback;
pub mod strategy;
pub mod types;

pub use error::ExecError;
pub use executor::AtomicExecutor;
pub use hedge::HedgeManager;
pub use preflight::PreflightChecker;
pub use reconcile::{EventReconciler, FillEvent, OrderReconciler, PollingReconciler};
pub use rollback::RollbackManager;
pub use strategy::{for_mode, ExecutionStrategy};
pub use types::{
    ExecutionMode, ExecutionResult, FillState, GroupResult, LegReport, LimitPrice, OrderContext,
    OrderSpec, RollbackRecord, RollbackReport, TargetSize,
};
