//! Execution error taxonomy.
//!
//! Venue failures are values, not exceptions: every class is an enum
//! variant so hedge/rollback decision logic can match exhaustively.

use crate::venue::VenueError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// Preflight: expected notional exceeds the allowed fraction of
    /// visible depth. Aborts before any order is placed.
    #[error("insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    /// Preflight: available balance cannot cover the leg's margin.
    /// Aborts before any order is placed.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Limit order would have crossed under a passive-order policy;
    /// retried with a re-priced order.
    #[error("post-only order would cross the spread")]
    PostOnlyViolation,

    /// Market order exceeded venue slippage limits; triggers the limit
    /// fallback.
    #[error("market order slippage above venue tolerance")]
    SlippageExceeded,

    /// Venue refused the order for its own reason. Not retryable;
    /// escalates to rollback.
    #[error("order rejected by venue: {0}")]
    OrderRejected(String),

    /// No terminal state within the time budget.
    #[error("timed out waiting for a terminal order state")]
    Timeout,

    /// Local tracking disagrees with venue-reported state. Always
    /// resolved in favor of the venue.
    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    /// Rollback could not close a known exposure. Surfaced to the caller
    /// for manual intervention, never swallowed.
    #[error("rollback failed, manual intervention required: {0}")]
    RollbackFailed(String),

    /// Transport or venue-internal failure outside the taxonomy above.
    #[error("venue call failed: {0}")]
    Venue(String),
}

impl ExecError {
    /// Whether a strategy may retry locally after this error.
    pub fn retryable(&self) -> bool {
        matches!(self, ExecError::PostOnlyViolation | ExecError::Timeout)
    }
}

impl From<VenueError> for ExecError {
    fn from(err: VenueError) -> Self {
        match err {
            VenueError::Rejected(reason) => ExecError::OrderRejected(reason),
            VenueError::PostOnlyRejected => ExecError::PostOnlyViolation,
            VenueError::SlippageRejected => ExecError::SlippageExceeded,
            VenueError::UnknownOrder(id) => {
                ExecError::ReconciliationMismatch(format!("venue does not know order {id}"))
            }
            VenueError::Transport(reason) => ExecError::Venue(reason),
        }
    }
}
