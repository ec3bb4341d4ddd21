//! Data model for one atomic execution group.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::ExecError;
use crate::utils::decimal::accumulate_vwap;
use crate::venue::{OrderId, OrderSide, SymbolMeta, VenueClient};

/// How a leg sizes its order. At most one of quantity or notional is
/// authoritative; notional is converted to quantity exactly once, at
/// placement, and quantity drives every control decision after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSize {
    /// Target quantity in venue contract units.
    Quantity(Decimal),
    /// Target notional in quote currency, resolved to quantity at the
    /// reference price when the leg starts.
    Notional(Decimal),
}

/// Caller-supplied price for the simple-limit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPrice {
    Absolute(Decimal),
    /// Ticks inside the spread from this side's touch (0 = join the
    /// touch, positive = more aggressive).
    OffsetTicks(i64),
}

/// Execution policy for a single leg. A closed enumeration: strategy
/// dispatch is a `match`, never a runtime lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Market,
    SimpleLimit(LimitPrice),
    AggressiveLimit,
}

/// Immutable description of one leg, created by the caller before
/// execution starts.
#[derive(Clone)]
pub struct OrderSpec {
    pub venue: Arc<dyn VenueClient>,
    pub symbol: String,
    pub side: OrderSide,
    pub target: TargetSize,
    pub reduce_only: bool,
    pub mode: ExecutionMode,
    /// Budget for a single limit-order wait.
    pub attempt_timeout: Duration,
    /// Budget for all retries of this leg.
    pub leg_timeout: Duration,
}

impl OrderSpec {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        symbol: impl Into<String>,
        side: OrderSide,
        target: TargetSize,
    ) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            side,
            target,
            reduce_only: false,
            mode: ExecutionMode::AggressiveLimit,
            attempt_timeout: Duration::from_secs(2),
            leg_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn with_timeouts(mut self, attempt: Duration, leg: Duration) -> Self {
        self.attempt_timeout = attempt;
        self.leg_timeout = leg;
        self
    }

    pub fn meta(&self) -> SymbolMeta {
        self.venue.symbol_meta(&self.symbol)
    }

    /// Resolve the target to a quantity in venue contract units, rounded
    /// down to the venue lot. A notional target is converted here, once;
    /// quantity is authoritative from this point on.
    pub fn resolve_qty(&self, reference_price: Decimal) -> Decimal {
        let meta = self.meta();
        let qty = match self.target {
            TargetSize::Quantity(q) => q,
            TargetSize::Notional(n) => crate::utils::decimal::safe_div(n, reference_price),
        };
        crate::utils::decimal::round_down_to_lot(qty, meta.qty_step)
    }
}

impl fmt::Debug for OrderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSpec")
            .field("venue", &self.venue.name())
            .field("symbol", &self.symbol)
            .field("side", &self.side)
            .field("target", &self.target)
            .field("reduce_only", &self.reduce_only)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Accumulated fill state of one leg.
///
/// `notional` is advisory only, for display and logging; hedge and
/// rollback sizing never read it.
#[derive(Debug, Clone, Default)]
pub struct FillState {
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub notional: Decimal,
    pub order_ids: Vec<OrderId>,
}

/// Mutable per-leg state, owned by the executor for the lifetime of one
/// leg. Fill fields are written only through [`OrderContext::accumulate`]
/// by the leg's own execution path; everyone else reads, and only after
/// the reconciler confirms the leg's orders are no longer live.
pub struct OrderContext {
    pub spec: OrderSpec,
    fills: RwLock<FillState>,
    /// Set exactly once, the first time any leg reaches a full fill.
    hedge_target: OnceLock<Decimal>,
    /// Touch price observed when the leg was resolved; rollback slippage
    /// is measured against it.
    reference_price: OnceLock<Decimal>,
    /// Target quantity after resolving `TargetSize`.
    resolved_qty: OnceLock<Decimal>,
    /// Quantity already closed by rollback (for idempotence).
    closed_qty: RwLock<Decimal>,
    cancel: AtomicBool,
    completed: AtomicBool,
}

impl OrderContext {
    pub fn new(spec: OrderSpec) -> Self {
        Self {
            spec,
            fills: RwLock::new(FillState::default()),
            hedge_target: OnceLock::new(),
            reference_price: OnceLock::new(),
            resolved_qty: OnceLock::new(),
            closed_qty: RwLock::new(Decimal::ZERO),
            cancel: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Fold a fill into the leg's accumulated quantity and VWAP.
    pub async fn accumulate(&self, qty: Decimal, price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let mut fills = self.fills.write().await;
        let (total, vwap) = accumulate_vwap(fills.filled_qty, fills.avg_price, qty, price);
        fills.filled_qty = total;
        fills.avg_price = vwap;
        fills.notional += qty * price;
    }

    pub async fn record_order(&self, order_id: OrderId) {
        self.fills.write().await.order_ids.push(order_id);
    }

    pub async fn fill_state(&self) -> FillState {
        self.fills.read().await.clone()
    }

    pub async fn filled_qty(&self) -> Decimal {
        self.fills.read().await.filled_qty
    }

    pub async fn order_ids(&self) -> Vec<OrderId> {
        self.fills.read().await.order_ids.clone()
    }

    /// Set the hedge target. Returns false if it was already set; the
    /// target never changes once computed.
    pub fn set_hedge_target(&self, qty: Decimal) -> bool {
        self.hedge_target.set(qty).is_ok()
    }

    pub fn hedge_target(&self) -> Option<Decimal> {
        self.hedge_target.get().copied()
    }

    /// `max(0, hedge_target - filled)`. Never negative, and monotonically
    /// non-increasing as fills accumulate.
    pub async fn remaining_to_hedge(&self) -> Decimal {
        let target = match self.hedge_target() {
            Some(t) => t,
            None => return Decimal::ZERO,
        };
        (target - self.filled_qty().await).max(Decimal::ZERO)
    }

    pub fn set_reference_price(&self, price: Decimal) {
        let _ = self.reference_price.set(price);
    }

    pub fn reference_price(&self) -> Decimal {
        self.reference_price.get().copied().unwrap_or(Decimal::ZERO)
    }

    pub fn set_resolved_qty(&self, qty: Decimal) {
        let _ = self.resolved_qty.set(qty);
    }

    /// Target quantity for this leg. Zero until resolved.
    pub fn target_qty(&self) -> Decimal {
        self.resolved_qty.get().copied().unwrap_or(Decimal::ZERO)
    }

    pub async fn closed_qty(&self) -> Decimal {
        *self.closed_qty.read().await
    }

    pub async fn add_closed(&self, qty: Decimal) {
        *self.closed_qty.write().await += qty;
    }

    /// Cooperative cancellation: set by the executor, checked by the
    /// leg's loop between attempts. Always paired with venue-side
    /// cancellation of open orders.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Issue venue-side cancels for every order of this leg that is still
    /// live, concurrently, without waiting on individual confirmations.
    /// Cancel errors are logged and ignored: the follow-up authoritative
    /// re-query decides what actually filled.
    pub async fn cancel_open_orders(&self) {
        let ids = self.order_ids().await;
        let venue = &self.spec.venue;
        let cancels = ids.iter().map(|&id| async move {
            if let Err(err) = venue.cancel_order(id).await {
                debug!(
                    venue = venue.name(),
                    order_id = %id,
                    error = %err,
                    "Cancel failed; re-query will reconcile"
                );
            }
        });
        join_all(cancels).await;
    }
}

/// Outcome of one order-placement attempt by an execution strategy.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// True if the fill rested on the book (maker) rather than crossing.
    pub maker: bool,
    pub error: Option<ExecError>,
    pub retryable: bool,
}

impl ExecutionResult {
    pub fn filled(qty: Decimal, avg_price: Decimal, maker: bool) -> Self {
        Self {
            success: true,
            filled_qty: qty,
            avg_price,
            maker,
            error: None,
            retryable: false,
        }
    }

    /// A success with nothing to do (residual below minimum order size).
    pub fn skipped() -> Self {
        Self::filled(Decimal::ZERO, Decimal::ZERO, false)
    }

    pub fn failed(error: ExecError, filled_qty: Decimal, avg_price: Decimal) -> Self {
        let retryable = error.retryable();
        Self {
            success: false,
            filled_qty,
            avg_price,
            maker: false,
            error: Some(error),
            retryable,
        }
    }
}

/// Final per-leg report in a [`GroupResult`].
#[derive(Debug, Clone)]
pub struct LegReport {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub target_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// Unfilled remainder deliberately left open because it is below the
    /// venue minimum order size.
    pub residual: Decimal,
}

/// Per-leg record of a rollback close.
#[derive(Debug, Clone)]
pub struct RollbackRecord {
    pub venue: String,
    pub symbol: String,
    /// Side of the closing order.
    pub close_side: OrderSide,
    pub closed_qty: Decimal,
    pub close_price: Decimal,
    /// Touch price observed when the leg was first priced.
    pub intended_price: Decimal,
    /// Realized cost of closing versus the intended price; positive is a
    /// loss.
    pub slippage_cost: Decimal,
    pub at: DateTime<Utc>,
}

/// Aggregate of one rollback episode.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub records: Vec<RollbackRecord>,
    pub total_cost: Decimal,
}

/// Structured outcome of one atomic group execution.
#[derive(Debug, Clone)]
pub struct GroupResult {
    pub success: bool,
    pub legs: Vec<LegReport>,
    pub rollback: Option<RollbackReport>,
    pub error: Option<ExecError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::MockVenueClient;
    use rust_decimal_macros::dec;

    fn ctx() -> OrderContext {
        let venue = Arc::new(MockVenueClient::new("mock"));
        OrderContext::new(OrderSpec::new(
            venue,
            "BTC",
            OrderSide::Buy,
            TargetSize::Quantity(dec!(1)),
        ))
    }

    #[tokio::test]
    async fn test_accumulate_builds_vwap() {
        let ctx = ctx();
        ctx.accumulate(dec!(0.5), dec!(100)).await;
        ctx.accumulate(dec!(0.5), dec!(110)).await;

        let fills = ctx.fill_state().await;
        assert_eq!(fills.filled_qty, dec!(1.0));
        assert_eq!(fills.avg_price, dec!(105));
        assert_eq!(fills.notional, dec!(105));
    }

    #[tokio::test]
    async fn test_hedge_target_set_exactly_once() {
        let ctx = ctx();
        assert!(ctx.set_hedge_target(dec!(1.0)));
        assert!(!ctx.set_hedge_target(dec!(2.0)));
        assert_eq!(ctx.hedge_target(), Some(dec!(1.0)));
    }

    #[tokio::test]
    async fn test_remaining_to_hedge_clamps_at_zero() {
        let ctx = ctx();
        ctx.set_hedge_target(dec!(1.0));
        assert_eq!(ctx.remaining_to_hedge().await, dec!(1.0));

        ctx.accumulate(dec!(0.6), dec!(100)).await;
        assert_eq!(ctx.remaining_to_hedge().await, dec!(0.4));

        // Overfill: remaining never goes negative.
        ctx.accumulate(dec!(0.6), dec!(100)).await;
        assert_eq!(ctx.remaining_to_hedge().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_remaining_monotonically_non_increasing() {
        let ctx = ctx();
        ctx.set_hedge_target(dec!(2.0));

        let mut last = ctx.remaining_to_hedge().await;
        for _ in 0..4 {
            ctx.accumulate(dec!(0.3), dec!(50)).await;
            let now = ctx.remaining_to_hedge().await;
            assert!(now <= last);
            last = now;
        }
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let ctx = ctx();
        assert!(!ctx.cancel_requested());
        ctx.request_cancel();
        assert!(ctx.cancel_requested());
    }

    #[tokio::test]
    async fn test_zero_accumulate_ignored() {
        let ctx = ctx();
        ctx.accumulate(Decimal::ZERO, dec!(100)).await;
        assert_eq!(ctx.filled_qty().await, Decimal::ZERO);
    }
}
