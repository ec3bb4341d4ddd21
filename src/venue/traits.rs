//! Venue-agnostic client contract.
//!
//! Each venue exposes only its own order primitives; there is no shared
//! transaction coordinator across venues. Implementations own transport
//! and signing. All methods must be safe for concurrent use: several leg
//! tasks read prices and place orders through the same client at once.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{BestBidOffer, OrderId, OrderInfo, OrderSide, SymbolMeta, VenueError};

/// Per-venue order placement, cancellation, and query.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Venue name for logging and reports.
    fn name(&self) -> &str;

    /// Trading rules for a symbol on this venue.
    fn symbol_meta(&self, symbol: &str) -> SymbolMeta;

    /// Place a resting limit order. The venue may reject it for crossing
    /// the spread under a passive-order policy (`PostOnlyRejected`).
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Result<OrderId, VenueError>;

    /// Place an immediate market order. The venue may reject it for
    /// exceeding allowed slippage (`SlippageRejected`).
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderId, VenueError>;

    /// Cancel an order. Cancelling an already-terminal order is not an
    /// error: the order may have filled in flight, and the caller must
    /// re-query to learn what actually happened.
    async fn cancel_order(&self, order_id: OrderId) -> Result<(), VenueError>;

    /// Authoritative order state. This, not local bookkeeping, decides
    /// every hedge and rollback sizing.
    async fn get_order_info(&self, order_id: OrderId) -> Result<OrderInfo, VenueError>;

    /// Current best bid/offer with quantity at the touch.
    async fn get_best_bid_offer(&self, symbol: &str) -> Result<BestBidOffer, VenueError>;

    /// Available balance/margin in quote currency.
    async fn get_available_balance(&self) -> Result<Decimal, VenueError>;
}
