//! Order and market-data types shared by every venue client.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order status as reported by a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states: the order can no longer change venue-side.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Venue-assigned order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authoritative order state from the venue.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub orig_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// Limit price, if the order was a limit order.
    pub price: Option<Decimal>,
}

/// Best bid/offer with the quantity visible at the touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestBidOffer {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
}

impl BestBidOffer {
    pub fn mid(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }

    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    /// Spread as a fraction of the mid price.
    pub fn spread_fraction(&self) -> Decimal {
        let mid = self.mid();
        if mid == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.spread() / mid
    }

    /// The price an immediate (taker) order would pay on `side`.
    pub fn touch(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask_price,
            OrderSide::Sell => self.bid_price,
        }
    }

    /// Quantity resting at the touch on the side an order of `side` hits.
    pub fn touch_qty(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask_qty,
            OrderSide::Sell => self.bid_qty,
        }
    }
}

/// Per-symbol trading rules for a venue.
///
/// Contract sizes differ across venues for the same symbol;
/// `size_multiplier` converts one venue contract into base units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    #[serde(with = "rust_decimal::serde::str")]
    pub min_order_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty_step: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_tick: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size_multiplier: Decimal,
}

impl Default for SymbolMeta {
    fn default() -> Self {
        Self {
            min_order_size: Decimal::new(1, 2),  // 0.01
            qty_step: Decimal::new(1, 3),        // 0.001
            price_tick: Decimal::new(1, 2),      // 0.01
            size_multiplier: Decimal::ONE,
        }
    }
}

/// Venue call failures, classified so execution logic can match on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VenueError {
    /// Venue refused the order with its own reason string.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Passive order would have crossed the spread.
    #[error("post-only order would cross the spread")]
    PostOnlyRejected,
    /// Market order exceeded the venue's allowed slippage.
    #[error("market order exceeds allowed slippage")]
    SlippageRejected,
    /// The venue does not know this order id.
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
    /// Network or venue-internal failure.
    #[error("venue transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bbo() -> BestBidOffer {
        BestBidOffer {
            symbol: "BTC".to_string(),
            bid_price: dec!(100),
            bid_qty: dec!(2),
            ask_price: dec!(101),
            ask_qty: dec!(3),
        }
    }

    #[test]
    fn test_bbo_derived_values() {
        let b = bbo();
        assert_eq!(b.mid(), dec!(100.5));
        assert_eq!(b.spread(), dec!(1));
        assert_eq!(b.touch(OrderSide::Buy), dec!(101));
        assert_eq!(b.touch(OrderSide::Sell), dec!(100));
        assert_eq!(b.touch_qty(OrderSide::Buy), dec!(3));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_terminal_status() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
