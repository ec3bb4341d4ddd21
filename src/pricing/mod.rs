//! Best-bid/offer fetching and passive price selection.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::venue::{BestBidOffer, OrderSide, VenueClient, VenueError};

/// Fetches current prices for one venue and derives order prices from them.
///
/// Safe for concurrent use: holds no mutable state, every call reads a
/// fresh BBO from the venue.
pub struct PriceProvider {
    venue: Arc<dyn VenueClient>,
}

impl PriceProvider {
    pub fn new(venue: Arc<dyn VenueClient>) -> Self {
        Self { venue }
    }

    pub async fn best_bid_offer(&self, symbol: &str) -> Result<BestBidOffer, VenueError> {
        self.venue.get_best_bid_offer(symbol).await
    }

    /// Price for a passive limit order: one tick inside the spread, so it
    /// improves the book without crossing. With a spread of two ticks or
    /// less there is no room inside; join the touch instead.
    pub async fn passive_price(&self, symbol: &str, side: OrderSide) -> Result<Decimal, VenueError> {
        let bbo = self.best_bid_offer(symbol).await?;
        let tick = self.venue.symbol_meta(symbol).price_tick;
        let price = passive_price_from(&bbo, side, tick);
        debug!(
            venue = self.venue.name(),
            %symbol,
            %side,
            bid = %bbo.bid_price,
            ask = %bbo.ask_price,
            %price,
            "Passive price selected"
        );
        Ok(price)
    }

    /// Price an immediate (taker) order would pay right now.
    pub async fn taker_reference(&self, symbol: &str, side: OrderSide) -> Result<Decimal, VenueError> {
        Ok(self.best_bid_offer(symbol).await?.touch(side))
    }
}

/// Pure passive-pricing rule, separated for testing.
pub fn passive_price_from(bbo: &BestBidOffer, side: OrderSide, tick: Decimal) -> Decimal {
    let has_room = bbo.spread() > tick * Decimal::TWO;
    match side {
        OrderSide::Buy => {
            if has_room {
                bbo.bid_price + tick
            } else {
                bbo.bid_price
            }
        }
        OrderSide::Sell => {
            if has_room {
                bbo.ask_price - tick
            } else {
                bbo.ask_price
            }
        }
    }
}
