//! Scriptable mock venue for tests and paper execution.
//!
//! Every order placement consumes the next [`FillScript`] from a queue, so
//! tests can stage the exact failure sequences the engine must survive:
//! partial fills, rejections, post-only violations, and fills that land in
//! the window between cancel request and cancel confirmation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::VenueClient;
use super::types::{BestBidOffer, OrderId, OrderInfo, OrderSide, OrderStatus, SymbolMeta, VenueError};

/// Behavior of the next order placed on the mock venue.
#[derive(Debug, Clone)]
pub enum FillScript {
    /// Fill fully on placement.
    Fill,
    /// Fill `qty` immediately and rest; `on_cancel` more fills in the
    /// window between cancel request and cancel taking effect.
    Partial { qty: Decimal, on_cancel: Decimal },
    /// Rest on the book unfilled.
    Open,
    /// Venue rejects the order outright.
    Reject(String),
    /// Passive-order policy rejection (limit orders that would cross).
    PostOnlyReject,
    /// Market order rejected for exceeding allowed slippage.
    SlippageReject,
}

#[derive(Debug, Clone)]
struct MockOrder {
    symbol: String,
    side: OrderSide,
    orig_qty: Decimal,
    limit_price: Option<Decimal>,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_price: Decimal,
    on_cancel: Decimal,
}

#[derive(Default)]
struct MockState {
    orders: HashMap<u64, MockOrder>,
    /// Signed net position per symbol, in venue contract units.
    positions: HashMap<String, Decimal>,
    scripts: VecDeque<FillScript>,
    books: HashMap<String, BestBidOffer>,
    balance: Decimal,
}

/// In-memory venue with scripted order outcomes.
pub struct MockVenueClient {
    name: String,
    state: Arc<RwLock<MockState>>,
    // Kept out of the async state lock: `symbol_meta` is a sync trait
    // method and must never observe writer contention on order state.
    metas: std::sync::RwLock<HashMap<String, SymbolMeta>>,
    order_id_counter: AtomicU64,
}

impl MockVenueClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(MockState {
                balance: Decimal::new(1_000_000, 0),
                ..MockState::default()
            })),
            metas: std::sync::RwLock::new(HashMap::new()),
            order_id_counter: AtomicU64::new(1),
        }
    }

    /// Queue the behavior for the next placed order.
    pub async fn push_script(&self, script: FillScript) {
        self.state.write().await.scripts.push_back(script);
    }

    pub async fn set_book(&self, symbol: &str, bid: Decimal, bid_qty: Decimal, ask: Decimal, ask_qty: Decimal) {
        self.state.write().await.books.insert(
            symbol.to_string(),
            BestBidOffer {
                symbol: symbol.to_string(),
                bid_price: bid,
                bid_qty,
                ask_price: ask,
                ask_qty,
            },
        );
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.write().await.balance = balance;
    }

    pub fn set_meta(&self, symbol: &str, meta: SymbolMeta) {
        let mut metas = match self.metas.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        metas.insert(symbol.to_string(), meta);
    }

    /// Signed net position in venue contract units (buys minus sells).
    pub async fn net_position(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Number of orders still live on the book.
    pub async fn open_order_count(&self) -> usize {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Fill (part of) a resting order, as if the market moved into it.
    pub async fn fill_open_order(&self, order_id: OrderId, qty: Decimal) {
        let mut state = self.state.write().await;
        let applied = match state.orders.get_mut(&order_id.0) {
            Some(order) if !order.status.is_terminal() => {
                let price = order.limit_price.unwrap_or(order.avg_price);
                let fill = qty.min(order.orig_qty - order.filled_qty);
                Self::apply_fill(order, fill, price);
                Some((order.symbol.clone(), Self::signed(order.side, fill)))
            }
            _ => None,
        };
        if let Some((symbol, delta)) = applied {
            *state.positions.entry(symbol).or_default() += delta;
        }
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn signed(side: OrderSide, qty: Decimal) -> Decimal {
        match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        }
    }

    fn apply_fill(order: &mut MockOrder, qty: Decimal, price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let total = order.filled_qty + qty;
        order.avg_price = (order.filled_qty * order.avg_price + qty * price) / total;
        order.filled_qty = total;
        if order.filled_qty >= order.orig_qty {
            order.status = OrderStatus::Filled;
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }
    }

    async fn place(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderId, VenueError> {
        let mut state = self.state.write().await;
        let script = state.scripts.pop_front().unwrap_or(FillScript::Fill);

        let fill_price = match limit_price {
            Some(p) => p,
            None => state
                .books
                .get(symbol)
                .map(|b| b.touch(side))
                .unwrap_or(Decimal::ONE),
        };

        let mut order = MockOrder {
            symbol: symbol.to_string(),
            side,
            orig_qty: qty,
            limit_price,
            status: OrderStatus::New,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            on_cancel: Decimal::ZERO,
        };

        match script {
            FillScript::Reject(reason) => return Err(VenueError::Rejected(reason)),
            FillScript::PostOnlyReject => return Err(VenueError::PostOnlyRejected),
            FillScript::SlippageReject => return Err(VenueError::SlippageRejected),
            FillScript::Fill => Self::apply_fill(&mut order, qty, fill_price),
            FillScript::Partial { qty: part, on_cancel } => {
                Self::apply_fill(&mut order, part.min(qty), fill_price);
                order.on_cancel = on_cancel;
            }
            FillScript::Open => {}
        }

        let delta = Self::signed(side, order.filled_qty);
        *state.positions.entry(symbol.to_string()).or_default() += delta;

        let id = self.next_order_id();
        debug!(
            venue = %self.name,
            order_id = id,
            %symbol,
            %side,
            %qty,
            filled = %order.filled_qty,
            status = ?order.status,
            "Mock order placed"
        );
        state.orders.insert(id, order);
        Ok(OrderId(id))
    }
}

#[async_trait]
impl VenueClient for MockVenueClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol_meta(&self, symbol: &str) -> SymbolMeta {
        let metas = match self.metas.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        metas.get(symbol).cloned().unwrap_or_default()
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        _reduce_only: bool,
    ) -> Result<OrderId, VenueError> {
        self.place(symbol, side, qty, Some(price)).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        _reduce_only: bool,
    ) -> Result<OrderId, VenueError> {
        self.place(symbol, side, qty, None).await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), VenueError> {
        let mut state = self.state.write().await;
        let applied = {
            let order = state
                .orders
                .get_mut(&order_id.0)
                .ok_or(VenueError::UnknownOrder(order_id))?;

            if order.status.is_terminal() {
                // Cancel raced a fill; not an error, caller re-queries.
                return Ok(());
            }

            // An order keeps filling until the cancel takes effect venue-side.
            let late_fill = order.on_cancel.min(order.orig_qty - order.filled_qty);
            if late_fill > Decimal::ZERO {
                let price = order.limit_price.unwrap_or(order.avg_price);
                Self::apply_fill(order, late_fill, price);
                if order.status != OrderStatus::Filled {
                    order.status = OrderStatus::Canceled;
                }
                Some((order.symbol.clone(), Self::signed(order.side, late_fill)))
            } else {
                order.status = OrderStatus::Canceled;
                None
            }
        };
        if let Some((symbol, delta)) = applied {
            *state.positions.entry(symbol).or_default() += delta;
        }
        Ok(())
    }

    async fn get_order_info(&self, order_id: OrderId) -> Result<OrderInfo, VenueError> {
        let state = self.state.read().await;
        let order = state
            .orders
            .get(&order_id.0)
            .ok_or(VenueError::UnknownOrder(order_id))?;
        Ok(OrderInfo {
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            status: order.status,
            orig_qty: order.orig_qty,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            price: order.limit_price,
        })
    }

    async fn get_best_bid_offer(&self, symbol: &str) -> Result<BestBidOffer, VenueError> {
        self.state
            .read()
            .await
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::Transport(format!("no book for {symbol}")))
    }

    async fn get_available_balance(&self) -> Result<Decimal, VenueError> {
        Ok(self.state.read().await.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn client_with_book() -> MockVenueClient {
        let client = MockVenueClient::new("mock");
        client.set_book("BTC", dec!(100), dec!(5), dec!(101), dec!(5)).await;
        client
    }

    #[tokio::test]
    async fn test_market_order_fills_at_touch() {
        let client = client_with_book().await;

        let id = client
            .place_market_order("BTC", OrderSide::Buy, dec!(1), false)
            .await
            .unwrap();
        let info = client.get_order_info(id).await.unwrap();

        assert_eq!(info.status, OrderStatus::Filled);
        assert_eq!(info.filled_qty, dec!(1));
        assert_eq!(info.avg_price, dec!(101));
        assert_eq!(client.net_position("BTC").await, dec!(1));
    }

    #[tokio::test]
    async fn test_scripted_rejection() {
        let client = client_with_book().await;
        client.push_script(FillScript::Reject("margin check".into())).await;

        let err = client
            .place_market_order("BTC", OrderSide::Buy, dec!(1), false)
            .await
            .unwrap_err();
        assert_eq!(err, VenueError::Rejected("margin check".into()));
        assert_eq!(client.net_position("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_partial_fill_then_late_fill_on_cancel() {
        let client = client_with_book().await;
        client
            .push_script(FillScript::Partial {
                qty: dec!(0.5),
                on_cancel: dec!(0.3),
            })
            .await;

        let id = client
            .place_limit_order("BTC", OrderSide::Buy, dec!(1), dec!(100), false)
            .await
            .unwrap();

        let info = client.get_order_info(id).await.unwrap();
        assert_eq!(info.status, OrderStatus::PartiallyFilled);
        assert_eq!(info.filled_qty, dec!(0.5));

        // Cancel races an in-flight fill: venue reports more than we saw.
        client.cancel_order(id).await.unwrap();
        let info = client.get_order_info(id).await.unwrap();
        assert_eq!(info.status, OrderStatus::Canceled);
        assert_eq!(info.filled_qty, dec!(0.8));
        assert_eq!(client.net_position("BTC").await, dec!(0.8));
    }

    #[tokio::test]
    async fn test_cancel_already_filled_is_ok() {
        let client = client_with_book().await;

        let id = client
            .place_market_order("BTC", OrderSide::Sell, dec!(2), false)
            .await
            .unwrap();
        assert!(client.cancel_order(id).await.is_ok());
        let info = client.get_order_info(id).await.unwrap();
        assert_eq!(info.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_fill_open_order() {
        let client = client_with_book().await;
        client.push_script(FillScript::Open).await;

        let id = client
            .place_limit_order("BTC", OrderSide::Buy, dec!(1), dec!(100.5), false)
            .await
            .unwrap();
        assert_eq!(client.open_order_count().await, 1);

        client.fill_open_order(id, dec!(1)).await;
        let info = client.get_order_info(id).await.unwrap();
        assert_eq!(info.status, OrderStatus::Filled);
        assert_eq!(info.avg_price, dec!(100.5));
        assert_eq!(client.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_post_only_script() {
        let client = client_with_book().await;
        client.push_script(FillScript::PostOnlyReject).await;

        let err = client
            .place_limit_order("BTC", OrderSide::Buy, dec!(1), dec!(101), false)
            .await
            .unwrap_err();
        assert_eq!(err, VenueError::PostOnlyRejected);
    }

    #[tokio::test]
    async fn test_symbol_meta_unaffected_by_state_writes() {
        let client = Arc::new(client_with_book().await);
        let meta = SymbolMeta {
            min_order_size: dec!(0.5),
            ..SymbolMeta::default()
        };
        client.set_meta("BTC", meta);

        // Hammer the order state while reading metadata: the custom
        // minimum must come back every time, never the default.
        let writer = {
            let client = client.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    client.push_script(FillScript::Open).await;
                }
            })
        };
        for _ in 0..100 {
            assert_eq!(client.symbol_meta("BTC").min_order_size, dec!(0.5));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_positions_net_across_sides() {
        let client = client_with_book().await;

        client
            .place_market_order("BTC", OrderSide::Buy, dec!(1.5), false)
            .await
            .unwrap();
        client
            .place_market_order("BTC", OrderSide::Sell, dec!(1.5), true)
            .await
            .unwrap();

        assert_eq!(client.net_position("BTC").await, Decimal::ZERO);
    }
}
