//! Execution strategies: how a single order reaches a terminal state on a
//! single venue.
//!
//! Three policies behind one trait, selected by `ExecutionMode` at
//! construction time. Every retry is sized from the remaining *quantity*,
//! computed from quantity accumulated so far, never from notional value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::ExecError;
use super::reconcile::OrderReconciler;
use super::types::{ExecutionMode, ExecutionResult, LimitPrice, OrderContext};
use crate::config::StrategyConfig;
use crate::pricing::PriceProvider;
use crate::utils::decimal::{accumulate_vwap, round_down_to_lot, round_to_tick};
use crate::venue::{OrderId, VenueClient, VenueError};

/// Places a single order on a single venue and drives it to a terminal
/// outcome. Fills are folded into the leg's `OrderContext` as they are
/// confirmed; the returned result covers only this call.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn execute(&self, ctx: &OrderContext, qty: Decimal) -> ExecutionResult;
}

/// Strategy for an execution mode. Closed dispatch: adding a mode means
/// adding a variant and an arm here.
pub fn for_mode(
    mode: ExecutionMode,
    reconciler: Arc<dyn OrderReconciler>,
    config: StrategyConfig,
) -> Box<dyn ExecutionStrategy> {
    match mode {
        ExecutionMode::Market => Box::new(MarketStrategy { reconciler }),
        ExecutionMode::SimpleLimit(price) => Box::new(SimpleLimitStrategy { price, reconciler }),
        ExecutionMode::AggressiveLimit => Box::new(AggressiveLimitStrategy { reconciler, config }),
    }
}

/// Wait for the order's terminal state; if the wait times out, cancel and
/// take the venue's authoritative post-cancel state. Accumulates the
/// order's final fills into the context exactly once.
async fn settle_order(
    venue: &dyn VenueClient,
    reconciler: &dyn OrderReconciler,
    ctx: &OrderContext,
    order_id: OrderId,
    qty: Decimal,
    wait: Duration,
    maker: bool,
) -> Result<ExecutionResult, ExecError> {
    let mut result = reconciler.wait_for_terminal(venue, order_id, wait).await?;

    if result.error == Some(ExecError::Timeout) {
        // Still live: cancel, then believe only what the venue reports.
        // The order may have filled further (or fully) in the window.
        let _ = venue.cancel_order(order_id).await;
        let info = venue.get_order_info(order_id).await.map_err(ExecError::from)?;
        result = if info.filled_qty >= qty {
            ExecutionResult::filled(info.filled_qty, info.avg_price, maker)
        } else {
            ExecutionResult::failed(ExecError::Timeout, info.filled_qty, info.avg_price)
        };
    } else if result.success {
        result.maker = maker;
    }

    ctx.accumulate(result.filled_qty, result.avg_price).await;
    Ok(result)
}

fn below_minimum(ctx: &OrderContext, qty: Decimal) -> bool {
    qty < ctx.spec.meta().min_order_size
}

/// Immediate market order; tracks partial fills and falls back to a
/// crossing limit order if the venue rejects for exceeding allowed
/// slippage.
pub struct MarketStrategy {
    reconciler: Arc<dyn OrderReconciler>,
}

#[async_trait]
impl ExecutionStrategy for MarketStrategy {
    async fn execute(&self, ctx: &OrderContext, qty: Decimal) -> ExecutionResult {
        let spec = &ctx.spec;
        let venue = spec.venue.as_ref();
        if below_minimum(ctx, qty) {
            info!(
                venue = venue.name(),
                symbol = %spec.symbol,
                %qty,
                "Quantity below venue minimum; skipping order"
            );
            return ExecutionResult::skipped();
        }

        let placed = venue
            .place_market_order(&spec.symbol, spec.side, qty, spec.reduce_only)
            .await;

        let order_id = match placed {
            Ok(id) => id,
            Err(VenueError::SlippageRejected) => {
                warn!(
                    venue = venue.name(),
                    symbol = %spec.symbol,
                    "Market order rejected for slippage; falling back to a crossing limit"
                );
                return self.limit_fallback(ctx, qty).await;
            }
            Err(err) => return ExecutionResult::failed(err.into(), Decimal::ZERO, Decimal::ZERO),
        };
        ctx.record_order(order_id).await;

        match settle_order(
            venue,
            self.reconciler.as_ref(),
            ctx,
            order_id,
            qty,
            spec.attempt_timeout,
            false,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => ExecutionResult::failed(err, Decimal::ZERO, Decimal::ZERO),
        }
    }
}

impl MarketStrategy {
    /// Limit order at the current touch: crosses like a taker but carries
    /// an explicit worst price the venue will accept.
    async fn limit_fallback(&self, ctx: &OrderContext, qty: Decimal) -> ExecutionResult {
        let spec = &ctx.spec;
        let venue = spec.venue.as_ref();
        let provider = PriceProvider::new(spec.venue.clone());

        let price = match provider.taker_reference(&spec.symbol, spec.side).await {
            Ok(p) => p,
            Err(err) => return ExecutionResult::failed(err.into(), Decimal::ZERO, Decimal::ZERO),
        };

        let order_id = match venue
            .place_limit_order(&spec.symbol, spec.side, qty, price, spec.reduce_only)
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecutionResult::failed(err.into(), Decimal::ZERO, Decimal::ZERO),
        };
        ctx.record_order(order_id).await;

        match settle_order(
            venue,
            self.reconciler.as_ref(),
            ctx,
            order_id,
            qty,
            spec.attempt_timeout,
            false,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => ExecutionResult::failed(err, Decimal::ZERO, Decimal::ZERO),
        }
    }
}

/// Single limit order at a caller-supplied price or offset; one wait for
/// a terminal state, no retries.
pub struct SimpleLimitStrategy {
    price: LimitPrice,
    reconciler: Arc<dyn OrderReconciler>,
}

#[async_trait]
impl ExecutionStrategy for SimpleLimitStrategy {
    async fn execute(&self, ctx: &OrderContext, qty: Decimal) -> ExecutionResult {
        let spec = &ctx.spec;
        let venue = spec.venue.as_ref();
        if below_minimum(ctx, qty) {
            info!(
                venue = venue.name(),
                symbol = %spec.symbol,
                %qty,
                "Quantity below venue minimum; skipping order"
            );
            return ExecutionResult::skipped();
        }

        let tick = spec.meta().price_tick;
        let price = match self.price {
            LimitPrice::Absolute(p) => round_to_tick(p, tick),
            LimitPrice::OffsetTicks(ticks) => {
                let provider = PriceProvider::new(spec.venue.clone());
                let bbo = match provider.best_bid_offer(&spec.symbol).await {
                    Ok(b) => b,
                    Err(err) => {
                        return ExecutionResult::failed(err.into(), Decimal::ZERO, Decimal::ZERO)
                    }
                };
                let offset = tick * Decimal::from(ticks);
                match spec.side {
                    crate::venue::OrderSide::Buy => bbo.bid_price + offset,
                    crate::venue::OrderSide::Sell => bbo.ask_price - offset,
                }
            }
        };

        let order_id = match venue
            .place_limit_order(&spec.symbol, spec.side, qty, price, spec.reduce_only)
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecutionResult::failed(err.into(), Decimal::ZERO, Decimal::ZERO),
        };
        ctx.record_order(order_id).await;

        match settle_order(
            venue,
            self.reconciler.as_ref(),
            ctx,
            order_id,
            qty,
            spec.attempt_timeout,
            true,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => ExecutionResult::failed(err, Decimal::ZERO, Decimal::ZERO),
        }
    }
}

/// The default for hedging and wide-spread exits.
///
/// Prices one tick inside the spread, waits a short interval, and on
/// rejection or timeout re-prices from a freshly fetched BBO, up to a
/// bounded retry count and the leg's total time budget. Exhausted retries
/// fall back to a market order for whatever quantity remains.
pub struct AggressiveLimitStrategy {
    reconciler: Arc<dyn OrderReconciler>,
    config: StrategyConfig,
}

#[async_trait]
impl ExecutionStrategy for AggressiveLimitStrategy {
    async fn execute(&self, ctx: &OrderContext, qty: Decimal) -> ExecutionResult {
        let spec = &ctx.spec;
        let venue = spec.venue.as_ref();
        let meta = spec.meta();
        if qty < meta.min_order_size {
            info!(
                venue = venue.name(),
                symbol = %spec.symbol,
                %qty,
                "Quantity below venue minimum; skipping order"
            );
            return ExecutionResult::skipped();
        }

        let provider = PriceProvider::new(spec.venue.clone());
        let deadline = Instant::now() + spec.leg_timeout;
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        // Call-local accumulation; remaining is always qty minus quantity
        // done in this call.
        let mut done = Decimal::ZERO;
        let mut vwap = Decimal::ZERO;
        let mut last_err: Option<ExecError> = None;

        for attempt in 1..=self.config.max_retries {
            if ctx.cancel_requested() {
                debug!(venue = venue.name(), symbol = %spec.symbol, "Cancellation requested; stopping retries");
                break;
            }
            let remaining = round_down_to_lot(qty - done, meta.qty_step);
            if remaining < meta.min_order_size {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                last_err = Some(ExecError::Timeout);
                break;
            }

            let price = match provider.passive_price(&spec.symbol, spec.side).await {
                Ok(p) => p,
                Err(err) => {
                    return ExecutionResult::failed(err.into(), done, vwap);
                }
            };

            let placed = venue
                .place_limit_order(&spec.symbol, spec.side, remaining, price, spec.reduce_only)
                .await;
            let order_id = match placed {
                Ok(id) => id,
                Err(VenueError::PostOnlyRejected) => {
                    warn!(
                        venue = venue.name(),
                        symbol = %spec.symbol,
                        attempt,
                        %price,
                        "Passive order would cross; re-pricing from fresh BBO"
                    );
                    last_err = Some(ExecError::PostOnlyViolation);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) => {
                    return ExecutionResult::failed(err.into(), done, vwap);
                }
            };
            ctx.record_order(order_id).await;

            let wait = spec.attempt_timeout.min(deadline - now);
            let result = match settle_order(
                venue,
                self.reconciler.as_ref(),
                ctx,
                order_id,
                remaining,
                wait,
                true,
            )
            .await
            {
                Ok(r) => r,
                Err(err) => return ExecutionResult::failed(err, done, vwap),
            };

            let (total, avg) = accumulate_vwap(done, vwap, result.filled_qty, result.avg_price);
            done = total;
            vwap = avg;

            if done >= qty {
                return ExecutionResult::filled(done, vwap, true);
            }
            match result.error {
                Some(ExecError::OrderRejected(reason)) => {
                    return ExecutionResult::failed(ExecError::OrderRejected(reason), done, vwap);
                }
                other => last_err = other.or(Some(ExecError::Timeout)),
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(backoff).await;
            }
        }

        let remaining = round_down_to_lot(qty - done, meta.qty_step);
        if remaining < meta.min_order_size {
            if remaining > Decimal::ZERO {
                info!(
                    venue = venue.name(),
                    symbol = %spec.symbol,
                    %remaining,
                    min = %meta.min_order_size,
                    "Residual below venue minimum; leaving it open"
                );
            }
            return ExecutionResult::filled(done, vwap, true);
        }

        if ctx.cancel_requested() {
            return ExecutionResult {
                success: false,
                filled_qty: done,
                avg_price: vwap,
                maker: true,
                error: last_err,
                retryable: false,
            };
        }

        if !self.config.market_fallback {
            return ExecutionResult::failed(last_err.unwrap_or(ExecError::Timeout), done, vwap);
        }

        info!(
            venue = venue.name(),
            symbol = %spec.symbol,
            %remaining,
            "Limit retries exhausted; falling back to market for the remainder"
        );
        let order_id = match venue
            .place_market_order(&spec.symbol, spec.side, remaining, spec.reduce_only)
            .await
        {
            Ok(id) => id,
            Err(err) => return ExecutionResult::failed(err.into(), done, vwap),
        };
        ctx.record_order(order_id).await;

        let result = match settle_order(
            venue,
            self.reconciler.as_ref(),
            ctx,
            order_id,
            remaining,
            spec.attempt_timeout,
            false,
        )
        .await
        {
            Ok(r) => r,
            Err(err) => return ExecutionResult::failed(err, done, vwap),
        };

        let (total, avg) = accumulate_vwap(done, vwap, result.filled_qty, result.avg_price);
        if result.success {
            ExecutionResult::filled(total, avg, false)
        } else {
            ExecutionResult::failed(result.error.unwrap_or(ExecError::Timeout), total, avg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::reconcile::PollingReconciler;
    use crate::execution::types::{OrderSpec, TargetSize};
    use crate::venue::{FillScript, MockVenueClient, OrderId, OrderSide, SymbolMeta};
    use rust_decimal_macros::dec;

    fn fast_config() -> StrategyConfig {
        StrategyConfig {
            max_retries: 3,
            retry_backoff_ms: 1,
            poll_interval_ms: 5,
            market_fallback: true,
        }
    }

    fn reconciler() -> Arc<dyn OrderReconciler> {
        Arc::new(PollingReconciler::new(Duration::from_millis(5)))
    }

    async fn venue_with_book() -> Arc<MockVenueClient> {
        let v = Arc::new(MockVenueClient::new("mock"));
        v.set_book("BTC", dec!(100), dec!(10), dec!(101), dec!(10)).await;
        v
    }

    fn ctx_for(venue: Arc<MockVenueClient>, side: OrderSide, qty: Decimal) -> OrderContext {
        let spec = OrderSpec::new(venue, "BTC", side, TargetSize::Quantity(qty)).with_timeouts(
            Duration::from_millis(40),
            Duration::from_millis(400),
        );
        OrderContext::new(spec)
    }

    #[tokio::test]
    async fn test_market_fills_and_accumulates() {
        let v = venue_with_book().await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::Market, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        assert!(!result.maker);
        assert_eq!(result.filled_qty, dec!(1));
        assert_eq!(ctx.filled_qty().await, dec!(1));
    }

    #[tokio::test]
    async fn test_market_slippage_falls_back_to_limit() {
        let v = venue_with_book().await;
        v.push_script(FillScript::SlippageReject).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::Market, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        assert_eq!(result.filled_qty, dec!(1));
        // Fallback was a limit at the touch (ask for a buy).
        let info = v.get_order_info(OrderId(1)).await.unwrap();
        assert_eq!(info.price, Some(dec!(101)));
    }

    #[tokio::test]
    async fn test_sub_minimum_quantity_places_no_order() {
        let v = venue_with_book().await;
        v.set_meta(
            "BTC",
            SymbolMeta {
                min_order_size: dec!(0.01),
                ..SymbolMeta::default()
            },
        );
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(0.003));

        for mode in [ExecutionMode::Market, ExecutionMode::AggressiveLimit] {
            let strategy = for_mode(mode, reconciler(), fast_config());
            let result = strategy.execute(&ctx, dec!(0.003)).await;
            assert!(result.success);
            assert_eq!(result.filled_qty, Decimal::ZERO);
        }
        assert_eq!(v.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_simple_limit_no_retries_on_timeout() {
        let v = venue_with_book().await;
        v.push_script(FillScript::Open).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(
            ExecutionMode::SimpleLimit(LimitPrice::Absolute(dec!(99.5))),
            reconciler(),
            fast_config(),
        );

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ExecError::Timeout));
        // Exactly one order: simple limit never re-prices.
        assert_eq!(v.order_count().await, 1);
        // The resting order was canceled on timeout.
        assert_eq!(v.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_aggressive_reprices_after_post_only_rejection() {
        let v = venue_with_book().await;
        v.push_script(FillScript::PostOnlyReject).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        assert!(result.maker);
        assert_eq!(result.filled_qty, dec!(1));
        assert_eq!(ctx.filled_qty().await, dec!(1));
    }

    #[tokio::test]
    async fn test_aggressive_retry_sized_from_remaining_quantity() {
        let v = venue_with_book().await;
        // First order partially fills 0.6 and times out; retry must ask
        // for exactly the remaining 0.4.
        v.push_script(FillScript::Partial {
            qty: dec!(0.6),
            on_cancel: Decimal::ZERO,
        })
        .await;
        v.push_script(FillScript::Fill).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        assert_eq!(result.filled_qty, dec!(1));
        let second = v.get_order_info(OrderId(2)).await.unwrap();
        assert_eq!(second.orig_qty, dec!(0.4));
        assert_eq!(ctx.filled_qty().await, dec!(1));
    }

    #[tokio::test]
    async fn test_aggressive_exhaustion_falls_back_to_market() {
        let v = venue_with_book().await;
        for _ in 0..3 {
            v.push_script(FillScript::Open).await;
        }
        // Fourth placement is the market fallback.
        let ctx = ctx_for(v.clone(), OrderSide::Sell, dec!(1));
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        assert!(!result.maker);
        assert_eq!(result.filled_qty, dec!(1));
        assert_eq!(v.order_count().await, 4);
        // Market order carries no limit price.
        let last = v.get_order_info(OrderId(4)).await.unwrap();
        assert_eq!(last.price, None);
    }

    #[tokio::test]
    async fn test_aggressive_prices_inside_wide_spread() {
        let v = Arc::new(MockVenueClient::new("mock"));
        // 3% spread; the passive order must improve the bid by one tick.
        v.set_book("BTC", dec!(100), dec!(10), dec!(103), dec!(10)).await;
        v.push_script(FillScript::Fill).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(result.success);
        let info = v.get_order_info(OrderId(1)).await.unwrap();
        assert_eq!(info.price, Some(dec!(100.01)));
    }

    #[tokio::test]
    async fn test_aggressive_stops_on_cancel_request() {
        let v = venue_with_book().await;
        v.push_script(FillScript::Partial {
            qty: dec!(0.5),
            on_cancel: Decimal::ZERO,
        })
        .await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        ctx.request_cancel();
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        // No order at all: the flag is checked before the first attempt.
        assert!(!result.success);
        assert_eq!(v.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_aggressive_hard_rejection_not_retried() {
        let v = venue_with_book().await;
        v.push_script(FillScript::Reject("bad contract".into())).await;
        let ctx = ctx_for(v.clone(), OrderSide::Buy, dec!(1));
        let strategy = for_mode(ExecutionMode::AggressiveLimit, reconciler(), fast_config());

        let result = strategy.execute(&ctx, dec!(1)).await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(ExecError::OrderRejected(_))));
        assert_eq!(v.order_count().await, 0);
    }
}
