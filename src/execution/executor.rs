//! Atomic executor: drives a group of legs across venues through
//! preflight, concurrent placement, monitoring, hedging, and rollback.
//!
//! State flow for one group:
//! PRECHECK -> PLACING -> MONITORING -> { HEDGING | ROLLING_BACK } -> DONE
//!
//! The first leg that fully fills becomes the trigger; every other leg
//! is canceled and hedged to the trigger's exposure. If no leg fills, or
//! hedging fails, everything that did fill is rolled back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::ExecError;
use super::hedge::HedgeManager;
use super::preflight::PreflightChecker;
use super::reconcile::{OrderReconciler, PollingReconciler};
use super::rollback::RollbackManager;
use super::strategy::for_mode;
use super::types::{ExecutionResult, GroupResult, LegReport, OrderContext, OrderSpec};
use crate::config::ExecutorConfig;
use crate::notify::{EventSink, ExecutionEvent, TracingSink};
use crate::pricing::PriceProvider;

/// How long to wait for leg tasks to wind down after a group timeout.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Precheck,
    Placing,
    Monitoring,
    Hedging,
    RollingBack,
    Done,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupState::Precheck => "PRECHECK",
            GroupState::Placing => "PLACING",
            GroupState::Monitoring => "MONITORING",
            GroupState::Hedging => "HEDGING",
            GroupState::RollingBack => "ROLLING_BACK",
            GroupState::Done => "DONE",
        };
        f.write_str(s)
    }
}

pub struct AtomicExecutor {
    config: ExecutorConfig,
    reconciler: Arc<dyn OrderReconciler>,
    sink: Arc<dyn EventSink>,
}

impl AtomicExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let poll = Duration::from_millis(config.strategy.poll_interval_ms);
        Self {
            reconciler: Arc::new(PollingReconciler::new(poll)),
            sink: Arc::new(TracingSink),
            config,
        }
    }

    /// Replace the polling reconciler, e.g. with an event-driven one fed
    /// by a venue's fill stream.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn OrderReconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Execute one atomic group. Either every leg ends within one venue
    /// minimum of its target, or everything that filled is closed.
    pub async fn execute(&self, specs: Vec<OrderSpec>) -> GroupResult {
        info!(state = %GroupState::Precheck, legs = specs.len(), "Starting execution group");

        let checker = PreflightChecker::new(self.config.preflight.clone());
        if let Err(err) = checker.check(&specs).await {
            warn!(state = %GroupState::Done, error = %err, "Preflight rejected group");
            return self.finish(GroupResult {
                success: false,
                legs: Vec::new(),
                rollback: None,
                error: Some(err),
            });
        }

        // Resolve each leg to a quantity at the observed touch before any
        // order goes out; notional targets are converted here, once.
        let mut ctxs: Vec<Arc<OrderContext>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let provider = PriceProvider::new(spec.venue.clone());
            let bbo = match provider.best_bid_offer(&spec.symbol).await {
                Ok(b) => b,
                Err(err) => {
                    return self.finish(GroupResult {
                        success: false,
                        legs: Vec::new(),
                        rollback: None,
                        error: Some(err.into()),
                    });
                }
            };
            let reference = bbo.touch(spec.side);
            let qty = spec.resolve_qty(reference);
            let ctx = Arc::new(OrderContext::new(spec));
            ctx.set_reference_price(reference);
            ctx.set_resolved_qty(qty);
            ctxs.push(ctx);
        }

        info!(state = %GroupState::Placing, "Placing legs");
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ExecutionResult)>();
        for (idx, ctx) in ctxs.iter().enumerate() {
            self.sink.publish(ExecutionEvent::LegPlaced {
                venue: ctx.spec.venue.name().to_string(),
                symbol: ctx.spec.symbol.clone(),
                side: ctx.spec.side,
                qty: ctx.target_qty(),
            });
            let strategy = for_mode(
                ctx.spec.mode,
                self.reconciler.clone(),
                self.config.strategy.clone(),
            );
            let ctx = ctx.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let qty = ctx.target_qty();
                let result = strategy.execute(&ctx, qty).await;
                ctx.mark_completed();
                let _ = tx.send((idx, result));
            });
        }
        drop(tx);

        info!(state = %GroupState::Monitoring, "Monitoring legs");
        let deadline = Instant::now() + Duration::from_millis(self.config.group_timeout_ms);
        let mut results: Vec<Option<ExecutionResult>> = vec![None; ctxs.len()];
        let mut trigger: Option<usize> = None;
        let mut failure: Option<ExecError> = None;
        let mut pending = ctxs.len();
        let mut timed_out = false;

        while pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some((idx, result))) => {
                    pending -= 1;
                    if result.success {
                        self.sink.publish(ExecutionEvent::LegFilled {
                            venue: ctxs[idx].spec.venue.name().to_string(),
                            symbol: ctxs[idx].spec.symbol.clone(),
                            filled_qty: result.filled_qty,
                            avg_price: result.avg_price,
                            maker: result.maker,
                        });
                        // The first full fill becomes the trigger: stop
                        // the others so the hedge can size from venue
                        // truth. A zero-fill success (sub-minimum leg
                        // skipped) created no exposure to hedge against
                        // and must not elect a trigger.
                        if trigger.is_none()
                            && failure.is_none()
                            && result.filled_qty > Decimal::ZERO
                        {
                            trigger = Some(idx);
                            self.stop_other_legs(&ctxs, idx).await;
                        }
                    } else if trigger.is_none() && failure.is_none() {
                        // A leg failed before anything filled fully: the
                        // group cannot complete, stop everything. Legs we
                        // canceled report without an error class and do
                        // not re-trigger this path.
                        if let Some(err) = result.error.clone() {
                            failure = Some(err);
                            self.stop_other_legs(&ctxs, idx).await;
                        }
                    }
                    results[idx] = Some(result);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(group_timeout_ms = self.config.group_timeout_ms, "Group timed out; canceling all legs");
            for ctx in &ctxs {
                ctx.request_cancel();
                ctx.cancel_open_orders().await;
            }
            let drain_deadline = Instant::now() + DRAIN_GRACE;
            while pending > 0 {
                let now = Instant::now();
                if now >= drain_deadline {
                    break;
                }
                match tokio::time::timeout(drain_deadline - now, rx.recv()).await {
                    Ok(Some((idx, result))) => {
                        results[idx] = Some(result);
                        pending -= 1;
                    }
                    _ => break,
                }
            }
        }

        if timed_out {
            return self.roll_back(&ctxs, ExecError::Timeout).await;
        }
        if let Some(cause) = failure {
            return self.roll_back(&ctxs, cause).await;
        }

        let trigger_idx = match trigger {
            Some(idx) => idx,
            None => {
                let cause = results
                    .iter()
                    .flatten()
                    .find_map(|r| r.error.clone())
                    .unwrap_or(ExecError::Timeout);
                return self.roll_back(&ctxs, cause).await;
            }
        };

        info!(state = %GroupState::Hedging, trigger = ctxs[trigger_idx].spec.venue.name(), "Hedging lagging legs");
        let hedger = HedgeManager::new(
            self.reconciler.clone(),
            self.config.strategy.clone(),
            self.sink.clone(),
        );
        for (idx, ctx) in ctxs.iter().enumerate() {
            if idx == trigger_idx {
                continue;
            }
            if let Err(err) = hedger.hedge_leg(&ctxs[trigger_idx], ctx).await {
                warn!(
                    venue = ctx.spec.venue.name(),
                    symbol = %ctx.spec.symbol,
                    error = %err,
                    "Hedge failed; rolling back the group"
                );
                return self.roll_back(&ctxs, err).await;
            }
        }

        let legs = self.leg_reports(&ctxs).await;
        let success = self.all_within_minimum(&ctxs, &legs);
        info!(state = %GroupState::Done, success, "Execution group finished");
        self.finish(GroupResult {
            success,
            legs,
            rollback: None,
            error: None,
        })
    }

    /// Cooperatively stop every leg other than `keep`: set the cancel
    /// flag for their retry loops and cancel their live venue orders.
    async fn stop_other_legs(&self, ctxs: &[Arc<OrderContext>], keep: usize) {
        for (idx, ctx) in ctxs.iter().enumerate() {
            if idx != keep && !ctx.is_completed() {
                ctx.request_cancel();
                ctx.cancel_open_orders().await;
            }
        }
    }

    async fn roll_back(&self, ctxs: &[Arc<OrderContext>], cause: ExecError) -> GroupResult {
        info!(state = %GroupState::RollingBack, cause = %cause, "Rolling back group");
        let manager = RollbackManager::new(
            self.reconciler.clone(),
            self.config.rollback.clone(),
            self.sink.clone(),
        );
        let (report, rollback_err) = manager.rollback(ctxs, &cause.to_string()).await;
        let legs = self.leg_reports(ctxs).await;
        self.finish(GroupResult {
            success: false,
            legs,
            rollback: Some(report),
            error: Some(rollback_err.unwrap_or(cause)),
        })
    }

    async fn leg_reports(&self, ctxs: &[Arc<OrderContext>]) -> Vec<LegReport> {
        let mut legs = Vec::with_capacity(ctxs.len());
        for ctx in ctxs {
            let fills = ctx.fill_state().await;
            let target = ctx.hedge_target().unwrap_or_else(|| ctx.target_qty());
            legs.push(LegReport {
                venue: ctx.spec.venue.name().to_string(),
                symbol: ctx.spec.symbol.clone(),
                side: ctx.spec.side,
                target_qty: target,
                filled_qty: fills.filled_qty,
                avg_price: fills.avg_price,
                residual: (target - fills.filled_qty).max(Decimal::ZERO),
            });
        }
        legs
    }

    /// Group success: every leg's unfilled remainder is below its venue's
    /// minimum order size.
    fn all_within_minimum(&self, ctxs: &[Arc<OrderContext>], legs: &[LegReport]) -> bool {
        ctxs.iter()
            .zip(legs)
            .all(|(ctx, leg)| leg.residual < ctx.spec.meta().min_order_size)
    }

    fn finish(&self, result: GroupResult) -> GroupResult {
        self.sink.publish(ExecutionEvent::Completed {
            success: result.success,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::{ExecutionMode, LimitPrice, TargetSize};
    use crate::venue::{FillScript, MockVenueClient, OrderSide};
    use rust_decimal_macros::dec;

    fn fast_config() -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        config.strategy.retry_backoff_ms = 1;
        config.strategy.poll_interval_ms = 5;
        config.rollback.settle_ms = 1;
        config.group_timeout_ms = 2_000;
        config
    }

    async fn venue(name: &str) -> Arc<MockVenueClient> {
        let v = Arc::new(MockVenueClient::new(name));
        v.set_book("BTC", dec!(100), dec!(50), dec!(101), dec!(50)).await;
        v
    }

    fn leg(venue: Arc<MockVenueClient>, side: OrderSide) -> OrderSpec {
        OrderSpec::new(venue, "BTC", side, TargetSize::Quantity(dec!(1))).with_timeouts(
            Duration::from_millis(40),
            Duration::from_millis(400),
        )
    }

    #[tokio::test]
    async fn test_two_leg_group_fills_both_sides() {
        let a = venue("a").await;
        let b = venue("b").await;
        let (sink, mut events) = crate::notify::ChannelSink::new();
        let executor = AtomicExecutor::new(fast_config()).with_sink(Arc::new(sink));

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy),
                leg(b.clone(), OrderSide::Sell),
            ])
            .await;

        assert!(result.success);
        assert!(result.rollback.is_none());
        assert_eq!(result.legs.len(), 2);
        for leg in &result.legs {
            assert_eq!(leg.filled_qty, dec!(1));
            assert_eq!(leg.residual, Decimal::ZERO);
        }
        assert_eq!(a.net_position("BTC").await, dec!(1));
        assert_eq!(b.net_position("BTC").await, dec!(-1));

        let mut placed = 0;
        let mut completed_ok = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ExecutionEvent::LegPlaced { .. } => placed += 1,
                ExecutionEvent::Completed { success } => completed_ok = success,
                _ => {}
            }
        }
        assert_eq!(placed, 2);
        assert!(completed_ok);
    }

    #[tokio::test]
    async fn test_preflight_failure_places_no_orders() {
        let a = venue("a").await;
        let b = venue("b").await;
        // Balance covers less than half the required margin.
        b.set_balance(dec!(40)).await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy),
                leg(b.clone(), OrderSide::Sell),
            ])
            .await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(ExecError::InsufficientBalance(_))));
        assert_eq!(a.order_count().await, 0);
        assert_eq!(b.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_fill_rolls_back_partials_including_late_fills() {
        let a = venue("a").await;
        let b = venue("b").await;
        // Both legs rest and time out; leg a picks up 0.3 more while its
        // cancel is in flight.
        a.push_script(FillScript::Partial {
            qty: dec!(0.5),
            on_cancel: dec!(0.3),
        })
        .await;
        b.push_script(FillScript::Partial {
            qty: dec!(0.2),
            on_cancel: Decimal::ZERO,
        })
        .await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
                leg(b.clone(), OrderSide::Sell)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
            ])
            .await;

        assert!(!result.success);
        let report = result.rollback.expect("rollback report");
        assert_eq!(report.records.len(), 2);
        let closed_a = report
            .records
            .iter()
            .find(|r| r.venue == "a")
            .expect("leg a record");
        assert_eq!(closed_a.closed_qty, dec!(0.8));
        // Both venues are flat afterwards.
        assert_eq!(a.net_position("BTC").await, Decimal::ZERO);
        assert_eq!(b.net_position("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_trigger_fill_hedges_lagging_leg() {
        let a = venue("a").await;
        let b = venue("b").await;
        // Leg b rests with a partial; leg a fills immediately and becomes
        // the trigger.
        b.push_script(FillScript::Partial {
            qty: dec!(0.4),
            on_cancel: Decimal::ZERO,
        })
        .await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy),
                leg(b.clone(), OrderSide::Sell)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
            ])
            .await;

        assert!(result.success);
        assert!(result.rollback.is_none());
        assert_eq!(a.net_position("BTC").await, dec!(1));
        assert_eq!(b.net_position("BTC").await, dec!(-1));
    }

    #[tokio::test]
    async fn test_sub_minimum_residual_counts_as_success() {
        let a = venue("a").await;
        let b = venue("b").await;
        b.push_script(FillScript::Partial {
            qty: dec!(0.997),
            on_cancel: Decimal::ZERO,
        })
        .await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy),
                leg(b.clone(), OrderSide::Sell)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
            ])
            .await;

        // The 0.003 remainder is below the 0.01 minimum: left open, group
        // still succeeds, nothing rolled back.
        assert!(result.success);
        assert!(result.rollback.is_none());
        let lag = result.legs.iter().find(|l| l.venue == "b").unwrap();
        assert_eq!(lag.filled_qty, dec!(0.997));
        assert_eq!(lag.residual, dec!(0.003));
        // Exactly one order on b: the original leg, no hedge top-up.
        assert_eq!(b.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_hedge_failure_rolls_back_everything() {
        let a = venue("a").await;
        let b = venue("b").await;
        // Leg b partially fills then rejects every follow-up, so the
        // hedge cannot complete.
        b.push_script(FillScript::Partial {
            qty: dec!(0.5),
            on_cancel: Decimal::ZERO,
        })
        .await;
        b.push_script(FillScript::Reject("margin check".into())).await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                leg(a.clone(), OrderSide::Buy),
                leg(b.clone(), OrderSide::Sell)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
            ])
            .await;

        assert!(!result.success);
        assert!(result.rollback.is_some());
        // Everything that filled on either venue is closed again.
        assert_eq!(a.net_position("BTC").await, Decimal::ZERO);
        assert_eq!(b.net_position("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_group_timeout_cancels_and_rolls_back() {
        let a = venue("a").await;
        let b = venue("b").await;
        a.push_script(FillScript::Open).await;
        b.push_script(FillScript::Open).await;
        let mut config = fast_config();
        config.group_timeout_ms = 60;
        let executor = AtomicExecutor::new(config);

        let specs = vec![
            leg(a.clone(), OrderSide::Buy)
                .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0)))
                .with_timeouts(Duration::from_secs(10), Duration::from_secs(10)),
            leg(b.clone(), OrderSide::Sell)
                .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0)))
                .with_timeouts(Duration::from_secs(10), Duration::from_secs(10)),
        ];
        let result = executor.execute(specs).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ExecError::Timeout));
        // Nothing filled, so nothing to close, but no order is left live.
        assert_eq!(a.open_order_count().await, 0);
        assert_eq!(b.open_order_count().await, 0);
        assert!(result.rollback.expect("rollback report").records.is_empty());
    }

    #[tokio::test]
    async fn test_zero_fill_leg_cannot_become_trigger() {
        let a = venue("a").await;
        let b = venue("b").await;
        // Leg a's target is below the 0.01 minimum, so it is skipped
        // with zero filled. That must not count as the trigger fill:
        // leg b's 0.5 partial has to be rolled back, not "hedged" to a
        // zero target and reported as success.
        b.push_script(FillScript::Partial {
            qty: dec!(0.5),
            on_cancel: Decimal::ZERO,
        })
        .await;
        let executor = AtomicExecutor::new(fast_config());

        let result = executor
            .execute(vec![
                OrderSpec::new(a.clone(), "BTC", OrderSide::Buy, TargetSize::Quantity(dec!(0.003)))
                    .with_timeouts(Duration::from_millis(40), Duration::from_millis(400)),
                leg(b.clone(), OrderSide::Sell)
                    .with_mode(ExecutionMode::SimpleLimit(LimitPrice::OffsetTicks(0))),
            ])
            .await;

        assert!(!result.success);
        let report = result.rollback.expect("rollback report");
        let closed_b = report
            .records
            .iter()
            .find(|r| r.venue == "b")
            .expect("leg b record");
        assert_eq!(closed_b.closed_qty, dec!(0.5));
        assert_eq!(a.net_position("BTC").await, Decimal::ZERO);
        assert_eq!(b.net_position("BTC").await, Decimal::ZERO);
        assert_eq!(b.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_notional_target_resolved_once_at_reference() {
        let a = venue("a").await;
        let executor = AtomicExecutor::new(fast_config());

        let spec = OrderSpec::new(
            a.clone(),
            "BTC",
            OrderSide::Buy,
            TargetSize::Notional(dec!(505)),
        )
        .with_timeouts(Duration::from_millis(40), Duration::from_millis(400));
        let result = executor.execute(vec![spec]).await;

        assert!(result.success);
        // 505 / 101 (ask at resolution time) = 5 units.
        assert_eq!(result.legs[0].target_qty, dec!(5));
        assert_eq!(result.legs[0].filled_qty, dec!(5));
    }
}
