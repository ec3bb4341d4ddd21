//! Rollback manager: unwinds partial fills when a group cannot complete.
//!
//! Cancel first, let fills settle, then re-query the venue for what
//! actually filled and market-close exactly that amount. Sizing from the
//! venue's numbers (never the local ledger) is what makes rollback safe
//! against fills that landed while cancels were in flight, and the
//! per-leg closed-quantity ledger makes a second invocation a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::error::ExecError;
use super::reconcile::OrderReconciler;
use super::types::{OrderContext, RollbackRecord, RollbackReport};
use crate::config::RollbackConfig;
use crate::notify::{EventSink, ExecutionEvent};
use crate::utils::decimal::{accumulate_vwap, round_down_to_lot};
use crate::venue::OrderSide;

pub struct RollbackManager {
    reconciler: Arc<dyn OrderReconciler>,
    config: RollbackConfig,
    sink: Arc<dyn EventSink>,
}

impl RollbackManager {
    pub fn new(
        reconciler: Arc<dyn OrderReconciler>,
        config: RollbackConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            reconciler,
            config,
            sink,
        }
    }

    /// Unwind every leg of a failed group. Returns the close records plus
    /// the first failure, if any leg could not be fully closed.
    pub async fn rollback(
        &self,
        legs: &[Arc<OrderContext>],
        reason: &str,
    ) -> (RollbackReport, Option<ExecError>) {
        self.sink.publish(ExecutionEvent::RollbackTriggered {
            reason: reason.to_string(),
        });

        for leg in legs {
            leg.request_cancel();
        }
        join_all(legs.iter().map(|leg| leg.cancel_open_orders())).await;

        // Fills can land while cancels are in flight; give the venues a
        // moment before taking their numbers as final.
        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;

        let mut report = RollbackReport::default();
        let mut first_error: Option<ExecError> = None;

        for leg in legs {
            match self.close_leg(leg).await {
                Ok(Some(record)) => {
                    report.total_cost += record.slippage_cost;
                    report.records.push(record);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        venue = leg.spec.venue.name(),
                        symbol = %leg.spec.symbol,
                        error = %err,
                        "Rollback failed to close leg"
                    );
                    if first_error.is_none() {
                        first_error = Some(ExecError::RollbackFailed(format!(
                            "{} {}: {}",
                            leg.spec.venue.name(),
                            leg.spec.symbol,
                            err,
                        )));
                    }
                }
            }
        }

        (report, first_error)
    }

    /// Close one leg's unwound exposure. `Ok(None)` means there was
    /// nothing above the venue minimum left to close.
    async fn close_leg(&self, leg: &OrderContext) -> Result<Option<RollbackRecord>, ExecError> {
        let venue = leg.spec.venue.as_ref();
        let meta = leg.spec.meta();

        // A leg task racing the cancel flag can slip one more order out
        // after the group-wide cancel pass. Cancel again before
        // measuring so nothing stays live behind the close.
        leg.cancel_open_orders().await;

        // Venue truth, not the local ledger.
        let mut actual = Decimal::ZERO;
        for id in leg.order_ids().await {
            actual += self.reconciler.query_actual_filled(venue, id).await?;
        }
        let local = leg.filled_qty().await;
        if actual != local {
            warn!(
                venue = venue.name(),
                symbol = %leg.spec.symbol,
                %local,
                %actual,
                "Local fill ledger disagrees with venue; closing the venue amount"
            );
        }

        let unclosed = round_down_to_lot(actual - leg.closed_qty().await, meta.qty_step);
        if unclosed < meta.min_order_size {
            if unclosed > Decimal::ZERO {
                info!(
                    venue = venue.name(),
                    symbol = %leg.spec.symbol,
                    %unclosed,
                    "Residual below venue minimum; nothing to close"
                );
            }
            return Ok(None);
        }

        let close_side = leg.spec.side.opposite();
        let (closed, close_price) = self.market_close(leg, close_side, unclosed).await?;
        leg.add_closed(closed).await;

        let intended = leg.reference_price();
        let slippage_cost = match leg.spec.side {
            OrderSide::Buy => (intended - close_price) * closed,
            OrderSide::Sell => (close_price - intended) * closed,
        };

        self.sink.publish(ExecutionEvent::RollbackLegClosed {
            venue: venue.name().to_string(),
            symbol: leg.spec.symbol.clone(),
            closed_qty: closed,
            slippage_cost,
        });

        Ok(Some(RollbackRecord {
            venue: venue.name().to_string(),
            symbol: leg.spec.symbol.clone(),
            close_side,
            closed_qty: closed,
            close_price,
            intended_price: intended,
            slippage_cost,
            at: Utc::now(),
        }))
    }

    /// Market-close `qty` with bounded retries. Returns the closed
    /// quantity and its VWAP.
    async fn market_close(
        &self,
        leg: &OrderContext,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<(Decimal, Decimal), ExecError> {
        let venue = leg.spec.venue.as_ref();
        let meta = leg.spec.meta();
        let mut closed = Decimal::ZERO;
        let mut vwap = Decimal::ZERO;
        let mut last_err: Option<ExecError> = None;

        for attempt in 1..=self.config.max_close_attempts {
            let remaining = round_down_to_lot(qty - closed, meta.qty_step);
            if remaining < meta.min_order_size {
                break;
            }

            let order_id = match venue
                .place_market_order(&leg.spec.symbol, side, remaining, true)
                .await
            {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        venue = venue.name(),
                        symbol = %leg.spec.symbol,
                        attempt,
                        error = %err,
                        "Rollback close order rejected"
                    );
                    last_err = Some(err.into());
                    continue;
                }
            };

            let result = self
                .reconciler
                .wait_for_terminal(venue, order_id, leg.spec.attempt_timeout)
                .await?;
            let (total, avg) = accumulate_vwap(closed, vwap, result.filled_qty, result.avg_price);
            closed = total;
            vwap = avg;
            if !result.success {
                last_err = result.error;
            }
        }

        let remaining = round_down_to_lot(qty - closed, meta.qty_step);
        if remaining >= meta.min_order_size {
            return Err(last_err.unwrap_or(ExecError::Timeout));
        }
        Ok((closed, vwap))
    }
}
