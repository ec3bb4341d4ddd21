//! Hedge manager: brings lagging legs to the exposure created by the
//! first leg that filled.
//!
//! The hedge target is derived from the trigger leg's filled quantity,
//! converted through each venue's contract size, and set exactly once.
//! Everything after that is quantity arithmetic: remaining to hedge is
//! `max(0, target - filled)` and shrinks as late fills are discovered.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::ExecError;
use super::reconcile::OrderReconciler;
use super::strategy::for_mode;
use super::types::{ExecutionMode, OrderContext, OrderSpec, TargetSize};
use crate::config::StrategyConfig;
use crate::notify::{EventSink, ExecutionEvent};
use crate::utils::decimal::round_down_to_lot;
use crate::venue::VenueClient;

pub struct HedgeManager {
    reconciler: Arc<dyn OrderReconciler>,
    config: StrategyConfig,
    sink: Arc<dyn EventSink>,
}

impl HedgeManager {
    pub fn new(
        reconciler: Arc<dyn OrderReconciler>,
        config: StrategyConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            reconciler,
            config,
            sink,
        }
    }

    /// Hedge target for `leg`, in the leg venue's contract units:
    /// the trigger leg's filled quantity converted to base units and back
    /// through the leg's contract size, rounded down to the leg's lot.
    fn convert_target(trigger: &OrderContext, leg: &OrderContext, trigger_filled: Decimal) -> Decimal {
        let base_units = trigger_filled * trigger.spec.meta().size_multiplier;
        let leg_meta = leg.spec.meta();
        let raw = crate::utils::decimal::safe_div(base_units, leg_meta.size_multiplier);
        round_down_to_lot(raw, leg_meta.qty_step)
    }

    /// Bring one lagging leg to the trigger leg's exposure.
    ///
    /// Cancels the leg's live orders, re-queries the venue for what
    /// actually filled (late fills during cancellation are common), and
    /// places an aggressive-limit order for the remainder. A remainder
    /// below the venue minimum is left open and reported as a skip.
    pub async fn hedge_leg(
        &self,
        trigger: &OrderContext,
        leg: &OrderContext,
    ) -> Result<(), ExecError> {
        let started = Instant::now();
        let trigger_filled = trigger.filled_qty().await;
        let target = Self::convert_target(trigger, leg, trigger_filled);

        if !leg.set_hedge_target(target) {
            info!(
                venue = leg.spec.venue.name(),
                symbol = %leg.spec.symbol,
                existing = %leg.hedge_target().unwrap_or(Decimal::ZERO),
                "Hedge target already set; keeping the original"
            );
        }

        // Stop the leg's own execution path, then let the venue decide
        // what actually filled before sizing the hedge.
        leg.request_cancel();
        leg.cancel_open_orders().await;
        self.reconcile_fills(leg).await?;

        let remaining = leg.remaining_to_hedge().await;
        let meta = leg.spec.meta();
        if remaining < meta.min_order_size {
            self.sink.publish(ExecutionEvent::HedgeSkipped {
                venue: leg.spec.venue.name().to_string(),
                symbol: leg.spec.symbol.clone(),
                residual: remaining,
            });
            return Ok(());
        }

        self.sink.publish(ExecutionEvent::HedgeTriggered {
            venue: leg.spec.venue.name().to_string(),
            symbol: leg.spec.symbol.clone(),
            target_qty: remaining,
        });

        // Fresh context: the leg's own context carries a cancel request
        // that must not stop the hedge order.
        let hedge_spec = OrderSpec::new(
            leg.spec.venue.clone(),
            leg.spec.symbol.clone(),
            leg.spec.side,
            TargetSize::Quantity(remaining),
        )
        .with_mode(ExecutionMode::AggressiveLimit)
        .with_timeouts(leg.spec.attempt_timeout, leg.spec.leg_timeout);
        let hedge_ctx = OrderContext::new(hedge_spec);

        let strategy = for_mode(
            ExecutionMode::AggressiveLimit,
            self.reconciler.clone(),
            self.config.clone(),
        );
        let result = strategy.execute(&hedge_ctx, remaining).await;

        // Fold the hedge's fills and orders back into the leg so reports
        // and any later rollback see one consistent ledger.
        leg.accumulate(result.filled_qty, result.avg_price).await;
        for id in hedge_ctx.order_ids().await {
            leg.record_order(id).await;
        }

        if result.success {
            info!(
                venue = leg.spec.venue.name(),
                symbol = %leg.spec.symbol,
                hedged = %result.filled_qty,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Hedge complete"
            );
            Ok(())
        } else {
            Err(result
                .error
                .unwrap_or(ExecError::Timeout))
        }
    }

    /// Re-query every order of the leg and trust the venue total over the
    /// local ledger. Late fills discovered here shrink the hedge.
    async fn reconcile_fills(&self, leg: &OrderContext) -> Result<(), ExecError> {
        let venue = leg.spec.venue.as_ref();
        let mut actual = Decimal::ZERO;
        for id in leg.order_ids().await {
            actual += self.reconciler.query_actual_filled(venue, id).await?;
        }

        let local = leg.filled_qty().await;
        if actual > local {
            warn!(
                venue = venue.name(),
                symbol = %leg.spec.symbol,
                %local,
                %actual,
                "Venue reports more filled than local ledger; adopting venue total"
            );
            let fills = leg.fill_state().await;
            let price = if fills.avg_price > Decimal::ZERO {
                fills.avg_price
            } else {
                leg.reference_price()
            };
            leg.accumulate(actual - local, price).await;
        } else if actual < local {
            // Local over venue should not happen; fills are only recorded
            // from venue responses. Surface it rather than guessing.
            return Err(ExecError::ReconciliationMismatch(format!(
                "{} {}: local {} > venue {}",
                venue.name(),
                leg.spec.symbol,
                local,
                actual,
            )));
        }
        Ok(())
    }
}
