//! Execution event notifications.
//!
//! Sinks are fire-and-forget: publishing never blocks and never fails,
//! so a slow or absent consumer cannot stall the execution path.

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::venue::OrderSide;

/// Lifecycle events of one atomic execution group.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    LegPlaced {
        venue: String,
        symbol: String,
        side: OrderSide,
        qty: Decimal,
    },
    LegFilled {
        venue: String,
        symbol: String,
        filled_qty: Decimal,
        avg_price: Decimal,
        maker: bool,
    },
    HedgeTriggered {
        venue: String,
        symbol: String,
        target_qty: Decimal,
    },
    /// Hedge remainder was below the venue minimum and was left open.
    HedgeSkipped {
        venue: String,
        symbol: String,
        residual: Decimal,
    },
    RollbackTriggered {
        reason: String,
    },
    RollbackLegClosed {
        venue: String,
        symbol: String,
        closed_qty: Decimal,
        slippage_cost: Decimal,
    },
    Completed {
        success: bool,
    },
}

/// Consumer of execution events. Implementations must return quickly.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ExecutionEvent);
}

/// Default sink: structured log lines, nothing else.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ExecutionEvent) {
        match &event {
            ExecutionEvent::LegPlaced {
                venue,
                symbol,
                side,
                qty,
            } => info!(venue, symbol, %side, %qty, "Leg placed"),
            ExecutionEvent::LegFilled {
                venue,
                symbol,
                filled_qty,
                avg_price,
                maker,
            } => info!(venue, symbol, %filled_qty, %avg_price, maker, "Leg filled"),
            ExecutionEvent::HedgeTriggered {
                venue,
                symbol,
                target_qty,
            } => info!(venue, symbol, %target_qty, "Hedge triggered"),
            ExecutionEvent::HedgeSkipped {
                venue,
                symbol,
                residual,
            } => info!(venue, symbol, %residual, "Hedge skipped; residual below venue minimum"),
            ExecutionEvent::RollbackTriggered { reason } => {
                warn!(reason, "Rollback triggered")
            }
            ExecutionEvent::RollbackLegClosed {
                venue,
                symbol,
                closed_qty,
                slippage_cost,
            } => warn!(venue, symbol, %closed_qty, %slippage_cost, "Rollback closed leg"),
            ExecutionEvent::Completed { success } => {
                info!(success, "Execution group completed")
            }
        }
    }
}

/// Sink that forwards events over an unbounded channel. Dropped
/// receivers are tolerated silently.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(ExecutionEvent::LegPlaced {
            venue: "a".into(),
            symbol: "BTC".into(),
            side: OrderSide::Buy,
            qty: dec!(1),
        });
        sink.publish(ExecutionEvent::Completed { success: true });

        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::LegPlaced { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::Completed { success: true })
        ));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.publish(ExecutionEvent::Completed { success: false });
    }
}
