//! Order reconciliation: the authoritative fill state of an order,
//! independent of local bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::ExecError;
use super::types::ExecutionResult;
use crate::venue::{OrderId, OrderInfo, OrderStatus, VenueClient};

/// Push notification of a fill, consumed by [`EventReconciler`].
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// Stream claims the order reached a terminal state. Claims are
    /// verified with a poll before being believed.
    pub terminal: bool,
}

/// Determines the terminal outcome and actual fills of an order.
#[async_trait]
pub trait OrderReconciler: Send + Sync {
    /// Wait until the order reaches a terminal state or the timeout
    /// elapses. A timeout is not an error: the result carries the fills
    /// accumulated so far and a retryable `Timeout` classification.
    async fn wait_for_terminal(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError>;

    /// Venue-reported filled quantity, for out-of-band reconciliation.
    /// This is the only sizing input hedge and rollback trust.
    async fn query_actual_filled(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
    ) -> Result<Decimal, ExecError>;
}

fn result_from_info(info: &OrderInfo) -> ExecutionResult {
    match info.status {
        OrderStatus::Filled => ExecutionResult::filled(info.filled_qty, info.avg_price, false),
        OrderStatus::Rejected => ExecutionResult::failed(
            ExecError::OrderRejected(format!("order {} rejected", info.order_id)),
            info.filled_qty,
            info.avg_price,
        ),
        // Canceled/expired with whatever filled before the cancel took
        // effect. No error class: the caller decided to cancel.
        OrderStatus::Canceled | OrderStatus::Expired => ExecutionResult {
            success: false,
            filled_qty: info.filled_qty,
            avg_price: info.avg_price,
            maker: false,
            error: None,
            retryable: false,
        },
        OrderStatus::New | OrderStatus::PartiallyFilled => ExecutionResult::failed(
            ExecError::Timeout,
            info.filled_qty,
            info.avg_price,
        ),
    }
}

/// Reconciler that periodically polls order status from the venue.
pub struct PollingReconciler {
    poll_interval: Duration,
}

impl PollingReconciler {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for PollingReconciler {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl OrderReconciler for PollingReconciler {
    async fn wait_for_terminal(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let deadline = Instant::now() + timeout;
        loop {
            let info = venue.get_order_info(order_id).await.map_err(ExecError::from)?;
            if info.status.is_terminal() {
                return Ok(result_from_info(&info));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    venue = venue.name(),
                    %order_id,
                    filled = %info.filled_qty,
                    "Wait timed out before terminal state"
                );
                return Ok(result_from_info(&info));
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn query_actual_filled(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
    ) -> Result<Decimal, ExecError> {
        let info = venue.get_order_info(order_id).await.map_err(ExecError::from)?;
        Ok(info.filled_qty)
    }
}

/// Reconciler that consumes a push stream of fill events.
///
/// Streams race venue-side state changes, so a terminal claim from the
/// stream is always verified with an authoritative poll before being
/// reported. The stream is shared by every concurrently waiting leg:
/// whichever wait holds the receiver pumps it for at most [`PUMP_SLICE`]
/// at a time and routes events for other orders to their queues, so one
/// leg's long wait never starves or discards another leg's events.
pub struct EventReconciler {
    events: Mutex<mpsc::UnboundedReceiver<FillEvent>>,
    pending: Mutex<HashMap<OrderId, Vec<FillEvent>>>,
}

/// Longest a single wait may hold the shared event stream.
const PUMP_SLICE: Duration = Duration::from_millis(25);

impl EventReconciler {
    pub fn new(events: mpsc::UnboundedReceiver<FillEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Take the events another wait routed to this order. True if any of
    /// them claimed a terminal state.
    async fn take_terminal_claim(&self, order_id: OrderId) -> bool {
        match self.pending.lock().await.remove(&order_id) {
            Some(events) => events.iter().any(|e| e.terminal),
            None => false,
        }
    }

    /// Pump the shared stream for at most `slice`, routing events for
    /// other orders to their queues. True when a terminal claim for
    /// `order_id` was seen, or the stream closed (which degrades the
    /// wait to plain polling at the pump cadence).
    async fn pump(&self, order_id: OrderId, slice: Duration) -> bool {
        let mut events = match self.events.try_lock() {
            Ok(guard) => guard,
            // Another wait is pumping; it routes our events to us.
            Err(_) => {
                tokio::time::sleep(slice).await;
                return false;
            }
        };
        let deadline = Instant::now() + slice;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match tokio::time::timeout(deadline - now, events.recv()).await {
                Ok(Some(event)) => {
                    if event.order_id == order_id {
                        if event.terminal {
                            return true;
                        }
                    } else {
                        self.pending
                            .lock()
                            .await
                            .entry(event.order_id)
                            .or_default()
                            .push(event);
                    }
                }
                Ok(None) => {
                    drop(events);
                    tokio::time::sleep(deadline.saturating_duration_since(Instant::now())).await;
                    return true;
                }
                Err(_) => return false,
            }
        }
    }
}

#[async_trait]
impl OrderReconciler for EventReconciler {
    async fn wait_for_terminal(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut terminal_claimed = self.take_terminal_claim(order_id).await;
            if !terminal_claimed {
                let now = Instant::now();
                if now < deadline {
                    terminal_claimed = self.pump(order_id, PUMP_SLICE.min(deadline - now)).await;
                }
            }

            // Authoritative poll; the stream only tells us when to look.
            let info = venue.get_order_info(order_id).await.map_err(ExecError::from)?;
            if info.status.is_terminal() {
                return Ok(result_from_info(&info));
            }
            if terminal_claimed {
                warn!(
                    venue = venue.name(),
                    %order_id,
                    status = ?info.status,
                    "Stream claimed terminal state but venue disagrees; continuing to wait"
                );
            }
            if Instant::now() >= deadline {
                return Ok(result_from_info(&info));
            }
        }
    }

    async fn query_actual_filled(
        &self,
        venue: &dyn VenueClient,
        order_id: OrderId,
    ) -> Result<Decimal, ExecError> {
        let info = venue.get_order_info(order_id).await.map_err(ExecError::from)?;
        Ok(info.filled_qty)
    }
}
