//! Preflight checks: fail fast, before any order is sent.
//!
//! Placing orders that are guaranteed to fail wastes fees and creates
//! transient one-sided exposure, so every leg is validated against
//! visible depth and available balance first. Read-only; no partial
//! success.

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::error::ExecError;
use super::types::OrderSpec;
use crate::config::PreflightConfig;
use crate::pricing::PriceProvider;

pub struct PreflightChecker {
    config: PreflightConfig,
}

impl PreflightChecker {
    pub fn new(config: PreflightConfig) -> Self {
        Self { config }
    }

    /// Validate every leg of an atomic group. Returns the first
    /// violation; the group must place no orders if any leg fails.
    pub async fn check(&self, specs: &[OrderSpec]) -> Result<(), ExecError> {
        for spec in specs {
            self.check_leg(spec).await?;
        }
        info!(legs = specs.len(), "Preflight passed");
        Ok(())
    }

    async fn check_leg(&self, spec: &OrderSpec) -> Result<(), ExecError> {
        let provider = PriceProvider::new(spec.venue.clone());
        let bbo = provider
            .best_bid_offer(&spec.symbol)
            .await
            .map_err(ExecError::from)?;

        let reference = bbo.touch(spec.side);
        let qty = spec.resolve_qty(reference);
        let notional = qty * reference;

        // Depth: the leg must plausibly fill against what is visible at
        // the touch.
        let visible_notional = bbo.touch_qty(spec.side) * reference;
        let depth_cap = visible_notional * self.config.max_depth_fraction;
        if notional > depth_cap {
            return Err(ExecError::InsufficientLiquidity(format!(
                "{} {}: notional {} exceeds {} ({} of visible depth {})",
                spec.venue.name(),
                spec.symbol,
                notional,
                depth_cap,
                self.config.max_depth_fraction,
                visible_notional,
            )));
        }

        // Balance: estimated margin requirement must be covered.
        let balance = spec
            .venue
            .get_available_balance()
            .await
            .map_err(ExecError::from)?;
        let required = notional * self.config.margin_fraction;
        if balance < required {
            return Err(ExecError::InsufficientBalance(format!(
                "{} {}: available {} < required margin {}",
                spec.venue.name(),
                spec.symbol,
                balance,
                required,
            )));
        }

        debug!(
            venue = spec.venue.name(),
            symbol = %spec.symbol,
            %qty,
            %notional,
            %balance,
            "Leg preflight ok"
        );
        Ok(())
    }

    /// Exposed for callers that want the margin estimate without the gate.
    pub fn required_margin(&self, notional: Decimal) -> Decimal {
        notional * self.config.margin_fraction
    }
}
