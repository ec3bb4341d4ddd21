//! Configuration for the atomic execution engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Preflight gating parameters
    #[serde(default)]
    pub preflight: PreflightConfig,
    /// Execution strategy parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Rollback parameters
    #[serde(default)]
    pub rollback: RollbackConfig,
    /// Group-level timeout in milliseconds
    #[serde(default = "default_group_timeout_ms")]
    pub group_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Maximum fraction of visible touch depth a leg's notional may take
    /// (0.0-1.0)
    #[serde(default = "default_max_depth_fraction")]
    pub max_depth_fraction: Decimal,
    /// Fraction of a leg's notional that must be available as balance
    /// (1.0 = fully collateralized)
    #[serde(default = "default_margin_fraction")]
    pub margin_fraction: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Maximum re-priced limit attempts before the market fallback
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff between retry attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Reconciler poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fall back to a market order for the remaining quantity after limit
    /// retries are exhausted
    #[serde(default = "default_market_fallback")]
    pub market_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Settling interval between cancels and the authoritative re-query,
    /// in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Attempts for each closing market order before declaring the
    /// rollback failed
    #[serde(default = "default_max_close_attempts")]
    pub max_close_attempts: u32,
}

// Default value functions
fn default_max_depth_fraction() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_margin_fraction() -> Decimal {
    Decimal::ONE // fully collateralized
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_market_fallback() -> bool {
    true
}

fn default_settle_ms() -> u64 {
    500
}

fn default_max_close_attempts() -> u32 {
    3
}

fn default_group_timeout_ms() -> u64 {
    30_000
}

impl ExecutorConfig {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("multileg").required(false))
            .add_source(config::Environment::default().separator("__").prefix("MLX"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.preflight.max_depth_fraction > Decimal::ZERO
                && self.preflight.max_depth_fraction <= Decimal::ONE,
            "max_depth_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.preflight.margin_fraction > Decimal::ZERO,
            "margin_fraction must be positive"
        );

        anyhow::ensure!(self.strategy.max_retries >= 1, "max_retries must be >= 1");

        anyhow::ensure!(
            self.rollback.max_close_attempts >= 1,
            "max_close_attempts must be >= 1"
        );

        anyhow::ensure!(self.group_timeout_ms > 0, "group_timeout_ms must be positive");

        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            preflight: PreflightConfig::default(),
            strategy: StrategyConfig::default(),
            rollback: RollbackConfig::default(),
            group_timeout_ms: default_group_timeout_ms(),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            max_depth_fraction: default_max_depth_fraction(),
            margin_fraction: default_margin_fraction(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            market_fallback: default_market_fallback(),
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            max_close_attempts: default_max_close_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_depth_fraction_rejected() {
        let mut config = ExecutorConfig::default();
        config.preflight.max_depth_fraction = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = ExecutorConfig::default();
        config.strategy.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
