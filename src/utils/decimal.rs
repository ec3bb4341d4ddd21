//! Decimal arithmetic utilities for order sizing and pricing.

use rust_decimal::Decimal;

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision).
///
/// Order quantities must always round *down*: rounding up can exceed the
/// filled amount being hedged or closed.
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Fold a new fill into an existing (quantity, vwap) accumulation.
pub fn accumulate_vwap(
    prev_qty: Decimal,
    prev_vwap: Decimal,
    fill_qty: Decimal,
    fill_price: Decimal,
) -> (Decimal, Decimal) {
    let total = prev_qty + fill_qty;
    if total == Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let vwap = (prev_qty * prev_vwap + fill_qty * fill_price) / total;
    (total, vwap)
}
