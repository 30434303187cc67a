//! Liquidation price approximation.
//!
//! A position is treated as liquidated once 90% of its margin is gone. This is a
//! heuristic for display and alerting in simulated rooms, not an exchange
//! maintenance-margin model: there is no tiering, no fees, no funding in the threshold.

use crate::position::Position;
use crate::types::{Leverage, Price, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Share of margin that may be lost before a position counts as liquidated.
pub const LIQUIDATION_MARGIN_FACTOR: Decimal = dec!(0.9);

/// Floor so a 1x long never reports a zero or negative threshold.
const MIN_LIQUIDATION_PRICE: Decimal = dec!(0.00000001);

/// long: entry * (1 - 0.9 / leverage), short: entry * (1 + 0.9 / leverage)
pub fn liquidation_price(entry_price: Price, leverage: Leverage, side: Side) -> Price {
    let buffer = leverage.margin_fraction() * LIQUIDATION_MARGIN_FACTOR;
    let raw = match side {
        Side::Long => entry_price.value() * (Decimal::ONE - buffer),
        // saturate: a threshold past Decimal::MAX is never reached anyway
        Side::Short => entry_price
            .value()
            .checked_mul(Decimal::ONE + buffer)
            .unwrap_or(Decimal::MAX),
    };
    Price::new_unchecked(raw.max(MIN_LIQUIDATION_PRICE))
}

pub fn position_liquidation_price(position: &Position) -> Price {
    liquidation_price(position.entry_price, position.leverage, position.side)
}

/// Signed distance from the current price to the threshold as a fraction of the current
/// price. Positive while the position is safe, zero or negative once it is crossed.
pub fn distance_to_liquidation(side: Side, liquidation: Price, current: Price) -> Decimal {
    let gap = match side {
        Side::Long => current.value() - liquidation.value(),
        Side::Short => liquidation.value() - current.value(),
    };
    gap.checked_div(current.value()).unwrap_or(if gap.is_sign_negative() {
        Decimal::MIN
    } else {
        Decimal::MAX
    })
}

pub fn is_liquidated(side: Side, liquidation: Price, current: Price) -> bool {
    distance_to_liquidation(side, liquidation, current) <= Decimal::ZERO
}
