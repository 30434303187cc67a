// 3.0: profit and loss. pure functions, no I/O.
// pnl = (current - entry) / entry * position_size for longs, mirrored for shorts.
// this is the only normalization used anywhere in the crate.

use crate::position::Position;
use crate::types::{Price, Quote, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub pnl: Quote,
    pub pnl_percentage: Decimal,
    pub current_price: Option<Price>,
}

impl PnlSnapshot {
    pub fn flat() -> Self {
        Self {
            pnl: Quote::zero(),
            pnl_percentage: Decimal::ZERO,
            current_price: None,
        }
    }
}

// 3.1: raw formula. a zero or negative current price means the feed has nothing for us,
// so the answer is zero rather than a division artefact. None when the result does not
// fit in a Decimal (a dust entry price against a large exit, say).
pub fn calculate_pnl(
    side: Side,
    entry_price: Price,
    current_price: Decimal,
    position_size: Quote,
) -> Option<Quote> {
    if current_price <= Decimal::ZERO {
        return Some(Quote::zero());
    }
    let move_fraction = current_price
        .checked_sub(entry_price.value())?
        .checked_div(entry_price.value())?;
    side.sign()
        .checked_mul(move_fraction)?
        .checked_mul(position_size.value())
        .map(Quote::new)
}

// 3.2: pnl relative to committed margin, in percent
pub fn pnl_percentage(pnl: Quote, entry_amount: Quote) -> Option<Decimal> {
    if entry_amount.value() <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }
    pnl.value().checked_div(entry_amount.value())?.checked_mul(dec!(100))
}

// 3.3: live view of a position at an optional price. None only on overflow
pub fn position_pnl(position: &Position, current_price: Option<Price>) -> Option<PnlSnapshot> {
    let Some(price) = current_price else {
        return Some(PnlSnapshot::flat());
    };
    let pnl = calculate_pnl(
        position.side,
        position.entry_price,
        price.value(),
        position.position_size,
    )?;
    Some(PnlSnapshot {
        pnl,
        pnl_percentage: pnl_percentage(pnl, position.entry_amount)?,
        current_price: Some(price),
    })
}

// 3.4: losses at close never eat more than the margin that was locked for them
pub fn cap_realized_loss(pnl: Quote, entry_amount: Quote) -> Quote {
    pnl.max(entry_amount.negate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry() -> Price {
        Price::new_unchecked(dec!(50000))
    }

    #[test]
    fn long_profit_matches_scenario() {
        let pnl = calculate_pnl(Side::Long, entry(), dec!(51000), Quote::new(dec!(10000))).unwrap();
        assert_eq!(pnl.value(), dec!(200));
        assert_eq!(pnl_percentage(pnl, Quote::new(dec!(1000))), Some(dec!(20)));
    }

    #[test]
    fn short_profits_when_price_drops() {
        let pnl = calculate_pnl(Side::Short, entry(), dec!(49000), Quote::new(dec!(10000))).unwrap();
        assert_eq!(pnl.value(), dec!(200));

        let loss = calculate_pnl(Side::Short, entry(), dec!(51000), Quote::new(dec!(10000))).unwrap();
        assert_eq!(loss.value(), dec!(-200));
    }

    #[test]
    fn zero_price_yields_zero() {
        let pnl = calculate_pnl(Side::Long, entry(), Decimal::ZERO, Quote::new(dec!(10000))).unwrap();
        assert!(pnl.is_zero());
    }

    #[test]
    fn percentage_of_zero_margin_is_zero() {
        assert_eq!(pnl_percentage(Quote::new(dec!(5)), Quote::zero()), Some(Decimal::ZERO));
    }

    #[test]
    fn dust_entry_against_large_exit_is_out_of_range() {
        let dust = Price::new_unchecked(dec!(0.00000000000000000001));
        assert_eq!(calculate_pnl(Side::Long, dust, dec!(100000000), Quote::new(dec!(10000))), None);
        assert_eq!(calculate_pnl(Side::Short, dust, dec!(100000000), Quote::new(dec!(10000))), None);
        // the same entry at a nearby price is fine
        assert!(calculate_pnl(Side::Long, dust, dec!(0.00000000000000000002), Quote::new(dec!(10000))).is_some());
        assert_eq!(pnl_percentage(Quote::new(Decimal::MAX), Quote::new(dec!(0.5))), None);
    }

    #[test]
    fn realized_loss_capped_at_margin() {
        let capped = cap_realized_loss(Quote::new(dec!(-1500)), Quote::new(dec!(1000)));
        assert_eq!(capped.value(), dec!(-1000));

        let gain = cap_realized_loss(Quote::new(dec!(300)), Quote::new(dec!(1000)));
        assert_eq!(gain.value(), dec!(300));
    }
}
