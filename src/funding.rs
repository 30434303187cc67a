// 5.0: funding. at each funding instant longs pay the raw rate on notional, shorts receive it.
// 5.0 has the records, 5.1+ the fee math, 5.4 the rate cache.

use crate::position::Position;
use crate::types::{PositionId, Quote, RoomId, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Latest observed rate for a symbol. Signed fraction per funding period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: Symbol,
    pub rate: Decimal,
    pub observed_at: Timestamp,
}

/// Idempotency key for a funding charge: the interval the rate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FundingInterval {
    pub start: Timestamp,
    pub length_ms: i64,
}

impl FundingInterval {
    pub fn containing(timestamp: Timestamp, length_ms: i64) -> Self {
        Self {
            start: timestamp.truncate_to(length_ms),
            length_ms,
        }
    }
}

// append-only audit row, one per charged position per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub id: Uuid,
    pub position_id: PositionId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub symbol: Symbol,
    pub side: Side,
    pub rate: Decimal,
    pub position_size: Quote,
    /// positive = paid by the holder, negative = received
    pub amount: Quote,
    pub interval_start: Timestamp,
    pub created_at: Timestamp,
}

impl FundingPayment {
    pub fn for_position(
        position: &Position,
        rate: &FundingRate,
        fee: Quote,
        interval: FundingInterval,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id: position.id,
            user_id: position.user_id.clone(),
            room_id: position.room_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            rate: rate.rate,
            position_size: position.position_size,
            amount: fee,
            interval_start: interval.start,
            created_at: timestamp,
        }
    }
}

// 5.1: long pays the raw rate, short pays the negated rate
pub fn adjusted_rate(side: Side, rate: Decimal) -> Decimal {
    side.sign() * rate
}

// 5.2: fee = notional * adjusted rate. positive fee is a debit. None if it does not fit
pub fn funding_fee(side: Side, position_size: Quote, rate: Decimal) -> Option<Quote> {
    position_size.checked_mul(adjusted_rate(side, rate))
}

// 5.3: balance effect of a fee. debit for positive, credit for negative.
pub fn balance_delta(fee: Quote) -> Quote {
    fee.negate()
}

#[derive(Debug, Clone)]
struct CachedRate {
    rate: FundingRate,
    cached_at: Timestamp,
}

// 5.4: explicit latest-rate cache. owned by whoever runs distributions, never global.
#[derive(Debug, Clone)]
pub struct FundingRateCache {
    ttl_ms: i64,
    entries: HashMap<Symbol, CachedRate>,
}

impl FundingRateCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, rate: FundingRate, now: Timestamp) {
        // keep the newer observation if two refreshes race
        if let Some(existing) = self.entries.get(&rate.symbol) {
            if existing.rate.observed_at > rate.observed_at {
                return;
            }
        }
        self.entries.insert(
            rate.symbol.clone(),
            CachedRate {
                rate,
                cached_at: now,
            },
        );
    }

    pub fn fresh(&self, symbol: &Symbol, now: Timestamp) -> Option<&FundingRate> {
        self.entries
            .get(symbol)
            .filter(|entry| now.as_millis() - entry.cached_at.as_millis() <= self.ttl_ms)
            .map(|entry| &entry.rate)
    }

    pub fn is_stale(&self, symbol: &Symbol, now: Timestamp) -> bool {
        self.fresh(symbol, now).is_none()
    }

    pub fn stale_symbols<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a Symbol>,
        now: Timestamp,
    ) -> Vec<Symbol> {
        symbols
            .into_iter()
            .filter(|s| self.is_stale(s, now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    #[test]
    fn long_pays_positive_rate() {
        let fee = funding_fee(Side::Long, Quote::new(dec!(10000)), dec!(0.0001)).unwrap();
        assert_eq!(fee.value(), dec!(1));
        assert_eq!(balance_delta(fee).value(), dec!(-1));
    }

    #[test]
    fn short_receives_positive_rate() {
        let fee = funding_fee(Side::Short, Quote::new(dec!(10000)), dec!(0.0001)).unwrap();
        assert_eq!(fee.value(), dec!(-1));
        assert_eq!(balance_delta(fee).value(), dec!(1));
    }

    #[test]
    fn negative_rate_flips_direction() {
        let fee = funding_fee(Side::Long, Quote::new(dec!(10000)), dec!(-0.0002)).unwrap();
        assert_eq!(fee.value(), dec!(-2));
    }

    #[test]
    fn absurd_rate_does_not_fit() {
        assert!(funding_fee(Side::Long, Quote::new(Decimal::MAX), dec!(2)).is_none());
    }

    #[test]
    fn interval_key() {
        let eight_h = 8 * 3_600_000;
        let a = FundingInterval::containing(Timestamp::from_millis(eight_h + 5), eight_h);
        let b = FundingInterval::containing(Timestamp::from_millis(2 * eight_h - 1), eight_h);
        assert_eq!(a, b);
        let c = FundingInterval::containing(Timestamp::from_millis(2 * eight_h), eight_h);
        assert_ne!(a, c);
    }

    #[test]
    fn cache_ttl() {
        let mut cache = FundingRateCache::new(1_000);
        let rate = FundingRate {
            symbol: btc(),
            rate: dec!(0.0001),
            observed_at: Timestamp::from_millis(0),
        };
        cache.insert(rate, Timestamp::from_millis(0));

        assert!(cache.fresh(&btc(), Timestamp::from_millis(1_000)).is_some());
        assert!(cache.fresh(&btc(), Timestamp::from_millis(1_001)).is_none());
        assert_eq!(cache.stale_symbols([&btc()], Timestamp::from_millis(2_000)), vec![btc()]);
    }

    #[test]
    fn cache_keeps_newer_observation() {
        let mut cache = FundingRateCache::new(10_000);
        cache.insert(
            FundingRate { symbol: btc(), rate: dec!(0.0003), observed_at: Timestamp::from_millis(500) },
            Timestamp::from_millis(500),
        );
        cache.insert(
            FundingRate { symbol: btc(), rate: dec!(0.0001), observed_at: Timestamp::from_millis(100) },
            Timestamp::from_millis(600),
        );
        let fresh = cache.fresh(&btc(), Timestamp::from_millis(700)).unwrap();
        assert_eq!(fresh.rate, dec!(0.0003));
    }
}
