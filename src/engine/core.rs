// 8.0 engine/core.rs: the room ledger. store, propagator, room locks, funding rate cache.
// every mutation takes the room lock, writes through the store, then publishes while still
// holding the lock so event order matches commit order within a room.

use super::locks::RoomLocks;
use super::results::LedgerError;
use crate::config::LedgerConfig;
use crate::events::{EventPayload, RoomEvent};
use crate::funding::FundingRateCache;
use crate::propagator::ChangePropagator;
use crate::store::LedgerStore;
use crate::types::{Price, Quote, RoomId, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

/** 8.1: ledger service. cheap to share behind an Arc; all interior state is synchronized */
pub struct RoomLedger<S: LedgerStore> {
    pub(super) store: Arc<S>,
    pub(super) propagator: Arc<ChangePropagator>,
    pub(super) config: LedgerConfig,
    pub(super) locks: RoomLocks,
    pub(super) rate_cache: Mutex<FundingRateCache>,
}

impl<S: LedgerStore> RoomLedger<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        let propagator = Arc::new(ChangePropagator::new(config.propagation.channel_capacity));
        Self::with_propagator(store, propagator, config)
    }

    pub fn with_propagator(store: Arc<S>, propagator: Arc<ChangePropagator>, config: LedgerConfig) -> Self {
        let rate_cache = Mutex::new(FundingRateCache::new(config.funding.rate_ttl_ms));
        Self {
            store,
            propagator,
            config,
            locks: RoomLocks::new(),
            rate_cache,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn propagator(&self) -> &Arc<ChangePropagator> {
        &self.propagator
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn subscribe(&self, room_id: &RoomId) -> broadcast::Receiver<RoomEvent> {
        self.propagator.subscribe(room_id)
    }

    // callers must hold the room lock
    pub(super) fn publish(&self, room_id: &RoomId, payload: EventPayload) -> RoomEvent {
        self.propagator.publish(room_id, payload)
    }
}

// 8.2: boundary validation. raw request values become typed values or a Validation error.

pub(super) fn parse_symbol(raw: &str) -> Result<Symbol, LedgerError> {
    Symbol::new(raw).ok_or_else(|| LedgerError::Validation(format!("invalid symbol {raw:?}")))
}

pub(super) fn parse_price(raw: Decimal, what: &str) -> Result<Price, LedgerError> {
    Price::new(raw).ok_or_else(|| LedgerError::Validation(format!("{what} must be positive, got {raw}")))
}

pub(super) fn parse_positive_amount(raw: Decimal, what: &str) -> Result<Quote, LedgerError> {
    if raw <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!("{what} must be positive, got {raw}")));
    }
    Ok(Quote::new(raw))
}

pub(super) fn parse_fraction(raw: Decimal) -> Result<Decimal, LedgerError> {
    if raw <= Decimal::ZERO || raw > Decimal::ONE {
        return Err(LedgerError::Validation(format!("close fraction must be in (0, 1], got {raw}")));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn boundary_parsers() {
        assert!(parse_symbol("btcusdt").is_ok());
        assert!(matches!(parse_symbol(""), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_price(dec!(0), "entry price"), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_positive_amount(dec!(-5), "entry amount"), Err(LedgerError::Validation(_))));
        assert_eq!(parse_fraction(dec!(1)).unwrap(), dec!(1));
        assert!(parse_fraction(dec!(1.01)).is_err());
        assert!(parse_fraction(dec!(0)).is_err());
    }
}
