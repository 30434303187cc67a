// 9.0 feed.rs: external market data. the ledger never owns a price or rate source,
// it only consumes these traits. the Static* types are in-memory stand-ins (mocked).

use crate::funding::FundingRate;
use crate::types::{Price, Symbol, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("Feed unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MarketPriceFeed: Send + Sync {
    /// `None` when the feed has no price for the symbol.
    async fn price(&self, symbol: &Symbol) -> Result<Option<Price>, FeedError>;
}

#[async_trait]
pub trait FundingRateFeed: Send + Sync {
    async fn latest_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, FeedError>;
}

// settable price table
#[derive(Debug, Default)]
pub struct StaticPriceFeed {
    prices: RwLock<HashMap<Symbol, Price>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: Symbol, price: Price) {
        self.prices.write().insert(symbol, price);
    }
}

#[async_trait]
impl MarketPriceFeed for StaticPriceFeed {
    async fn price(&self, symbol: &Symbol) -> Result<Option<Price>, FeedError> {
        Ok(self.prices.read().get(symbol).copied())
    }
}

// settable rate table, stamps each set with the given observation time
#[derive(Debug, Default)]
pub struct StaticRateFeed {
    rates: RwLock<HashMap<Symbol, FundingRate>>,
}

impl StaticRateFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: Symbol, rate: Decimal, observed_at: Timestamp) {
        self.rates.write().insert(
            symbol.clone(),
            FundingRate {
                symbol,
                rate,
                observed_at,
            },
        );
    }
}

#[async_trait]
impl FundingRateFeed for StaticRateFeed {
    async fn latest_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, FeedError> {
        Ok(self.rates.read().get(symbol).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn static_feeds_return_what_was_set() {
        let btc = Symbol::new("BTCUSDT").unwrap();
        let prices = StaticPriceFeed::new();
        assert_eq!(prices.price(&btc).await.unwrap(), None);
        prices.set(btc.clone(), Price::new_unchecked(dec!(50000)));
        assert_eq!(prices.price(&btc).await.unwrap().unwrap().value(), dec!(50000));

        let rates = StaticRateFeed::new();
        rates.set(btc.clone(), dec!(0.0001), Timestamp::from_millis(10));
        let rate = rates.latest_rate(&btc).await.unwrap().unwrap();
        assert_eq!(rate.rate, dec!(0.0001));
        assert_eq!(rate.observed_at, Timestamp::from_millis(10));
    }
}
