//! Persistent store contract.
//!
//! The ledger only talks to storage through [`LedgerStore`]. Implementations must make
//! `adjust_account` atomic: read, validate and write the account in one step so that two
//! adjustments on the same room can never both pass validation against the same
//! snapshot. Trade history and funding payments are append-only.
//!
//! [`InMemoryStore`] is the reference implementation used by the simulation and tests.

use crate::account::{AccountAdjustment, AccountError, AccountState};
use crate::funding::{FundingPayment, FundingRate};
use crate::position::{Position, TradeHistory};
use crate::types::{PositionId, RoomId, Symbol, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(#[from] AccountError),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fails with `Conflict` if the room already has an account.
    async fn insert_account(&self, account: AccountState) -> Result<(), StoreError>;

    async fn account(&self, room_id: &RoomId) -> Result<Option<AccountState>, StoreError>;

    /// Atomic conditional update. Rejected adjustments leave the account untouched.
    async fn adjust_account(
        &self,
        room_id: &RoomId,
        adjustment: AccountAdjustment,
        timestamp: Timestamp,
    ) -> Result<AccountState, StoreError>;

    async fn insert_position(&self, position: Position) -> Result<(), StoreError>;

    /// Fails with `Conflict` if the stored record is already closed.
    async fn update_position(&self, position: Position) -> Result<(), StoreError>;

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    async fn open_positions(&self, room_id: &RoomId) -> Result<Vec<Position>, StoreError>;

    async fn all_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    async fn append_trade(&self, trade: TradeHistory) -> Result<(), StoreError>;

    async fn trades(&self, room_id: &RoomId) -> Result<Vec<TradeHistory>, StoreError>;

    /// Keeps only the newest observation per symbol.
    async fn record_funding_rate(&self, rate: FundingRate) -> Result<(), StoreError>;

    async fn latest_funding_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, StoreError>;

    /// Batch append. All or nothing.
    async fn append_funding_payments(&self, payments: Vec<FundingPayment>) -> Result<(), StoreError>;

    async fn funding_payments(&self, position_id: PositionId) -> Result<Vec<FundingPayment>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<RoomId, AccountState>,
    positions: HashMap<PositionId, Position>,
    trades: Vec<TradeHistory>,
    rates: HashMap<Symbol, FundingRate>,
    payments: Vec<FundingPayment>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_age(mut positions: Vec<Position>) -> Vec<Position> {
    positions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    positions
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn insert_account(&self, account: AccountState) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.accounts.contains_key(&account.room_id) {
            return Err(StoreError::Conflict(format!("account for room {}", account.room_id)));
        }
        tables.accounts.insert(account.room_id.clone(), account);
        Ok(())
    }

    async fn account(&self, room_id: &RoomId) -> Result<Option<AccountState>, StoreError> {
        Ok(self.tables.read().accounts.get(room_id).cloned())
    }

    async fn adjust_account(
        &self,
        room_id: &RoomId,
        adjustment: AccountAdjustment,
        timestamp: Timestamp,
    ) -> Result<AccountState, StoreError> {
        let mut tables = self.tables.write();
        let current = tables
            .accounts
            .get(room_id)
            .ok_or_else(|| StoreError::NotFound(format!("account for room {room_id}")))?;
        let next = current.apply(adjustment, timestamp)?;
        tables.accounts.insert(room_id.clone(), next.clone());
        Ok(next)
    }

    async fn insert_position(&self, position: Position) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.positions.contains_key(&position.id) {
            return Err(StoreError::Conflict(format!("position {}", position.id)));
        }
        tables.positions.insert(position.id, position);
        Ok(())
    }

    async fn update_position(&self, position: Position) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let stored = tables
            .positions
            .get(&position.id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", position.id)))?;
        if stored.is_closed() {
            return Err(StoreError::Conflict(format!("position {} is closed", position.id)));
        }
        tables.positions.insert(position.id, position);
        Ok(())
    }

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        Ok(self.tables.read().positions.get(&id).cloned())
    }

    async fn open_positions(&self, room_id: &RoomId) -> Result<Vec<Position>, StoreError> {
        let open = self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| p.is_open() && &p.room_id == room_id)
            .cloned()
            .collect();
        Ok(sorted_by_age(open))
    }

    async fn all_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let open = self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        Ok(sorted_by_age(open))
    }

    async fn append_trade(&self, trade: TradeHistory) -> Result<(), StoreError> {
        self.tables.write().trades.push(trade);
        Ok(())
    }

    async fn trades(&self, room_id: &RoomId) -> Result<Vec<TradeHistory>, StoreError> {
        Ok(self
            .tables
            .read()
            .trades
            .iter()
            .filter(|t| &t.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn record_funding_rate(&self, rate: FundingRate) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let newer = tables
            .rates
            .get(&rate.symbol)
            .map_or(true, |existing| rate.observed_at >= existing.observed_at);
        if newer {
            tables.rates.insert(rate.symbol.clone(), rate);
        }
        Ok(())
    }

    async fn latest_funding_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, StoreError> {
        Ok(self.tables.read().rates.get(symbol).cloned())
    }

    async fn append_funding_payments(&self, payments: Vec<FundingPayment>) -> Result<(), StoreError> {
        self.tables.write().payments.extend(payments);
        Ok(())
    }

    async fn funding_payments(&self, position_id: PositionId) -> Result<Vec<FundingPayment>, StoreError> {
        Ok(self
            .tables
            .read()
            .payments
            .iter()
            .filter(|p| p.position_id == position_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quote, UserId};
    use rust_decimal_macros::dec;

    fn room() -> RoomId {
        RoomId::new("room-1").unwrap()
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert_account(AccountState::new(
                room(),
                UserId::new("owner").unwrap(),
                Quote::new(dec!(500)),
                Timestamp::from_millis(0),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn duplicate_account_conflicts() {
        let store = seeded().await;
        let again = AccountState::new(room(), UserId::new("owner").unwrap(), Quote::zero(), Timestamp::from_millis(0));
        assert!(matches!(store.insert_account(again).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn rejected_adjustment_leaves_account() {
        let store = seeded().await;
        let result = store
            .adjust_account(&room(), AccountAdjustment::reserve(Quote::new(dec!(1000))), Timestamp::from_millis(1))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConstraintViolation(AccountError::InsufficientBalance { .. }))
        ));

        let account = store.account(&room()).await.unwrap().unwrap();
        assert_eq!(account.holdings.value(), dec!(500));
        assert_eq!(account.version, 0);
    }

    #[tokio::test]
    async fn adjust_missing_room() {
        let store = InMemoryStore::new();
        let result = store
            .adjust_account(&room(), AccountAdjustment::holdings(Quote::new(dec!(1))), Timestamp::from_millis(1))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn older_rate_does_not_replace_newer() {
        let store = InMemoryStore::new();
        let btc = Symbol::new("BTCUSDT").unwrap();
        store
            .record_funding_rate(FundingRate { symbol: btc.clone(), rate: dec!(0.0002), observed_at: Timestamp::from_millis(200) })
            .await
            .unwrap();
        store
            .record_funding_rate(FundingRate { symbol: btc.clone(), rate: dec!(0.0001), observed_at: Timestamp::from_millis(100) })
            .await
            .unwrap();

        let latest = store.latest_funding_rate(&btc).await.unwrap().unwrap();
        assert_eq!(latest.rate, dec!(0.0002));
    }
}
