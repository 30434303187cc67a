//! Per-room virtual currency account.
//!
//! Each room owns exactly one account. `holdings` is the total balance, `locked_margin`
//! the sum of entry amounts committed by the room's open positions, and `available`
//! (holdings minus locked) what new trades may draw on. Every mutation goes through
//! [`AccountState::apply`], which either produces a new state satisfying
//! `holdings >= 0`, `locked >= 0` and `available >= 0`, or rejects the whole change.

use crate::position::Position;
use crate::types::{Price, Quote, RoomId, Symbol, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub holdings: Quote,
    pub locked_margin: Quote,
    /// Bumped on every applied adjustment.
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A signed change to both account columns, applied as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountAdjustment {
    pub holdings_delta: Quote,
    pub locked_delta: Quote,
}

impl AccountAdjustment {
    /// Move margin from available to locked.
    pub fn reserve(amount: Quote) -> Self {
        Self {
            holdings_delta: Quote::zero(),
            locked_delta: amount,
        }
    }

    /// Unlock margin and book realized pnl against holdings.
    pub fn release(margin: Quote, realized_pnl: Quote) -> Self {
        Self {
            holdings_delta: realized_pnl,
            locked_delta: margin.negate(),
        }
    }

    /// Plain holdings change: deposits, withdrawals, funding.
    pub fn holdings(delta: Quote) -> Self {
        Self {
            holdings_delta: delta,
            locked_delta: Quote::zero(),
        }
    }
}

impl AccountState {
    pub fn new(room_id: RoomId, owner_id: UserId, holdings: Quote, timestamp: Timestamp) -> Self {
        Self {
            room_id,
            owner_id,
            holdings,
            locked_margin: Quote::zero(),
            version: 0,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn available(&self) -> Quote {
        self.holdings.sub(self.locked_margin)
    }

    /// Validate and apply an adjustment. `self` is untouched on rejection.
    pub fn apply(&self, adjustment: AccountAdjustment, timestamp: Timestamp) -> Result<AccountState, AccountError> {
        let holdings = self
            .holdings
            .checked_add(adjustment.holdings_delta)
            .ok_or(AccountError::Overflow("holdings"))?;
        let locked = self
            .locked_margin
            .checked_add(adjustment.locked_delta)
            .ok_or(AccountError::Overflow("locked margin"))?;

        if holdings.is_negative() {
            return Err(AccountError::NegativeHoldings {
                holdings: self.holdings,
                delta: adjustment.holdings_delta,
            });
        }
        if locked.is_negative() {
            return Err(AccountError::InsufficientLocked {
                requested: adjustment.locked_delta.negate(),
                locked: self.locked_margin,
            });
        }
        if holdings.sub(locked).is_negative() {
            // report in terms of what the caller tried to take out of available
            let requested = adjustment.locked_delta.sub(adjustment.holdings_delta);
            return Err(AccountError::InsufficientBalance {
                requested,
                available: self.available(),
            });
        }

        Ok(AccountState {
            holdings,
            locked_margin: locked,
            version: self.version + 1,
            updated_at: timestamp,
            ..self.clone()
        })
    }
}

/// Read model returned by balance queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub room_id: RoomId,
    pub holdings: Quote,
    pub locked_margin: Quote,
    pub available: Quote,
    pub unrealized_pnl: Quote,
    pub valuation: Quote,
    pub open_positions: usize,
    pub version: u64,
}

// valuation = available + locked + unrealized. symbols without a price contribute zero pnl.
pub fn calculate_balance_view(
    account: &AccountState,
    open_positions: &[Position],
    prices: &HashMap<Symbol, Price>,
) -> Result<BalanceView, AccountError> {
    let mut unrealized_pnl = Quote::zero();
    for position in open_positions.iter().filter(|p| p.is_open()) {
        let Some(price) = prices.get(&position.symbol) else {
            continue;
        };
        unrealized_pnl = position
            .unrealized_pnl(price.value())
            .and_then(|pnl| unrealized_pnl.checked_add(pnl))
            .ok_or(AccountError::Overflow("unrealized pnl"))?;
    }

    let available = account.available();
    let valuation = account
        .holdings
        .checked_add(unrealized_pnl)
        .ok_or(AccountError::Overflow("valuation"))?;
    Ok(BalanceView {
        room_id: account.room_id.clone(),
        holdings: account.holdings,
        locked_margin: account.locked_margin,
        available,
        unrealized_pnl,
        valuation,
        open_positions: open_positions.iter().filter(|p| p.is_open()).count(),
        version: account.version,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Adjustment {delta} would drive holdings {holdings} negative")]
    NegativeHoldings { holdings: Quote, delta: Quote },

    #[error("Cannot release {requested}: only {locked} locked")]
    InsufficientLocked { requested: Quote, locked: Quote },

    #[error("Adjustment overflows {0}")]
    Overflow(&'static str),
}
