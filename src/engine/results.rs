// 8.0.2: result types and errors for ledger operations.

use crate::account::{AccountError, AccountState};
use crate::position::{Position, TradeHistory};
use crate::store::StoreError;
use crate::types::{PositionId, Quote, RoomId, Symbol};
use std::collections::BTreeMap;

/// What a close or partial close did.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// The record after the reduction. `closed` for a full close.
    pub position: Position,
    pub trade: TradeHistory,
    pub account: AccountState,
    /// false if the trade history append failed after the balance was settled
    pub trade_persisted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PriceTickOutcome {
    pub updated: usize,
    pub closed: Vec<CloseOutcome>,
    /// open positions whose price crossed the approximate liquidation threshold
    pub past_liquidation: Vec<PositionId>,
}

/// Summary of one funding distribution run. Partial success is normal.
#[derive(Debug, Clone, Default)]
pub struct FundingRunReport {
    /// positions charged and settled
    pub processed: usize,
    /// positions whose rate fetch, update or room adjustment failed
    pub failed: usize,
    /// symbols with no rate on record
    pub skipped_symbols: Vec<Symbol>,
    /// positions already charged for the rate's interval
    pub already_applied: usize,
    pub payments_written: usize,
    /// batch payment insert failure. balances and positions are NOT rolled back
    pub payment_error: Option<String>,
    /// net balance change per room (negative = room paid)
    pub room_deltas: BTreeMap<RoomId, Quote>,
}

impl FundingRunReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.payment_error.is_none()
    }
}

/// Result of recomputing a room's account invariants from its positions.
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantReport {
    pub room_id: RoomId,
    pub holdings: Quote,
    pub locked_margin: Quote,
    pub available: Quote,
    /// Σ entry_amount over open and partially closed positions
    pub open_margin: Quote,
    pub open_positions: usize,
}

impl InvariantReport {
    pub fn locked_matches_positions(&self) -> bool {
        self.locked_margin == self.open_margin
    }

    pub fn is_consistent(&self) -> bool {
        self.locked_matches_positions()
            && !self.available.is_negative()
            && self.available == self.holdings.sub(self.locked_margin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient store failure: {0}")]
    TransientStore(String),

    #[error("Stale data rejected: {0}")]
    StaleData(String),
}

impl LedgerError {
    /// Only transient I/O is worth retrying. validation and authorization never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::TransientStore(_))
    }
}

impl From<AccountError> for LedgerError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InsufficientBalance { requested, available } => {
                LedgerError::InsufficientBalance { requested, available }
            }
            AccountError::NegativeHoldings { holdings, delta } => LedgerError::InsufficientBalance {
                requested: delta.negate(),
                available: holdings,
            },
            AccountError::InsufficientLocked { .. } | AccountError::Overflow(_) => {
                LedgerError::Validation(err.to_string())
            }
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => LedgerError::TransientStore(msg),
            StoreError::NotFound(msg) => LedgerError::NotFound(msg),
            StoreError::Conflict(msg) => LedgerError::StaleData(msg),
            StoreError::ConstraintViolation(e) => e.into(),
        }
    }
}
