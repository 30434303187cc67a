//! Room account operations, balance queries, snapshots and the invariant audit.

use super::core::RoomLedger;
use super::results::{InvariantReport, LedgerError};
use crate::account::{calculate_balance_view, AccountAdjustment, AccountState, BalanceView};
use crate::context::{Actor, SecurityContext};
use crate::events::{BalanceChangedEvent, EventPayload, RoomEvent};
use crate::feed::MarketPriceFeed;
use crate::store::{LedgerStore, StoreError};
use crate::sync::{EventSource, RoomSnapshot, SnapshotSource};
use crate::types::{Price, Quote, RoomId, Symbol, Timestamp};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::{info, warn};

impl<S: LedgerStore> RoomLedger<S> {
    /// Provision the room's single account. Owner only.
    pub async fn create_account(
        &self,
        ctx: &SecurityContext,
        initial_holdings: Decimal,
    ) -> Result<AccountState, LedgerError> {
        if !ctx.is_owner {
            return Err(LedgerError::Unauthorized(format!(
                "{} does not own room {}",
                ctx.user_id, ctx.room_id
            )));
        }
        if initial_holdings < Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "initial holdings cannot be negative, got {initial_holdings}"
            )));
        }

        let room_id = ctx.room_id.clone();
        let _guard = self.locks.lock(&room_id).await;
        let account = AccountState::new(
            room_id.clone(),
            ctx.user_id.clone(),
            Quote::new(initial_holdings),
            Timestamp::now(),
        );
        match self.store.insert_account(account.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(LedgerError::Validation(format!("room {room_id} already has an account")));
            }
            Err(e) => return Err(e.into()),
        }

        self.publish(
            &room_id,
            EventPayload::BalanceChanged(BalanceChangedEvent {
                account: account.clone(),
                memo: "account created".to_string(),
            }),
        );
        info!(room = %room_id, owner = %ctx.user_id, holdings = %account.holdings, "account created");
        Ok(account)
    }

    /// Owner deposit (positive) or withdrawal (negative). Rejected outright if it would
    /// leave available or holdings negative.
    pub async fn adjust_balance(
        &self,
        ctx: &SecurityContext,
        room_id: &RoomId,
        delta: Decimal,
        memo: &str,
    ) -> Result<AccountState, LedgerError> {
        if delta.is_zero() {
            return Err(LedgerError::Validation("balance adjustment of zero".to_string()));
        }
        let actor = Actor::Caller(ctx.clone());
        if !actor.may_mutate(room_id) {
            return Err(LedgerError::Unauthorized(format!(
                "{} may not adjust the balance of room {}",
                ctx.user_id, room_id
            )));
        }

        let _guard = self.locks.lock(room_id).await;
        self.adjust_locked(&actor, room_id, AccountAdjustment::holdings(Quote::new(delta)), memo)
            .await
    }

    // caller holds the room lock
    pub(super) async fn adjust_locked(
        &self,
        actor: &Actor,
        room_id: &RoomId,
        adjustment: AccountAdjustment,
        memo: &str,
    ) -> Result<AccountState, LedgerError> {
        if !actor.may_mutate(room_id) {
            return Err(LedgerError::Unauthorized(format!("account of room {room_id}")));
        }

        let account = match self
            .store
            .adjust_account(room_id, adjustment, Timestamp::now())
            .await
        {
            Ok(account) => account,
            Err(e) => {
                let err = LedgerError::from(e);
                warn!(room = %room_id, memo, error = %err, "balance adjustment rejected");
                return Err(err);
            }
        };

        self.publish(
            room_id,
            EventPayload::BalanceChanged(BalanceChangedEvent {
                account: account.clone(),
                memo: memo.to_string(),
            }),
        );
        info!(
            room = %room_id,
            holdings_delta = %adjustment.holdings_delta,
            holdings = %account.holdings,
            available = %account.available(),
            memo,
            "balance adjusted"
        );
        Ok(account)
    }

    pub async fn account(&self, room_id: &RoomId) -> Result<AccountState, LedgerError> {
        self.store
            .account(room_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("account for room {room_id}")))
    }

    /// Balance view at the given prices. Symbols without a price count as flat.
    pub async fn balance(
        &self,
        room_id: &RoomId,
        prices: &HashMap<Symbol, Price>,
    ) -> Result<BalanceView, LedgerError> {
        let account = self.account(room_id).await?;
        let positions = self.store.open_positions(room_id).await?;
        calculate_balance_view(&account, &positions, prices).map_err(LedgerError::from)
    }

    /// Same as `balance` but pulls prices from a market feed. A feed failure for one
    /// symbol only zeroes that symbol's unrealized pnl.
    pub async fn balance_with_feed(
        &self,
        room_id: &RoomId,
        feed: &dyn MarketPriceFeed,
    ) -> Result<BalanceView, LedgerError> {
        let account = self.account(room_id).await?;
        let positions = self.store.open_positions(room_id).await?;

        let symbols: BTreeSet<&Symbol> = positions.iter().map(|p| &p.symbol).collect();
        let mut prices = HashMap::new();
        for symbol in symbols {
            match feed.price(symbol).await {
                Ok(Some(price)) => {
                    prices.insert(symbol.clone(), price);
                }
                Ok(None) => {}
                Err(e) => warn!(room = %room_id, symbol = %symbol, error = %e, "no price for balance view"),
            }
        }

        calculate_balance_view(&account, &positions, &prices).map_err(LedgerError::from)
    }

    /// Recompute locked margin from the open positions and compare with the account.
    pub async fn verify_room(&self, room_id: &RoomId) -> Result<InvariantReport, LedgerError> {
        let _guard = self.locks.lock(room_id).await;
        let account = self.account(room_id).await?;
        let positions = self.store.open_positions(room_id).await?;

        let report = InvariantReport {
            room_id: room_id.clone(),
            holdings: account.holdings,
            locked_margin: account.locked_margin,
            available: account.available(),
            open_margin: positions.iter().map(|p| p.entry_amount).sum(),
            open_positions: positions.len(),
        };
        if !report.is_consistent() {
            warn!(
                room = %room_id,
                locked = %report.locked_margin,
                open_margin = %report.open_margin,
                available = %report.available,
                "room invariants violated"
            );
        }
        Ok(report)
    }

    /// Authoritative view of a room. Taken under the room lock so `seq` matches the state.
    pub async fn snapshot(&self, room_id: &RoomId) -> Result<RoomSnapshot, LedgerError> {
        let _guard = self.locks.lock(room_id).await;
        let account = self.account(room_id).await?;
        let positions = self.store.open_positions(room_id).await?;
        Ok(RoomSnapshot {
            room_id: room_id.clone(),
            positions,
            account,
            seq: self.propagator.current_seq(room_id),
            taken_at: Timestamp::now(),
        })
    }
}

#[async_trait]
impl<S: LedgerStore> SnapshotSource for RoomLedger<S> {
    async fn fetch_snapshot(&self, room_id: &RoomId) -> Result<RoomSnapshot, LedgerError> {
        self.snapshot(room_id).await
    }
}

impl<S: LedgerStore> EventSource for RoomLedger<S> {
    fn subscribe_room(&self, room_id: &RoomId) -> Result<broadcast::Receiver<RoomEvent>, LedgerError> {
        Ok(self.subscribe(room_id))
    }
}
