//! Position lifecycle: open, close, partial close, protective orders, price ticks.

use super::core::{parse_fraction, parse_positive_amount, parse_price, parse_symbol, RoomLedger};
use super::results::{CloseOutcome, LedgerError, PriceTickOutcome};
use crate::account::AccountAdjustment;
use crate::context::SecurityContext;
use crate::events::{
    BalanceChangedEvent, EventPayload, PositionClosedEvent, PositionOpenedEvent, PositionUpdatedEvent,
    UpdateReason,
};
use crate::liquidation::{is_liquidated, position_liquidation_price};
use crate::pnl::position_pnl;
use crate::position::{CloseReason, Position, ProtectiveOrders, TradeHistory};
use crate::store::LedgerStore;
use crate::types::{Leverage, PositionId, Price, Quote, RoomId, Side, Symbol, Timestamp};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// Raw trade request as it arrives from the caller. Validated by `open_position`.
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub room_id: RoomId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub entry_amount: Decimal,
    pub leverage: Decimal,
}

// positions trade against the room account, so only its owner may touch them
fn authorize_owner(ctx: &SecurityContext, room_id: &RoomId, what: &str) -> Result<(), LedgerError> {
    if !ctx.can_mutate_account(room_id) {
        return Err(LedgerError::Unauthorized(format!(
            "{} may not {what} in room {room_id}",
            ctx.user_id
        )));
    }
    Ok(())
}

impl<S: LedgerStore> RoomLedger<S> {
    /// Reserve margin and record a new position. Nothing is written if the reserve is rejected.
    pub async fn open_position(
        &self,
        ctx: &SecurityContext,
        request: OpenPositionRequest,
    ) -> Result<Position, LedgerError> {
        // 1. validate at the boundary
        let symbol = parse_symbol(&request.symbol)?;
        let entry_price = parse_price(request.entry_price, "entry price")?;
        let entry_amount = parse_positive_amount(request.entry_amount, "entry amount")?;
        let leverage = Leverage::new(request.leverage)
            .filter(|l| l.value() <= self.config.limits.max_leverage)
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "leverage must be between 1 and {}, got {}",
                    self.config.limits.max_leverage, request.leverage
                ))
            })?;
        if Position::notional(entry_amount, leverage).is_none() {
            return Err(LedgerError::Validation(format!(
                "position size out of range: {entry_amount} at {leverage}"
            )));
        }
        authorize_owner(ctx, &request.room_id, "open positions")?;

        let room_id = request.room_id;
        let _guard = self.locks.lock(&room_id).await;
        let now = Timestamp::now();

        // 2. reserve. rejection leaves the account as it was
        let account = match self
            .store
            .adjust_account(&room_id, AccountAdjustment::reserve(entry_amount), now)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                let err = LedgerError::from(e);
                warn!(room = %room_id, user = %ctx.user_id, amount = %entry_amount, error = %err, "open rejected");
                return Err(err);
            }
        };

        // 3. persist. undo the reserve if the row can't be written
        let position = Position::open(
            room_id.clone(),
            ctx.user_id.clone(),
            symbol,
            request.side,
            entry_price,
            entry_amount,
            leverage,
            now,
        );
        if let Err(e) = self.store.insert_position(position.clone()).await {
            error!(room = %room_id, position = %position.id, error = %e, "position insert failed, releasing margin");
            self.compensate(&room_id, AccountAdjustment::release(entry_amount, Quote::zero()), now)
                .await;
            return Err(e.into());
        }

        self.publish(
            &room_id,
            EventPayload::PositionOpened(PositionOpenedEvent {
                position: position.clone(),
            }),
        );
        self.publish(
            &room_id,
            EventPayload::BalanceChanged(BalanceChangedEvent {
                account,
                memo: format!("margin reserved for {}", position.id),
            }),
        );

        info!(
            room = %room_id,
            position = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            size = %position.position_size,
            leverage = %position.leverage,
            "position opened"
        );
        Ok(position)
    }

    pub async fn close_position(
        &self,
        ctx: &SecurityContext,
        position_id: PositionId,
        exit_price: Decimal,
    ) -> Result<CloseOutcome, LedgerError> {
        self.reduce_position(ctx, position_id, Decimal::ONE, exit_price).await
    }

    /// Close `fraction` of a position pro-rata. 1 is a full close.
    pub async fn reduce_position(
        &self,
        ctx: &SecurityContext,
        position_id: PositionId,
        fraction: Decimal,
        exit_price: Decimal,
    ) -> Result<CloseOutcome, LedgerError> {
        let fraction = parse_fraction(fraction)?;
        let exit_price = parse_price(exit_price, "exit price")?;

        let room_id = self.load_open(position_id).await?.room_id;
        let _guard = self.locks.lock(&room_id).await;
        // reload under the lock, a concurrent close may have won
        let position = self.load_open(position_id).await?;
        authorize_owner(ctx, &position.room_id, &format!("close position {position_id}"))?;

        self.settle_reduction(&position, fraction, exit_price, CloseReason::UserClosed)
            .await
    }

    pub async fn set_protective_orders(
        &self,
        ctx: &SecurityContext,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<Position, LedgerError> {
        let orders = ProtectiveOrders {
            stop_loss: stop_loss.map(|p| parse_price(p, "stop loss")).transpose()?,
            take_profit: take_profit.map(|p| parse_price(p, "take profit")).transpose()?,
        };

        let room_id = self.load_open(position_id).await?.room_id;
        let _guard = self.locks.lock(&room_id).await;
        let position = self.load_open(position_id).await?;
        authorize_owner(ctx, &position.room_id, &format!("modify position {position_id}"))?;

        if !orders.is_valid_for(position.side, position.entry_price) {
            return Err(LedgerError::Validation(format!(
                "stop loss / take profit on the wrong side of entry {} for a {} position",
                position.entry_price, position.side
            )));
        }

        let mut updated = position;
        updated.protective = orders;
        updated.updated_at = Timestamp::now();
        self.store.update_position(updated.clone()).await?;

        self.publish(
            &room_id,
            EventPayload::PositionUpdated(PositionUpdatedEvent {
                position: updated.clone(),
                reason: UpdateReason::ProtectiveOrders,
                pnl: None,
            }),
        );
        debug!(room = %room_id, position = %updated.id, ?orders, "protective orders set");
        Ok(updated)
    }

    /// Price tick for one symbol in one room. Recomputes live pnl for every open position on
    /// the symbol and closes the ones whose stop loss or take profit triggered.
    pub async fn apply_price(
        &self,
        room_id: &RoomId,
        symbol: &Symbol,
        price: Price,
    ) -> Result<PriceTickOutcome, LedgerError> {
        let _guard = self.locks.lock(room_id).await;
        let positions = self.store.open_positions(room_id).await?;
        let mut outcome = PriceTickOutcome::default();

        for position in positions.iter().filter(|p| &p.symbol == symbol) {
            if let Some(reason) = position.protective.triggered(position.side, price) {
                match self
                    .settle_reduction(position, Decimal::ONE, price, reason)
                    .await
                {
                    Ok(closed) => outcome.closed.push(closed),
                    Err(e) => {
                        warn!(room = %room_id, position = %position.id, reason = reason.as_str(), error = %e, "protective close failed");
                    }
                }
                continue;
            }

            let liquidation = position_liquidation_price(position);
            if is_liquidated(position.side, liquidation, price) {
                warn!(
                    room = %room_id,
                    position = %position.id,
                    price = %price,
                    liquidation = %liquidation,
                    "position past liquidation threshold"
                );
                outcome.past_liquidation.push(position.id);
            }

            let pnl = position_pnl(position, Some(price));
            if pnl.is_none() {
                warn!(room = %room_id, position = %position.id, price = %price, "pnl out of range");
            }
            self.publish(
                room_id,
                EventPayload::PositionUpdated(PositionUpdatedEvent {
                    position: position.clone(),
                    reason: UpdateReason::PriceTick,
                    pnl,
                }),
            );
            outcome.updated += 1;
        }

        Ok(outcome)
    }

    pub async fn position(&self, position_id: PositionId) -> Result<Position, LedgerError> {
        self.store
            .position(position_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("position {position_id}")))
    }

    pub async fn open_positions(&self, room_id: &RoomId) -> Result<Vec<Position>, LedgerError> {
        Ok(self.store.open_positions(room_id).await?)
    }

    pub async fn trade_history(&self, room_id: &RoomId) -> Result<Vec<TradeHistory>, LedgerError> {
        Ok(self.store.trades(room_id).await?)
    }

    async fn load_open(&self, position_id: PositionId) -> Result<Position, LedgerError> {
        match self.store.position(position_id).await? {
            Some(position) if position.is_open() => Ok(position),
            Some(_) => Err(LedgerError::NotFound(format!(
                "position {position_id} is already closed"
            ))),
            None => Err(LedgerError::NotFound(format!("position {position_id}"))),
        }
    }

    // 8.3: caller holds the room lock. release first since it is the step that can be
    // rejected, then freeze the record, then append history.
    async fn settle_reduction(
        &self,
        position: &Position,
        fraction: Decimal,
        exit_price: Price,
        reason: CloseReason,
    ) -> Result<CloseOutcome, LedgerError> {
        let now = Timestamp::now();
        let room_id = &position.room_id;
        let reduction = crate::position::reduce_position(position, fraction, exit_price, now)
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "pnl of position {} at {exit_price} is out of range",
                    position.id
                ))
            })?;

        let release = AccountAdjustment::release(reduction.released_margin, reduction.realized_pnl);
        let account = self.store.adjust_account(room_id, release, now).await?;

        if let Err(e) = self.store.update_position(reduction.position.clone()).await {
            error!(room = %room_id, position = %position.id, error = %e, "position update failed, re-locking margin");
            let undo = AccountAdjustment {
                holdings_delta: reduction.realized_pnl.negate(),
                locked_delta: reduction.released_margin,
            };
            self.compensate(room_id, undo, now).await;
            return Err(e.into());
        }

        let trade = TradeHistory::from_reduction(&reduction, exit_price, reason, now);
        let trade_persisted = match self.store.append_trade(trade.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!(room = %room_id, position = %position.id, trade = %trade.id, error = %e, "trade history append failed");
                false
            }
        };

        let payload = if reduction.position.is_closed() {
            EventPayload::PositionClosed(PositionClosedEvent {
                position: reduction.position.clone(),
                trade: trade.clone(),
            })
        } else {
            EventPayload::PositionUpdated(PositionUpdatedEvent {
                position: reduction.position.clone(),
                reason: UpdateReason::PartialClose,
                pnl: position_pnl(&reduction.position, Some(exit_price)),
            })
        };
        self.publish(room_id, payload);
        self.publish(
            room_id,
            EventPayload::BalanceChanged(BalanceChangedEvent {
                account: account.clone(),
                memo: format!("{} {}", reason.as_str(), position.id),
            }),
        );

        info!(
            room = %room_id,
            position = %position.id,
            fraction = %reduction.closed_fraction,
            exit_price = %exit_price,
            realized_pnl = %reduction.realized_pnl,
            reason = reason.as_str(),
            "position reduced"
        );

        Ok(CloseOutcome {
            position: reduction.position,
            trade,
            account,
            trade_persisted,
        })
    }

    // best effort undo of an applied adjustment after a later step failed
    pub(super) async fn compensate(&self, room_id: &RoomId, adjustment: AccountAdjustment, now: Timestamp) {
        if let Err(e) = self.store.adjust_account(room_id, adjustment, now).await {
            error!(room = %room_id, error = %e, ?adjustment, "compensating adjustment failed, room needs audit");
        }
    }
}
