// 4.0: position records. size = entry_amount * leverage, fixed at open.
// 4.1 has the pro-rata reduction logic, 4.2 protective orders, 4.3 trade history.

use crate::pnl::{calculate_pnl, cap_realized_loss};
use crate::types::{Leverage, PositionId, Price, Quote, RoomId, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub entry_amount: Quote,
    pub leverage: Leverage,
    pub position_size: Quote,
    pub cumulative_funding_fee: Quote,
    pub last_funding_time: Option<Timestamp>,
    pub realized_pnl: Quote,
    pub status: PositionStatus,
    pub protective: ProtectiveOrders,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl Position {
    /// `entry_amount * leverage`, or None if it does not fit.
    pub fn notional(entry_amount: Quote, leverage: Leverage) -> Option<Quote> {
        entry_amount.checked_mul(leverage.value())
    }

    /// The notional must fit; check with [`Position::notional`] first for caller input.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        room_id: RoomId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        entry_price: Price,
        entry_amount: Quote,
        leverage: Leverage,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: PositionId::generate(),
            room_id,
            user_id,
            symbol,
            side,
            entry_price,
            entry_amount,
            leverage,
            position_size: entry_amount.mul(leverage.value()),
            cumulative_funding_fee: Quote::zero(),
            last_funding_time: None,
            realized_pnl: Quote::zero(),
            status: PositionStatus::Open,
            protective: ProtectiveOrders::default(),
            created_at: timestamp,
            updated_at: timestamp,
            closed_at: None,
        }
    }

    // open and partially closed positions both hold locked margin
    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::PartiallyClosed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, PositionStatus::Closed)
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Option<Quote> {
        calculate_pnl(self.side, self.entry_price, current_price, self.position_size)
    }

    // funding already charged for an interval starting at or before this instant
    pub fn funded_since(&self, interval_start: Timestamp) -> bool {
        self.last_funding_time
            .is_some_and(|last| last >= interval_start)
    }

    // copy of the record with one more funding charge on it
    pub fn with_funding(&self, fee: Quote, timestamp: Timestamp) -> Option<Position> {
        let mut charged = self.clone();
        charged.cumulative_funding_fee = self.cumulative_funding_fee.checked_add(fee)?;
        charged.last_funding_time = Some(timestamp);
        charged.updated_at = timestamp;
        Some(charged)
    }
}

/// What a reduction did: the remaining record plus the amounts released.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub position: Position,
    pub closed_fraction: Decimal,
    pub closed_size: Quote,
    pub released_margin: Quote,
    pub realized_pnl: Quote,
}

impl Reduction {
    // what goes back to available: released margin plus capped pnl
    pub fn credit(&self) -> Option<Quote> {
        self.released_margin.checked_add(self.realized_pnl)
    }
}

// 4.1: pro-rata close. fraction of size and margin leave together so size/margin stays = leverage.
// fraction >= 1 closes everything and freezes the record. None if the pnl at this exit
// price does not fit in a Decimal.
pub fn reduce_position(
    position: &Position,
    fraction: Decimal,
    exit_price: Price,
    timestamp: Timestamp,
) -> Option<Reduction> {
    debug_assert!(fraction > Decimal::ZERO, "reduce fraction must be positive");
    let full_close = fraction >= Decimal::ONE;

    let (closed_size, released_margin) = if full_close {
        (position.position_size, position.entry_amount)
    } else {
        (
            position.position_size.checked_mul(fraction)?,
            position.entry_amount.checked_mul(fraction)?,
        )
    };

    let raw_pnl = calculate_pnl(position.side, position.entry_price, exit_price.value(), closed_size)?;
    let realized_pnl = cap_realized_loss(raw_pnl, released_margin);

    let mut remaining = position.clone();
    remaining.position_size = position.position_size.sub(closed_size);
    remaining.entry_amount = position.entry_amount.sub(released_margin);
    remaining.realized_pnl = position.realized_pnl.checked_add(realized_pnl)?;
    remaining.updated_at = timestamp;
    if full_close {
        remaining.status = PositionStatus::Closed;
        remaining.closed_at = Some(timestamp);
    } else {
        remaining.status = PositionStatus::PartiallyClosed;
    }

    Some(Reduction {
        position: remaining,
        closed_fraction: fraction.min(Decimal::ONE),
        closed_size,
        released_margin,
        realized_pnl,
    })
}

// 4.2: stop loss below entry for longs, above for shorts. take profit mirrored.
impl ProtectiveOrders {
    pub fn is_valid_for(&self, side: Side, entry_price: Price) -> bool {
        let stop_ok = self.stop_loss.map_or(true, |stop| match side {
            Side::Long => stop < entry_price,
            Side::Short => stop > entry_price,
        });
        let target_ok = self.take_profit.map_or(true, |target| match side {
            Side::Long => target > entry_price,
            Side::Short => target < entry_price,
        });
        stop_ok && target_ok
    }

    // stop loss wins if a gap crosses both
    pub fn triggered(&self, side: Side, price: Price) -> Option<CloseReason> {
        let stop_hit = self.stop_loss.is_some_and(|stop| match side {
            Side::Long => price <= stop,
            Side::Short => price >= stop,
        });
        if stop_hit {
            return Some(CloseReason::StopLoss);
        }
        let target_hit = self.take_profit.is_some_and(|target| match side {
            Side::Long => price >= target,
            Side::Short => price <= target,
        });
        target_hit.then_some(CloseReason::TakeProfit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserClosed,
    StopLoss,
    TakeProfit,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::UserClosed => "user_closed",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
        }
    }
}

// 4.3: append-only record written on every close or partial close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistory {
    pub id: Uuid,
    pub position_id: PositionId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub exit_price: Price,
    pub closed_fraction: Decimal,
    pub closed_size: Quote,
    pub released_margin: Quote,
    pub realized_pnl: Quote,
    pub reason: CloseReason,
    pub opened_at: Timestamp,
    pub closed_at: Timestamp,
}

impl TradeHistory {
    pub fn from_reduction(
        reduction: &Reduction,
        exit_price: Price,
        reason: CloseReason,
        timestamp: Timestamp,
    ) -> Self {
        let position = &reduction.position;
        Self {
            id: Uuid::new_v4(),
            position_id: position.id,
            room_id: position.room_id.clone(),
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            closed_fraction: reduction.closed_fraction,
            closed_size: reduction.closed_size,
            released_margin: reduction.released_margin,
            realized_pnl: reduction.realized_pnl,
            reason,
            opened_at: position.created_at,
            closed_at: timestamp,
        }
    }
}
