// 11.0: every ledger or account mutation produces a room-scoped event.
// the EventPayload enum is the closed list; wire names are kebab-case ("position-opened").

use crate::account::AccountState;
use crate::pnl::PnlSnapshot;
use crate::position::{Position, TradeHistory};
use crate::types::{PositionId, RoomId, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub room_id: RoomId,
    /// Per-room, strictly increasing. Assigned by the propagator.
    pub seq: u64,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    PositionOpened(PositionOpenedEvent),
    PositionUpdated(PositionUpdatedEvent),
    PositionClosed(PositionClosedEvent),
    BalanceChanged(BalanceChangedEvent),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::PositionOpened(_) => "position-opened",
            EventPayload::PositionUpdated(_) => "position-updated",
            EventPayload::PositionClosed(_) => "position-closed",
            EventPayload::BalanceChanged(_) => "balance-changed",
        }
    }

    pub fn position_id(&self) -> Option<PositionId> {
        match self {
            EventPayload::PositionOpened(e) => Some(e.position.id),
            EventPayload::PositionUpdated(e) => Some(e.position.id),
            EventPayload::PositionClosed(e) => Some(e.position.id),
            EventPayload::BalanceChanged(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdatedEvent {
    pub position: Position,
    pub reason: UpdateReason,
    /// Present when the update came from a price tick.
    pub pnl: Option<PnlSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    PriceTick,
    FundingCharged,
    PartialClose,
    ProtectiveOrders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position: Position,
    pub trade: TradeHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChangedEvent {
    pub account: AccountState,
    pub memo: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quote, UserId};
    use rust_decimal_macros::dec;

    #[test]
    fn wire_names_are_kebab_case() {
        let account = AccountState::new(
            RoomId::new("room-1").unwrap(),
            UserId::new("owner").unwrap(),
            Quote::new(dec!(100)),
            Timestamp::from_millis(0),
        );
        let payload = EventPayload::BalanceChanged(BalanceChangedEvent {
            account,
            memo: "deposit".to_string(),
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "balance-changed");
        assert_eq!(payload.kind(), "balance-changed");
        assert!(payload.position_id().is_none());

        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
