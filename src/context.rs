//! Caller identity as handed over by the session layer.
//!
//! Credentials are verified upstream; the ledger only checks the claims against the
//! room being touched.

use crate::types::{RoomId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub is_owner: bool,
}

impl SecurityContext {
    pub fn new(user_id: UserId, room_id: RoomId, is_owner: bool) -> Self {
        Self {
            user_id,
            room_id,
            is_owner,
        }
    }

    pub fn can_view(&self, room_id: &RoomId) -> bool {
        &self.room_id == room_id
    }

    pub fn can_mutate_account(&self, room_id: &RoomId) -> bool {
        self.is_owner && self.can_view(room_id)
    }
}

/// Who is driving a mutation. `System` is the funding distributor's exemption from the
/// owner check; it still takes the room lock like everyone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Caller(SecurityContext),
    System,
}

impl Actor {
    pub fn may_mutate(&self, room_id: &RoomId) -> bool {
        match self {
            Actor::Caller(ctx) => ctx.can_mutate_account(room_id),
            Actor::System => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(is_owner: bool) -> SecurityContext {
        SecurityContext::new(
            UserId::new("alice").unwrap(),
            RoomId::new("room-1").unwrap(),
            is_owner,
        )
    }

    #[test]
    fn owner_only_in_own_room() {
        let room = RoomId::new("room-1").unwrap();
        let other = RoomId::new("room-2").unwrap();

        assert!(ctx(true).can_mutate_account(&room));
        assert!(!ctx(true).can_mutate_account(&other));
        assert!(!ctx(false).can_mutate_account(&room));
        assert!(ctx(false).can_view(&room));
    }

    #[test]
    fn system_bypasses_owner_check() {
        let other = RoomId::new("room-2").unwrap();
        assert!(Actor::System.may_mutate(&other));
        assert!(!Actor::Caller(ctx(true)).may_mutate(&other));
    }
}
