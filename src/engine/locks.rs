// 8.0.1: per-room mutation boundary. one async mutex per room, created on first use.
// rooms never block each other. the registry lock is only held to clone the Arc.

use crate::types::RoomId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct RoomLocks {
    rooms: Mutex<HashMap<RoomId, Arc<AsyncMutex<()>>>>,
}

impl RoomLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Held across store I/O, so this has to be the tokio mutex.
    pub(crate) async fn lock(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        let room_lock = {
            let mut rooms = self.rooms.lock();
            rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        room_lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}
