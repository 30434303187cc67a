//! Room-scoped change propagation.
//!
//! One `tokio::sync::broadcast` channel per room, created lazily on first publish or
//! subscribe. Each publish stamps the next per-room sequence number so subscribers can
//! drop duplicates and detect gaps. Rooms are independent; nothing orders events across them.

use crate::events::{EventPayload, RoomEvent};
use crate::types::{RoomId, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

struct RoomChannel {
    sender: broadcast::Sender<RoomEvent>,
    seq: u64,
}

pub struct ChangePropagator {
    capacity: usize,
    rooms: RwLock<HashMap<RoomId, RoomChannel>>,
}

impl ChangePropagator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Stamp and publish. Having no subscribers is not an error; the sequence still advances.
    pub fn publish(&self, room_id: &RoomId, payload: EventPayload) -> RoomEvent {
        let mut rooms = self.rooms.write();
        let channel = rooms
            .entry(room_id.clone())
            .or_insert_with(|| RoomChannel {
                sender: broadcast::channel(self.capacity).0,
                seq: 0,
            });
        channel.seq += 1;

        let event = RoomEvent {
            room_id: room_id.clone(),
            seq: channel.seq,
            timestamp: Timestamp::now(),
            payload,
        };

        match channel.sender.send(event.clone()) {
            Ok(receivers) => debug!(
                room = %room_id,
                seq = event.seq,
                kind = event.payload.kind(),
                receivers,
                "event published"
            ),
            Err(_) => debug!(room = %room_id, seq = event.seq, "event published with no subscribers"),
        }
        event
    }

    pub fn subscribe(&self, room_id: &RoomId) -> broadcast::Receiver<RoomEvent> {
        let mut rooms = self.rooms.write();
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| RoomChannel {
                sender: broadcast::channel(self.capacity).0,
                seq: 0,
            })
            .sender
            .subscribe()
    }

    /// Sequence of the last event published for the room, 0 if none.
    pub fn current_seq(&self, room_id: &RoomId) -> u64 {
        self.rooms.read().get(room_id).map_or(0, |c| c.seq)
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .read()
            .get(room_id)
            .map_or(0, |c| c.sender.receiver_count())
    }
}

impl Default for ChangePropagator {
    fn default() -> Self {
        Self::new(1024)
    }
}
