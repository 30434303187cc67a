// 12.0: sync and resilience. keeps a caller-side view of one room coherent with the
// ledger across bursts, drops and reconnects.

mod backoff;
mod coalescer;
mod connection;
mod manager;

pub use backoff::Backoff;
pub use coalescer::{Coalescer, WindowPolicy};
pub use connection::{transition, ConnectionEvent, ConnectionSignal, ConnectionState};
pub use manager::{
    EventOutcome, EventSource, RoomSnapshot, SnapshotSource, SyncManager, SyncOutcome, SyncView,
};
