//! Caller-side reconciliation for one room.
//!
//! The manager keeps a local copy of a room's open positions and account, fed by the
//! room's event stream and corrected by full snapshots. Two guards keep it coherent:
//!
//! - every event carries the room sequence; anything at or below what was already seen is
//!   a duplicate, anything past the next expected number is a gap and forces a resync
//! - every refetch carries a local request number; a snapshot older than the newest applied
//!   request, or older than the applied event sequence, is rejected as stale
//!
//! A snapshot replaces the cache wholesale and drops all optimistic entries.

use super::backoff::Backoff;
use super::coalescer::{Coalescer, WindowPolicy};
use super::connection::{transition, ConnectionEvent, ConnectionSignal, ConnectionState};
use crate::account::AccountState;
use crate::config::SyncConfig;
use crate::engine::LedgerError;
use crate::events::{EventPayload, RoomEvent};
use crate::position::Position;
use crate::types::{PositionId, RoomId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Authoritative state of a room at event sequence `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub positions: Vec<Position>,
    pub account: AccountState,
    pub seq: u64,
    pub taken_at: Timestamp,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, room_id: &RoomId) -> Result<RoomSnapshot, LedgerError>;
}

pub trait EventSource: Send + Sync {
    fn subscribe_room(&self, room_id: &RoomId) -> Result<broadcast::Receiver<RoomEvent>, LedgerError>;
}

/// What subscribers of the manager see. Published once per flush or resync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncView {
    pub room_id: RoomId,
    /// confirmed open positions, oldest first
    pub positions: Vec<Position>,
    /// local entries not yet confirmed, in the order they were recorded
    pub optimistic: Vec<Position>,
    pub account: Option<AccountState>,
    pub last_seq: u64,
    pub connection: ConnectionState,
    /// bumped on every publish
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { seq: u64 },
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Queued,
    Duplicate,
    Gap { expected: u64, received: u64 },
    OtherRoom,
}

#[derive(Debug, Clone)]
struct OptimisticEntry {
    position: Position,
    local_seq: u64,
}

pub struct SyncManager<S> {
    room_id: RoomId,
    source: Arc<S>,
    config: SyncConfig,
    state: ConnectionState,

    positions: HashMap<PositionId, Position>,
    optimistic: HashMap<PositionId, OptimisticEntry>,
    account: Option<AccountState>,

    // last applied and last queued room sequence
    last_seq: u64,
    last_received: u64,
    // refetch request numbers
    requests_issued: u64,
    request_applied: u64,
    local_seq: u64,
    last_refetch: Option<Instant>,

    coalescer: Coalescer<RoomEvent>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    version: u64,
    view_tx: watch::Sender<SyncView>,
}

impl<S> SyncManager<S>
where
    S: SnapshotSource + EventSource,
{
    pub fn new(room_id: RoomId, source: Arc<S>, config: SyncConfig) -> Self {
        let initial = SyncView {
            room_id: room_id.clone(),
            positions: Vec::new(),
            optimistic: Vec::new(),
            account: None,
            last_seq: 0,
            connection: ConnectionState::Connecting,
            version: 0,
        };
        let (view_tx, _) = watch::channel(initial);
        Self {
            room_id,
            source,
            coalescer: Coalescer::new(WindowPolicy::from_config(&config)),
            backoff: Backoff::from_config(&config),
            config,
            state: ConnectionState::Connecting,
            positions: HashMap::new(),
            optimistic: HashMap::new(),
            account: None,
            last_seq: 0,
            last_received: 0,
            requests_issued: 0,
            request_applied: 0,
            local_seq: 0,
            last_refetch: None,
            retry_at: None,
            version: 0,
            view_tx,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn pending(&self) -> usize {
        self.coalescer.len()
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn watch(&self) -> watch::Receiver<SyncView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> SyncView {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut optimistic: Vec<&OptimisticEntry> = self.optimistic.values().collect();
        optimistic.sort_by_key(|entry| entry.local_seq);

        SyncView {
            room_id: self.room_id.clone(),
            positions,
            optimistic: optimistic.into_iter().map(|e| e.position.clone()).collect(),
            account: self.account.clone(),
            last_seq: self.last_seq,
            connection: self.state,
            version: self.version,
        }
    }

    /// Show a position locally before the ledger confirms it. Returns its local sequence.
    pub fn apply_optimistic(&mut self, position: Position) -> u64 {
        self.local_seq += 1;
        self.optimistic.insert(
            position.id,
            OptimisticEntry {
                position,
                local_seq: self.local_seq,
            },
        );
        self.publish_view();
        self.local_seq
    }

    // 12.4: sequence checks. events are only queued here; flush applies them.
    pub fn handle_event(&mut self, event: RoomEvent, now: Instant) -> EventOutcome {
        if event.room_id != self.room_id {
            return EventOutcome::OtherRoom;
        }
        let head = self.last_received.max(self.last_seq);
        if event.seq <= head {
            debug!(room = %self.room_id, seq = event.seq, head, "duplicate event ignored");
            return EventOutcome::Duplicate;
        }
        if event.seq > head + 1 {
            warn!(room = %self.room_id, expected = head + 1, received = event.seq, "event gap");
            return EventOutcome::Gap {
                expected: head + 1,
                received: event.seq,
            };
        }
        self.last_received = event.seq;
        self.coalescer.push(event, now);
        EventOutcome::Queued
    }

    pub fn flush_if_due(&mut self, now: Instant) -> usize {
        if self.coalescer.is_due(now) {
            self.flush()
        } else {
            0
        }
    }

    /// Apply everything pending and publish one view.
    pub fn flush(&mut self) -> usize {
        let window = self.coalescer.window();
        let events = self.coalescer.drain();
        if events.is_empty() {
            return 0;
        }
        for event in &events {
            self.apply_event(event);
        }
        self.publish_view();
        debug!(room = %self.room_id, applied = events.len(), ?window, seq = self.last_seq, "flushed");
        events.len()
    }

    fn apply_event(&mut self, event: &RoomEvent) {
        match &event.payload {
            EventPayload::PositionOpened(e) => self.upsert(&e.position),
            EventPayload::PositionUpdated(e) => self.upsert(&e.position),
            EventPayload::PositionClosed(e) => {
                self.positions.remove(&e.position.id);
                self.optimistic.remove(&e.position.id);
            }
            EventPayload::BalanceChanged(e) => self.account = Some(e.account.clone()),
        }
        self.last_seq = event.seq;
    }

    fn upsert(&mut self, position: &Position) {
        self.optimistic.remove(&position.id);
        if position.is_open() {
            self.positions.insert(position.id, position.clone());
        } else {
            self.positions.remove(&position.id);
        }
    }

    pub fn begin_refetch(&mut self) -> u64 {
        self.requests_issued += 1;
        self.requests_issued
    }

    /// Replace the cache with a snapshot unless a newer refetch or newer events already
    /// landed. Optimistic entries are dropped.
    pub fn apply_snapshot(&mut self, request: u64, snapshot: RoomSnapshot) -> Result<u64, LedgerError> {
        if snapshot.room_id != self.room_id {
            return Err(LedgerError::Validation(format!(
                "snapshot for room {} applied to room {}",
                snapshot.room_id, self.room_id
            )));
        }
        if request <= self.request_applied {
            return Err(LedgerError::StaleData(format!(
                "refetch #{request} superseded by #{}",
                self.request_applied
            )));
        }
        if snapshot.seq < self.last_seq {
            return Err(LedgerError::StaleData(format!(
                "snapshot at seq {} behind applied seq {}",
                snapshot.seq, self.last_seq
            )));
        }

        let seq = snapshot.seq;
        let dropped = self.optimistic.len();
        self.positions = snapshot
            .positions
            .into_iter()
            .filter(Position::is_open)
            .map(|p| (p.id, p))
            .collect();
        self.account = Some(snapshot.account);
        self.optimistic.clear();
        self.last_seq = seq;
        self.last_received = self.last_received.max(seq);
        self.request_applied = request;
        // anything queued at or below the snapshot is already in it
        self.coalescer.retain(|event| event.seq > seq);
        self.publish_view();

        info!(
            room = %self.room_id,
            seq,
            request,
            positions = self.positions.len(),
            dropped_optimistic = dropped,
            "snapshot applied"
        );
        Ok(seq)
    }

    /// Full refetch. Skipped if the last one was less than the throttle interval ago,
    /// unless forced.
    pub async fn resync(&mut self, force: bool) -> Result<SyncOutcome, LedgerError> {
        let now = Instant::now();
        if !force && !self.throttle_remaining(now).is_zero() {
            debug!(room = %self.room_id, "refetch throttled");
            return Ok(SyncOutcome::Throttled);
        }
        self.last_refetch = Some(now);

        let request = self.begin_refetch();
        let snapshot = self.source.fetch_snapshot(&self.room_id).await?;
        let seq = self.apply_snapshot(request, snapshot)?;
        Ok(SyncOutcome::Applied { seq })
    }

    /// Initial mount: subscribe, then fetch with bounded retries. Subscribing first means
    /// nothing published between the two steps is lost.
    pub async fn connect(&mut self) -> Result<broadcast::Receiver<RoomEvent>, LedgerError> {
        let receiver = match self.source.subscribe_room(&self.room_id) {
            Ok(rx) => rx,
            Err(e) => return Err(self.fail_attempt(e)),
        };

        let mut backoff = Backoff::from_config(&self.config);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.resync(true).await {
                Ok(_) => break,
                Err(e) if e.is_retryable() && attempt < self.config.initial_fetch_attempts => {
                    let delay = backoff.next_delay();
                    warn!(room = %self.room_id, attempt, ?delay, error = %e, "initial fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(room = %self.room_id, attempt, error = %e, "initial fetch gave up");
                    return Err(self.fail_attempt(e));
                }
            }
        }

        self.mark_connected();
        Ok(receiver)
    }

    /// Resubscribe and replace the cache. Forces the refetch; callers pace attempts
    /// through `retry_at`, which already honours the throttle.
    pub async fn reconnect(&mut self) -> Result<broadcast::Receiver<RoomEvent>, LedgerError> {
        self.set_state(ConnectionEvent::Retry);
        self.retry_at = None;

        let receiver = match self.source.subscribe_room(&self.room_id) {
            Ok(rx) => rx,
            Err(e) => return Err(self.fail_attempt(e)),
        };
        if let Err(e) = self.resync(true).await {
            warn!(room = %self.room_id, error = %e, "resync after reconnect failed");
            return Err(self.fail_attempt(e));
        }

        self.mark_connected();
        Ok(receiver)
    }

    /// Feed an environment signal. Returns true when the room is live and wants a
    /// (throttled) resync, e.g. after the page became visible again.
    pub fn on_signal(&mut self, signal: ConnectionSignal, now: Instant) -> bool {
        debug!(room = %self.room_id, ?signal, state = %self.state, "connection signal");
        match signal {
            ConnectionSignal::Error => {
                self.set_state(ConnectionEvent::Failed);
                self.schedule_retry(now);
                false
            }
            ConnectionSignal::Timeout => {
                self.set_state(ConnectionEvent::Timeout);
                self.schedule_retry(now);
                false
            }
            ConnectionSignal::Offline => {
                self.set_state(ConnectionEvent::Offline);
                // nothing to retry against until the network is back
                self.retry_at = None;
                false
            }
            ConnectionSignal::Online | ConnectionSignal::VisibilityRestored => {
                if self.state.needs_reconnect() {
                    self.retry_at = Some(now + self.throttle_remaining(now));
                    false
                } else {
                    self.state.is_live()
                }
            }
        }
    }

    /// Drive the manager until the signal channel closes. Never gives up on the
    /// connection: every failure schedules another attempt.
    pub async fn run(mut self, mut signals: mpsc::Receiver<ConnectionSignal>) {
        let mut events = self.connect().await.ok();

        loop {
            let flush_at = self.coalescer.deadline();
            let retry_at = self.retry_at;

            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!(room = %self.room_id, "signal channel closed, sync stopping");
                        break;
                    };
                    if self.on_signal(signal, Instant::now()) {
                        if let Err(e) = self.resync(false).await {
                            warn!(room = %self.room_id, error = %e, "resync failed");
                        }
                    }
                    if !self.state.is_live() {
                        events = None;
                    }
                }
                received = next_event(&mut events) => match received {
                    Ok(event) => {
                        if let EventOutcome::Gap { .. } = self.handle_event(event, Instant::now()) {
                            if let Err(e) = self.resync(true).await {
                                warn!(room = %self.room_id, error = %e, "resync after gap failed");
                                self.on_signal(ConnectionSignal::Error, Instant::now());
                                events = None;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(room = %self.room_id, skipped, "event stream lagged");
                        self.on_signal(ConnectionSignal::Error, Instant::now());
                        events = None;
                    }
                    Err(RecvError::Closed) => {
                        warn!(room = %self.room_id, "event stream closed");
                        self.on_signal(ConnectionSignal::Error, Instant::now());
                        events = None;
                    }
                },
                _ = sleep_until_opt(flush_at) => {
                    self.flush();
                }
                _ = sleep_until_opt(retry_at) => {
                    match self.reconnect().await {
                        Ok(rx) => events = Some(rx),
                        Err(e) => warn!(room = %self.room_id, error = %e, "reconnect failed"),
                    }
                }
            }
        }
    }

    fn set_state(&mut self, event: ConnectionEvent) {
        let next = transition(self.state, event);
        if next != self.state {
            info!(room = %self.room_id, from = %self.state, to = %next, "connection state");
            self.state = next;
            self.publish_view();
        }
    }

    fn mark_connected(&mut self) {
        self.set_state(ConnectionEvent::Subscribed);
        self.backoff.reset();
        self.retry_at = None;
    }

    fn fail_attempt(&mut self, err: LedgerError) -> LedgerError {
        self.set_state(ConnectionEvent::Failed);
        self.schedule_retry(Instant::now());
        err
    }

    fn schedule_retry(&mut self, now: Instant) {
        if !self.state.needs_reconnect() {
            return;
        }
        let delay = self.backoff.next_delay().max(self.throttle_remaining(now));
        debug!(room = %self.room_id, ?delay, attempt = self.backoff.attempt(), "reconnect scheduled");
        self.retry_at = Some(now + delay);
    }

    fn throttle_remaining(&self, now: Instant) -> Duration {
        self.last_refetch.map_or(Duration::ZERO, |last| {
            self.config
                .refetch_min_interval()
                .saturating_sub(now.saturating_duration_since(last))
        })
    }

    fn publish_view(&mut self) {
        self.version += 1;
        let view = self.view();
        self.view_tx.send_replace(view);
    }
}

async fn next_event(
    receiver: &mut Option<broadcast::Receiver<RoomEvent>>,
) -> Result<RoomEvent, RecvError> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
