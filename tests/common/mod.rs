use async_trait::async_trait;
use parking_lot::Mutex;
use room_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// In-memory store with switchable faults for the failure paths.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    pub fail_rate_reads: AtomicBool,
    pub fail_payment_insert: AtomicBool,
    pub fail_trade_append: AtomicBool,
    /// next N account reads fail with a transient error
    pub account_read_failures: AtomicU32,
    /// next N funding rate reads fail with a transient error
    pub rate_read_failures: AtomicU32,
    /// next N position updates fail with a transient error
    pub update_failures: AtomicU32,
    failing_updates: Mutex<HashSet<PositionId>>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates_for(&self, id: PositionId) {
        self.failing_updates.lock().insert(id);
    }

    pub fn heal(&self) {
        self.fail_rate_reads.store(false, Ordering::SeqCst);
        self.fail_payment_insert.store(false, Ordering::SeqCst);
        self.fail_trade_append.store(false, Ordering::SeqCst);
        self.account_read_failures.store(0, Ordering::SeqCst);
        self.rate_read_failures.store(0, Ordering::SeqCst);
        self.update_failures.store(0, Ordering::SeqCst);
        self.failing_updates.lock().clear();
    }
}

fn transient(what: &str) -> StoreError {
    StoreError::Transient(format!("injected {what} failure"))
}

// consume one scheduled failure, if any are left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn insert_account(&self, account: AccountState) -> Result<(), StoreError> {
        self.inner.insert_account(account).await
    }

    async fn account(&self, room_id: &RoomId) -> Result<Option<AccountState>, StoreError> {
        if take_failure(&self.account_read_failures) {
            return Err(transient("account read"));
        }
        self.inner.account(room_id).await
    }

    async fn adjust_account(
        &self,
        room_id: &RoomId,
        adjustment: AccountAdjustment,
        timestamp: Timestamp,
    ) -> Result<AccountState, StoreError> {
        self.inner.adjust_account(room_id, adjustment, timestamp).await
    }

    async fn insert_position(&self, position: Position) -> Result<(), StoreError> {
        self.inner.insert_position(position).await
    }

    async fn update_position(&self, position: Position) -> Result<(), StoreError> {
        if self.failing_updates.lock().contains(&position.id) || take_failure(&self.update_failures) {
            return Err(transient("position update"));
        }
        self.inner.update_position(position).await
    }

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        self.inner.position(id).await
    }

    async fn open_positions(&self, room_id: &RoomId) -> Result<Vec<Position>, StoreError> {
        self.inner.open_positions(room_id).await
    }

    async fn all_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.inner.all_open_positions().await
    }

    async fn append_trade(&self, trade: TradeHistory) -> Result<(), StoreError> {
        if self.fail_trade_append.load(Ordering::SeqCst) {
            return Err(transient("trade append"));
        }
        self.inner.append_trade(trade).await
    }

    async fn trades(&self, room_id: &RoomId) -> Result<Vec<TradeHistory>, StoreError> {
        self.inner.trades(room_id).await
    }

    async fn record_funding_rate(&self, rate: FundingRate) -> Result<(), StoreError> {
        self.inner.record_funding_rate(rate).await
    }

    async fn latest_funding_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, StoreError> {
        if self.fail_rate_reads.load(Ordering::SeqCst) || take_failure(&self.rate_read_failures) {
            return Err(transient("rate read"));
        }
        self.inner.latest_funding_rate(symbol).await
    }

    async fn append_funding_payments(&self, payments: Vec<FundingPayment>) -> Result<(), StoreError> {
        if self.fail_payment_insert.load(Ordering::SeqCst) {
            return Err(transient("payment batch"));
        }
        self.inner.append_funding_payments(payments).await
    }

    async fn funding_payments(&self, position_id: PositionId) -> Result<Vec<FundingPayment>, StoreError> {
        self.inner.funding_payments(position_id).await
    }
}

#[allow(dead_code)]
pub fn ledger() -> (Arc<RoomLedger<FlakyStore>>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new());
    let ledger = Arc::new(RoomLedger::new(store.clone(), LedgerConfig::testing()));
    (ledger, store)
}

#[allow(dead_code)]
pub fn room(name: &str) -> RoomId {
    RoomId::new(name).unwrap()
}

#[allow(dead_code)]
pub fn owner_of(room_name: &str) -> SecurityContext {
    SecurityContext::new(UserId::new("owner").unwrap(), room(room_name), true)
}

#[allow(dead_code)]
pub fn member_of(room_name: &str, user: &str) -> SecurityContext {
    SecurityContext::new(UserId::new(user).unwrap(), room(room_name), false)
}

#[allow(dead_code)]
pub fn btc() -> Symbol {
    Symbol::new("BTCUSDT").unwrap()
}

/// Create the room's account and return the owner context.
#[allow(dead_code)]
pub async fn seed_room<S: LedgerStore>(ledger: &RoomLedger<S>, room_name: &str, holdings: Decimal) -> SecurityContext {
    let ctx = owner_of(room_name);
    ledger
        .create_account(&ctx, holdings)
        .await
        .expect("Failed to seed room account");
    ctx
}

/// 1000 margin at 10x on BTCUSDT @ 50000.
#[allow(dead_code)]
pub fn btc_request(room_name: &str, side: Side) -> OpenPositionRequest {
    OpenPositionRequest {
        room_id: room(room_name),
        symbol: "BTCUSDT".to_string(),
        side,
        entry_price: dec!(50000),
        entry_amount: dec!(1000),
        leverage: dec!(10),
    }
}

#[allow(dead_code)]
pub async fn assert_room_consistent<S: LedgerStore>(ledger: &RoomLedger<S>, room_name: &str) {
    let report = ledger.verify_room(&room(room_name)).await.unwrap();
    assert!(report.is_consistent(), "room {room_name} inconsistent: {report:?}");
}
