// room-ledger: leveraged trading ledger for shared rooms.
// balance-first architecture: account invariants are checked on every write.
// pure math is synchronous; only store, feed and subscription calls suspend.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: RoomId, UserId, Symbol, Side, Price, Quote, Leverage
//   3.x  pnl.rs: unrealized/realized pnl, percentage, loss cap
//   4.x  position.rs: position record, pro-rata reduction, protective orders, trade history
//   5.x  funding.rs: funding fee math, interval key, rate cache
//   6.x  liquidation.rs: 90%-of-margin liquidation price approximation
//   7.x  config.rs: funding, sync, propagation, limits, env presets
//   8.x  engine/: room ledger: positions, accounts, funding runs, room locks
//   9.x  feed.rs: market price and funding rate feeds (mocked)
//   10.x account.rs: room account, adjustments, balance view
//   11.x events.rs: room-scoped change events
//   12.x sync/: caller-side sync manager, coalescing, reconnect
//   13.x propagator.rs: per-room broadcast channels
//   14.x store.rs: persistence contract + in-memory store
//   15.x context.rs: caller security context

// core ledger modules
pub mod account;
pub mod engine;
pub mod events;
pub mod funding;
pub mod liquidation;
pub mod pnl;
pub mod position;
pub mod types;

// delivery and reconciliation
pub mod propagator;
pub mod sync;

// integration modules
pub mod config;
pub mod context;
pub mod feed;
pub mod store;

// re exports for convenience
pub use account::{calculate_balance_view, AccountAdjustment, AccountError, AccountState, BalanceView};
pub use config::{ConfigError, Environment, LedgerConfig};
pub use context::{Actor, SecurityContext};
pub use engine::{
    CloseOutcome, FundingRunReport, InvariantReport, LedgerError, OpenPositionRequest, PriceTickOutcome,
    RoomLedger,
};
pub use events::*;
pub use feed::{FeedError, FundingRateFeed, MarketPriceFeed, StaticPriceFeed, StaticRateFeed};
pub use funding::{FundingInterval, FundingPayment, FundingRate, FundingRateCache};
pub use liquidation::{liquidation_price, LIQUIDATION_MARGIN_FACTOR};
pub use pnl::{calculate_pnl, pnl_percentage, PnlSnapshot};
pub use position::{CloseReason, Position, PositionStatus, ProtectiveOrders, TradeHistory};
pub use propagator::ChangePropagator;
pub use store::{InMemoryStore, LedgerStore, StoreError};
pub use sync::{ConnectionSignal, ConnectionState, SyncManager, SyncOutcome, SyncView};
pub use types::*;
