// 8.0: room ledger engine. position lifecycle, room accounts, funding distribution.
// all mutations for a room go through that room's lock; rooms run in parallel.

mod account;
mod core;
mod funding;
mod locks;
mod positions;
mod results;

pub use core::RoomLedger;
pub use positions::OpenPositionRequest;
pub use results::{CloseOutcome, FundingRunReport, InvariantReport, LedgerError, PriceTickOutcome};
