//! Room ledger simulation.
//!
//! Runs the reference scenarios end to end against the in-memory store: open and price
//! a position, close it, distribute funding, reject an unaffordable trade, and recover a
//! sync manager from a dropped connection.

use anyhow::{bail, ensure, Context, Result};
use room_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Ledger = RoomLedger<InMemoryStore>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = LedgerConfig::from_env().context("loading ledger config")?;
    info!(max_leverage = %config.limits.max_leverage, funding_interval_ms = config.funding.interval_ms, "room-sim starting");

    let ledger = Arc::new(RoomLedger::new(Arc::new(InMemoryStore::new()), config));

    println!("Room Ledger Simulation\n");

    let position = scenario_a_open_and_price(&ledger).await?;
    scenario_b_close(&ledger, &position).await?;
    scenario_c_funding(&ledger).await?;
    scenario_d_insufficient_balance(&ledger).await?;
    scenario_e_reconnect(&ledger).await?;

    println!("\nAll scenarios completed.");
    Ok(())
}

fn ids(room: &str, user: &str) -> Result<(RoomId, UserId)> {
    let room = RoomId::new(room).context("room id")?;
    let user = UserId::new(user).context("user id")?;
    Ok((room, user))
}

async fn seeded_room(ledger: &Ledger, room: &str, holdings: Decimal) -> Result<SecurityContext> {
    let (room_id, owner) = ids(room, "owner")?;
    let ctx = SecurityContext::new(owner, room_id, true);
    ledger.create_account(&ctx, holdings).await?;
    Ok(ctx)
}

fn btc_long(room_id: &RoomId) -> OpenPositionRequest {
    OpenPositionRequest {
        room_id: room_id.clone(),
        symbol: "BTCUSDT".to_string(),
        side: Side::Long,
        entry_price: dec!(50000),
        entry_amount: dec!(1000),
        leverage: dec!(10),
    }
}

/// Open a 10x long and move the price 2%.
async fn scenario_a_open_and_price(ledger: &Ledger) -> Result<Position> {
    println!("Scenario A: open long, price moves to 51000\n");

    let owner = seeded_room(ledger, "room-a", dec!(10000)).await?;
    let position = ledger.open_position(&owner, btc_long(&owner.room_id)).await?;
    println!("  position size: {}", position.position_size);
    println!("  liquidation price: {}", liquidation_price(position.entry_price, position.leverage, position.side));

    let symbol = position.symbol.clone();
    let tick = ledger
        .apply_price(&owner.room_id, &symbol, Price::new_unchecked(dec!(51000)))
        .await?;
    let mut prices = HashMap::new();
    prices.insert(symbol, Price::new_unchecked(dec!(51000)));
    let pnl = position.unrealized_pnl(dec!(51000)).context("pnl out of range")?;
    let pct = pnl_percentage(pnl, position.entry_amount).context("pnl percentage out of range")?;
    println!("  updated positions: {}", tick.updated);
    println!("  pnl: {} ({}%)", pnl, pct);

    let view = ledger.balance(&owner.room_id, &prices).await?;
    println!("  valuation: {}, available: {}\n", view.valuation, view.available);
    ensure!(pnl.value() == dec!(200), "expected pnl 200, got {pnl}");
    Ok(position)
}

/// Close at 51000: 1000 margin + 200 pnl back to available.
async fn scenario_b_close(ledger: &Ledger, position: &Position) -> Result<()> {
    println!("Scenario B: close at 51000\n");

    let before = ledger.account(&position.room_id).await?;
    let ctx = SecurityContext::new(position.user_id.clone(), position.room_id.clone(), true);
    let outcome = ledger.close_position(&ctx, position.id, dec!(51000)).await?;

    let credit = outcome.account.available().sub(before.available());
    println!("  realized pnl: {}", outcome.trade.realized_pnl);
    println!("  available credit: {}", credit);
    println!("  locked margin: {} -> {}", before.locked_margin, outcome.account.locked_margin);
    println!("  trade rows: {}", ledger.trade_history(&position.room_id).await?.len());

    let report = ledger.verify_room(&position.room_id).await?;
    println!("  invariants hold: {}\n", report.is_consistent());
    ensure!(credit.value() == dec!(1200), "expected credit 1200, got {credit}");
    Ok(())
}

/// +0.01% funding on a 10000 long and a 10000 short.
async fn scenario_c_funding(ledger: &Ledger) -> Result<()> {
    println!("Scenario C: funding at +0.0001\n");

    let long_room = seeded_room(ledger, "room-c-long", dec!(5000)).await?;
    let short_room = seeded_room(ledger, "room-c-short", dec!(5000)).await?;

    let long = ledger.open_position(&long_room, btc_long(&long_room.room_id)).await?;
    let mut short_request = btc_long(&short_room.room_id);
    short_request.side = Side::Short;
    let short = ledger.open_position(&short_room, short_request).await?;

    let now = Timestamp::now();
    let rates = StaticRateFeed::new();
    rates.set(long.symbol.clone(), dec!(0.0001), now);
    // the run pulls the missing rate from the feed itself
    let report = ledger.distribute_funding_with_feed(&rates, now).await?;
    println!("  processed: {}, failed: {}, payments: {}", report.processed, report.failed, report.payments_written);
    for (room, delta) in &report.room_deltas {
        println!("  {room}: {delta}");
    }

    let rerun = ledger.distribute_funding(now).await?;
    println!("  rerun already applied: {}\n", rerun.already_applied);

    let long_after = ledger.position(long.id).await?;
    let short_after = ledger.position(short.id).await?;
    ensure!(long_after.cumulative_funding_fee.value() == dec!(1), "long should pay 1");
    ensure!(short_after.cumulative_funding_fee.value() == dec!(-1), "short should receive 1");
    Ok(())
}

/// 500 available, 1000 requested.
async fn scenario_d_insufficient_balance(ledger: &Ledger) -> Result<()> {
    println!("Scenario D: insufficient balance\n");

    let owner = seeded_room(ledger, "room-d", dec!(500)).await?;
    match ledger.open_position(&owner, btc_long(&owner.room_id)).await {
        Err(LedgerError::InsufficientBalance { requested, available }) => {
            println!("  rejected: requested {requested}, available {available}");
        }
        Err(e) => bail!("unexpected error: {e}"),
        Ok(p) => bail!("position {} should not have opened", p.id),
    }

    let positions = ledger.open_positions(&owner.room_id).await?;
    let account = ledger.account(&owner.room_id).await?;
    println!("  positions: {}, holdings: {}\n", positions.len(), account.holdings);
    Ok(())
}

/// Drop the connection, mutate the room while offline, reconnect.
async fn scenario_e_reconnect(ledger: &Arc<Ledger>) -> Result<()> {
    println!("Scenario E: reconnect replaces the local cache\n");

    let owner = seeded_room(ledger, "room-e", dec!(10000)).await?;
    let mut sync = SyncManager::new(owner.room_id.clone(), ledger.clone(), ledger.config().sync.clone());
    let _events = sync.connect().await?;
    println!("  connected: {}", sync.state());

    let ghost = Position::open(
        owner.room_id.clone(),
        owner.user_id.clone(),
        Symbol::new("ETHUSDT").context("symbol")?,
        Side::Long,
        Price::new_unchecked(dec!(3000)),
        Quote::new(dec!(100)),
        Leverage::new(dec!(5)).context("leverage")?,
        Timestamp::now(),
    );
    sync.apply_optimistic(ghost);
    println!("  optimistic entries: {}", sync.view().optimistic.len());

    sync.on_signal(ConnectionSignal::Offline, Instant::now());
    println!("  state after drop: {}", sync.state());
    ledger.open_position(&owner, btc_long(&owner.room_id)).await?;

    sync.on_signal(ConnectionSignal::Online, Instant::now());
    let _events = sync.reconnect().await?;
    let view = sync.view();
    println!("  state: {}", view.connection);
    println!("  positions: {}, optimistic: {}, seq: {}", view.positions.len(), view.optimistic.len(), view.last_seq);
    ensure!(view.optimistic.is_empty(), "optimistic entries should be gone");
    ensure!(view.positions.len() == 1, "expected the authoritative position");
    Ok(())
}
