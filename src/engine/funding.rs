//! Funding distribution and funding rate refresh.
//!
//! A run charges every open position once per funding interval. Units fail independently:
//! a symbol whose rate can't be read, a position whose update fails, or a room whose
//! aggregated adjustment is rejected is logged, counted and skipped. The final payment
//! batch insert is reported but never rolls back balances already settled; the
//! `last_funding_time` guard keeps a retried run from charging those positions twice.
//! Transient store errors on a rate read or a position write get a few backed-off
//! retries before the unit is given up on.

use super::core::RoomLedger;
use super::results::{FundingRunReport, LedgerError};
use crate::account::AccountAdjustment;
use crate::context::Actor;
use crate::events::{EventPayload, PositionUpdatedEvent, UpdateReason};
use crate::feed::FundingRateFeed;
use crate::funding::{balance_delta, funding_fee, FundingInterval, FundingPayment, FundingRate};
use crate::position::Position;
use crate::store::LedgerStore;
use crate::sync::Backoff;
use crate::types::{PositionId, Quote, RoomId, Symbol, Timestamp};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error, info, warn};

// one position's planned charge
struct Charge {
    position_id: PositionId,
    rate: FundingRate,
    interval: FundingInterval,
}

impl<S: LedgerStore> RoomLedger<S> {
    /// Charge or credit every open position from the latest rate of its symbol.
    /// Only a failure to list open positions aborts the run.
    pub async fn distribute_funding(&self, now: Timestamp) -> Result<FundingRunReport, LedgerError> {
        self.run_funding(None, now).await
    }

    /// Same as `distribute_funding`, but first pulls a fresh rate from `feed` for every
    /// symbol whose cached rate is stale or missing.
    pub async fn distribute_funding_with_feed(
        &self,
        feed: &dyn FundingRateFeed,
        now: Timestamp,
    ) -> Result<FundingRunReport, LedgerError> {
        self.run_funding(Some(feed), now).await
    }

    async fn run_funding(
        &self,
        feed: Option<&dyn FundingRateFeed>,
        now: Timestamp,
    ) -> Result<FundingRunReport, LedgerError> {
        let mut report = FundingRunReport::default();

        // 1. open positions, grouped by symbol
        let positions = self.store.all_open_positions().await?;
        let mut by_symbol: BTreeMap<Symbol, Vec<Position>> = BTreeMap::new();
        for position in positions {
            by_symbol.entry(position.symbol.clone()).or_default().push(position);
        }

        if let Some(feed) = feed {
            let symbols: Vec<Symbol> = by_symbol.keys().cloned().collect();
            let refreshed = self.refresh_funding_rates(feed, &symbols, now).await;
            debug!(symbols = symbols.len(), refreshed = refreshed.len(), "rates refreshed before funding");
        }

        // 2. rate per symbol, then plan charges per room
        let mut by_room: BTreeMap<RoomId, Vec<Charge>> = BTreeMap::new();
        for (symbol, positions) in by_symbol {
            let symbol_ref = &symbol;
            let fetched = self.retry_transient("rate read", move || self.rate_for(symbol_ref, now)).await;
            let rate = match fetched {
                Ok(Some(rate)) => rate,
                Ok(None) => {
                    warn!(symbol = %symbol, positions = positions.len(), "no funding rate, skipping symbol");
                    report.skipped_symbols.push(symbol);
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "funding rate fetch failed, skipping symbol");
                    report.failed += positions.len();
                    continue;
                }
            };

            let interval = FundingInterval::containing(rate.observed_at, self.config.funding.interval_ms);
            for position in positions {
                if position.funded_since(interval.start) {
                    report.already_applied += 1;
                    continue;
                }
                by_room.entry(position.room_id.clone()).or_default().push(Charge {
                    position_id: position.id,
                    rate: rate.clone(),
                    interval,
                });
            }
        }

        // 3. settle room by room under each room's lock
        let mut payments = Vec::new();
        for (room_id, charges) in by_room {
            self.settle_room_funding(&room_id, charges, now, &mut report, &mut payments)
                .await;
        }

        // 4. one batch of audit rows. a failure here does not undo step 3
        if !payments.is_empty() {
            let count = payments.len();
            match self.store.append_funding_payments(payments).await {
                Ok(()) => report.payments_written = count,
                Err(e) => {
                    error!(payments = count, error = %e, "funding payment batch insert failed, balances already applied");
                    report.payment_error = Some(e.to_string());
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            already_applied = report.already_applied,
            skipped_symbols = report.skipped_symbols.len(),
            payments = report.payments_written,
            rooms = report.room_deltas.len(),
            "funding run complete"
        );
        Ok(report)
    }

    async fn settle_room_funding(
        &self,
        room_id: &RoomId,
        charges: Vec<Charge>,
        now: Timestamp,
        report: &mut FundingRunReport,
        payments: &mut Vec<FundingPayment>,
    ) {
        let _guard = self.locks.lock(room_id).await;

        // (original, charged, fee, interval, rate) for every position updated in this room
        let mut applied: Vec<(Position, Position, Quote, FundingInterval, FundingRate)> = Vec::new();
        for charge in charges {
            // re-read under the lock, the position may have closed since it was listed
            let id = charge.position_id;
            let original = match self.retry_transient("position read", move || self.store.position(id)).await {
                Ok(Some(p)) if p.is_open() => p,
                Ok(_) => {
                    debug!(room = %room_id, position = %charge.position_id, "closed before funding, skipped");
                    continue;
                }
                Err(e) => {
                    warn!(room = %room_id, position = %charge.position_id, error = %e, "position read failed");
                    report.failed += 1;
                    continue;
                }
            };
            if original.funded_since(charge.interval.start) {
                report.already_applied += 1;
                continue;
            }

            let charged = funding_fee(original.side, original.position_size, charge.rate.rate)
                .and_then(|fee| Some((fee, original.with_funding(fee, charge.rate.observed_at)?)));
            let Some((fee, charged)) = charged else {
                warn!(room = %room_id, position = %original.id, rate = %charge.rate.rate, "funding fee out of range");
                report.failed += 1;
                continue;
            };

            let record = &charged;
            let written = self
                .retry_transient("funding update", move || self.store.update_position(record.clone()))
                .await;
            if let Err(e) = written {
                warn!(room = %room_id, position = %original.id, error = %e, "funding update failed");
                report.failed += 1;
                continue;
            }
            applied.push((original, charged, fee, charge.interval, charge.rate));
        }

        if applied.is_empty() {
            return;
        }

        // aggregate the room's net effect into one atomic adjustment
        let delta = applied
            .iter()
            .try_fold(Quote::zero(), |acc, (_, _, fee, _, _)| acc.checked_add(balance_delta(*fee)))
            .ok_or_else(|| LedgerError::Validation(format!("funding total for room {room_id} out of range")));
        let settled = match delta {
            Ok(delta) if delta.is_zero() => Ok(delta),
            Ok(delta) => self
                .adjust_locked(&Actor::System, room_id, AccountAdjustment::holdings(delta), "funding")
                .await
                .map(|_| delta),
            Err(e) => Err(e),
        };
        let delta = match settled {
            Ok(delta) => delta,
            Err(e) => {
                warn!(room = %room_id, error = %e, "room funding rejected, restoring positions");
                for (original, _, _, _, _) in &applied {
                    if let Err(restore_err) = self.store.update_position(original.clone()).await {
                        error!(room = %room_id, position = %original.id, error = %restore_err, "position restore failed");
                    }
                }
                report.failed += applied.len();
                return;
            }
        };

        report.processed += applied.len();
        report.room_deltas.insert(room_id.clone(), delta);
        for (_, charged, fee, interval, rate) in applied {
            debug!(room = %room_id, position = %charged.id, fee = %fee, "funding charged");
            payments.push(FundingPayment::for_position(&charged, &rate, fee, interval, now));
            self.publish(
                room_id,
                EventPayload::PositionUpdated(PositionUpdatedEvent {
                    position: charged,
                    reason: UpdateReason::FundingCharged,
                    pnl: None,
                }),
            );
        }
    }

    // bounded retry for transient store errors, rejections come straight back
    async fn retry_transient<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LedgerError>
    where
        E: Into<LedgerError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let funding = &self.config.funding;
        let mut backoff = Backoff::new(funding.retry_base(), funding.retry_max());
        loop {
            match op().await.map_err(Into::into) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && backoff.attempt() + 1 < funding.retry_attempts => {
                    let delay = backoff.next_delay();
                    debug!(what, attempt = backoff.attempt(), ?delay, error = %e, "transient funding error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // fresh cache entry first, then the store
    async fn rate_for(&self, symbol: &Symbol, now: Timestamp) -> Result<Option<FundingRate>, LedgerError> {
        let cached = self.rate_cache.lock().fresh(symbol, now).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let stored = self.store.latest_funding_rate(symbol).await?;
        if let Some(rate) = &stored {
            self.rate_cache.lock().insert(rate.clone(), now);
        }
        Ok(stored)
    }

    /// Pull fresh rates for the stale or missing symbols among `symbols`, persist them and
    /// warm the cache. Returns the symbols that were refreshed.
    pub async fn refresh_funding_rates(
        &self,
        feed: &dyn FundingRateFeed,
        symbols: &[Symbol],
        now: Timestamp,
    ) -> Vec<Symbol> {
        let stale = self.rate_cache.lock().stale_symbols(symbols, now);
        let mut refreshed = Vec::new();

        for symbol in stale {
            match feed.latest_rate(&symbol).await {
                Ok(Some(rate)) => {
                    if let Err(e) = self.store.record_funding_rate(rate.clone()).await {
                        warn!(symbol = %symbol, error = %e, "could not persist funding rate");
                        continue;
                    }
                    debug!(symbol = %symbol, rate = %rate.rate, observed_at = %rate.observed_at, "funding rate refreshed");
                    self.rate_cache.lock().insert(rate, now);
                    refreshed.push(symbol);
                }
                Ok(None) => debug!(symbol = %symbol, "feed has no funding rate"),
                Err(e) => warn!(symbol = %symbol, error = %e, "funding rate feed failed"),
            }
        }
        refreshed
    }

    pub async fn funding_payments(&self, position_id: PositionId) -> Result<Vec<FundingPayment>, LedgerError> {
        Ok(self.store.funding_payments(position_id).await?)
    }
}
