//! Room solvency invariant tests.
//!
//! These tests verify that no sequence of trades can create or destroy virtual currency:
//! every unit of holdings is explained by the initial grant, owner transfers and realized
//! pnl, and locked margin always matches the open positions.

mod common;

use common::*;
use proptest::prelude::*;
use room_ledger::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[derive(Debug, Clone)]
enum Step {
    Open { side: Side, margin: Decimal, leverage: Decimal },
    Reduce { slot: usize, fraction: Decimal, price: Decimal },
    Deposit(Decimal),
    Withdraw(Decimal),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (
            prop_oneof![Just(Side::Long), Just(Side::Short)],
            (100i64..300_000i64).prop_map(|x| Decimal::new(x, 2)),
            (1u32..=50u32).prop_map(Decimal::from),
        )
            .prop_map(|(side, margin, leverage)| Step::Open { side, margin, leverage }),
        (
            0usize..8,
            (1i64..=4i64).prop_map(|x| Decimal::new(x * 25, 2)),
            (40_000i64..60_000i64).prop_map(Decimal::from),
        )
            .prop_map(|(slot, fraction, price)| Step::Reduce { slot, fraction, price }),
        (1i64..100_000i64).prop_map(|x| Step::Deposit(Decimal::new(x, 2))),
        (1i64..100_000i64).prop_map(|x| Step::Withdraw(Decimal::new(x, 2))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Holdings = initial + deposits - withdrawals + realized pnl, after any step sequence
    #[test]
    fn holdings_explained_by_history(
        initial in (1_000i64..50_000i64).prop_map(Decimal::from),
        steps in proptest::collection::vec(step_strategy(), 1..30),
    ) {
        runtime().block_on(async {
            let (ledger, _) = ledger();
            let owner = seed_room(&ledger, "room-1", initial).await;
            let mut opened: Vec<PositionId> = Vec::new();
            let mut net_transfers = Decimal::ZERO;

            for step in steps {
                match step {
                    Step::Open { side, margin, leverage } => {
                        let mut request = btc_request("room-1", side);
                        request.entry_amount = margin;
                        request.leverage = leverage;
                        match ledger.open_position(&owner, request).await {
                            Ok(position) => opened.push(position.id),
                            Err(LedgerError::InsufficientBalance { .. }) => {}
                            Err(e) => panic!("open failed: {e}"),
                        }
                    }
                    Step::Reduce { slot, fraction, price } => {
                        let Some(id) = opened.get(slot % opened.len().max(1)).copied() else {
                            continue;
                        };
                        match ledger.reduce_position(&owner, id, fraction, price).await {
                            Ok(_) | Err(LedgerError::NotFound(_)) => {}
                            Err(e) => panic!("reduce failed: {e}"),
                        }
                    }
                    Step::Deposit(amount) => {
                        ledger.adjust_balance(&owner, &room("room-1"), amount, "deposit").await.unwrap();
                        net_transfers += amount;
                    }
                    Step::Withdraw(amount) => {
                        match ledger.adjust_balance(&owner, &room("room-1"), -amount, "withdraw").await {
                            Ok(_) => net_transfers -= amount,
                            Err(LedgerError::InsufficientBalance { .. }) => {}
                            Err(e) => panic!("withdraw failed: {e}"),
                        }
                    }
                }

                let report = ledger.verify_room(&room("room-1")).await.unwrap();
                prop_assert!(report.is_consistent(), "inconsistent: {:?}", report);
            }

            let realized: Quote = ledger
                .trade_history(&room("room-1"))
                .await
                .unwrap()
                .iter()
                .map(|t| t.realized_pnl)
                .sum();
            let account = ledger.account(&room("room-1")).await.unwrap();
            let expected = initial + net_transfers + realized.value();
            // pnl carries full decimal precision, so allow for rounding in the last places
            prop_assert!(
                (account.holdings.value() - expected).abs() < dec!(0.000001),
                "holdings {} but history explains {}",
                account.holdings,
                expected
            );
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Closing everything at entry returns the room to exactly its starting balance
    #[test]
    fn flat_round_trips_conserve_holdings(
        initial in (10_000i64..100_000i64).prop_map(Decimal::from),
        margins in proptest::collection::vec((1i64..200_000i64).prop_map(|x| Decimal::new(x, 2)), 1..10),
        leverage in (1u32..=100u32).prop_map(Decimal::from),
    ) {
        runtime().block_on(async {
            let (ledger, _) = ledger();
            let owner = seed_room(&ledger, "room-1", initial).await;

            let mut ids = Vec::new();
            for (i, margin) in margins.into_iter().enumerate() {
                let side = if i % 2 == 0 { Side::Long } else { Side::Short };
                let mut request = btc_request("room-1", side);
                request.entry_amount = margin;
                request.leverage = leverage;
                if let Ok(position) = ledger.open_position(&owner, request).await {
                    ids.push(position.id);
                }
            }
            for id in ids {
                ledger.close_position(&owner, id, dec!(50000)).await.unwrap();
            }

            let account = ledger.account(&room("room-1")).await.unwrap();
            prop_assert_eq!(account.holdings.value(), initial);
            prop_assert!(account.locked_margin.is_zero());
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// A losing close never takes more than its margin out of holdings
    #[test]
    fn losses_bounded_by_margin(
        side in prop_oneof![Just(Side::Long), Just(Side::Short)],
        leverage in (1u32..=125u32).prop_map(Decimal::from),
        exit in (1i64..200_000i64).prop_map(Decimal::from),
    ) {
        runtime().block_on(async {
            let (ledger, _) = ledger();
            let owner = seed_room(&ledger, "room-1", dec!(1000)).await;
            let mut request = btc_request("room-1", side);
            request.leverage = leverage;
            let position = ledger.open_position(&owner, request).await.unwrap();

            let outcome = ledger.close_position(&owner, position.id, exit).await.unwrap();
            prop_assert!(!outcome.account.holdings.is_negative());
            prop_assert!(outcome.trade.realized_pnl.value() >= dec!(-1000));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
