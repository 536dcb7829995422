//! Concurrency tests: racing claims, racing settlement, and claims racing
//! kickoff. Each race must end in one of the states a serial order could
//! produce.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use squares_types::{
    Board, BoardStatus, DeliveryStatus, EngineError, Game, LedgerKind, LedgerTransaction, Period,
    ScorePair,
};

use crate::mocks::{
    claim_range, engine_with, fill_with_axis, fixed_axis, paid_board, test_engine,
};
use crate::store::{BoardStore, Memory};
use crate::wallet::{CreditRequest, Wallet, WalletError};

#[test]
fn racing_claims_on_one_index_have_one_winner() {
    let (engine, _clock) = test_engine(1);
    paid_board(&engine, "b1", "g1", 500);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || engine.claim_square("b1", 42, &format!("user{i}")))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|err| matches!(err, EngineError::Conflict { index: 42, .. })));
    assert_eq!(engine.board("b1").unwrap().claimed_count(), 1);
    assert_eq!(engine.squares("b1").unwrap().len(), 1);
}

#[test]
fn concurrent_fill_assigns_digits_once() {
    let (engine, _clock) = test_engine(2);
    paid_board(&engine, "b1", "g1", 500);
    let engine = Arc::new(engine);

    // Ten threads, each trying every index; every index is won exactly once.
    let handles: Vec<_> = (0..10)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut won = 0;
                for offset in 0..100u16 {
                    let index = (offset + t * 10) % 100;
                    if engine.claim_square("b1", index, &format!("t{t}")).is_ok() {
                        won += 1;
                    }
                }
                won
            })
        })
        .collect();
    let won: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(won, 100);

    let board = engine.board("b1").unwrap();
    assert_eq!(board.status, BoardStatus::Full);
    let axis = board.axis.unwrap();
    let squares = engine.squares("b1").unwrap();
    assert_eq!(squares.len(), 100);
    assert!(squares
        .iter()
        .all(|s| s.value == Some(axis.square_value(s.index))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_settlement_credits_once() {
    let (engine, _clock) = test_engine(3);
    fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
    let mut game = Game::new("g1");
    game.is_live = true;
    game.quarter = 2;
    game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
    engine.store().put_game(game).unwrap();
    let engine = Arc::new(engine);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.reconcile("b1", Period::Q1, "ops").await.map(|_| ())
            } else {
                engine.on_game_updated("g1").await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = engine.winner("b1", Period::Q1).unwrap();
    assert!(record.paid);
    assert_eq!(record.paid_amount, 10_000);
    // The wallet may see the same key more than once; it only applies it once.
    assert_eq!(engine.wallet().credits().len(), 1);
    assert_eq!(engine.wallet().balance("user13"), 10_000);
    assert_eq!(engine.wins_for("user13").unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_claim_racing_kickoff_ends_consistent() {
    for round in 0..20u64 {
        let (engine, _clock) = test_engine(round);
        paid_board(&engine, "b1", "g1", 500);
        claim_range(&engine, "b1", 0..99, &["alice", "bob"]);
        let mut game = Game::new("g1");
        game.is_live = true;
        engine.store().put_game(game).unwrap();
        let engine = Arc::new(engine);

        let claimer = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.claim_square("b1", 99, "carol") })
        };
        let kickoff = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.on_game_live("b1").await })
        };
        let claim = claimer.await.unwrap();
        kickoff.await.unwrap().unwrap();
        // A kickoff that lost the race leaves the board full; replay it.
        engine.on_game_live("b1").await.unwrap();

        let board = engine.board("b1").unwrap();
        match board.status {
            BoardStatus::Active => {
                assert!(claim.is_ok(), "round {round}: active without the last claim");
                assert_eq!(board.claimed_count(), 100);
                assert!(board.axis.is_some());
                assert!(engine.store().undelivered(None).unwrap().is_empty());
                assert!(engine.wallet().credits().is_empty());
            }
            BoardStatus::Unfilled => {
                assert!(board.axis.is_none());
                let refunds = engine
                    .wallet()
                    .credits()
                    .into_iter()
                    .filter(|c| c.idempotency_key.starts_with("b1_refund_"))
                    .count();
                assert_eq!(refunds, board.claimed_count());
                // Only a board with an unsold square may be refunded.
                assert!(claim.is_err(), "round {round}: sold-out board refunded");
                assert_eq!(board.claimed_count(), 99);
                let entry = engine.store().ledger_entry("b1_refund_0").unwrap().unwrap();
                assert_eq!(entry.transaction.kind, LedgerKind::Refund);
            }
            other => panic!("round {round}: unexpected status {other}"),
        }
    }
}

/// First call stalls and is then rejected; every later call succeeds.
#[derive(Default)]
struct StallThenRecover {
    calls: AtomicUsize,
}

impl Wallet for StallThenRecover {
    async fn credit(&self, _request: &CreditRequest) -> Result<(), WalletError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(WalletError::Rejected("account locked".to_string()));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_failure_does_not_requeue_delivered_credit() {
    let (engine, _clock) = engine_with(Memory::new(), StallThenRecover::default(), 8);
    let board = Board::new("b1", "g1", 500, 10_000, 0);
    let tx = LedgerTransaction::winnings(&board, Period::Q1, "alice", 10_000, 1);
    engine.store().insert_ledger(tx.clone()).unwrap();
    let engine = Arc::new(engine);

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deliver_pending(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = engine.deliver_pending(None).await.unwrap();
    let slow = slow.await.unwrap().unwrap();

    assert_eq!(fast.delivered, 1);
    assert_eq!(slow.delivered + slow.escalated, 0);
    let entry = engine.store().ledger_entry(&tx.id).unwrap().unwrap();
    assert_eq!(entry.delivery.status, DeliveryStatus::Delivered);
    assert!(engine.operator_queue().unwrap().is_empty());
}
