//! Idempotency tests.
//!
//! Every trigger may be delivered zero, one or many times. These tests replay
//! feed updates, lifecycle events and reconciliation in different orders and
//! check that the stored outcome and the money moved never change after the
//! first successful run.

use std::collections::BTreeSet;

use proptest::prelude::*;
use squares_types::{BoardStatus, Game, LedgerKind, Period, ScorePair};

use crate::mocks::{
    claim_range, fill_with_axis, fixed_axis, free_board, go_live, paid_board, test_engine,
};
use crate::store::BoardStore;

fn scores_through_final(game: &mut Game) {
    game.quarter = 4;
    game.is_over = true;
    game.home_score = 24;
    game.away_score = 17;
    game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
    game.period_scores.insert(Period::Q2, ScorePair::new(10, 14));
    game.period_scores.insert(Period::Q3, ScorePair::new(17, 14));
}

#[tokio::test]
async fn scenario_a_resolves_to_square_37() {
    let (engine, _clock) = test_engine(1);
    let board = fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
    let squares = engine.squares("b1").unwrap();
    assert_eq!(board.status, BoardStatus::Full);
    assert_eq!(squares[13].value.as_deref(), Some("37"));

    go_live(&engine, "g1", |game| {
        game.quarter = 2;
        game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
    })
    .await;

    let record = engine.winner("b1", Period::Q1).unwrap();
    assert!(record.assigned);
    assert_eq!(record.winning_square_value.as_deref(), Some("37"));
    assert_eq!(record.winning_index, Some(13));
    assert_eq!(record.winner.as_deref(), Some("user13"));

    let summary = engine.winner_summary("b1", Period::Q1).unwrap().unwrap();
    assert_eq!(summary.winning_index, 13);
    assert_eq!((summary.home_score, summary.away_score), (7, 13));
}

#[tokio::test]
async fn scenario_b_empty_board_unfilled_without_refunds() {
    let (engine, _clock) = test_engine(2);
    paid_board(&engine, "b1", "g1", 500);

    for _ in 0..3 {
        let report = go_live(&engine, "g1", |_| {}).await;
        assert!(report.failures.is_empty());
    }
    let first = engine.on_game_live("b1").await.unwrap();
    assert!(!first.unfilled);
    assert_eq!(first.refunds_written, 0);

    assert_eq!(engine.board("b1").unwrap().status, BoardStatus::Unfilled);
    assert_eq!(engine.wallet().calls(), 0);
    assert!(engine.store().undelivered(None).unwrap().is_empty());
}

#[tokio::test]
async fn scenario_c_three_refunds_exactly_once() {
    let (engine, _clock) = test_engine(3);
    paid_board(&engine, "b1", "g1", 500);
    claim_range(&engine, "b1", 10..13, &["alice", "bob", "carol"]);

    let report = go_live(&engine, "g1", |_| {}).await;
    assert_eq!(report.unfilled, 1);

    // Replays through every entry point.
    go_live(&engine, "g1", |_| {}).await;
    engine.on_game_updated("g1").await.unwrap();
    engine.on_game_live("b1").await.unwrap();
    engine.reconcile("b1", Period::Q1, "ops").await.unwrap();

    let credits = engine.wallet().credits();
    assert_eq!(credits.len(), 3);
    assert_eq!(engine.wallet().calls(), 3);
    let keys: BTreeSet<_> = credits.iter().map(|c| c.idempotency_key.clone()).collect();
    assert_eq!(
        keys,
        BTreeSet::from([
            "b1_refund_10".to_string(),
            "b1_refund_11".to_string(),
            "b1_refund_12".to_string(),
        ])
    );
    for owner in ["alice", "bob", "carol"] {
        assert_eq!(engine.wallet().balance(owner), 500);
    }
    for key in &keys {
        let entry = engine.store().ledger_entry(key).unwrap().unwrap();
        assert_eq!(entry.transaction.kind, LedgerKind::Refund);
        assert!(entry.delivery.is_delivered());
    }
}

#[tokio::test]
async fn scenario_d_unowned_final_latches_with_zero_payout() {
    let (engine, _clock) = test_engine(4);
    free_board(&engine, "b1", "g1", 2_500);
    engine.store().claim_square("b1", 0, "alice", 0).unwrap();
    engine
        .store()
        .assign_axis("b1", fixed_axis(), true, 0)
        .unwrap();

    // Away 20, home 10 -> "00": row of away 0 is 2, column of home 0 is 9.
    go_live(&engine, "g1", |game| {
        game.is_over = true;
        game.quarter = 4;
        game.home_score = 10;
        game.away_score = 20;
        game.period_scores.insert(Period::Q1, ScorePair::new(10, 20));
        game.period_scores.insert(Period::Q2, ScorePair::new(10, 20));
        game.period_scores.insert(Period::Q3, ScorePair::new(10, 20));
    })
    .await;

    let record = engine.winner("b1", Period::Final).unwrap();
    assert!(record.assigned);
    assert!(record.paid);
    assert_eq!(record.paid_amount, 0);
    assert_eq!(record.winning_index, Some(29));
    assert_eq!(record.winner, None);
    assert!(engine.store().ledger_entry("b1_final_alice").unwrap().is_none());
    assert!(engine.store().undelivered(None).unwrap().is_empty());
    assert_eq!(engine.wallet().calls(), 0);
    assert_eq!(engine.board("b1").unwrap().status, BoardStatus::Closed);
}

#[tokio::test]
async fn full_game_replayed_pays_each_period_once() {
    let (engine, _clock) = test_engine(5);
    fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());

    for _ in 0..4 {
        go_live(&engine, "g1", scores_through_final).await;
    }
    for period in Period::ALL {
        for _ in 0..3 {
            engine.reconcile("b1", period, "ops").await.unwrap();
        }
    }

    let board = engine.board("b1").unwrap();
    assert_eq!(board.status, BoardStatus::Closed);
    let credits = engine.wallet().credits();
    assert_eq!(credits.len(), 4);
    let total: u64 = credits.iter().map(|c| c.amount).sum();
    assert_eq!(total, 4 * 10_000);
    assert!(total <= board.pot());
}

#[tokio::test]
async fn transient_wallet_outage_is_repaired_by_reconcile() {
    let (engine, _clock) = test_engine(6);
    fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
    // Three attempts per delivery; fail them all.
    engine.wallet().fail_next(3);
    go_live(&engine, "g1", |game| {
        game.quarter = 2;
        game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
    })
    .await;

    assert!(engine.winner("b1", Period::Q1).unwrap().paid);
    assert_eq!(engine.wallet().balance("user13"), 0);
    assert_eq!(engine.operator_queue().unwrap().len(), 1);

    let report = engine.reconcile("b1", Period::Q1, "ops").await.unwrap();
    assert!(!report.paid_now);
    assert_eq!(report.credits_delivered, 1);
    assert_eq!(report.credits_outstanding, 0);
    assert_eq!(engine.wallet().balance("user13"), 10_000);
    assert!(engine.operator_queue().unwrap().is_empty());

    let entry = engine.store().ledger_entry("b1_q1_user13").unwrap().unwrap();
    assert_eq!(entry.delivery.attempts, 4);
}

#[derive(Clone, Debug)]
enum Step {
    Feed,
    Reconcile(usize),
    Deliver,
    Live,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Feed),
        (0usize..4).prop_map(Step::Reconcile),
        Just(Step::Deliver),
        Just(Step::Live),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_replay_order_converges(steps in prop::collection::vec(step(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (engine, _clock) = test_engine(7);
            fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
            let mut game = Game::new("g1");
            game.is_live = true;
            scores_through_final(&mut game);
            engine.store().put_game(game).unwrap();

            for step in &steps {
                match step {
                    Step::Feed => {
                        engine.on_game_updated("g1").await.unwrap();
                    }
                    Step::Reconcile(i) => {
                        engine.reconcile("b1", Period::ALL[*i], "ops").await.unwrap();
                    }
                    Step::Deliver => {
                        engine.deliver_pending(None).await.unwrap();
                    }
                    Step::Live => {
                        engine.on_game_live("b1").await.unwrap();
                    }
                }
            }
            // Whatever ran before, one more full pass finishes the job.
            engine.on_game_updated("g1").await.unwrap();

            let board = engine.board("b1").unwrap();
            assert_eq!(board.status, BoardStatus::Closed);
            for period in Period::ALL {
                let record = board.winner(period);
                assert!(record.assigned && record.paid);
                assert_eq!(record.paid_amount, 10_000);
            }
            assert_eq!(engine.wallet().credits().len(), 4);
            assert_eq!(engine.wallet().calls(), 4);
        });
    }
}
