//! Settlement engine and ledger delivery.
//!
//! Settlement sets the `paid` latch and writes the winner's credit and win
//! record in the same store step. Money moves afterwards: pending ledger
//! entries are pushed to the wallet with retry, and anything the wallet will
//! not take ends up in the operator queue. Nothing is dropped.
//!
//! Feed-driven calls only push entries that were never attempted. Escalated
//! entries are retried by the delivery sweep and by reconciliation.

use squares_types::{
    win_record_id, BoardStatus, Delivery, DeliveryReport, DeliveryStatus, EngineError,
    LedgerEntry, LedgerTransaction, Latch, OperatorItem, Period, WinRecord, WinnerRecord,
};
use tracing::{error, info};

use crate::engine::Engine;
use crate::store::{BoardStore, Payout};
use crate::wallet::{credit_with_backoff, CreditRequest, Wallet};

/// What happened to one ledger entry on a delivery attempt.
enum Outcome {
    Delivered,
    Escalated,
    /// Failed here, but another task delivered it first.
    Superseded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub record: Latch<WinnerRecord>,
    pub delivery: DeliveryReport,
    /// The board moved `active -> closed` in this call.
    pub closed: bool,
}

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Pay out an assigned period, at most once.
    ///
    /// With no owner (or a zero prize) the latch is set with `paidAmount = 0`
    /// and no ledger entry. After the Final is paid the board closes.
    ///
    /// The period must be assigned before it can be settled. The store checks
    /// the payout against the assigned winner when it sets the latch.
    pub async fn settle_period(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Settlement, EngineError> {
        let board = self.require_board(board_id)?;
        if !board.status.accepts_settlement() {
            return Err(EngineError::InvalidState {
                board_id: board_id.to_string(),
                status: board.status,
                expected: "active or closed",
            });
        }

        let now = self.now();
        let record = board.winner(period);
        if !record.assigned {
            return Err(EngineError::InvalidInput(format!(
                "{period} is not assigned on board {board_id}"
            )));
        }
        let payout = match (&record.winner, record.winning_index) {
            (Some(owner), Some(winning_index)) if board.payout_per_period > 0 => {
                let amount = board.payout_per_period;
                let tx = LedgerTransaction::winnings(&board, period, owner, amount, now);
                let win = WinRecord {
                    id: win_record_id(board_id, period),
                    owner: owner.clone(),
                    board_id: board_id.to_string(),
                    game_id: board.game_id.clone(),
                    period,
                    winning_index,
                    winning_square_value: record.winning_square_value.clone().unwrap_or_default(),
                    amount,
                    won_at: now,
                };
                Payout {
                    winner: record.winner.clone(),
                    amount,
                    credit: Some((tx, win)),
                    paid_at: now,
                }
            }
            _ => Payout {
                winner: record.winner.clone(),
                amount: 0,
                credit: None,
                paid_at: now,
            },
        };

        let latch = self.store.latch_paid(board_id, period, &payout)?;
        if latch.is_applied() {
            info!(
                board_id,
                %period,
                winner = ?latch.get().winner,
                amount = latch.get().paid_amount,
                "period settled"
            );
        }

        let delivery = self.deliver_new(board_id).await?;

        let mut closed = false;
        if period == Period::Final && latch.get().paid {
            let board = self.require_board(board_id)?;
            if board.status == BoardStatus::Active {
                closed = self
                    .store
                    .transition(board_id, BoardStatus::Active, BoardStatus::Closed, self.now())?
                    .is_applied();
                if closed {
                    info!(board_id, "board closed");
                }
            }
        }

        Ok(Settlement {
            record: latch,
            delivery,
            closed,
        })
    }

    /// Push undelivered ledger entries to the wallet, optionally for one board.
    /// Escalated entries are retried too.
    pub async fn deliver_pending(&self, board_id: Option<&str>) -> Result<DeliveryReport, EngineError> {
        let entries = self.store.undelivered(board_id)?;
        self.deliver_all(entries).await
    }

    /// Push a board's ledger entries that have never been attempted.
    pub(crate) async fn deliver_new(&self, board_id: &str) -> Result<DeliveryReport, EngineError> {
        let entries = self
            .store
            .undelivered(Some(board_id))?
            .into_iter()
            .filter(|entry| entry.delivery.status == DeliveryStatus::Pending)
            .collect();
        self.deliver_all(entries).await
    }

    async fn deliver_all(&self, entries: Vec<LedgerEntry>) -> Result<DeliveryReport, EngineError> {
        let mut report = DeliveryReport::default();
        for entry in entries {
            match self.deliver(entry).await? {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Escalated => report.escalated += 1,
                Outcome::Superseded => {}
            }
        }
        Ok(report)
    }

    async fn deliver(&self, entry: LedgerEntry) -> Result<Outcome, EngineError> {
        let tx_id = entry.transaction.id.clone();
        let request = CreditRequest::from(&entry.transaction);
        let attempt = credit_with_backoff(&*self.wallet, &request, &self.config.retry).await;
        let attempts = entry.delivery.attempts.saturating_add(attempt.attempts);

        match attempt.result {
            Ok(()) => {
                let recorded = self.store.record_delivery(
                    &tx_id,
                    Delivery {
                        status: DeliveryStatus::Delivered,
                        attempts,
                        last_error: None,
                        delivered_at: Some(self.now()),
                    },
                )?;
                self.store.clear_operator(&tx_id)?;
                if !recorded {
                    return Ok(Outcome::Superseded);
                }
                info!(
                    %tx_id,
                    owner = %entry.transaction.owner,
                    amount = entry.transaction.amount,
                    kind = ?entry.transaction.kind,
                    "credit delivered"
                );
                Ok(Outcome::Delivered)
            }
            Err(err) => {
                let delivery = Delivery {
                    status: DeliveryStatus::Escalated,
                    attempts,
                    last_error: Some(err.to_string()),
                    delivered_at: None,
                };
                let escalated = LedgerEntry {
                    transaction: entry.transaction,
                    delivery,
                };
                let item = OperatorItem::from_entry(&escalated, err.to_string(), self.now());
                // A concurrent delivery may have landed while this one failed.
                if !self
                    .store
                    .escalate_delivery(&tx_id, escalated.delivery.clone(), item)?
                {
                    info!(%tx_id, error = %err, "credit already delivered elsewhere");
                    return Ok(Outcome::Superseded);
                }
                error!(
                    %tx_id,
                    owner = %escalated.transaction.owner,
                    amount = escalated.transaction.amount,
                    attempts,
                    error = %err,
                    "credit escalated to operator queue"
                );
                Ok(Outcome::Escalated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{fill_with_axis, fixed_axis, go_live, test_engine};
    use squares_types::ScorePair;

    #[tokio::test]
    async fn winner_paid_once_and_win_recorded() {
        let (engine, _clock) = test_engine(1);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        go_live(&engine, "g1", |game| {
            game.quarter = 2;
            game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
        })
        .await;

        let record = engine.winner("b1", Period::Q1).unwrap();
        assert!(record.paid);
        assert_eq!(record.paid_amount, 10_000);
        assert_eq!(engine.wallet().balance("user13"), 10_000);

        let again = engine.settle_period("b1", Period::Q1).await.unwrap();
        assert!(!again.record.is_applied());
        assert_eq!(again.delivery, DeliveryReport::default());
        assert_eq!(engine.wallet().balance("user13"), 10_000);

        let wins = engine.wins_for("user13").unwrap();
        assert_eq!(wins.len(), 1);
        assert_eq!(wins[0].id, "b1_q1");
        assert_eq!(wins[0].amount, 10_000);
    }

    #[tokio::test]
    async fn rejected_credit_lands_in_operator_queue() {
        let (engine, _clock) = test_engine(2);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        engine.wallet().reject_owner("user13");
        go_live(&engine, "g1", |game| {
            game.quarter = 2;
            game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
        })
        .await;

        assert!(engine.winner("b1", Period::Q1).unwrap().paid);
        let queue = engine.operator_queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].tx_id, "b1_q1_user13");
        assert_eq!(queue[0].amount, 10_000);

        engine.wallet().allow_owner("user13");
        let report = engine.deliver_pending(None).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(engine.operator_queue().unwrap().is_empty());
        assert_eq!(engine.wallet().balance("user13"), 10_000);
    }

    #[tokio::test]
    async fn final_closes_board() {
        let (engine, _clock) = test_engine(3);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        go_live(&engine, "g1", |game| {
            game.is_over = true;
            game.quarter = 4;
            game.home_score = 27;
            game.away_score = 20;
            game.period_scores.insert(Period::Q1, ScorePair::new(7, 3));
            game.period_scores.insert(Period::Q2, ScorePair::new(14, 10));
            game.period_scores.insert(Period::Q3, ScorePair::new(21, 17));
        })
        .await;

        let board = engine.board("b1").unwrap();
        assert_eq!(board.status, BoardStatus::Closed);
        assert!(Period::ALL.iter().all(|p| board.winner(*p).paid));
        // Closed boards still answer reconciliation.
        let again = engine.settle_period("b1", Period::Q2).await.unwrap();
        assert!(!again.record.is_applied());
        assert!(!again.closed);
    }

    #[tokio::test]
    async fn settling_before_resolution_is_refused() {
        let (engine, _clock) = test_engine(4);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        go_live(&engine, "g1", |_| {}).await;
        let mut game = engine.game("g1").unwrap();
        game.quarter = 2;
        game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
        engine.store().put_game(game).unwrap();

        assert!(matches!(
            engine.settle_period("b1", Period::Q1).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(!engine.winner("b1", Period::Q1).unwrap().paid);

        engine.resolve_period("b1", Period::Q1).unwrap();
        let settled = engine.settle_period("b1", Period::Q1).await.unwrap();
        assert!(settled.record.is_applied());
        assert_eq!(settled.record.get().paid_amount, 10_000);
        assert_eq!(engine.wallet().balance("user13"), 10_000);
    }

    #[tokio::test]
    async fn feed_replays_leave_escalated_credits_to_the_sweep() {
        let (engine, _clock) = test_engine(5);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        engine.wallet().reject_owner("user13");
        for _ in 0..3 {
            go_live(&engine, "g1", |game| {
                game.quarter = 2;
                game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
            })
            .await;
        }
        // Rejections are not retried, and replays do not touch the escalated entry.
        assert_eq!(engine.wallet().calls(), 1);
        assert_eq!(engine.operator_queue().unwrap().len(), 1);

        engine.wallet().allow_owner("user13");
        let report = engine.deliver_pending(Some("b1")).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(engine.wallet().calls(), 2);
        assert!(engine.operator_queue().unwrap().is_empty());
    }
}
