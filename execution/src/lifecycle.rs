//! Game lifecycle handler: what happens to a board when its game goes live.

use squares_types::{
    refund_transactions, Board, BoardStatus, DeliveryReport, EngineError,
};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::store::BoardStore;
use crate::wallet::Wallet;

/// Status races (a claim filling the board while the game goes live) settle
/// within a few rounds, one of which may be a late fill; this bounds the
/// re-read loop.
const MAX_STATUS_ROUNDS: usize = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveOutcome {
    /// `full -> active` happened in this call.
    pub activated: bool,
    /// `open -> unfilled` happened in this call.
    pub unfilled: bool,
    /// Refund transactions newly written in this call.
    pub refunds_written: usize,
    pub delivery: DeliveryReport,
}

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Lock or refund a board whose game is live.
    ///
    /// A full board becomes active. An open board with all 100 squares sold
    /// gets its digits first and then becomes active. Any other open board
    /// becomes unfilled and every claimed square is refunded. Replays are harmless: an active or closed
    /// board is left alone, and an unfilled board only pushes refunds that were
    /// never attempted. Escalated refunds wait for the sweep or reconciliation.
    pub async fn on_game_live(&self, board_id: &str) -> Result<LiveOutcome, EngineError> {
        let mut last_err = None;
        for _ in 0..MAX_STATUS_ROUNDS {
            let board = self.require_board(board_id)?;
            let next = match board.status {
                BoardStatus::Full => BoardStatus::Active,
                // Every square sold but the fill never ran: draw now and lock.
                BoardStatus::Open if board.is_full() => {
                    self.run_fill_trigger(board_id, false)?;
                    continue;
                }
                BoardStatus::Open => BoardStatus::Unfilled,
                BoardStatus::Unfilled => {
                    return self.refund_unfilled(&board).await;
                }
                BoardStatus::Active | BoardStatus::Closed => {
                    debug!(board_id, status = %board.status, "board already locked");
                    return Ok(LiveOutcome::default());
                }
            };

            match self
                .store
                .transition(board_id, board.status, next, self.now())
            {
                Ok(latch) => {
                    let applied = latch.is_applied();
                    let board = latch.into_inner();
                    if next == BoardStatus::Active {
                        if applied {
                            info!(board_id, "board active");
                        }
                        return Ok(LiveOutcome {
                            activated: applied,
                            ..Default::default()
                        });
                    }
                    if applied {
                        info!(
                            board_id,
                            claimed = board.claimed_count(),
                            "board unfilled at kickoff"
                        );
                    }
                    let mut outcome = self.refund_unfilled(&board).await?;
                    outcome.unfilled = applied;
                    return Ok(outcome);
                }
                // Someone moved the board first. Re-read and go again.
                Err(err @ EngineError::InvalidState { .. }) => {
                    debug!(board_id, error = %err, "status moved underneath, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::board_not_found(board_id)))
    }

    /// Write any missing refund transactions for an unfilled board and deliver
    /// the ones not yet attempted.
    ///
    /// Refunds are re-derived from the square set, which is frozen once the
    /// board leaves `open`. Ids are per square, so rewrites collide.
    pub(crate) async fn refund_unfilled(&self, board: &Board) -> Result<LiveOutcome, EngineError> {
        if board.status != BoardStatus::Unfilled {
            return Err(EngineError::InvalidState {
                board_id: board.id.clone(),
                status: board.status,
                expected: "unfilled",
            });
        }
        let squares = self.store.squares(&board.id)?;
        let mut refunds_written = 0;
        for tx in refund_transactions(board, &squares, self.now()) {
            if self.store.insert_ledger(tx)?.is_applied() {
                refunds_written += 1;
            }
        }
        if refunds_written > 0 {
            info!(
                board_id = %board.id,
                refunds = refunds_written,
                entry_fee = board.entry_fee,
                "refunds written"
            );
        }
        let delivery = self.deliver_new(&board.id).await?;
        Ok(LiveOutcome {
            refunds_written,
            delivery,
            ..Default::default()
        })
    }
}
