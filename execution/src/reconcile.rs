//! Reconciliation: the single privileged repair entry point.
//!
//! Re-derives a (board, period) outcome from stored state. The latches decide
//! what is left to do, so running it after zero, one or many earlier triggers
//! ends in the same place. Every call is audited.

use squares_types::{
    AuditAction, AuditEntry, Board, BoardStatus, EngineError, Period, ReconcileReport,
};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::store::BoardStore;
use crate::wallet::Wallet;

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    pub async fn reconcile(
        &self,
        board_id: &str,
        period: Period,
        actor: &str,
    ) -> Result<ReconcileReport, EngineError> {
        info!(audit = true, board_id, %period, actor, "reconciliation requested");
        let result = self.reconcile_inner(board_id, period).await;

        let outcome = match &result {
            Ok(report) => format!(
                "assigned_now={} paid_now={} delivered={} outstanding={}",
                report.assigned_now,
                report.paid_now,
                report.credits_delivered,
                report.credits_outstanding
            ),
            Err(err) => format!("error: {err}"),
        };
        info!(audit = true, board_id, %period, actor, %outcome, "reconciliation finished");
        let entry = AuditEntry {
            action: AuditAction::Reconcile,
            board_id: board_id.to_string(),
            period: Some(period),
            actor: actor.to_string(),
            at: self.now(),
            outcome,
        };
        if let Err(err) = self.store.append_audit(entry) {
            warn!(board_id, error = %err, "audit write failed");
        }
        result
    }

    async fn reconcile_inner(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<ReconcileReport, EngineError> {
        let board = self.catch_up(board_id).await?;

        match board.status {
            BoardStatus::Unfilled => {
                let outcome = self.refund_unfilled(&board).await?;
                let retried = self.deliver_pending(Some(board_id)).await?;
                Ok(ReconcileReport {
                    board_id: board_id.to_string(),
                    period,
                    record: None,
                    assigned_now: false,
                    paid_now: false,
                    credits_delivered: outcome.delivery.delivered + retried.delivered,
                    credits_outstanding: self.store.undelivered(Some(board_id))?.len(),
                })
            }
            BoardStatus::Active | BoardStatus::Closed => {
                let assigned = self.resolve_period(board_id, period)?;
                let settled = self.settle_period(board_id, period).await?;
                let retried = self.deliver_pending(Some(board_id)).await?;
                Ok(ReconcileReport {
                    board_id: board_id.to_string(),
                    period,
                    record: Some(settled.record.get().clone()),
                    assigned_now: assigned.is_applied(),
                    paid_now: settled.record.is_applied(),
                    credits_delivered: settled.delivery.delivered + retried.delivered,
                    credits_outstanding: self.store.undelivered(Some(board_id))?.len(),
                })
            }
            BoardStatus::Open | BoardStatus::Full => Err(EngineError::InvalidState {
                board_id: board_id.to_string(),
                status: board.status,
                expected: "active, closed or unfilled",
            }),
        }
    }

    /// Replay the earlier stages a missed trigger would have run: the fill of
    /// a complete board, and the kickoff transition once the game is live.
    async fn catch_up(&self, board_id: &str) -> Result<Board, EngineError> {
        let board = self.require_board(board_id)?;
        if board.status == BoardStatus::Open && board.is_full() {
            self.run_fill_trigger(board_id, false)?;
        }
        if matches!(board.status, BoardStatus::Open | BoardStatus::Full) {
            let game = self.require_game(&board.game_id)?;
            if game.has_started() {
                self.on_game_live(board_id).await?;
            }
        }
        self.require_board(board_id)
    }
}
