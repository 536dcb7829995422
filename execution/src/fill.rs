//! Board fill trigger: the one-time axis digit draw.

use rand::seq::SliceRandom;
use squares_types::{AuditAction, AuditEntry, AxisDigits, Board, EngineError, Latch};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::store::BoardStore;
use crate::wallet::Wallet;

fn identity_digits() -> [u8; 10] {
    std::array::from_fn(|i| i as u8)
}

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Two independent uniform permutations of 0-9, home axis first.
    pub(crate) fn draw_axis(&self) -> Result<AxisDigits, EngineError> {
        let mut rng = self.rng()?;
        let mut home = identity_digits();
        let mut away = identity_digits();
        home.shuffle(&mut *rng);
        away.shuffle(&mut *rng);
        Ok(AxisDigits::new(home, away)?)
    }

    /// Assign axis digits to a board if it has none yet.
    ///
    /// Digits, the `open -> full` transition and every square value are
    /// written in one store step. If digits already exist the stored board is
    /// returned unchanged.
    pub(crate) fn run_fill_trigger(
        &self,
        board_id: &str,
        force: bool,
    ) -> Result<Latch<Board>, EngineError> {
        let board = self.require_board(board_id)?;
        if board.axis.is_some() {
            return Ok(Latch::AlreadyProcessed(board));
        }
        let axis = self.draw_axis()?;
        let latch = self
            .store
            .assign_axis(board_id, axis, force, self.now())?;
        if latch.is_applied() {
            info!(
                board_id,
                claimed = latch.get().claimed_count(),
                home = ?axis.home(),
                away = ?axis.away(),
                forced = force,
                "axis digits assigned"
            );
        }
        Ok(latch)
    }

    /// Operator fill of a free board at cutoff, whatever its claim count.
    pub fn force_fill(&self, board_id: &str, actor: &str) -> Result<Board, EngineError> {
        let board = self.require_board(board_id)?;
        let result = if board.is_sweepstakes() {
            self.run_fill_trigger(board_id, true)
        } else {
            Err(EngineError::InvalidState {
                board_id: board_id.to_string(),
                status: board.status,
                expected: "a free board",
            })
        };

        let outcome = match &result {
            Ok(Latch::Applied(board)) => format!("filled with {} claims", board.claimed_count()),
            Ok(Latch::AlreadyProcessed(_)) => "already filled".to_string(),
            Err(err) => format!("rejected: {err}"),
        };
        info!(audit = true, board_id, actor, %outcome, "force fill");
        let entry = AuditEntry {
            action: AuditAction::ForceFill,
            board_id: board_id.to_string(),
            period: None,
            actor: actor.to_string(),
            at: self.now(),
            outcome,
        };
        if let Err(err) = self.store.append_audit(entry) {
            warn!(board_id, error = %err, "audit write failed");
        }
        result.map(Latch::into_inner)
    }
}
