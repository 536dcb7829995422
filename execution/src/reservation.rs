use squares_types::{validate_index, EngineError, Square};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::store::BoardStore;
use crate::wallet::Wallet;

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Claim one square for `owner_id`.
    ///
    /// The store performs the existence check and insert as one conditional
    /// write, so of two racing claims for the same index exactly one wins and
    /// the other gets `Conflict`. The claim that completes the board runs the
    /// fill trigger before returning.
    pub fn claim_square(
        &self,
        board_id: &str,
        index: u16,
        owner_id: &str,
    ) -> Result<Square, EngineError> {
        let index = validate_index(index)
            .ok_or_else(|| EngineError::InvalidInput(format!("square index {index} out of range")))?;
        if owner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("owner id is empty".to_string()));
        }

        let (mut square, board) = self
            .store
            .claim_square(board_id, index, owner_id, self.now())?;
        debug!(
            board_id,
            index,
            owner = owner_id,
            claimed = board.claimed_count(),
            "square claimed"
        );

        if board.is_full() {
            match self.run_fill_trigger(board_id, false) {
                Ok(latch) => {
                    if let Some(axis) = latch.get().axis {
                        square.value = Some(axis.square_value(index));
                    }
                }
                // The claim stands. Reconciliation retries the fill.
                Err(err) => warn!(board_id, error = %err, "fill trigger failed"),
            }
        }
        Ok(square)
    }
}
