use thiserror::Error as ThisError;

use crate::board::{AxisError, BoardStatus};

/// Errors surfaced by the board engine.
///
/// A latch that is already set is not an error; see [`crate::Latch`].
#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
pub enum EngineError {
    /// Square already taken. Callers should pick another square.
    #[error("square {index} on board {board_id} is already claimed")]
    Conflict { board_id: String, index: u8 },

    /// Board is in the wrong status for the operation. Not retried.
    #[error("board {board_id} is {status}, expected {expected}")]
    InvalidState {
        board_id: String,
        status: BoardStatus,
        expected: &'static str,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Feed state does not line up with board state. Deferred to reconciliation.
    #[error("feed inconsistency on board {board_id}: {reason}")]
    ExternalFeedInconsistency { board_id: String, reason: String },

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn board_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: "board",
            id: id.to_string(),
        }
    }

    pub fn game_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: "game",
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Conflict { .. } => "SQUARE_TAKEN",
            EngineError::InvalidState { .. } => "INVALID_STATE",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::AlreadyExists { .. } => "ALREADY_EXISTS",
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::ExternalFeedInconsistency { .. } => "FEED_INCONSISTENCY",
            EngineError::Wallet(_) => "WALLET_ERROR",
            EngineError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<AxisError> for EngineError {
    fn from(value: AxisError) -> Self {
        EngineError::InvalidInput(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_board() {
        let err = EngineError::InvalidState {
            board_id: "b1".to_string(),
            status: BoardStatus::Full,
            expected: "open",
        };
        assert_eq!(err.to_string(), "board b1 is full, expected open");
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(
            EngineError::board_not_found("b9").to_string(),
            "board b9 not found"
        );
    }
}
