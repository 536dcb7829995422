//! Common types for the squares board engine.
//!
//! Everything here is plain data plus pure functions over it. Storage,
//! randomness, time and money movement live in `squares-execution`.

pub mod api;
pub mod board;
pub mod error;
pub mod game;
pub mod ledger;
pub mod winner;

pub use board::{
    row_col, square_id, square_value, validate_index, AxisDigits, AxisError, Board, BoardId,
    BoardStatus, GameId, OwnerId, Square, GRID_SIZE, SQUARE_COUNT,
};
pub use api::{
    BoardFailure, ClaimSquareRequest, CreateBoard, DeliveryReport, ErrorResponse,
    GameUpdateReport, ReconcileReport,
};
pub use error::EngineError;
pub use game::{Game, Period, ScorePair};
pub use ledger::{
    refund_transactions, refund_tx_id, settlement_tx_id, AuditAction, AuditEntry, Delivery,
    DeliveryStatus, LedgerEntry, LedgerKind, LedgerTransaction, OperatorItem,
};
pub use winner::{win_record_id, Assignment, Latch, WinRecord, WinnerRecord, WinnerSummary};
