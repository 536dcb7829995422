//! Wire types shared by the engine and the HTTP service.

use serde::{Deserialize, Serialize};

use crate::board::{BoardId, GameId, OwnerId};
use crate::game::Period;
use crate::winner::WinnerRecord;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBoard {
    pub id: BoardId,
    pub game_id: GameId,
    /// Entry fee per square in cents.
    pub entry_fee: u64,
    /// Per-period prize for free boards, in cents. Ignored for paid boards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweepstakes_prize: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSquareRequest {
    pub index: u16,
    pub owner_id: OwnerId,
}

/// What a reconciliation run found and did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub board_id: BoardId,
    pub period: Period,
    /// Winner record after the run. `None` for unfilled boards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<WinnerRecord>,
    pub assigned_now: bool,
    pub paid_now: bool,
    pub credits_delivered: usize,
    pub credits_outstanding: usize,
}

/// Outcome of a delivery pass over pending ledger entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivered: usize,
    pub escalated: usize,
}

/// A board that could not be processed for a game update. Other boards of the
/// same game are unaffected; reconciliation picks these up later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardFailure {
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    pub code: String,
    pub message: String,
}

/// What one pass over a game's boards changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdateReport {
    pub game_id: GameId,
    pub boards: usize,
    pub activated: usize,
    pub unfilled: usize,
    /// Periods newly assigned during this pass.
    pub resolved: usize,
    /// Periods newly paid during this pass.
    pub paid: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<BoardFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
