use serde::{Deserialize, Serialize};

use crate::board::{BoardId, GameId, OwnerId};
use crate::game::{Period, ScorePair};

/// Per-board, per-period outcome.
///
/// `assigned` and `paid` are one-way latches. Once set they are never cleared,
/// and they alone decide whether resolution or settlement still has work to do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    pub assigned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_index: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_square_value: Option<String>,
    /// Owner of the winning square, if anyone claimed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<OwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<u64>,
    pub paid: bool,
    #[serde(default)]
    pub paid_amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<u64>,
}

/// Outcome computed by the resolver, applied under the `assigned` latch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub winning_index: u8,
    pub winning_square_value: String,
    pub winner: Option<OwnerId>,
    pub score: ScorePair,
    pub assigned_at: u64,
}

impl Assignment {
    pub fn apply(&self, record: &mut WinnerRecord) {
        record.assigned = true;
        record.winning_index = Some(self.winning_index);
        record.winning_square_value = Some(self.winning_square_value.clone());
        record.winner = self.winner.clone();
        record.assigned_at = Some(self.assigned_at);
    }

    pub fn summary(&self, board_id: &str, game_id: &str, period: Period) -> WinnerSummary {
        WinnerSummary {
            board_id: board_id.to_string(),
            game_id: game_id.to_string(),
            period,
            winning_index: self.winning_index,
            winning_square_value: self.winning_square_value.clone(),
            winner: self.winner.clone(),
            home_score: self.score.home,
            away_score: self.score.away,
            assigned_at: self.assigned_at,
        }
    }
}

/// Read-only public record emitted when a period is assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerSummary {
    pub board_id: BoardId,
    pub game_id: GameId,
    pub period: Period,
    pub winning_index: u8,
    pub winning_square_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<OwnerId>,
    pub home_score: u32,
    pub away_score: u32,
    pub assigned_at: u64,
}

/// Per-user win document, stored at [`win_record_id`] under the owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRecord {
    pub id: String,
    pub owner: OwnerId,
    pub board_id: BoardId,
    pub game_id: GameId,
    pub period: Period,
    pub winning_index: u8,
    pub winning_square_value: String,
    pub amount: u64,
    pub won_at: u64,
}

pub fn win_record_id(board_id: &str, period: Period) -> String {
    format!("{board_id}_{period}")
}

/// Result of a compare-and-set on a latch or status.
///
/// `AlreadyProcessed` is success: the work was done by an earlier call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Latch<T> {
    Applied(T),
    AlreadyProcessed(T),
}

impl<T> Latch<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Latch::Applied(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Latch::Applied(value) | Latch::AlreadyProcessed(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Latch::Applied(value) | Latch::AlreadyProcessed(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Latch<U> {
        match self {
            Latch::Applied(value) => Latch::Applied(f(value)),
            Latch::AlreadyProcessed(value) => Latch::AlreadyProcessed(f(value)),
        }
    }
}
