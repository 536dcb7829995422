//! Board, square and axis-digit types.
//!
//! A board is a 10x10 grid. Square `index` maps to `row = index / 10` and
//! `col = index % 10`. Rows carry the away team's axis digits and columns carry
//! the home team's, so a square's value is `away[row]` followed by `home[col]`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::game::Period;
use crate::winner::WinnerRecord;

/// Number of rows (and columns) on a board.
pub const GRID_SIZE: u8 = 10;

/// Number of squares on a board.
pub const SQUARE_COUNT: u8 = GRID_SIZE * GRID_SIZE;

pub type BoardId = String;
pub type GameId = String;
pub type OwnerId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardStatus {
    /// Accepting claims.
    Open,
    /// All squares claimed (or force-filled), axis digits assigned.
    Full,
    /// Game is live, grid locked.
    Active,
    /// Game went live before the board filled. Terminal.
    Unfilled,
    /// Final period settled. Terminal.
    Closed,
}

impl BoardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardStatus::Open => "open",
            BoardStatus::Full => "full",
            BoardStatus::Active => "active",
            BoardStatus::Unfilled => "unfilled",
            BoardStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BoardStatus::Unfilled | BoardStatus::Closed)
    }

    /// Whether `self -> next` is an edge of the board state machine.
    pub fn can_transition_to(&self, next: BoardStatus) -> bool {
        matches!(
            (self, next),
            (BoardStatus::Open, BoardStatus::Full)
                | (BoardStatus::Full, BoardStatus::Active)
                | (BoardStatus::Open, BoardStatus::Unfilled)
                | (BoardStatus::Active, BoardStatus::Closed)
        )
    }

    /// Whether winners may be resolved and settled in this status.
    pub fn accepts_settlement(&self) -> bool {
        matches!(self, BoardStatus::Active | BoardStatus::Closed)
    }
}

impl fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum AxisError {
    #[error("{axis} axis is not a permutation of 0-9: {digits:?}")]
    NotPermutation { axis: &'static str, digits: [u8; 10] },
}

/// The two axis permutations assigned once a board fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisDigits {
    home_digits: [u8; 10],
    away_digits: [u8; 10],
}

impl AxisDigits {
    pub fn new(home_digits: [u8; 10], away_digits: [u8; 10]) -> Result<Self, AxisError> {
        if !is_permutation(&home_digits) {
            return Err(AxisError::NotPermutation {
                axis: "home",
                digits: home_digits,
            });
        }
        if !is_permutation(&away_digits) {
            return Err(AxisError::NotPermutation {
                axis: "away",
                digits: away_digits,
            });
        }
        Ok(Self {
            home_digits,
            away_digits,
        })
    }

    pub fn home(&self) -> &[u8; 10] {
        &self.home_digits
    }

    pub fn away(&self) -> &[u8; 10] {
        &self.away_digits
    }

    /// Value of the square at `index`: away digit of its row, then home digit of its column.
    pub fn square_value(&self, index: u8) -> String {
        let (row, col) = row_col(index);
        square_value(
            self.away_digits[row as usize],
            self.home_digits[col as usize],
        )
    }

    /// Index of the square whose value is `away_digit ++ home_digit`.
    pub fn index_of(&self, away_digit: u8, home_digit: u8) -> Option<u8> {
        let row = self.away_digits.iter().position(|d| *d == away_digit)?;
        let col = self.home_digits.iter().position(|d| *d == home_digit)?;
        Some(row as u8 * GRID_SIZE + col as u8)
    }
}

fn is_permutation(digits: &[u8; 10]) -> bool {
    let mut seen = [false; 10];
    for digit in digits {
        let Some(slot) = seen.get_mut(*digit as usize) else {
            return false;
        };
        if *slot {
            return false;
        }
        *slot = true;
    }
    true
}

pub fn row_col(index: u8) -> (u8, u8) {
    (index / GRID_SIZE, index % GRID_SIZE)
}

pub fn square_value(away_digit: u8, home_digit: u8) -> String {
    format!("{away_digit}{home_digit}")
}

pub fn validate_index(index: u16) -> Option<u8> {
    if index < SQUARE_COUNT as u16 {
        Some(index as u8)
    } else {
        None
    }
}

/// Persisted board document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: BoardId,
    pub game_id: GameId,
    /// Entry fee per square in cents. Zero marks a free sweepstakes board.
    pub entry_fee: u64,
    /// Prize paid to each period's winner, in cents. Fixed at creation.
    pub payout_per_period: u64,
    pub status: BoardStatus,
    pub claimed_indexes: BTreeSet<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<AxisDigits>,
    #[serde(default)]
    pub winners: BTreeMap<Period, WinnerRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Board {
    pub fn new(
        id: impl Into<BoardId>,
        game_id: impl Into<GameId>,
        entry_fee: u64,
        payout_per_period: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            game_id: game_id.into(),
            entry_fee,
            payout_per_period,
            status: BoardStatus::Open,
            claimed_indexes: BTreeSet::new(),
            axis: None,
            winners: BTreeMap::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_sweepstakes(&self) -> bool {
        self.entry_fee == 0
    }

    /// Entry fee times the number of squares.
    pub fn pot(&self) -> u64 {
        self.entry_fee.saturating_mul(SQUARE_COUNT as u64)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed_indexes.len()
    }

    pub fn is_full(&self) -> bool {
        self.claimed_indexes.len() >= SQUARE_COUNT as usize
    }

    pub fn winner(&self, period: Period) -> WinnerRecord {
        self.winners.get(&period).cloned().unwrap_or_default()
    }
}

/// Persisted square document. Exactly one exists per `(board_id, index)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Square {
    pub board_id: BoardId,
    pub index: u8,
    pub owner: OwnerId,
    /// `None` until the board's axis digits exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub claimed_at: u64,
}

impl Square {
    pub fn id(&self) -> String {
        square_id(&self.board_id, self.index)
    }

    pub fn row_col(&self) -> (u8, u8) {
        row_col(self.index)
    }
}

pub fn square_id(board_id: &str, index: u8) -> String {
    format!("{board_id}_{index}")
}
