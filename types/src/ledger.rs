//! Ledger transactions, their delivery state, and the operator queue.
//!
//! Transactions are written alongside the latch that produced them and are
//! delivered to the wallet afterwards. Ids are derived from the event that
//! caused the credit, so a retried write collides instead of duplicating.

use serde::{Deserialize, Serialize};

use crate::board::{Board, BoardId, OwnerId, Square};
use crate::game::Period;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Winnings,
    Refund,
}

/// Immutable credit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: String,
    pub owner: OwnerId,
    /// Amount in cents.
    pub amount: u64,
    pub kind: LedgerKind,
    pub reason: String,
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_index: Option<u8>,
    pub created_at: u64,
}

impl LedgerTransaction {
    pub fn winnings(board: &Board, period: Period, owner: &str, amount: u64, now_ms: u64) -> Self {
        Self {
            id: settlement_tx_id(&board.id, period, owner),
            owner: owner.to_string(),
            amount,
            kind: LedgerKind::Winnings,
            reason: format!(
                "{} winnings for board {} (game {})",
                period.label(),
                board.id,
                board.game_id
            ),
            board_id: board.id.clone(),
            period: Some(period),
            square_index: None,
            created_at: now_ms,
        }
    }

    pub fn refund(board: &Board, square: &Square, now_ms: u64) -> Self {
        Self {
            id: refund_tx_id(&board.id, square.index),
            owner: square.owner.clone(),
            amount: board.entry_fee,
            kind: LedgerKind::Refund,
            reason: format!(
                "refund for square {} on unfilled board {} (game {})",
                square.index, board.id, board.game_id
            ),
            board_id: board.id.clone(),
            period: None,
            square_index: Some(square.index),
            created_at: now_ms,
        }
    }
}

pub fn settlement_tx_id(board_id: &str, period: Period, owner: &str) -> String {
    format!("{board_id}_{period}_{owner}")
}

pub fn refund_tx_id(board_id: &str, index: u8) -> String {
    format!("{board_id}_refund_{index}")
}

/// Refund transactions owed for an unfilled board: one per claimed square.
///
/// Free boards owe nothing.
pub fn refund_transactions(board: &Board, squares: &[Square], now_ms: u64) -> Vec<LedgerTransaction> {
    if board.entry_fee == 0 {
        return Vec::new();
    }
    squares
        .iter()
        .map(|square| LedgerTransaction::refund(board, square, now_ms))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    /// Retries exhausted or rejected; waiting in the operator queue.
    Escalated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<u64>,
}

impl Delivery {
    pub fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            delivered_at: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub transaction: LedgerTransaction,
    pub delivery: Delivery,
}

impl LedgerEntry {
    pub fn new(transaction: LedgerTransaction) -> Self {
        Self {
            transaction,
            delivery: Delivery::pending(),
        }
    }
}

/// Money owed that the wallet would not accept. Keyed by transaction id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorItem {
    pub tx_id: String,
    pub owner: OwnerId,
    pub amount: u64,
    pub board_id: BoardId,
    pub reason: String,
    pub last_error: String,
    pub attempts: u32,
    pub queued_at: u64,
}

impl OperatorItem {
    pub fn from_entry(entry: &LedgerEntry, last_error: String, now_ms: u64) -> Self {
        Self {
            tx_id: entry.transaction.id.clone(),
            owner: entry.transaction.owner.clone(),
            amount: entry.transaction.amount,
            board_id: entry.transaction.board_id.clone(),
            reason: entry.transaction.reason.clone(),
            last_error,
            attempts: entry.delivery.attempts,
            queued_at: now_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Reconcile,
    ForceFill,
}

/// Record of a privileged call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: AuditAction,
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    pub actor: String,
    pub at: u64,
    pub outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(index: u8, owner: &str) -> Square {
        Square {
            board_id: "b1".to_string(),
            index,
            owner: owner.to_string(),
            value: None,
            claimed_at: 0,
        }
    }

    #[test]
    fn ids_collide_on_retry() {
        assert_eq!(settlement_tx_id("b1", Period::Q1, "alice"), "b1_q1_alice");
        assert_eq!(refund_tx_id("b1", 42), "b1_refund_42");
    }

    #[test]
    fn refunds_one_per_square() {
        let board = Board::new("b1", "g1", 500, 10_000, 0);
        let squares = vec![square(3, "alice"), square(4, "alice"), square(90, "bob")];
        let refunds = refund_transactions(&board, &squares, 9);
        assert_eq!(refunds.len(), 3);
        assert!(refunds.iter().all(|tx| tx.amount == 500 && tx.kind == LedgerKind::Refund));
        let ids: std::collections::BTreeSet<_> = refunds.iter().map(|tx| tx.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn free_boards_owe_no_refunds() {
        let board = Board::new("b1", "g1", 0, 2_500, 0);
        assert!(refund_transactions(&board, &[square(1, "alice")], 0).is_empty());
    }
}
