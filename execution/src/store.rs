//! Board store: the system of record for boards, squares and the ledger.
//!
//! Every mutating method is a single atomic step against current state. Callers
//! never read a board, edit it and write it back; they ask the store to apply a
//! guarded change (test-and-set insert, status compare-and-set, latch set) and
//! the store either applies it whole or reports why it could not.
//!
//! [`Memory`] keeps one lock per board, so work on different boards never
//! contends. The ledger, operator queue and win records have their own locks,
//! always taken after the board lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use squares_types::{
    Assignment, AuditEntry, AxisDigits, Board, BoardStatus, Delivery, DeliveryStatus, EngineError,
    Game, LedgerEntry, LedgerTransaction, Latch, OperatorItem, OwnerId, Period, Square, WinRecord,
    WinnerRecord, WinnerSummary, SQUARE_COUNT,
};

/// Settlement applied under the `paid` latch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payout {
    /// Winner the payout was computed for. Must match the assigned winner.
    pub winner: Option<OwnerId>,
    pub amount: u64,
    /// Credit and win record written together with the latch, if anyone won.
    pub credit: Option<(LedgerTransaction, WinRecord)>,
    pub paid_at: u64,
}

pub trait BoardStore: Send + Sync + 'static {
    /// Feed-side write. The engine itself never calls this.
    fn put_game(&self, game: Game) -> Result<(), EngineError>;
    fn game(&self, id: &str) -> Result<Option<Game>, EngineError>;

    /// Insert a new board. Fails with `AlreadyExists` if the id is taken.
    fn insert_board(&self, board: Board) -> Result<(), EngineError>;
    fn board(&self, id: &str) -> Result<Option<Board>, EngineError>;
    fn boards_for_game(&self, game_id: &str) -> Result<Vec<Board>, EngineError>;
    fn squares(&self, board_id: &str) -> Result<Vec<Square>, EngineError>;

    /// Test-and-set insert of the square at `index`, adding it to the board's
    /// claimed set in the same step. Returns the square and the updated board.
    fn claim_square(
        &self,
        board_id: &str,
        index: u8,
        owner: &str,
        now_ms: u64,
    ) -> Result<(Square, Board), EngineError>;

    /// Store axis digits, move `open -> full` and recompute every square value,
    /// all at once. Without `force` the board must hold 100 claims.
    fn assign_axis(
        &self,
        board_id: &str,
        axis: AxisDigits,
        force: bool,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError>;

    /// Compare-and-set on board status.
    fn transition(
        &self,
        board_id: &str,
        from: BoardStatus,
        to: BoardStatus,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError>;

    /// Set the `assigned` latch for `period` and write its public summary.
    fn latch_assigned(
        &self,
        board_id: &str,
        period: Period,
        assignment: &Assignment,
    ) -> Result<Latch<WinnerRecord>, EngineError>;
    fn winner_summary(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Option<WinnerSummary>, EngineError>;

    /// Set the `paid` latch for `period`, writing the credit and win record
    /// with it. The period must already be assigned to `payout.winner`.
    fn latch_paid(
        &self,
        board_id: &str,
        period: Period,
        payout: &Payout,
    ) -> Result<Latch<WinnerRecord>, EngineError>;

    /// Insert-if-absent by transaction id.
    fn insert_ledger(&self, tx: LedgerTransaction) -> Result<Latch<LedgerEntry>, EngineError>;
    fn ledger_entry(&self, tx_id: &str) -> Result<Option<LedgerEntry>, EngineError>;
    /// Entries not yet delivered, optionally limited to one board.
    fn undelivered(&self, board_id: Option<&str>) -> Result<Vec<LedgerEntry>, EngineError>;
    /// Returns `false` without writing when the entry is already delivered.
    fn record_delivery(&self, tx_id: &str, delivery: Delivery) -> Result<bool, EngineError>;
    /// Record a failed delivery and queue it for an operator in one step.
    /// Refused (returns `false`) once the entry is delivered.
    fn escalate_delivery(
        &self,
        tx_id: &str,
        delivery: Delivery,
        item: OperatorItem,
    ) -> Result<bool, EngineError>;

    fn clear_operator(&self, tx_id: &str) -> Result<(), EngineError>;
    fn operator_queue(&self) -> Result<Vec<OperatorItem>, EngineError>;

    fn wins_for(&self, owner: &str) -> Result<Vec<WinRecord>, EngineError>;

    fn append_audit(&self, entry: AuditEntry) -> Result<(), EngineError>;
    fn audit_log(&self, board_id: &str) -> Result<Vec<AuditEntry>, EngineError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Guard logic shared by every backend
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn check_claim(board: &Board, index: u8, taken: bool) -> Result<(), EngineError> {
    if index >= SQUARE_COUNT {
        return Err(EngineError::InvalidInput(format!(
            "square index {index} out of range"
        )));
    }
    if board.status != BoardStatus::Open {
        return Err(EngineError::InvalidState {
            board_id: board.id.clone(),
            status: board.status,
            expected: "open",
        });
    }
    if taken || board.claimed_indexes.contains(&index) {
        return Err(EngineError::Conflict {
            board_id: board.id.clone(),
            index,
        });
    }
    Ok(())
}

/// Returns `Ok(false)` when digits are already present.
pub(crate) fn check_fill(board: &Board, force: bool) -> Result<bool, EngineError> {
    if board.axis.is_some() {
        return Ok(false);
    }
    if board.status != BoardStatus::Open {
        return Err(EngineError::InvalidState {
            board_id: board.id.clone(),
            status: board.status,
            expected: "open",
        });
    }
    if !force && !board.is_full() {
        return Err(EngineError::InvalidState {
            board_id: board.id.clone(),
            status: board.status,
            expected: "open with every square claimed",
        });
    }
    Ok(true)
}

/// Returns `Ok(false)` when the board is already in `to`.
pub(crate) fn check_transition(
    board: &Board,
    from: BoardStatus,
    to: BoardStatus,
) -> Result<bool, EngineError> {
    if board.status == to {
        return Ok(false);
    }
    if board.status != from || !from.can_transition_to(to) {
        return Err(EngineError::InvalidState {
            board_id: board.id.clone(),
            status: board.status,
            expected: from.as_str(),
        });
    }
    // A sold-out board is filled and activated, never refunded.
    if to == BoardStatus::Unfilled && board.is_full() {
        return Err(EngineError::InvalidState {
            board_id: board.id.clone(),
            status: board.status,
            expected: "open with unsold squares",
        });
    }
    Ok(true)
}

pub(crate) fn check_paid(
    board: &Board,
    period: Period,
    payout: &Payout,
) -> Result<bool, EngineError> {
    let record = board.winner(period);
    if record.paid {
        return Ok(false);
    }
    if !record.assigned {
        return Err(EngineError::InvalidInput(format!(
            "{period} is not assigned on board {}",
            board.id
        )));
    }
    let credited = payout.credit.as_ref().map(|(tx, _)| &tx.owner);
    let credit_mismatch = credited.is_some() && credited != record.winner.as_ref();
    if record.winner != payout.winner || credit_mismatch {
        return Err(EngineError::InvalidInput(format!(
            "payout for {period} on board {} does not match the assigned winner",
            board.id
        )));
    }
    Ok(true)
}

fn ledger_missing(tx_id: &str) -> EngineError {
    EngineError::NotFound {
        kind: "ledger transaction",
        id: tx_id.to_string(),
    }
}

pub(crate) fn apply_payout(record: &mut WinnerRecord, payout: &Payout) {
    record.paid = true;
    record.paid_amount = payout.amount;
    record.paid_at = Some(payout.paid_at);
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BoardCell {
    board: Board,
    squares: BTreeMap<u8, Square>,
    summaries: BTreeMap<Period, WinnerSummary>,
}

/// In-memory store with per-board locking.
#[derive(Debug, Default)]
pub struct Memory {
    games: RwLock<HashMap<String, Game>>,
    boards: RwLock<HashMap<String, Arc<Mutex<BoardCell>>>>,
    ledger: Mutex<BTreeMap<String, LedgerEntry>>,
    operator: Mutex<BTreeMap<String, OperatorItem>>,
    wins: Mutex<BTreeMap<(String, String), WinRecord>>,
    audit: Mutex<Vec<AuditEntry>>,
}

fn poisoned(what: &str) -> EngineError {
    EngineError::Store(format!("{what} lock poisoned"))
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, EngineError> {
    mutex.lock().map_err(|_| poisoned(what))
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockReadGuard<'a, T>, EngineError> {
    lock.read().map_err(|_| poisoned(what))
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockWriteGuard<'a, T>, EngineError> {
    lock.write().map_err(|_| poisoned(what))
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, board_id: &str) -> Result<Arc<Mutex<BoardCell>>, EngineError> {
        read(&self.boards, "boards")?
            .get(board_id)
            .cloned()
            .ok_or_else(|| EngineError::board_not_found(board_id))
    }
}

impl BoardStore for Memory {
    fn put_game(&self, game: Game) -> Result<(), EngineError> {
        write(&self.games, "games")?.insert(game.id.clone(), game);
        Ok(())
    }

    fn game(&self, id: &str) -> Result<Option<Game>, EngineError> {
        Ok(read(&self.games, "games")?.get(id).cloned())
    }

    fn insert_board(&self, board: Board) -> Result<(), EngineError> {
        let mut boards = write(&self.boards, "boards")?;
        if boards.contains_key(&board.id) {
            return Err(EngineError::AlreadyExists {
                kind: "board",
                id: board.id,
            });
        }
        let id = board.id.clone();
        boards.insert(
            id,
            Arc::new(Mutex::new(BoardCell {
                board,
                squares: BTreeMap::new(),
                summaries: BTreeMap::new(),
            })),
        );
        Ok(())
    }

    fn board(&self, id: &str) -> Result<Option<Board>, EngineError> {
        let Some(cell) = read(&self.boards, "boards")?.get(id).cloned() else {
            return Ok(None);
        };
        let cell = lock(&cell, "board")?;
        Ok(Some(cell.board.clone()))
    }

    fn boards_for_game(&self, game_id: &str) -> Result<Vec<Board>, EngineError> {
        let cells: Vec<_> = read(&self.boards, "boards")?.values().cloned().collect();
        let mut boards = Vec::new();
        for cell in cells {
            let cell = lock(&cell, "board")?;
            if cell.board.game_id == game_id {
                boards.push(cell.board.clone());
            }
        }
        boards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(boards)
    }

    fn squares(&self, board_id: &str) -> Result<Vec<Square>, EngineError> {
        let cell = self.cell(board_id)?;
        let cell = lock(&cell, "board")?;
        Ok(cell.squares.values().cloned().collect())
    }

    fn claim_square(
        &self,
        board_id: &str,
        index: u8,
        owner: &str,
        now_ms: u64,
    ) -> Result<(Square, Board), EngineError> {
        let cell = self.cell(board_id)?;
        let mut cell = lock(&cell, "board")?;
        check_claim(&cell.board, index, cell.squares.contains_key(&index))?;

        let square = Square {
            board_id: board_id.to_string(),
            index,
            owner: owner.to_string(),
            value: None,
            claimed_at: now_ms,
        };
        cell.squares.insert(index, square.clone());
        cell.board.claimed_indexes.insert(index);
        cell.board.updated_at = now_ms;
        Ok((square, cell.board.clone()))
    }

    fn assign_axis(
        &self,
        board_id: &str,
        axis: AxisDigits,
        force: bool,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError> {
        let cell = self.cell(board_id)?;
        let mut cell = lock(&cell, "board")?;
        if !check_fill(&cell.board, force)? {
            return Ok(Latch::AlreadyProcessed(cell.board.clone()));
        }

        cell.board.axis = Some(axis);
        cell.board.status = BoardStatus::Full;
        cell.board.updated_at = now_ms;
        for square in cell.squares.values_mut() {
            square.value = Some(axis.square_value(square.index));
        }
        Ok(Latch::Applied(cell.board.clone()))
    }

    fn transition(
        &self,
        board_id: &str,
        from: BoardStatus,
        to: BoardStatus,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError> {
        let cell = self.cell(board_id)?;
        let mut cell = lock(&cell, "board")?;
        if !check_transition(&cell.board, from, to)? {
            return Ok(Latch::AlreadyProcessed(cell.board.clone()));
        }
        cell.board.status = to;
        cell.board.updated_at = now_ms;
        Ok(Latch::Applied(cell.board.clone()))
    }

    fn latch_assigned(
        &self,
        board_id: &str,
        period: Period,
        assignment: &Assignment,
    ) -> Result<Latch<WinnerRecord>, EngineError> {
        let cell = self.cell(board_id)?;
        let mut cell = lock(&cell, "board")?;
        let mut record = cell.board.winner(period);
        if record.assigned {
            return Ok(Latch::AlreadyProcessed(record));
        }

        assignment.apply(&mut record);
        let summary = assignment.summary(board_id, &cell.board.game_id, period);
        cell.board.winners.insert(period, record.clone());
        cell.board.updated_at = assignment.assigned_at;
        cell.summaries.insert(period, summary);
        Ok(Latch::Applied(record))
    }

    fn winner_summary(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Option<WinnerSummary>, EngineError> {
        let cell = self.cell(board_id)?;
        let cell = lock(&cell, "board")?;
        Ok(cell.summaries.get(&period).cloned())
    }

    fn latch_paid(
        &self,
        board_id: &str,
        period: Period,
        payout: &Payout,
    ) -> Result<Latch<WinnerRecord>, EngineError> {
        let cell = self.cell(board_id)?;
        let mut cell = lock(&cell, "board")?;
        if !check_paid(&cell.board, period, payout)? {
            return Ok(Latch::AlreadyProcessed(cell.board.winner(period)));
        }

        if let Some((tx, win)) = &payout.credit {
            let mut ledger = lock(&self.ledger, "ledger")?;
            let mut wins = lock(&self.wins, "wins")?;
            ledger
                .entry(tx.id.clone())
                .or_insert_with(|| LedgerEntry::new(tx.clone()));
            wins.entry((win.owner.clone(), win.id.clone()))
                .or_insert_with(|| win.clone());
        }

        let mut record = cell.board.winner(period);
        apply_payout(&mut record, payout);
        cell.board.winners.insert(period, record.clone());
        cell.board.updated_at = payout.paid_at;
        Ok(Latch::Applied(record))
    }

    fn insert_ledger(&self, tx: LedgerTransaction) -> Result<Latch<LedgerEntry>, EngineError> {
        let mut ledger = lock(&self.ledger, "ledger")?;
        if let Some(existing) = ledger.get(&tx.id) {
            return Ok(Latch::AlreadyProcessed(existing.clone()));
        }
        let entry = LedgerEntry::new(tx);
        ledger.insert(entry.transaction.id.clone(), entry.clone());
        Ok(Latch::Applied(entry))
    }

    fn ledger_entry(&self, tx_id: &str) -> Result<Option<LedgerEntry>, EngineError> {
        Ok(lock(&self.ledger, "ledger")?.get(tx_id).cloned())
    }

    fn undelivered(&self, board_id: Option<&str>) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(lock(&self.ledger, "ledger")?
            .values()
            .filter(|entry| entry.delivery.status != DeliveryStatus::Delivered)
            .filter(|entry| board_id.map_or(true, |id| entry.transaction.board_id == id))
            .cloned()
            .collect())
    }

    fn record_delivery(&self, tx_id: &str, delivery: Delivery) -> Result<bool, EngineError> {
        let mut ledger = lock(&self.ledger, "ledger")?;
        let entry = ledger.get_mut(tx_id).ok_or_else(|| ledger_missing(tx_id))?;
        // Delivered is terminal.
        if entry.delivery.is_delivered() {
            return Ok(false);
        }
        entry.delivery = delivery;
        Ok(true)
    }

    fn escalate_delivery(
        &self,
        tx_id: &str,
        delivery: Delivery,
        item: OperatorItem,
    ) -> Result<bool, EngineError> {
        let mut ledger = lock(&self.ledger, "ledger")?;
        let entry = ledger.get_mut(tx_id).ok_or_else(|| ledger_missing(tx_id))?;
        if entry.delivery.is_delivered() {
            return Ok(false);
        }
        entry.delivery = delivery;
        // Queued under the ledger lock, so a later success always clears it.
        lock(&self.operator, "operator")?.insert(item.tx_id.clone(), item);
        Ok(true)
    }

    fn clear_operator(&self, tx_id: &str) -> Result<(), EngineError> {
        lock(&self.operator, "operator")?.remove(tx_id);
        Ok(())
    }

    fn operator_queue(&self) -> Result<Vec<OperatorItem>, EngineError> {
        Ok(lock(&self.operator, "operator")?.values().cloned().collect())
    }

    fn wins_for(&self, owner: &str) -> Result<Vec<WinRecord>, EngineError> {
        Ok(lock(&self.wins, "wins")?
            .iter()
            .filter(|((win_owner, _), _)| win_owner == owner)
            .map(|(_, win)| win.clone())
            .collect())
    }

    fn append_audit(&self, entry: AuditEntry) -> Result<(), EngineError> {
        lock(&self.audit, "audit")?.push(entry);
        Ok(())
    }

    fn audit_log(&self, board_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(lock(&self.audit, "audit")?
            .iter()
            .filter(|entry| entry.board_id == board_id)
            .cloned()
            .collect())
    }
}
