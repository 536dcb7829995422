//! SQLite backend for [`BoardStore`].
//!
//! Documents are stored as JSON next to the columns the guards need. Each
//! mutating call runs in one `IMMEDIATE` transaction, so a guarded change and
//! everything written with it commit together or not at all. Square
//! uniqueness is additionally enforced by the `(board_id, idx)` primary key.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use squares_types::{
    Assignment, AuditEntry, AxisDigits, Board, BoardStatus, Delivery, DeliveryStatus, EngineError,
    Game, LedgerEntry, LedgerTransaction, Latch, OperatorItem, Period, Square, WinRecord,
    WinnerRecord, WinnerSummary,
};

use crate::store::{
    apply_payout, check_claim, check_fill, check_paid, check_transition, BoardStore, Payout,
};

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     CREATE TABLE IF NOT EXISTS games (
         id TEXT PRIMARY KEY,
         doc TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS boards (
         id TEXT PRIMARY KEY,
         game_id TEXT NOT NULL,
         doc TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS boards_by_game ON boards (game_id);
     CREATE TABLE IF NOT EXISTS squares (
         board_id TEXT NOT NULL,
         idx INTEGER NOT NULL,
         doc TEXT NOT NULL,
         PRIMARY KEY (board_id, idx)
     );
     CREATE TABLE IF NOT EXISTS winner_summaries (
         board_id TEXT NOT NULL,
         period TEXT NOT NULL,
         doc TEXT NOT NULL,
         PRIMARY KEY (board_id, period)
     );
     CREATE TABLE IF NOT EXISTS ledger (
         id TEXT PRIMARY KEY,
         board_id TEXT NOT NULL,
         delivered INTEGER NOT NULL DEFAULT 0,
         doc TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS operator_queue (
         tx_id TEXT PRIMARY KEY,
         doc TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS wins (
         owner TEXT NOT NULL,
         id TEXT NOT NULL,
         doc TEXT NOT NULL,
         PRIMARY KEY (owner, id)
     );
     CREATE TABLE IF NOT EXISTS audit (
         seq INTEGER PRIMARY KEY AUTOINCREMENT,
         board_id TEXT NOT NULL,
         doc TEXT NOT NULL
     );";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db(err: rusqlite::Error) -> EngineError {
    EngineError::Store(format!("sqlite: {err}"))
}

fn to_doc<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|err| EngineError::Store(format!("encode: {err}")))
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T, EngineError> {
    serde_json::from_str(doc).map_err(|err| EngineError::Store(format!("decode: {err}")))
}

fn load_board(conn: &Connection, id: &str) -> Result<Option<Board>, EngineError> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM boards WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db)?;
    doc.map(|doc| from_doc(&doc)).transpose()
}

fn require_board(conn: &Connection, id: &str) -> Result<Board, EngineError> {
    load_board(conn, id)?.ok_or_else(|| EngineError::board_not_found(id))
}

fn save_board(conn: &Connection, board: &Board) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE boards SET doc = ?2 WHERE id = ?1",
        params![board.id, to_doc(board)?],
    )
    .map_err(db)?;
    Ok(())
}

fn load_squares(conn: &Connection, board_id: &str) -> Result<Vec<Square>, EngineError> {
    let mut stmt = conn
        .prepare("SELECT doc FROM squares WHERE board_id = ?1 ORDER BY idx ASC")
        .map_err(db)?;
    let rows = stmt
        .query_map(params![board_id], |row| row.get::<_, String>(0))
        .map_err(db)?;
    let mut squares = Vec::new();
    for row in rows {
        squares.push(from_doc(&row.map_err(db)?)?);
    }
    Ok(squares)
}

fn insert_ledger_row(conn: &Connection, entry: &LedgerEntry) -> Result<bool, EngineError> {
    let changed = conn
        .execute(
            "INSERT OR IGNORE INTO ledger (id, board_id, delivered, doc) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.transaction.id,
                entry.transaction.board_id,
                entry.delivery.is_delivered(),
                to_doc(entry)?
            ],
        )
        .map_err(db)?;
    Ok(changed == 1)
}

fn load_ledger(conn: &Connection, tx_id: &str) -> Result<Option<LedgerEntry>, EngineError> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM ledger WHERE id = ?1", params![tx_id], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db)?;
    doc.map(|doc| from_doc(&doc)).transpose()
}

fn doc_column(row: &rusqlite::Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

fn query_docs<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    param: Option<&str>,
) -> Result<Vec<T>, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(db)?;
    let docs: Vec<String> = match param {
        Some(param) => stmt
            .query_map(params![param], doc_column)
            .and_then(|rows| rows.collect()),
        None => stmt
            .query_map([], doc_column)
            .and_then(|rows| rows.collect()),
    }
    .map_err(db)?;
    docs.iter().map(|doc| from_doc(doc)).collect()
}

fn write_delivery(conn: &Connection, entry: &LedgerEntry) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE ledger SET delivered = ?2, doc = ?3 WHERE id = ?1",
        params![
            entry.transaction.id,
            entry.delivery.status == DeliveryStatus::Delivered,
            to_doc(entry)?
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn require_ledger(conn: &Connection, tx_id: &str) -> Result<LedgerEntry, EngineError> {
    load_ledger(conn, tx_id)?.ok_or_else(|| EngineError::NotFound {
        kind: "ledger transaction",
        id: tx_id.to_string(),
    })
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open board store at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("init board store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Store("sqlite connection lock poisoned".to_string()))
    }

    /// Run `f` inside one immediate transaction, committing only on `Ok`.
    fn atomically<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        let out = f(&tx)?;
        tx.commit().map_err(db)?;
        Ok(out)
    }
}

impl BoardStore for SqliteStore {
    fn put_game(&self, game: Game) -> Result<(), EngineError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO games (id, doc) VALUES (?1, ?2)",
                params![game.id, to_doc(&game)?],
            )
            .map_err(db)?;
        Ok(())
    }

    fn game(&self, id: &str) -> Result<Option<Game>, EngineError> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM games WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db)?;
        doc.map(|doc| from_doc(&doc)).transpose()
    }

    fn insert_board(&self, board: Board) -> Result<(), EngineError> {
        self.atomically(|conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO boards (id, game_id, doc) VALUES (?1, ?2, ?3)",
                    params![board.id, board.game_id, to_doc(&board)?],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(EngineError::AlreadyExists {
                    kind: "board",
                    id: board.id.clone(),
                });
            }
            Ok(())
        })
    }

    fn board(&self, id: &str) -> Result<Option<Board>, EngineError> {
        load_board(&*self.conn()?, id)
    }

    fn boards_for_game(&self, game_id: &str) -> Result<Vec<Board>, EngineError> {
        query_docs(
            &*self.conn()?,
            "SELECT doc FROM boards WHERE game_id = ?1 ORDER BY id ASC",
            Some(game_id),
        )
    }

    fn squares(&self, board_id: &str) -> Result<Vec<Square>, EngineError> {
        let conn = self.conn()?;
        require_board(&*conn, board_id)?;
        load_squares(&*conn, board_id)
    }

    fn claim_square(
        &self,
        board_id: &str,
        index: u8,
        owner: &str,
        now_ms: u64,
    ) -> Result<(Square, Board), EngineError> {
        self.atomically(|conn| {
            let mut board = require_board(conn, board_id)?;
            check_claim(&board, index, false)?;

            let square = Square {
                board_id: board_id.to_string(),
                index,
                owner: owner.to_string(),
                value: None,
                claimed_at: now_ms,
            };
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO squares (board_id, idx, doc) VALUES (?1, ?2, ?3)",
                    params![board_id, index, to_doc(&square)?],
                )
                .map_err(db)?;
            if inserted == 0 {
                return Err(EngineError::Conflict {
                    board_id: board_id.to_string(),
                    index,
                });
            }
            board.claimed_indexes.insert(index);
            board.updated_at = now_ms;
            save_board(conn, &board)?;
            Ok((square, board))
        })
    }

    fn assign_axis(
        &self,
        board_id: &str,
        axis: AxisDigits,
        force: bool,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError> {
        self.atomically(|conn| {
            let mut board = require_board(conn, board_id)?;
            if !check_fill(&board, force)? {
                return Ok(Latch::AlreadyProcessed(board));
            }
            board.axis = Some(axis);
            board.status = BoardStatus::Full;
            board.updated_at = now_ms;
            save_board(conn, &board)?;

            for mut square in load_squares(conn, board_id)? {
                square.value = Some(axis.square_value(square.index));
                conn.execute(
                    "UPDATE squares SET doc = ?3 WHERE board_id = ?1 AND idx = ?2",
                    params![board_id, square.index, to_doc(&square)?],
                )
                .map_err(db)?;
            }
            Ok(Latch::Applied(board))
        })
    }

    fn transition(
        &self,
        board_id: &str,
        from: BoardStatus,
        to: BoardStatus,
        now_ms: u64,
    ) -> Result<Latch<Board>, EngineError> {
        self.atomically(|conn| {
            let mut board = require_board(conn, board_id)?;
            if !check_transition(&board, from, to)? {
                return Ok(Latch::AlreadyProcessed(board));
            }
            board.status = to;
            board.updated_at = now_ms;
            save_board(conn, &board)?;
            Ok(Latch::Applied(board))
        })
    }

    fn latch_assigned(
        &self,
        board_id: &str,
        period: Period,
        assignment: &Assignment,
    ) -> Result<Latch<WinnerRecord>, EngineError> {
        self.atomically(|conn| {
            let mut board = require_board(conn, board_id)?;
            let mut record = board.winner(period);
            if record.assigned {
                return Ok(Latch::AlreadyProcessed(record));
            }
            assignment.apply(&mut record);
            board.winners.insert(period, record.clone());
            board.updated_at = assignment.assigned_at;
            save_board(conn, &board)?;

            let summary = assignment.summary(board_id, &board.game_id, period);
            conn.execute(
                "INSERT OR REPLACE INTO winner_summaries (board_id, period, doc) VALUES (?1, ?2, ?3)",
                params![board_id, period.as_str(), to_doc(&summary)?],
            )
            .map_err(db)?;
            Ok(Latch::Applied(record))
        })
    }

    fn winner_summary(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Option<WinnerSummary>, EngineError> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM winner_summaries WHERE board_id = ?1 AND period = ?2",
                params![board_id, period.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        doc.map(|doc| from_doc(&doc)).transpose()
    }

    fn latch_paid(
        &self,
        board_id: &str,
        period: Period,
        payout: &Payout,
    ) -> Result<Latch<WinnerRecord>, EngineError> {
        self.atomically(|conn| {
            let mut board = require_board(conn, board_id)?;
            if !check_paid(&board, period, payout)? {
                return Ok(Latch::AlreadyProcessed(board.winner(period)));
            }
            if let Some((tx, win)) = &payout.credit {
                insert_ledger_row(conn, &LedgerEntry::new(tx.clone()))?;
                conn.execute(
                    "INSERT OR IGNORE INTO wins (owner, id, doc) VALUES (?1, ?2, ?3)",
                    params![win.owner, win.id, to_doc(win)?],
                )
                .map_err(db)?;
            }
            let mut record = board.winner(period);
            apply_payout(&mut record, payout);
            board.winners.insert(period, record.clone());
            board.updated_at = payout.paid_at;
            save_board(conn, &board)?;
            Ok(Latch::Applied(record))
        })
    }

    fn insert_ledger(&self, tx: LedgerTransaction) -> Result<Latch<LedgerEntry>, EngineError> {
        self.atomically(|conn| {
            let entry = LedgerEntry::new(tx);
            if insert_ledger_row(conn, &entry)? {
                return Ok(Latch::Applied(entry));
            }
            let existing = load_ledger(conn, &entry.transaction.id)?.ok_or_else(|| {
                EngineError::Store(format!("ledger row {} vanished", entry.transaction.id))
            })?;
            Ok(Latch::AlreadyProcessed(existing))
        })
    }

    fn ledger_entry(&self, tx_id: &str) -> Result<Option<LedgerEntry>, EngineError> {
        load_ledger(&*self.conn()?, tx_id)
    }

    fn undelivered(&self, board_id: Option<&str>) -> Result<Vec<LedgerEntry>, EngineError> {
        let conn = self.conn()?;
        match board_id {
            Some(board_id) => query_docs(
                &*conn,
                "SELECT doc FROM ledger WHERE delivered = 0 AND board_id = ?1 ORDER BY id ASC",
                Some(board_id),
            ),
            None => query_docs(
                &*conn,
                "SELECT doc FROM ledger WHERE delivered = 0 ORDER BY id ASC",
                None,
            ),
        }
    }

    fn record_delivery(&self, tx_id: &str, delivery: Delivery) -> Result<bool, EngineError> {
        self.atomically(|conn| {
            let mut entry = require_ledger(conn, tx_id)?;
            if entry.delivery.is_delivered() {
                return Ok(false);
            }
            entry.delivery = delivery;
            write_delivery(conn, &entry)?;
            Ok(true)
        })
    }

    fn escalate_delivery(
        &self,
        tx_id: &str,
        delivery: Delivery,
        item: OperatorItem,
    ) -> Result<bool, EngineError> {
        self.atomically(|conn| {
            let mut entry = require_ledger(conn, tx_id)?;
            if entry.delivery.is_delivered() {
                return Ok(false);
            }
            entry.delivery = delivery;
            write_delivery(conn, &entry)?;
            conn.execute(
                "INSERT OR REPLACE INTO operator_queue (tx_id, doc) VALUES (?1, ?2)",
                params![item.tx_id, to_doc(&item)?],
            )
            .map_err(db)?;
            Ok(true)
        })
    }

    fn clear_operator(&self, tx_id: &str) -> Result<(), EngineError> {
        self.conn()?
            .execute(
                "DELETE FROM operator_queue WHERE tx_id = ?1",
                params![tx_id],
            )
            .map_err(db)?;
        Ok(())
    }

    fn operator_queue(&self) -> Result<Vec<OperatorItem>, EngineError> {
        query_docs(
            &*self.conn()?,
            "SELECT doc FROM operator_queue ORDER BY tx_id ASC",
            None,
        )
    }

    fn wins_for(&self, owner: &str) -> Result<Vec<WinRecord>, EngineError> {
        query_docs(
            &*self.conn()?,
            "SELECT doc FROM wins WHERE owner = ?1 ORDER BY id ASC",
            Some(owner),
        )
    }

    fn append_audit(&self, entry: AuditEntry) -> Result<(), EngineError> {
        self.conn()?
            .execute(
                "INSERT INTO audit (board_id, doc) VALUES (?1, ?2)",
                params![entry.board_id, to_doc(&entry)?],
            )
            .map_err(db)?;
        Ok(())
    }

    fn audit_log(&self, board_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        query_docs(
            &*self.conn()?,
            "SELECT doc FROM audit WHERE board_id = ?1 ORDER BY seq ASC",
            Some(board_id),
        )
    }
}
