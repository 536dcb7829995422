//! The board engine.
//!
//! One [`Engine`] serves every board. Component behavior lives in sibling
//! modules as separate `impl` blocks (reservation, fill, lifecycle, resolver,
//! settlement, reconcile); this module holds construction, configuration,
//! board creation, feed ingestion, and read access.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use squares_types::{
    Board, BoardFailure, CreateBoard, EngineError, Game, GameUpdateReport, OperatorItem, Period,
    Square, WinRecord, WinnerRecord, WinnerSummary, SQUARE_COUNT,
};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::BoardStore;
use crate::wallet::{RetryPolicy, Wallet};

/// Basis points in one whole.
pub const BPS_DENOMINATOR: u64 = 10_000;
/// Default per-period share of the pot (20%).
pub const DEFAULT_PERIOD_SHARE_BPS: u32 = 2_000;
/// Four periods at this share pay out the whole pot.
pub const MAX_PERIOD_SHARE_BPS: u32 = 2_500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Share of the pot paid to each period's winner on paid boards.
    pub period_share_bps: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            period_share_bps: DEFAULT_PERIOD_SHARE_BPS,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.period_share_bps > MAX_PERIOD_SHARE_BPS {
            return Err(EngineError::InvalidInput(format!(
                "period share {} bps exceeds {} bps",
                self.period_share_bps, MAX_PERIOD_SHARE_BPS
            )));
        }
        self.retry.validate()
    }

    /// Per-period prize for a new board, fixed at creation.
    pub fn payout_for(&self, entry_fee: u64, sweepstakes_prize: Option<u64>) -> u64 {
        if entry_fee == 0 {
            return sweepstakes_prize.unwrap_or(0);
        }
        let pot = entry_fee.saturating_mul(SQUARE_COUNT as u64);
        pot.saturating_mul(self.period_share_bps as u64) / BPS_DENOMINATOR
    }
}

pub struct Engine<S, W> {
    pub(crate) store: Arc<S>,
    pub(crate) wallet: Arc<W>,
    pub(crate) config: EngineConfig,
    clock: Arc<dyn Clock>,
    rng: Mutex<ChaCha20Rng>,
}

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Build an engine on the system clock with an entropy-seeded RNG.
    pub fn new(store: Arc<S>, wallet: Arc<W>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            store,
            wallet,
            config,
            clock: Arc::new(SystemClock),
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the RNG with a seeded one. Digit draws become reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(ChaCha20Rng::seed_from_u64(seed));
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn wallet(&self) -> &Arc<W> {
        &self.wallet
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn rng(&self) -> Result<MutexGuard<'_, ChaCha20Rng>, EngineError> {
        self.rng
            .lock()
            .map_err(|_| EngineError::Store("rng lock poisoned".to_string()))
    }

    pub(crate) fn require_board(&self, board_id: &str) -> Result<Board, EngineError> {
        self.store
            .board(board_id)?
            .ok_or_else(|| EngineError::board_not_found(board_id))
    }

    pub(crate) fn require_game(&self, game_id: &str) -> Result<Game, EngineError> {
        self.store
            .game(game_id)?
            .ok_or_else(|| EngineError::game_not_found(game_id))
    }

    pub fn create_board(&self, request: CreateBoard) -> Result<Board, EngineError> {
        if request.id.trim().is_empty() {
            return Err(EngineError::InvalidInput("board id is empty".to_string()));
        }
        self.require_game(&request.game_id)?;

        let payout = self
            .config
            .payout_for(request.entry_fee, request.sweepstakes_prize);
        let board = Board::new(
            request.id,
            request.game_id,
            request.entry_fee,
            payout,
            self.now(),
        );
        self.store.insert_board(board.clone())?;
        info!(
            board_id = %board.id,
            game_id = %board.game_id,
            entry_fee = board.entry_fee,
            payout_per_period = board.payout_per_period,
            "board created"
        );
        Ok(board)
    }

    /// Store a feed record and process it.
    pub async fn upsert_game(&self, game: Game) -> Result<GameUpdateReport, EngineError> {
        if game.id.trim().is_empty() {
            return Err(EngineError::InvalidInput("game id is empty".to_string()));
        }
        let game_id = game.id.clone();
        self.store.put_game(game)?;
        self.on_game_updated(&game_id).await
    }

    /// Event consumer for game changes.
    ///
    /// Notifications carry no payload and may repeat, so this re-reads the
    /// stored game and drives every board of it from current state. Boards
    /// are processed concurrently; one board failing does not stop the rest.
    pub async fn on_game_updated(&self, game_id: &str) -> Result<GameUpdateReport, EngineError> {
        let game = self.require_game(game_id)?;
        let boards = self.store.boards_for_game(game_id)?;
        debug!(
            game_id,
            boards = boards.len(),
            quarter = game.quarter,
            is_live = game.is_live,
            is_over = game.is_over,
            "processing game update"
        );

        let outcomes = join_all(boards.iter().map(|board| self.drive_board(&game, &board.id))).await;

        let mut report = GameUpdateReport {
            game_id: game_id.to_string(),
            boards: boards.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            report.activated += usize::from(outcome.activated);
            report.unfilled += usize::from(outcome.unfilled);
            report.resolved += outcome.resolved;
            report.paid += outcome.paid;
            report.failures.extend(outcome.failures);
        }
        if !report.failures.is_empty() {
            warn!(
                game_id,
                failures = report.failures.len(),
                "game update left boards for reconciliation"
            );
        }
        Ok(report)
    }

    async fn drive_board(&self, game: &Game, board_id: &str) -> BoardPass {
        let mut pass = BoardPass::default();

        if game.has_started() {
            match self.on_game_live(board_id).await {
                Ok(outcome) => {
                    pass.activated = outcome.activated;
                    pass.unfilled = outcome.unfilled;
                }
                Err(err) => {
                    pass.fail(board_id, None, &err);
                    return pass;
                }
            }
        }

        let board = match self.require_board(board_id) {
            Ok(board) => board,
            Err(err) => {
                pass.fail(board_id, None, &err);
                return pass;
            }
        };
        if !board.status.accepts_settlement() {
            return pass;
        }

        for period in game.reached_periods() {
            match self.resolve_and_settle(board_id, period).await {
                Ok((assigned, paid)) => {
                    pass.resolved += usize::from(assigned);
                    pass.paid += usize::from(paid);
                }
                Err(err) => pass.fail(board_id, Some(period), &err),
            }
        }
        pass
    }

    /// Resolve then settle one period. Returns whether each latch was newly set.
    pub(crate) async fn resolve_and_settle(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<(bool, bool), EngineError> {
        let assigned = self.resolve_period(board_id, period)?;
        let settled = self.settle_period(board_id, period).await?;
        Ok((assigned.is_applied(), settled.record.is_applied()))
    }

    pub fn board(&self, board_id: &str) -> Result<Board, EngineError> {
        self.require_board(board_id)
    }

    pub fn squares(&self, board_id: &str) -> Result<Vec<Square>, EngineError> {
        self.store.squares(board_id)
    }

    pub fn game(&self, game_id: &str) -> Result<Game, EngineError> {
        self.require_game(game_id)
    }

    pub fn winner(&self, board_id: &str, period: Period) -> Result<WinnerRecord, EngineError> {
        Ok(self.require_board(board_id)?.winner(period))
    }

    pub fn winner_summary(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Option<WinnerSummary>, EngineError> {
        self.require_board(board_id)?;
        self.store.winner_summary(board_id, period)
    }

    pub fn wins_for(&self, owner: &str) -> Result<Vec<WinRecord>, EngineError> {
        self.store.wins_for(owner)
    }

    pub fn operator_queue(&self) -> Result<Vec<OperatorItem>, EngineError> {
        self.store.operator_queue()
    }
}

#[derive(Debug, Default)]
struct BoardPass {
    activated: bool,
    unfilled: bool,
    resolved: usize,
    paid: usize,
    failures: Vec<BoardFailure>,
}

impl BoardPass {
    fn fail(&mut self, board_id: &str, period: Option<Period>, err: &EngineError) {
        match err {
            EngineError::ExternalFeedInconsistency { .. } => {
                warn!(board_id, ?period, error = %err, "deferred to reconciliation")
            }
            _ => warn!(board_id, ?period, error = %err, "board processing failed"),
        }
        self.failures.push(BoardFailure {
            board_id: board_id.to_string(),
            period,
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }
}
