//! Test doubles and fixtures for the engine. Enabled in tests and with the
//! `mocks` feature.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use squares_types::{AxisDigits, Board, CreateBoard, Game, GameUpdateReport};

use crate::clock::Clock;
use crate::engine::{Engine, EngineConfig};
use crate::store::{BoardStore, Memory};
use crate::wallet::{CreditRequest, RetryPolicy, Wallet, WalletError};

/// Home axis used by fixed-digit fixtures.
pub const HOME_DIGITS: [u8; 10] = [3, 1, 4, 7, 5, 9, 2, 6, 8, 0];
/// Away axis used by fixed-digit fixtures.
pub const AWAY_DIGITS: [u8; 10] = [9, 3, 0, 1, 2, 4, 5, 6, 7, 8];

pub fn fixed_axis() -> AxisDigits {
    match AxisDigits::new(HOME_DIGITS, AWAY_DIGITS) {
        Ok(axis) => axis,
        Err(err) => panic!("fixture digits are not permutations: {err}"),
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct WalletState {
    credited: BTreeMap<String, CreditRequest>,
    balances: HashMap<String, u64>,
    calls: usize,
    fail_next: u32,
    rejected: HashSet<String>,
}

/// In-memory wallet, idempotent on the credit key like a real one.
#[derive(Debug, Default)]
pub struct MemoryWallet {
    state: Mutex<WalletState>,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` credits as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    pub fn reject_owner(&self, owner: &str) {
        self.state().rejected.insert(owner.to_string());
    }

    pub fn allow_owner(&self, owner: &str) {
        self.state().rejected.remove(owner);
    }

    pub fn balance(&self, owner: &str) -> u64 {
        self.state().balances.get(owner).copied().unwrap_or(0)
    }

    /// Credits that took effect, keyed by idempotency key.
    pub fn credits(&self) -> Vec<CreditRequest> {
        self.state().credited.values().cloned().collect()
    }

    /// Every call, including failed and duplicate ones.
    pub fn calls(&self) -> usize {
        self.state().calls
    }
}

impl Wallet for MemoryWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<(), WalletError> {
        let mut state = self.state();
        state.calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(WalletError::Unavailable("injected failure".to_string()));
        }
        if state.rejected.contains(&request.owner_id) {
            return Err(WalletError::Rejected(format!(
                "account {} is frozen",
                request.owner_id
            )));
        }
        if state.credited.contains_key(&request.idempotency_key) {
            return Ok(());
        }
        state
            .credited
            .insert(request.idempotency_key.clone(), request.clone());
        *state.balances.entry(request.owner_id.clone()).or_default() += request.amount;
        Ok(())
    }
}

/// Retry policy without sleeps.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

/// Start time of every fixture clock.
pub const START_MS: u64 = 1_700_000_000_000;

/// Seeded engine over any store and wallet, on a manual clock.
pub fn engine_with<S: BoardStore, W: Wallet>(
    store: S,
    wallet: W,
    seed: u64,
) -> (Engine<S, W>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = EngineConfig {
        retry: fast_retry(),
        ..Default::default()
    };
    let engine = match Engine::new(Arc::new(store), Arc::new(wallet), config) {
        Ok(engine) => engine,
        Err(err) => panic!("test engine config rejected: {err}"),
    };
    (engine.with_clock(clock.clone()).with_seed(seed), clock)
}

/// Seeded in-memory engine on a manual clock.
pub fn test_engine(seed: u64) -> (Engine<Memory, MemoryWallet>, Arc<ManualClock>) {
    engine_with(Memory::new(), MemoryWallet::new(), seed)
}

fn ensure_game<S: BoardStore, W: Wallet>(engine: &Engine<S, W>, game_id: &str) {
    if matches!(engine.store().game(game_id), Ok(None)) {
        engine
            .store()
            .put_game(Game::new(game_id))
            .unwrap_or_else(|err| panic!("put game {game_id}: {err}"));
    }
}

fn create<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    game_id: &str,
    entry_fee: u64,
    sweepstakes_prize: Option<u64>,
) -> Board {
    ensure_game(engine, game_id);
    engine
        .create_board(CreateBoard {
            id: board_id.to_string(),
            game_id: game_id.to_string(),
            entry_fee,
            sweepstakes_prize,
        })
        .unwrap_or_else(|err| panic!("create board {board_id}: {err}"))
}

/// Open paid board, creating its game if needed.
pub fn paid_board<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    game_id: &str,
    entry_fee: u64,
) -> Board {
    create(engine, board_id, game_id, entry_fee, None)
}

/// Open free board with a per-period prize.
pub fn free_board<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    game_id: &str,
    prize: u64,
) -> Board {
    create(engine, board_id, game_id, 0, Some(prize))
}

/// Claim every index in `indexes` through the engine, cycling `owners`.
pub fn claim_range<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    indexes: Range<u16>,
    owners: &[&str],
) {
    for (i, index) in indexes.enumerate() {
        let owner = owners[i % owners.len()];
        engine
            .claim_square(board_id, index, owner)
            .unwrap_or_else(|err| panic!("claim {index}: {err}"));
    }
}

/// Paid board (fee 500) filled through normal claims, so digits are drawn.
pub fn fill_paid_board<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    game_id: &str,
) -> Board {
    paid_board(engine, board_id, game_id, 500);
    for index in 0..100u16 {
        engine
            .claim_square(board_id, index, &format!("user{index}"))
            .unwrap_or_else(|err| panic!("claim {index}: {err}"));
    }
    engine
        .board(board_id)
        .unwrap_or_else(|err| panic!("board {board_id}: {err}"))
}

/// Full board with known digits. Square `i` belongs to `user{i}`.
///
/// Claims go straight to the store so the random draw never runs.
pub fn fill_with_axis<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    board_id: &str,
    game_id: &str,
    entry_fee: u64,
    axis: AxisDigits,
) -> Board {
    let prize = (entry_fee == 0).then_some(2_500);
    create(engine, board_id, game_id, entry_fee, prize);
    for index in 0..100u8 {
        engine
            .store()
            .claim_square(board_id, index, &format!("user{index}"), 0)
            .unwrap_or_else(|err| panic!("claim {index}: {err}"));
    }
    engine
        .store()
        .assign_axis(board_id, axis, false, 0)
        .unwrap_or_else(|err| panic!("assign axis: {err}"))
        .into_inner()
}

/// Publish a live game record, edited by `edit`, through the feed path.
pub async fn go_live<S: BoardStore, W: Wallet>(
    engine: &Engine<S, W>,
    game_id: &str,
    edit: impl FnOnce(&mut Game),
) -> GameUpdateReport {
    let mut game = engine
        .store()
        .game(game_id)
        .ok()
        .flatten()
        .unwrap_or_else(|| Game::new(game_id));
    game.is_live = true;
    edit(&mut game);
    engine
        .upsert_game(game)
        .await
        .unwrap_or_else(|err| panic!("upsert game {game_id}: {err}"))
}
