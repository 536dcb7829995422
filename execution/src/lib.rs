//! Squares board engine.
//!
//! Drives boards from creation to closure: atomic square claims, the one-time
//! axis digit draw, the kickoff transition (activate or refund), per-period
//! winner resolution and settlement, and reconciliation. The entrypoint is
//! [`Engine`].
//!
//! ## Idempotency
//! Every step is safe to re-run. Event delivery is at-least-once, so nothing
//! here relies on control flow having run exactly once:
//! - square claims are test-and-set inserts in the store;
//! - axis digits are written only when absent;
//! - status changes are compare-and-set;
//! - each period has one-way `assigned` and `paid` latches;
//! - ledger transaction ids are derived from the event that caused them.
//!
//! ## Determinism requirements
//! - Do not read the wall clock inside the engine; use the injected [`Clock`].
//! - Digit draws come only from the engine's ChaCha20 RNG.
//!
//! ## Minimal flow (example)
//! ```rust,ignore
//! use std::sync::Arc;
//! use squares_execution::{Engine, EngineConfig, Memory, UnconfiguredWallet};
//! use squares_types::{CreateBoard, Game, Period};
//!
//! # async fn example() -> Result<(), squares_types::EngineError> {
//! let engine = Engine::new(
//!     Arc::new(Memory::new()),
//!     Arc::new(UnconfiguredWallet),
//!     EngineConfig::default(),
//! )?;
//! engine.upsert_game(Game::new("g1")).await?;
//! engine.create_board(CreateBoard {
//!     id: "b1".into(),
//!     game_id: "g1".into(),
//!     entry_fee: 500,
//!     sweepstakes_prize: None,
//! })?;
//! engine.claim_square("b1", 42, "alice")?;
//! // ... later, from an operator:
//! engine.reconcile("b1", Period::Q1, "ops").await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod engine;
pub mod fill;
pub mod lifecycle;
pub mod reconcile;
pub mod reservation;
pub mod resolver;
pub mod settlement;
pub mod sqlite;
pub mod store;
pub mod wallet;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod idempotency_tests;

pub use clock::{Clock, SystemClock};
pub use engine::{
    Engine, EngineConfig, BPS_DENOMINATOR, DEFAULT_PERIOD_SHARE_BPS, MAX_PERIOD_SHARE_BPS,
};
pub use lifecycle::LiveOutcome;
pub use settlement::Settlement;
pub use sqlite::SqliteStore;
pub use store::{BoardStore, Memory, Payout};
pub use wallet::{
    credit_with_backoff, CreditAttempt, CreditRequest, HttpWallet, RetryPolicy,
    UnconfiguredWallet, Wallet, WalletError,
};
