//! Period winner resolver.

use squares_types::{Assignment, EngineError, Latch, Period, WinnerRecord};
use tracing::info;

use crate::engine::Engine;
use crate::store::BoardStore;
use crate::wallet::Wallet;

impl<S: BoardStore, W: Wallet> Engine<S, W> {
    /// Compute and latch the winner of `period` from the stored game snapshot.
    ///
    /// The winning value is the away score's last digit followed by the home
    /// score's. If `assigned` is already set the stored record is returned as
    /// is. A winning square nobody claimed still latches, with no winner.
    pub fn resolve_period(
        &self,
        board_id: &str,
        period: Period,
    ) -> Result<Latch<WinnerRecord>, EngineError> {
        let board = self.require_board(board_id)?;
        if !board.status.accepts_settlement() {
            return Err(EngineError::InvalidState {
                board_id: board_id.to_string(),
                status: board.status,
                expected: "active or closed",
            });
        }
        let existing = board.winner(period);
        if existing.assigned {
            return Ok(Latch::AlreadyProcessed(existing));
        }

        let game = self.require_game(&board.game_id)?;
        let score = game
            .score_for(period)
            .ok_or_else(|| EngineError::ExternalFeedInconsistency {
                board_id: board_id.to_string(),
                reason: format!("no {period} score snapshot for game {}", game.id),
            })?;
        let axis = board
            .axis
            .ok_or_else(|| EngineError::ExternalFeedInconsistency {
                board_id: board_id.to_string(),
                reason: format!("{period} reached but axis digits are missing"),
            })?;
        let winning_index = axis
            .index_of(score.away_digit(), score.home_digit())
            .ok_or_else(|| EngineError::ExternalFeedInconsistency {
                board_id: board_id.to_string(),
                reason: format!("no square carries value {}", score.winning_value()),
            })?;

        let winner = self
            .store
            .squares(board_id)?
            .into_iter()
            .find(|square| square.index == winning_index)
            .map(|square| square.owner);
        let assignment = Assignment {
            winning_index,
            winning_square_value: axis.square_value(winning_index),
            winner,
            score,
            assigned_at: self.now(),
        };

        let latch = self.store.latch_assigned(board_id, period, &assignment)?;
        if latch.is_applied() {
            info!(
                board_id,
                %period,
                index = winning_index,
                value = %assignment.winning_square_value,
                winner = ?assignment.winner,
                home = score.home,
                away = score.away,
                "period winner assigned"
            );
        }
        Ok(latch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{fill_with_axis, fixed_axis, go_live, test_engine};
    use squares_types::{Game, ScorePair};

    #[tokio::test]
    async fn resolves_once_with_stable_index() {
        let (engine, _clock) = test_engine(1);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        go_live(&engine, "g1", |game| {
            game.quarter = 2;
            game.period_scores.insert(Period::Q1, ScorePair::new(7, 13));
        })
        .await;

        let record = engine.winner("b1", Period::Q1).unwrap();
        assert!(record.assigned);
        assert_eq!(record.winning_square_value.as_deref(), Some("37"));
        assert_eq!(record.winning_index, Some(13));

        for _ in 0..5 {
            let again = engine.resolve_period("b1", Period::Q1).unwrap();
            assert!(!again.is_applied());
            assert_eq!(again.get().winning_index, Some(13));
        }
    }

    #[test]
    fn open_board_is_not_resolvable() {
        let (engine, _clock) = test_engine(1);
        crate::mocks::paid_board(&engine, "b1", "g1", 500);
        assert!(matches!(
            engine.resolve_period("b1", Period::Q1),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn missing_snapshot_is_feed_inconsistency() {
        let (engine, _clock) = test_engine(1);
        fill_with_axis(&engine, "b1", "g1", 500, fixed_axis());
        let mut game = Game::new("g1");
        game.is_live = true;
        engine.upsert_game(game).await.unwrap();
        assert!(matches!(
            engine.resolve_period("b1", Period::Q3),
            Err(EngineError::ExternalFeedInconsistency { .. })
        ));
        assert!(!engine.winner("b1", Period::Q3).unwrap().assigned);
    }
}
