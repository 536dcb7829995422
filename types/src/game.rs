//! Game records as published by the score feed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::board::{square_value, GameId};

/// One of the four scoring checkpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Q1,
    Q2,
    Q3,
    Final,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Q1, Period::Q2, Period::Q3, Period::Final];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Q1 => "q1",
            Period::Q2 => "q2",
            Period::Q3 => "q3",
            Period::Final => "final",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::Q1 => "Q1",
            Period::Q2 => "Q2 / Half",
            Period::Q3 => "Q3",
            Period::Final => "Final",
        }
    }

    /// First quarter number that can only be reached once this period is over.
    fn closing_quarter(&self) -> Option<u8> {
        match self {
            Period::Q1 => Some(2),
            Period::Q2 => Some(3),
            Period::Q3 => Some(4),
            Period::Final => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "q1" => Ok(Period::Q1),
            "q2" | "half" => Ok(Period::Q2),
            "q3" => Ok(Period::Q3),
            "final" | "q4" => Ok(Period::Final),
            other => Err(format!("unknown period: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePair {
    pub home: u32,
    pub away: u32,
}

impl ScorePair {
    pub fn new(home: u32, away: u32) -> Self {
        Self { home, away }
    }

    pub fn home_digit(&self) -> u8 {
        (self.home % 10) as u8
    }

    pub fn away_digit(&self) -> u8 {
        (self.away % 10) as u8
    }

    /// Winning square value: away last digit, then home last digit.
    pub fn winning_value(&self) -> String {
        square_value(self.away_digit(), self.home_digit())
    }
}

/// Game record owned by the feed. Read-only to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    #[serde(default)]
    pub id: GameId,
    #[serde(default)]
    pub home_score: u32,
    #[serde(default)]
    pub away_score: u32,
    /// Cumulative score at the end of each period, as published by the feed.
    #[serde(default)]
    pub period_scores: BTreeMap<Period, ScorePair>,
    /// Current quarter (0 before kickoff).
    #[serde(default)]
    pub quarter: u8,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub is_over: bool,
}

impl Game {
    pub fn new(id: impl Into<GameId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn has_started(&self) -> bool {
        self.is_live || self.is_over
    }

    /// Whether the feed has moved past `period`.
    pub fn period_reached(&self, period: Period) -> bool {
        if self.is_over {
            return true;
        }
        match period.closing_quarter() {
            Some(quarter) => self.quarter >= quarter,
            None => false,
        }
    }

    /// Score snapshot for `period`. Final falls back to the current score.
    pub fn score_for(&self, period: Period) -> Option<ScorePair> {
        if let Some(score) = self.period_scores.get(&period) {
            return Some(*score);
        }
        if period == Period::Final && self.is_over {
            return Some(ScorePair::new(self.home_score, self.away_score));
        }
        None
    }

    pub fn winning_square(&self, period: Period) -> Option<String> {
        self.score_for(period).map(|score| score.winning_value())
    }

    pub fn reached_periods(&self) -> Vec<Period> {
        Period::ALL
            .into_iter()
            .filter(|period| self.period_reached(*period))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winning_value_uses_last_digits() {
        assert_eq!(ScorePair::new(7, 13).winning_value(), "37");
        assert_eq!(ScorePair::new(20, 0).winning_value(), "00");
        assert_eq!(ScorePair::new(31, 24).winning_value(), "41");
    }

    #[test]
    fn periods_reached_by_quarter() {
        let mut game = Game::new("g1");
        assert!(game.reached_periods().is_empty());
        game.quarter = 2;
        assert_eq!(game.reached_periods(), vec![Period::Q1]);
        game.quarter = 4;
        assert_eq!(game.reached_periods(), vec![Period::Q1, Period::Q2, Period::Q3]);
        game.is_over = true;
        assert_eq!(game.reached_periods(), Period::ALL.to_vec());
    }

    #[test]
    fn final_score_falls_back_to_current() {
        let mut game = Game::new("g1");
        game.home_score = 24;
        game.away_score = 17;
        assert_eq!(game.score_for(Period::Final), None);
        game.is_over = true;
        assert_eq!(game.score_for(Period::Final), Some(ScorePair::new(24, 17)));
        assert_eq!(game.winning_square(Period::Final).as_deref(), Some("74"));
        assert_eq!(game.score_for(Period::Q1), None);
    }

    #[test]
    fn period_wire_names() {
        let json = serde_json::to_string(&Period::Final).unwrap();
        assert_eq!(json, "\"final\"");
        assert_eq!("Q2".parse::<Period>(), Ok(Period::Q2));
        assert_eq!("half".parse::<Period>(), Ok(Period::Q2));
        assert!("q5".parse::<Period>().is_err());
    }

    #[test]
    fn game_deserializes_feed_record() {
        let game: Game = serde_json::from_str(
            r#"{"id":"401","homeScore":7,"awayScore":13,"quarter":2,"isLive":true,
                "periodScores":{"q1":{"home":7,"away":13}}}"#,
        )
        .unwrap();
        assert!(game.is_live);
        assert_eq!(game.score_for(Period::Q1), Some(ScorePair::new(7, 13)));
    }
}
