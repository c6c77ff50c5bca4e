use serde::{Deserialize, Serialize};

use crate::models::Answer;

/// Two answers to the same question, oriented so `winner` has the strictly
/// higher score.
#[derive(Debug, Clone, Copy)]
pub struct AnswerPair<'a> {
    pub loser: &'a Answer,
    pub winner: &'a Answer,
}

impl<'a> AnswerPair<'a> {
    /// Orients two answers by score. Equal scores carry no preference and
    /// yield `None`.
    pub fn orient(a: &'a Answer, b: &'a Answer) -> Option<Self> {
        let (sa, sb) = (a.score_value(), b.score_value());
        match sa.cmp(&sb) {
            std::cmp::Ordering::Less => Some(Self { loser: a, winner: b }),
            std::cmp::Ordering::Greater => Some(Self { loser: b, winner: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Seconds between the two answers, if both carry a timestamp.
    pub fn time_diff(&self) -> Option<f64> {
        Some((self.winner.created_utc? - self.loser.created_utc?).abs())
    }

    /// Longer body length over shorter body length, in characters.
    pub fn len_ratio(&self) -> f64 {
        let a = self.loser.body_text().chars().count() as f64;
        let b = self.winner.body_text().chars().count() as f64;
        let (short, long) = if a < b { (a, b) } else { (b, a) };
        if short == 0.0 {
            return f64::INFINITY;
        }
        long / short
    }

    /// Winner score over loser score. Unbounded when the loser's score is
    /// not positive.
    pub fn score_ratio(&self) -> f64 {
        let low = self.loser.score_value();
        if low <= 0 {
            return f64::INFINITY;
        }
        self.winner.score_value() as f64 / low as f64
    }
}

/// Pairwise filters; `None` disables a criterion. Bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PairFilters {
    #[serde(default)]
    pub max_time_diff: Option<f64>,
    #[serde(default)]
    pub max_len_ratio: Option<f64>,
    #[serde(default)]
    pub min_score_ratio: Option<f64>,
}

impl PairFilters {
    pub fn accepts(&self, pair: &AnswerPair<'_>) -> bool {
        if let Some(max) = self.max_time_diff {
            match pair.time_diff() {
                Some(diff) if diff <= max => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_len_ratio {
            if pair.len_ratio() > max {
                return false;
            }
        }
        if let Some(min) = self.min_score_ratio {
            if pair.score_ratio() < min {
                return false;
            }
        }
        true
    }
}
