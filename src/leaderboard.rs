//! Scoring and standings
//!
//! A guesser earns a point for every question where their guess matches
//! the target's answer and loses one for every miss, so a round is worth
//! between `-n` and `+n` for an `n` question bank.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::Serialize;

use crate::{
    questions::{Answers, QuestionBank},
    record::GameRecord,
};

/// Score change for one guesser in one round
///
/// Questions the target never answered count as misses.
pub fn score_delta(target_answers: &Answers, guesses: &Answers, bank: &QuestionBank) -> i64 {
    bank.questions()
        .iter()
        .map(|q| match (target_answers.get(&q.id), guesses.get(&q.id)) {
            (Some(actual), Some(guess)) if actual == guess => 1,
            _ => -1,
        })
        .sum()
}

/// Score changes for every guesser of a target
pub fn round_deltas(
    target_answers: &Answers,
    guesses_by_guesser: &BTreeMap<String, Answers>,
    bank: &QuestionBank,
) -> BTreeMap<String, i64> {
    guesses_by_guesser
        .iter()
        .map(|(guesser, guesses)| {
            (
                guesser.clone(),
                score_delta(target_answers, guesses, bank),
            )
        })
        .collect()
}

/// A player's place in the final standings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Standing {
    /// The player's name
    pub name: String,
    /// Accumulated score
    pub score: i64,
    /// Whether the player shares the top score
    pub winner: bool,
}

/// Orders players by score, highest first
///
/// Ties keep join order. Every player at the top score is a winner; a room
/// with no players has no winners.
pub fn standings(record: &GameRecord) -> Vec<Standing> {
    let scored = record
        .players
        .iter()
        .map(|p| (p.name.clone(), record.scores.get(&p.name).copied().unwrap_or(0)))
        .sorted_by(|(_, a), (_, b)| b.cmp(a))
        .collect_vec();

    let top = scored.first().map(|(_, score)| *score);

    scored
        .into_iter()
        .map(|(name, score)| Standing {
            winner: Some(score) == top,
            name,
            score,
        })
        .collect()
}
