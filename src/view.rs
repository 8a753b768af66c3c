//! View projection
//!
//! Maps the shared record and this client's identity to view descriptors.
//! Nothing here is stored: every value is derived again from the record
//! whenever it changes, including the reveal countdown, which is computed
//! from the absolute deadline each time.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_with::skip_serializing_none;
use web_time::Duration;

use crate::{
    game::Identity,
    leaderboard::{self, Standing},
    questions::{Answers, Question, QuestionBank},
    record::{GameRecord, Reveal, Round},
    room_code::RoomCode,
};

/// A player as shown in the waiting room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    /// The player's name
    pub name: String,
    /// Whether the player hosts the room
    pub is_host: bool,
    /// Whether this is the local player
    pub is_you: bool,
}

/// The lobby before a game starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomView {
    /// Code to share with other players
    pub room: RoomCode,
    /// Players in join order
    pub players: Vec<PlayerView>,
    /// Number of players in the room
    pub joined: usize,
    /// Capacity of the room
    pub max_players: usize,
    /// Whether the local player hosts the room
    pub is_host: bool,
    /// Whether to offer the start control
    ///
    /// Only the host sees it, once the room is full. The transition itself
    /// does not require a full room.
    pub can_start: bool,
}

impl WaitingRoomView {
    /// Projects the waiting room
    pub fn new(room: RoomCode, record: &GameRecord, identity: &Identity) -> Self {
        Self {
            room,
            players: record
                .players
                .iter()
                .map(|p| PlayerView {
                    name: p.name.clone(),
                    is_host: p.is_host,
                    is_you: p.name == identity.player_name,
                })
                .collect(),
            joined: record.players.len(),
            max_players: record.max_players,
            is_host: identity.is_host,
            can_start: identity.is_host && record.is_full(),
        }
    }
}

/// Every player answering the question bank about themselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsweringView {
    /// Questions in display order
    pub questions: Vec<Question>,
    /// Options the local player picked but has not submitted
    pub selections: Answers,
    /// Whether the local player already submitted
    pub submitted: bool,
    /// Players who submitted
    pub answered: usize,
    /// Players in the room
    pub total: usize,
}

impl AnsweringView {
    /// Projects the answering phase
    pub fn new(
        record: &GameRecord,
        identity: &Identity,
        bank: &QuestionBank,
        selections: &Answers,
    ) -> Self {
        Self {
            questions: bank.questions().to_vec(),
            selections: selections.clone(),
            submitted: record.player_answers.contains_key(&identity.player_name),
            answered: record.answered_count(),
            total: record.players.len(),
        }
    }
}

/// The correct answers and score changes after a round
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealView {
    /// Player whose answers were guessed
    pub target: String,
    /// The target's actual answers
    pub answers: Answers,
    /// Score change per guesser
    pub scores: BTreeMap<String, i64>,
    /// The local player's score change, if they guessed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_delta: Option<i64>,
    /// Time left before the next round, never negative
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub remaining: Duration,
}

impl RevealView {
    /// Projects a reveal as seen at `now_millis`
    pub fn new(reveal: &Reveal, identity: &Identity, now_millis: u64) -> Self {
        Self {
            target: reveal.target.clone(),
            answers: reveal.answers.clone(),
            scores: reveal.scores.clone(),
            your_delta: reveal.scores.get(&identity.player_name).copied(),
            remaining: Duration::from_millis(reveal.until.saturating_sub(now_millis)),
        }
    }
}

/// One guessing round
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuessingView {
    /// Player being guessed
    pub target: String,
    /// Position of the target in the rotation
    pub target_index: usize,
    /// Number of rounds in the game
    pub rounds: usize,
    /// Whether the local player is the target and only waits
    pub is_target: bool,
    /// Questions in display order
    pub questions: Vec<Question>,
    /// Guesses the local player picked but has not submitted
    pub selections: Answers,
    /// Whether the local player already guessed this target
    pub submitted: bool,
    /// Guessers who submitted
    pub guessed: usize,
    /// Guessers needed to complete the round
    pub needed: usize,
    /// The local player's accumulated score
    pub score: i64,
    /// Present while the reveal countdown runs
    pub reveal: Option<RevealView>,
}

impl GuessingView {
    /// Projects the running round
    pub fn new(
        record: &GameRecord,
        round: &Round,
        identity: &Identity,
        bank: &QuestionBank,
        selections: &Answers,
        now_millis: u64,
    ) -> Self {
        let target = record
            .players
            .get(round.current_target)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let for_target = round.guesses.get(&target);

        Self {
            is_target: target == identity.player_name,
            submitted: for_target.is_some_and(|g| g.contains_key(&identity.player_name)),
            guessed: for_target.map_or(0, BTreeMap::len),
            target,
            target_index: round.current_target,
            rounds: record.players.len(),
            questions: bank.questions().to_vec(),
            selections: selections.clone(),
            needed: record.guessers_needed(),
            score: record
                .scores
                .get(&identity.player_name)
                .copied()
                .unwrap_or(0),
            reveal: round
                .reveal
                .as_ref()
                .map(|r| RevealView::new(r, identity, now_millis)),
        }
    }
}

/// Final standings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsView {
    /// Players from highest to lowest score
    pub standings: Vec<Standing>,
    /// What every player answered about themselves
    pub answers: BTreeMap<String, Answers>,
    /// Whether to offer the play again control
    pub is_host: bool,
}

impl ResultsView {
    /// Projects the results
    pub fn new(record: &GameRecord, identity: &Identity) -> Self {
        Self {
            standings: leaderboard::standings(record),
            answers: record.player_answers.clone(),
            is_host: identity.is_host,
        }
    }
}

/// Full view switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncMessage {
    /// Show the waiting room
    WaitingRoom(WaitingRoomView),
    /// Show the answer cards
    Answering(AnsweringView),
    /// Show the guessing round
    Guessing(GuessingView),
    /// Show the final standings
    Results(ResultsView),
    /// The host left and the room no longer exists
    RoomClosed,
}

impl SyncMessage {
    /// Converts the sync message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// In-place refreshes of the current view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UpdateMessage {
    /// Someone joined the waiting room
    Players(WaitingRoomView),
    /// Someone submitted their answers
    AnswerProgress {
        /// Players who submitted
        answered: usize,
        /// Players in the room
        total: usize,
    },
    /// Someone submitted guesses for the current target
    GuessProgress {
        /// Guessers who submitted
        guessed: usize,
        /// Guessers needed to complete the round
        needed: usize,
    },
    /// The round resolved and the countdown started
    Reveal(RevealView),
    /// The reveal ended and the next target is up
    NextTarget(GuessingView),
}

impl UpdateMessage {
    /// Converts the update message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}
