//! The shared game record and its phase state machine
//!
//! A [`GameRecord`] is stored verbatim at the room's key and is the only
//! state shared between clients. Inside the crate the phase and its round
//! data are an explicit [`State`] sum type; on the wire the record keeps the
//! flat `phase`/`currentTarget`/`guesses`/`reveal` layout that every client
//! reads and writes.
//!
//! Every transition here is a pure function of the record. Transitions
//! that a retried write may repeat (start, advance, play again) report
//! [`Change::Unchanged`] instead of failing when they were already applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::ValidationError,
    leaderboard,
    names,
    questions::{Answers, QuestionBank},
};

/// Guesses keyed by target name, then by guesser name
pub type Guesses = BTreeMap<String, BTreeMap<String, Answers>>;

/// The phase every client derives its active view from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Players are joining
    #[display("waiting")]
    Waiting,
    /// Every player answers the question bank about themselves
    #[display("answering")]
    Answering,
    /// Players guess one target's answers at a time
    #[display("guessing")]
    Guessing,
    /// Final scores
    #[display("results")]
    Results,
}

/// A member of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Unique name within the room
    pub name: String,
    /// Whether this player created the room
    pub is_host: bool,
}

impl Player {
    /// The player who created the room
    pub fn host(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            is_host: true,
        }
    }

    /// A player who joined an existing room
    pub fn guest(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            is_host: false,
        }
    }
}

/// The post-round payload shown during the reveal countdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reveal {
    /// Name of the player whose answers were guessed
    pub target: String,
    /// The target's actual answers
    pub answers: Answers,
    /// Score change per guesser for this round
    pub scores: BTreeMap<String, i64>,
    /// Deadline in milliseconds since the Unix epoch
    pub until: u64,
}

/// One guessing cycle for the target at `current_target`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Round {
    /// Index into the room's players of the player being guessed
    pub current_target: usize,
    /// Guesses for every target so far
    pub guesses: Guesses,
    /// Present only while the reveal countdown runs
    pub reveal: Option<Reveal>,
}

/// Phase together with the data that only exists in that phase
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    /// Players are joining
    #[default]
    Waiting,
    /// Players are answering about themselves
    Answering,
    /// A guessing round is running
    Guessing(Round),
    /// Every target has been guessed
    Results {
        /// All guesses made during the game
        guesses: Guesses,
    },
}

impl State {
    /// The wire phase of this state
    pub fn phase(&self) -> Phase {
        match self {
            Self::Waiting => Phase::Waiting,
            Self::Answering => Phase::Answering,
            Self::Guessing(_) => Phase::Guessing,
            Self::Results { .. } => Phase::Results,
        }
    }

    /// First state after everyone answered
    ///
    /// With fewer than two players no round can ever complete, so the game
    /// goes straight to results.
    fn begin_guessing(player_count: usize) -> Self {
        if player_count < 2 {
            Self::Results {
                guesses: Guesses::new(),
            }
        } else {
            Self::Guessing(Round::default())
        }
    }

    /// State after the reveal for `round` has been dismissed
    fn after_reveal(round: Round, player_count: usize) -> Self {
        let next = round.current_target + 1;
        if next >= player_count {
            Self::Results {
                guesses: round.guesses,
            }
        } else {
            Self::Guessing(Round {
                current_target: next,
                guesses: round.guesses,
                reveal: None,
            })
        }
    }
}

/// How a transition affected the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Nothing needed to change; the transition was already applied
    Unchanged,
    /// Data changed within the same phase
    Updated,
    /// The record moved into a new phase
    Entered(Phase),
}

/// Result of recording one guesser's guesses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuessOutcome {
    /// The guesses were stored; other guessers are still missing
    Recorded {
        /// Guessers still to submit for this target
        remaining: usize,
    },
    /// These guesses completed the round and the reveal was written
    Resolved(Reveal),
}

/// Fields of a record that differ from a newer snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Changes {
    /// `maxPlayers` changed
    pub max_players: bool,
    /// Players joined or the list was replaced
    pub players: bool,
    /// Someone submitted answers
    pub answers: bool,
    /// Scores changed
    pub scores: bool,
    /// Round data changed within the same phase
    pub round: bool,
    /// Phase before and after, when the phase changed
    pub phase: Option<(Phase, Phase)>,
}

impl Changes {
    /// Whether the snapshot was identical
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Wire layout of the shared record
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordSerde {
    #[serde(default)]
    revision: u64,
    phase: Phase,
    max_players: usize,
    #[serde(default)]
    players: Vec<Player>,
    #[serde(default)]
    player_answers: BTreeMap<String, Answers>,
    #[serde(default)]
    current_target: usize,
    #[serde(default)]
    guesses: Guesses,
    #[serde(default)]
    scores: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reveal: Option<Reveal>,
}

/// The entire state shared by the clients of one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecordSerde", into = "RecordSerde")]
pub struct GameRecord {
    /// Number of committed writes; a snapshot with a lower revision is older
    pub revision: u64,
    /// Capacity fixed at room creation
    pub max_players: usize,
    /// Players in join order; the order is the target rotation
    pub players: Vec<Player>,
    /// Each player's own answers
    pub player_answers: BTreeMap<String, Answers>,
    /// Accumulated scores
    pub scores: BTreeMap<String, i64>,
    /// Phase and round data
    pub state: State,
}

impl From<RecordSerde> for GameRecord {
    /// Rebuilds the phase sum type from the flat wire fields
    ///
    /// Round fields that make no sense for the phase are dropped, and a
    /// guessing record whose target ran past the last player is read as
    /// results.
    fn from(serde: RecordSerde) -> Self {
        let RecordSerde {
            revision,
            phase,
            max_players,
            players,
            player_answers,
            current_target,
            guesses,
            scores,
            reveal,
        } = serde;

        let state = match phase {
            Phase::Waiting => State::Waiting,
            Phase::Answering => State::Answering,
            Phase::Guessing if current_target >= players.len() => State::Results { guesses },
            Phase::Guessing => State::Guessing(Round {
                current_target,
                guesses,
                reveal,
            }),
            Phase::Results => State::Results { guesses },
        };

        Self {
            revision,
            max_players,
            players,
            player_answers,
            scores,
            state,
        }
    }
}

impl From<GameRecord> for RecordSerde {
    fn from(record: GameRecord) -> Self {
        let phase = record.state.phase();
        let player_count = record.players.len();
        let (current_target, guesses, reveal) = match record.state {
            State::Waiting | State::Answering => (0, Guesses::new(), None),
            State::Guessing(round) => (round.current_target, round.guesses, round.reveal),
            State::Results { guesses } => (player_count, guesses, None),
        };

        Self {
            revision: record.revision,
            phase,
            max_players: record.max_players,
            players: record.players,
            player_answers: record.player_answers,
            current_target,
            guesses,
            scores: record.scores,
            reveal,
        }
    }
}

impl GameRecord {
    /// Creates the record for a freshly hosted room
    pub fn new(host: Player, max_players: usize) -> Self {
        Self {
            revision: 0,
            max_players,
            scores: BTreeMap::from([(host.name.clone(), 0)]),
            players: vec![host],
            player_answers: BTreeMap::new(),
            state: State::Waiting,
        }
    }

    /// The current phase
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// The running round, if guessing
    pub fn round(&self) -> Option<&Round> {
        match &self.state {
            State::Guessing(round) => Some(round),
            _ => None,
        }
    }

    /// The pending reveal, if any
    pub fn reveal(&self) -> Option<&Reveal> {
        self.round().and_then(|r| r.reveal.as_ref())
    }

    /// The player being guessed this round
    pub fn target(&self) -> Option<&Player> {
        self.round().and_then(|r| self.players.get(r.current_target))
    }

    /// Looks up a player by name
    pub fn player(&self, name: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.name == name)
    }

    /// Whether the room has reached its capacity
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Number of players who have submitted answers
    pub fn answered_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| self.player_answers.contains_key(&p.name))
            .count()
    }

    /// Guesses submitted for the current target
    pub fn current_guesses(&self) -> Option<&BTreeMap<String, Answers>> {
        let target = self.target()?;
        self.round()?.guesses.get(&target.name)
    }

    /// Number of guessers a round needs before it is complete
    pub fn guessers_needed(&self) -> usize {
        self.players.len().saturating_sub(1)
    }

    /// Whether `guesser` already guessed the current target
    pub fn has_guessed(&self, guesser: &str) -> bool {
        self.current_guesses()
            .is_some_and(|g| g.contains_key(guesser))
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), ValidationError> {
        let actual = self.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(ValidationError::WrongPhase { expected, actual })
        }
    }

    /// Adds a player to a waiting room
    ///
    /// Returns the cleaned name the player was stored under.
    ///
    /// # Errors
    ///
    /// * `GameInProgress` - the room is past the waiting phase
    /// * `RoomFull` - `players.len()` already equals `max_players`
    /// * `Name` - the name is blank, too long, inappropriate or taken
    pub fn join(&mut self, name: &str) -> Result<String, ValidationError> {
        if self.phase() != Phase::Waiting {
            return Err(ValidationError::GameInProgress);
        }
        if self.is_full() {
            return Err(ValidationError::RoomFull);
        }
        let name = names::claim(name, &self.players)?;
        self.players.push(Player::guest(&name));
        self.scores.insert(name.clone(), 0);
        Ok(name)
    }

    /// Moves a waiting room into answering
    ///
    /// A full room is not required.
    ///
    /// # Errors
    ///
    /// `WrongPhase` unless the room is waiting or already answering.
    pub fn start(&mut self) -> Result<Change, ValidationError> {
        match self.state {
            State::Waiting => {
                self.state = State::Answering;
                Ok(Change::Entered(Phase::Answering))
            }
            State::Answering => Ok(Change::Unchanged),
            _ => Err(ValidationError::WrongPhase {
                expected: Phase::Waiting,
                actual: self.phase(),
            }),
        }
    }

    /// Stores `player`'s answers, starting the guessing phase once every
    /// player has answered
    ///
    /// Submitting again overwrites the earlier answers.
    ///
    /// # Errors
    ///
    /// * `WrongPhase` - the room is not answering
    /// * `UnknownPlayer` - `player` is not in the room
    /// * `Selection` - the answers are incomplete or invalid
    pub fn submit_answers(
        &mut self,
        player: &str,
        answers: Answers,
        bank: &QuestionBank,
    ) -> Result<Change, ValidationError> {
        self.expect_phase(Phase::Answering)?;
        if self.player(player).is_none() {
            return Err(ValidationError::UnknownPlayer(player.to_owned()));
        }
        bank.check_complete(&answers)?;

        self.player_answers.insert(player.to_owned(), answers);

        if self.answered_count() == self.players.len() {
            self.state = State::begin_guessing(self.players.len());
            Ok(Change::Entered(self.phase()))
        } else {
            Ok(Change::Updated)
        }
    }

    /// Stores `guesser`'s guesses about the target at `target_index`
    ///
    /// When these guesses complete the round, the round is scored and the
    /// reveal is written with a deadline of `now_millis + reveal_millis`, all
    /// in the same update. Scoring can only happen once per target because a
    /// resolved round accepts no further guesses.
    ///
    /// # Errors
    ///
    /// * `WrongPhase` - the room is not guessing
    /// * `StaleTarget` - `target_index` is not the current target
    /// * `RoundResolved` - the reveal for this target is already running
    /// * `UnknownPlayer` - `guesser` is not in the room
    /// * `SelfGuess` - `guesser` is the target
    /// * `AlreadyGuessed` - `guesser` already guessed this target
    /// * `Selection` - the guesses are incomplete or invalid
    pub fn submit_guesses(
        &mut self,
        guesser: &str,
        target_index: usize,
        guesses: Answers,
        bank: &QuestionBank,
        now_millis: u64,
        reveal_millis: u64,
    ) -> Result<GuessOutcome, ValidationError> {
        let actual = self.phase();
        let player_count = self.players.len();
        let guesser_known = self.player(guesser).is_some();
        let State::Guessing(round) = &mut self.state else {
            return Err(ValidationError::WrongPhase {
                expected: Phase::Guessing,
                actual,
            });
        };
        if round.current_target != target_index {
            return Err(ValidationError::StaleTarget);
        }
        if round.reveal.is_some() {
            return Err(ValidationError::RoundResolved);
        }
        let Some(target) = self.players.get(target_index) else {
            return Err(ValidationError::StaleTarget);
        };
        if !guesser_known {
            return Err(ValidationError::UnknownPlayer(guesser.to_owned()));
        }
        if target.name == guesser {
            return Err(ValidationError::SelfGuess);
        }
        if round
            .guesses
            .get(&target.name)
            .is_some_and(|g| g.contains_key(guesser))
        {
            return Err(ValidationError::AlreadyGuessed);
        }
        bank.check_complete(&guesses)?;

        let for_target = round.guesses.entry(target.name.clone()).or_default();
        for_target.insert(guesser.to_owned(), guesses);

        let needed = player_count.saturating_sub(1);
        if for_target.len() < needed {
            return Ok(GuessOutcome::Recorded {
                remaining: needed - for_target.len(),
            });
        }

        let answers = self
            .player_answers
            .get(&target.name)
            .cloned()
            .unwrap_or_default();
        let deltas = leaderboard::round_deltas(&answers, for_target, bank);
        for (name, delta) in &deltas {
            *self.scores.entry(name.clone()).or_default() += delta;
        }
        let reveal = Reveal {
            target: target.name.clone(),
            answers,
            scores: deltas,
            until: now_millis.saturating_add(reveal_millis),
        };
        round.reveal = Some(reveal.clone());
        Ok(GuessOutcome::Resolved(reveal))
    }

    /// Dismisses the reveal for `expected_target` and moves to the next
    /// target, or to results after the last one
    ///
    /// Advancing a target that was already advanced past is a no-op, so a
    /// duplicate advance from a retried write or a second scheduler cannot
    /// skip a round.
    ///
    /// # Errors
    ///
    /// * `WrongPhase` - the room is neither guessing nor showing results
    /// * `RoundNotResolved` - the current round has no reveal yet
    pub fn advance(&mut self, expected_target: usize) -> Result<Change, ValidationError> {
        let player_count = self.players.len();
        let actual = self.phase();
        match std::mem::take(&mut self.state) {
            State::Guessing(round)
                if round.current_target == expected_target && round.reveal.is_some() =>
            {
                self.state = State::after_reveal(round, player_count);
                Ok(match self.phase() {
                    Phase::Results => Change::Entered(Phase::Results),
                    _ => Change::Updated,
                })
            }
            state => {
                let outcome = match &state {
                    State::Results { .. } => Ok(Change::Unchanged),
                    State::Guessing(round) if round.current_target > expected_target => {
                        Ok(Change::Unchanged)
                    }
                    State::Guessing(round) if round.current_target == expected_target => {
                        Err(ValidationError::RoundNotResolved)
                    }
                    State::Guessing(_) => Err(ValidationError::StaleTarget),
                    State::Waiting | State::Answering => Err(ValidationError::WrongPhase {
                        expected: Phase::Guessing,
                        actual,
                    }),
                };
                self.state = state;
                outcome
            }
        }
    }

    /// Returns a finished room to waiting for another game
    ///
    /// Players and capacity are kept; answers, guesses and the reveal are
    /// cleared and every score goes back to zero.
    ///
    /// # Errors
    ///
    /// `WrongPhase` unless the room shows results or is already waiting.
    pub fn reset(&mut self) -> Result<Change, ValidationError> {
        match self.state {
            State::Results { .. } => {
                self.state = State::Waiting;
                self.player_answers.clear();
                self.scores = self.players.iter().map(|p| (p.name.clone(), 0)).collect();
                Ok(Change::Entered(Phase::Waiting))
            }
            State::Waiting => Ok(Change::Unchanged),
            _ => Err(ValidationError::WrongPhase {
                expected: Phase::Results,
                actual: self.phase(),
            }),
        }
    }

    /// Advances the revision ahead of a write
    pub fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Whether `other` is an older snapshot of this record
    pub fn supersedes(&self, other: &GameRecord) -> bool {
        other.revision < self.revision
    }

    /// Merges a newer snapshot into this record field by field and reports
    /// what differed
    ///
    /// The revision is taken over silently; it never counts as a change.
    pub fn merge(&mut self, incoming: GameRecord) -> Changes {
        let GameRecord {
            revision,
            max_players,
            players,
            player_answers,
            scores,
            state,
        } = incoming;

        self.revision = revision;
        let mut changes = Changes::default();
        if self.max_players != max_players {
            self.max_players = max_players;
            changes.max_players = true;
        }
        if self.players != players {
            self.players = players;
            changes.players = true;
        }
        if self.player_answers != player_answers {
            self.player_answers = player_answers;
            changes.answers = true;
        }
        if self.scores != scores {
            self.scores = scores;
            changes.scores = true;
        }
        if self.state != state {
            let before = self.phase();
            self.state = state;
            let after = self.phase();
            if before == after {
                changes.round = true;
            } else {
                changes.phase = Some((before, after));
            }
        }
        changes
    }
}
