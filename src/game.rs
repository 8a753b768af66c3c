//! The game session controller
//!
//! A [`Game`] is one client's view of one room. It owns this client's
//! identity, its last observed copy of the shared record, the in-progress
//! selections the player has not submitted yet, and the host's pending
//! round advance. It is constructed when a room is created, joined or
//! resumed, and consumed when the player leaves.
//!
//! Every local action is a transition applied to a fresh copy of the
//! shared record inside a store transaction. Whatever the store returns,
//! and every snapshot that arrives by push or poll, goes through
//! [`Game::reconcile`], which is the only place that touches the local
//! record, the view and the advance schedule.

use std::{fmt::Debug, sync::Arc};

use serde::{Deserialize, Serialize};
use web_time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    config::Settings,
    constants::room::{MAX_PLAYERS, MIN_PLAYERS},
    error::{Error, ValidationError},
    names,
    persistence::Persistence,
    questions::Answers,
    record::{Change, Changes, GameRecord, GuessOutcome, Phase, Player, Round, State},
    room_code::RoomCode,
    session::Tunnel,
    store::{StorageError, Store, Transaction},
    sync::{Incoming, Source, Synchronizer},
    view::{
        AnsweringView, GuessingView, ResultsView, RevealView, SyncMessage, UpdateMessage,
        WaitingRoomView,
    },
};

/// Source of the current wall-clock time
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Collaborators shared by every session on this client
#[derive(Clone)]
pub struct Context {
    /// Where shared records are read and written
    pub persistence: Arc<Persistence>,
    /// Timings and the question bank
    pub settings: Settings,
    clock: Clock,
}

impl Context {
    /// Creates a context that reads the system clock
    pub fn new(persistence: Arc<Persistence>, settings: Settings) -> Self {
        Self {
            persistence,
            settings,
            clock: Arc::new(SystemTime::now),
        }
    }

    /// Replaces the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The current time
    pub fn now(&self) -> SystemTime {
        (self.clock)()
    }

    /// The current time in milliseconds since the Unix epoch
    pub fn now_millis(&self) -> u64 {
        millis_since_epoch(self.now())
    }

    fn reveal_millis(&self) -> u64 {
        u64::try_from(self.settings.reveal_duration.as_millis()).unwrap_or(u64::MAX)
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Who this client is within the room
///
/// Set when the room is created, joined or resumed and never re-derived from
/// later snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// The name this client plays under
    pub player_name: String,
    /// Whether this client may start, advance and reset the game
    pub is_host: bool,
}

/// Identifies one scheduled round advance
///
/// Observing the same reveal again yields the same key, so the host never
/// holds more than one pending advance per reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdvanceKey {
    /// The room the reveal belongs to
    pub room: RoomCode,
    /// Index of the target whose reveal is showing
    pub target: usize,
    /// Reveal deadline in milliseconds since the Unix epoch
    pub until: u64,
}

/// Deferred actions the embedding application must deliver back through
/// [`Game::receive_alarm`] once their delay has passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// Dismiss the reveal and move to the next target
    AdvanceRound(AdvanceKey),
}

/// What reconciling a snapshot did to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The snapshot matched the local record
    Unchanged,
    /// Same phase; the current view was refreshed in place
    Refreshed,
    /// The phase changed and the view was switched
    Switched(Phase),
    /// The snapshot was older than the local record and was dropped
    Stale,
    /// The room no longer exists
    Closed,
}

#[derive(Debug, Default)]
struct Drafts {
    answers: Answers,
    guesses: Answers,
}

impl Drafts {
    fn clear(&mut self) {
        self.answers.clear();
        self.guesses.clear();
    }
}

/// A no-op scheduler for transitions that can never produce a reveal
fn no_alarms(_: AlarmMessage, _: Duration) {}

/// The result of running a transition inside a store transaction
struct Applied<R> {
    outcome: Result<R, Error>,
    /// The record the transition ended with, or `Some(None)` when the room
    /// was missing; `None` if the store failed before the record was read
    latest: Option<Option<GameRecord>>,
}

/// Runs `transition` against the stored record
///
/// Only a record that actually changed is written. A rejected transition
/// writes nothing and reports the record it was rejected against.
async fn apply<R, F>(persistence: &Persistence, room: RoomCode, mut transition: F) -> Applied<R>
where
    R: Send,
    F: FnMut(&mut GameRecord) -> Result<R, ValidationError> + Send,
{
    let mut outcome = None;
    let mut latest = None;

    let written = persistence
        .transact(room, &mut |current: Option<GameRecord>| {
            let Some(mut record) = current else {
                outcome = Some(Err(Error::NotFound(room)));
                latest = Some(None);
                return Transaction::Abort;
            };
            let before = record.clone();
            match transition(&mut record) {
                Ok(value) => {
                    outcome = Some(Ok(value));
                    if record == before {
                        latest = Some(Some(record));
                        Transaction::Abort
                    } else {
                        record.bump();
                        latest = Some(Some(record.clone()));
                        Transaction::Commit(record)
                    }
                }
                Err(e) => {
                    outcome = Some(Err(e.into()));
                    latest = Some(Some(before));
                    Transaction::Abort
                }
            }
        })
        .await;

    match written {
        Ok(_) => Applied {
            outcome: outcome.unwrap_or(Err(Error::Storage(StorageError::Conflict))),
            latest,
        },
        Err(e) => Applied {
            outcome: Err(e.into()),
            latest: None,
        },
    }
}

/// One client's session in a room
pub struct Game<T: Tunnel> {
    room: RoomCode,
    identity: Identity,
    record: GameRecord,
    context: Context,
    sync: Synchronizer,
    tunnel: T,
    pending_advance: Option<AdvanceKey>,
    drafts: Drafts,
    closed: bool,
}

impl<T: Tunnel> Debug for Game<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("room", &self.room)
            .field("identity", &self.identity)
            .field("phase", &self.record.phase())
            .finish_non_exhaustive()
    }
}

impl<T: Tunnel> Game<T> {
    /// Hosts a new room
    ///
    /// Draws a room code, writes the initial record with the host as its
    /// only player, and shows the waiting room.
    ///
    /// # Arguments
    ///
    /// * `context` - Persistence, settings and clock
    /// * `tunnel` - Where views are sent
    /// * `host_name` - The host's display name
    /// * `max_players` - Room capacity
    ///
    /// # Errors
    ///
    /// * `Capacity` - `max_players` is outside the supported bounds
    /// * `Name` - the host name is blank, too long or inappropriate
    /// * `Storage` - neither the remote nor the local store accepted the record
    pub async fn create(
        context: Context,
        tunnel: T,
        host_name: &str,
        max_players: usize,
    ) -> Result<Self, Error> {
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&max_players) {
            return Err(ValidationError::Capacity {
                min: MIN_PLAYERS,
                max: MAX_PLAYERS,
            }
            .into());
        }
        let name = names::clean(host_name)?;
        let room = RoomCode::new();
        let record = GameRecord::new(Player::host(&name), max_players);

        context.persistence.put(room, &record).await?;
        tracing::info!(room = %room, player = %name, max_players, "room created");

        let identity = Identity {
            player_name: name,
            is_host: true,
        };
        Self::attach(context, tunnel, room, identity, record, &mut no_alarms)
    }

    /// Joins an existing room by its typed code
    ///
    /// The player is added inside a transaction, so two players joining at
    /// once cannot overfill the room or take the same name.
    ///
    /// # Errors
    ///
    /// * `RoomCode` - the code is not six digits
    /// * `Name` - the name is blank, too long, inappropriate or taken
    /// * `NotFound` - no room exists under the code
    /// * `RoomFull` - the room is at capacity
    /// * `GameInProgress` - the room has already started
    pub async fn join(context: Context, tunnel: T, code: &str, name: &str) -> Result<Self, Error> {
        let room: RoomCode = code.parse()?;
        let name = names::clean(name)?;

        let Applied { outcome, latest } =
            apply(&context.persistence, room, |record| record.join(&name)).await;
        let player_name = outcome?;
        let record = latest.flatten().ok_or(Error::NotFound(room))?;
        tracing::info!(room = %room, player = %player_name, "joined room");

        let identity = Identity {
            player_name,
            is_host: false,
        };
        Self::attach(context, tunnel, room, identity, record, &mut no_alarms)
    }

    /// Re-attaches to a room this client was already part of
    ///
    /// Host rights are taken from the player's entry in the record. A host
    /// resuming during a reveal schedules the advance that was missed while
    /// it was away.
    ///
    /// # Errors
    ///
    /// * `NotFound` - the room no longer exists
    /// * `UnknownPlayer` - no player by that name is in the room
    pub async fn resume<S: FnMut(AlarmMessage, Duration)>(
        context: Context,
        tunnel: T,
        room: RoomCode,
        player_name: &str,
        mut schedule_message: S,
    ) -> Result<Self, Error> {
        let record = context
            .persistence
            .get(room)
            .await?
            .ok_or(Error::NotFound(room))?;
        let player = record
            .player(player_name.trim())
            .ok_or_else(|| ValidationError::UnknownPlayer(player_name.to_owned()))?;
        let identity = Identity {
            player_name: player.name.clone(),
            is_host: player.is_host,
        };
        tracing::info!(room = %room, player = %identity.player_name, host = identity.is_host, "resumed room");

        Self::attach(context, tunnel, room, identity, record, &mut schedule_message)
    }

    fn attach<S: FnMut(AlarmMessage, Duration)>(
        context: Context,
        tunnel: T,
        room: RoomCode,
        identity: Identity,
        record: GameRecord,
        schedule_message: &mut S,
    ) -> Result<Self, Error> {
        let subscription = context.persistence.subscribe(room)?;
        let sync = Synchronizer::new(room, subscription, context.settings.poll_interval);

        let mut game = Self {
            room,
            identity,
            record,
            context,
            sync,
            tunnel,
            pending_advance: None,
            drafts: Drafts::default(),
            closed: false,
        };
        game.tunnel.send_state(&game.state_message());
        game.sync_advance(schedule_message);
        Ok(game)
    }

    /// Leaves the room and closes the view
    ///
    /// A leaving host deletes the shared record, which closes the room for
    /// everyone. Anyone else only drops their local session; their slot in
    /// the room is kept.
    ///
    /// # Errors
    ///
    /// `Storage` if the host's delete failed on both stores. The view is
    /// closed either way.
    pub async fn leave(self) -> Result<(), Error> {
        let Self {
            room,
            identity,
            context,
            tunnel,
            closed,
            ..
        } = self;

        let removed = if identity.is_host && !closed {
            context.persistence.remove(room).await.map_err(Error::from)
        } else {
            Ok(())
        };
        tracing::info!(room = %room, player = %identity.player_name, host = identity.is_host, "left room");

        tunnel.close();
        removed
    }

    /// The room this session belongs to
    pub fn room(&self) -> RoomCode {
        self.room
    }

    /// This client's identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The last observed shared record
    pub fn record(&self) -> &GameRecord {
        &self.record
    }

    /// The phase of the last observed record
    pub fn phase(&self) -> Phase {
        self.record.phase()
    }

    /// Whether the room has been removed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The advance the host is waiting to run, if any
    pub fn pending_advance(&self) -> Option<AdvanceKey> {
        self.pending_advance
    }

    /// Answers picked but not yet submitted
    pub fn answer_selections(&self) -> &Answers {
        &self.drafts.answers
    }

    /// Guesses picked for the current target but not yet submitted
    pub fn guess_selections(&self) -> &Answers {
        &self.drafts.guesses
    }

    fn require_host(&self) -> Result<(), ValidationError> {
        if self.identity.is_host {
            Ok(())
        } else {
            Err(ValidationError::NotHost)
        }
    }

    fn require_phase(&self, expected: Phase) -> Result<(), ValidationError> {
        let actual = self.record.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(ValidationError::WrongPhase { expected, actual })
        }
    }

    /// Moves the room from waiting to answering
    ///
    /// Host only. A full room is not required.
    ///
    /// # Errors
    ///
    /// * `NotHost` - this client is not the host
    /// * `WrongPhase` - the game is already past answering
    pub async fn start<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        mut schedule_message: S,
    ) -> Result<Change, Error> {
        self.require_host()?;
        let change = self.mutate(&mut schedule_message, GameRecord::start).await?;
        tracing::info!(room = %self.room, "game started");
        Ok(change)
    }

    /// Records a selection for one question while answering
    ///
    /// # Errors
    ///
    /// `WrongPhase` outside answering, or `Selection` for an unknown
    /// question or option.
    pub fn select_answer(&mut self, question: &str, option: &str) -> Result<(), Error> {
        self.require_phase(Phase::Answering)?;
        self.context
            .settings
            .questions
            .check_selection(question, option)?;
        self.drafts
            .answers
            .insert(question.to_owned(), option.to_owned());
        Ok(())
    }

    /// Submits the local player's answers about themselves
    ///
    /// Incomplete answers are rejected before anything is written. The
    /// write that completes everyone's answers also starts guessing.
    ///
    /// # Errors
    ///
    /// * `Selection` - a question is unanswered or an option is unknown
    /// * `WrongPhase` - the room is not answering
    pub async fn submit_answers<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        answers: Answers,
        mut schedule_message: S,
    ) -> Result<Change, Error> {
        self.context.settings.questions.check_complete(&answers)?;

        let player = self.identity.player_name.clone();
        let bank = self.context.settings.questions.clone();
        let change = self
            .mutate(&mut schedule_message, move |record| {
                record.submit_answers(&player, answers.clone(), &bank)
            })
            .await?;
        tracing::debug!(room = %self.room, player = %self.identity.player_name, "answers submitted");
        Ok(change)
    }

    /// Submits the answers picked with [`Game::select_answer`]
    ///
    /// # Errors
    ///
    /// As [`Game::submit_answers`].
    pub async fn submit_answer_selections<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        schedule_message: S,
    ) -> Result<Change, Error> {
        let answers = self.drafts.answers.clone();
        self.submit_answers(answers, schedule_message).await
    }

    /// Records a guess for one question about the current target
    ///
    /// # Errors
    ///
    /// `WrongPhase` outside guessing, `SelfGuess` for the target, or
    /// `Selection` for an unknown question or option.
    pub fn select_guess(&mut self, question: &str, option: &str) -> Result<(), Error> {
        self.require_phase(Phase::Guessing)?;
        if self
            .record
            .target()
            .is_some_and(|t| t.name == self.identity.player_name)
        {
            return Err(ValidationError::SelfGuess.into());
        }
        self.context
            .settings
            .questions
            .check_selection(question, option)?;
        self.drafts
            .guesses
            .insert(question.to_owned(), option.to_owned());
        Ok(())
    }

    /// Submits the local player's guesses about the current target
    ///
    /// The guesses are stored and, if they are the last ones needed, the
    /// round is scored and the reveal written, all in one transaction.
    /// Guessers submitting at the same moment therefore never lose a guess
    /// or score a round twice when the store supports transactions.
    ///
    /// # Arguments
    ///
    /// * `guesses` - One option per question
    /// * `schedule_message` - Function to schedule the host's round advance
    ///
    /// # Errors
    ///
    /// * `WrongPhase` - the room is not guessing
    /// * `StaleTarget` - the round moved on since this client last looked
    /// * `RoundResolved` - every guess is already in
    /// * `SelfGuess` - this client is the target
    /// * `AlreadyGuessed` - this client already guessed the target
    /// * `Selection` - the guesses are incomplete or invalid
    pub async fn submit_guesses<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        guesses: Answers,
        mut schedule_message: S,
    ) -> Result<GuessOutcome, Error> {
        let target_index = self
            .record
            .round()
            .map(|r| r.current_target)
            .ok_or(ValidationError::WrongPhase {
                expected: Phase::Guessing,
                actual: self.record.phase(),
            })?;
        self.context.settings.questions.check_complete(&guesses)?;

        let guesser = self.identity.player_name.clone();
        let bank = self.context.settings.questions.clone();
        let now = self.context.now_millis();
        let reveal_millis = self.context.reveal_millis();

        let outcome = self
            .mutate(&mut schedule_message, move |record| {
                record.submit_guesses(
                    &guesser,
                    target_index,
                    guesses.clone(),
                    &bank,
                    now,
                    reveal_millis,
                )
            })
            .await?;

        match &outcome {
            GuessOutcome::Recorded { remaining } => tracing::debug!(
                room = %self.room,
                target = target_index,
                remaining,
                "guesses recorded"
            ),
            GuessOutcome::Resolved(reveal) => tracing::info!(
                room = %self.room,
                target = %reveal.target,
                "round resolved"
            ),
        }
        Ok(outcome)
    }

    /// Submits the guesses picked with [`Game::select_guess`]
    ///
    /// # Errors
    ///
    /// As [`Game::submit_guesses`].
    pub async fn submit_guess_selections<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        schedule_message: S,
    ) -> Result<GuessOutcome, Error> {
        let guesses = self.drafts.guesses.clone();
        self.submit_guesses(guesses, schedule_message).await
    }

    /// Ends the reveal now instead of waiting for the countdown
    ///
    /// Host only. The pending scheduled advance is cancelled, so the round
    /// is advanced exactly once.
    ///
    /// # Errors
    ///
    /// * `NotHost` - this client is not the host
    /// * `WrongPhase` - the room is not guessing
    /// * `RoundNotResolved` - guesses are still missing
    pub async fn continue_round<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        mut schedule_message: S,
    ) -> Result<Change, Error> {
        self.require_host()?;
        let target = match &self.record.state {
            State::Guessing(round) => round.current_target,
            State::Results { .. } => return Ok(Change::Unchanged),
            State::Waiting | State::Answering => {
                return Err(ValidationError::WrongPhase {
                    expected: Phase::Guessing,
                    actual: self.record.phase(),
                }
                .into());
            }
        };
        self.advance(target, &mut schedule_message).await
    }

    async fn advance<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        target: usize,
        schedule_message: &mut S,
    ) -> Result<Change, Error> {
        if let Some(key) = self.pending_advance.take() {
            tracing::debug!(room = %self.room, target = key.target, "pending advance cancelled");
        }
        let change = self
            .mutate(schedule_message, move |record| record.advance(target))
            .await?;
        tracing::debug!(room = %self.room, target, change = ?change, "round advanced");
        Ok(change)
    }

    /// Returns a finished room to the waiting room with scores reset
    ///
    /// Host only.
    ///
    /// # Errors
    ///
    /// * `NotHost` - this client is not the host
    /// * `WrongPhase` - the game is still running
    pub async fn play_again<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        mut schedule_message: S,
    ) -> Result<Change, Error> {
        self.require_host()?;
        let change = self.mutate(&mut schedule_message, GameRecord::reset).await?;
        tracing::info!(room = %self.room, "game reset");
        Ok(change)
    }

    /// Handles scheduled alarm messages
    ///
    /// An alarm for an advance that is no longer pending (cancelled by a
    /// manual continue, replaced by a newer reveal, or cleared by a reset)
    /// is ignored. An alarm delivered before its deadline is scheduled
    /// again for the remaining time.
    ///
    /// # Errors
    ///
    /// As [`Game::continue_round`], minus `NotHost`.
    pub async fn receive_alarm<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        message: AlarmMessage,
        mut schedule_message: S,
    ) -> Result<(), Error> {
        match message {
            AlarmMessage::AdvanceRound(key) => {
                if self.pending_advance != Some(key) {
                    tracing::debug!(room = %self.room, target = key.target, "stale advance ignored");
                    return Ok(());
                }
                let now = self.context.now_millis();
                if now < key.until {
                    schedule_message(message, Duration::from_millis(key.until - now));
                    return Ok(());
                }
                self.advance(key.target, &mut schedule_message)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Feeds every queued push notification, and a poll when one is due,
    /// into [`Game::reconcile`]
    ///
    /// The embedding application calls this whenever the push channel may
    /// have delivered something and at least every poll interval while the
    /// room is waiting.
    pub async fn pump<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        mut schedule_message: S,
    ) -> Vec<Reconciled> {
        if self.sync.has_push() && self.context.persistence.is_degraded() {
            tracing::info!(room = %self.room, "shared store lost, ignoring remote changes");
            self.sync.detach();
        }
        let mut results = self
            .sync
            .drain()
            .into_iter()
            .map(|incoming| self.reconcile(incoming, &mut schedule_message))
            .collect::<Vec<_>>();

        let now = self.context.now();
        if !self.closed && self.sync.poll_due(self.record.phase(), now) {
            if let Some(incoming) = self.sync.poll(self.context.persistence.as_ref(), now).await {
                results.push(self.reconcile(incoming, &mut schedule_message));
            }
        }
        results
    }

    /// Time until [`Game::pump`] should poll, if polling applies
    pub fn next_poll_in(&self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        self.sync
            .next_poll_in(self.record.phase(), self.context.now())
    }

    /// Merges a snapshot of the shared record into the local session
    ///
    /// The snapshot is merged field by field; this client's identity and
    /// unsubmitted selections are kept. A phase change switches the view
    /// and drops the selections; any other change refreshes the current
    /// view in place. Reconciling the same snapshot again changes nothing:
    /// no view message is sent and no second advance is scheduled. A snapshot
    /// with a lower revision than the local record, such as a notification
    /// queued before this client's own later write, is dropped.
    pub fn reconcile<S: FnMut(AlarmMessage, Duration)>(
        &mut self,
        incoming: Incoming,
        mut schedule_message: S,
    ) -> Reconciled {
        if self.closed {
            return Reconciled::Unchanged;
        }
        let Some(record) = incoming.record else {
            tracing::info!(room = %self.room, source = ?incoming.source, "room closed");
            self.closed = true;
            self.pending_advance = None;
            self.tunnel.send_state(&SyncMessage::RoomClosed);
            return Reconciled::Closed;
        };
        if self.record.supersedes(&record) {
            tracing::debug!(
                room = %self.room,
                source = ?incoming.source,
                revision = record.revision,
                current = self.record.revision,
                "stale snapshot dropped"
            );
            return Reconciled::Stale;
        }

        let previous_target = self.record.round().map(|r| r.current_target);
        let had_reveal = self.record.reveal().is_some();
        let changes = self.record.merge(record);

        let reconciled = if changes.is_empty() {
            Reconciled::Unchanged
        } else if let Some((from, to)) = changes.phase {
            tracing::info!(room = %self.room, source = ?incoming.source, %from, %to, "phase changed");
            self.drafts.clear();
            self.tunnel.send_state(&self.state_message());
            Reconciled::Switched(to)
        } else {
            tracing::debug!(room = %self.room, source = ?incoming.source, changes = ?changes, "record refreshed");
            self.refresh(changes, previous_target, had_reveal);
            Reconciled::Refreshed
        };

        self.sync_advance(&mut schedule_message);
        reconciled
    }

    fn refresh(&mut self, changes: Changes, previous_target: Option<usize>, had_reveal: bool) {
        let now = self.context.now_millis();
        match &self.record.state {
            State::Waiting => {
                if changes.players || changes.max_players {
                    self.tunnel.send_message(&UpdateMessage::Players(WaitingRoomView::new(
                        self.room,
                        &self.record,
                        &self.identity,
                    )));
                }
            }
            State::Answering => {
                if changes.answers || changes.players {
                    self.tunnel.send_message(&UpdateMessage::AnswerProgress {
                        answered: self.record.answered_count(),
                        total: self.record.players.len(),
                    });
                }
            }
            State::Guessing(round) => {
                if previous_target != Some(round.current_target) {
                    self.drafts.guesses.clear();
                    self.tunnel
                        .send_message(&UpdateMessage::NextTarget(GuessingView::new(
                            &self.record,
                            round,
                            &self.identity,
                            &self.context.settings.questions,
                            &self.drafts.guesses,
                            now,
                        )));
                } else if let Some(reveal) = round.reveal.as_ref().filter(|_| !had_reveal) {
                    self.tunnel.send_message(&UpdateMessage::Reveal(RevealView::new(
                        reveal,
                        &self.identity,
                        now,
                    )));
                } else if changes.round {
                    self.tunnel.send_message(&UpdateMessage::GuessProgress {
                        guessed: self.record.current_guesses().map_or(0, |g| g.len()),
                        needed: self.record.guessers_needed(),
                    });
                }
            }
            State::Results { .. } => {}
        }
    }

    /// Keeps the host's pending advance in line with the observed reveal
    fn sync_advance<S: FnMut(AlarmMessage, Duration)>(&mut self, schedule_message: &mut S) {
        let wanted = match &self.record.state {
            State::Guessing(Round {
                current_target,
                reveal: Some(reveal),
                ..
            }) if self.identity.is_host && !self.closed => Some(AdvanceKey {
                room: self.room,
                target: *current_target,
                until: reveal.until,
            }),
            _ => None,
        };
        if wanted == self.pending_advance {
            return;
        }

        if let Some(old) = self.pending_advance.take() {
            tracing::debug!(room = %self.room, target = old.target, "pending advance cancelled");
        }
        if let Some(key) = wanted {
            let delay = Duration::from_millis(key.until.saturating_sub(self.context.now_millis()));
            tracing::debug!(room = %self.room, target = key.target, delay = ?delay, "advance scheduled");
            schedule_message(AlarmMessage::AdvanceRound(key), delay);
            self.pending_advance = Some(key);
        }
    }

    /// Applies a transition through the store and reconciles the result
    async fn mutate<R, F, S>(&mut self, schedule_message: &mut S, transition: F) -> Result<R, Error>
    where
        R: Send,
        F: FnMut(&mut GameRecord) -> Result<R, ValidationError> + Send,
        S: FnMut(AlarmMessage, Duration),
    {
        if self.closed {
            return Err(Error::NotFound(self.room));
        }
        let Applied { outcome, latest } =
            apply(&self.context.persistence, self.room, transition).await;
        if let Some(record) = latest {
            self.reconcile(
                Incoming {
                    source: Source::Local,
                    record,
                },
                &mut *schedule_message,
            );
        }
        outcome
    }

    /// The full view for the current phase
    pub fn state_message(&self) -> SyncMessage {
        if self.closed {
            return SyncMessage::RoomClosed;
        }
        let bank = &self.context.settings.questions;
        match &self.record.state {
            State::Waiting => SyncMessage::WaitingRoom(WaitingRoomView::new(
                self.room,
                &self.record,
                &self.identity,
            )),
            State::Answering => SyncMessage::Answering(AnsweringView::new(
                &self.record,
                &self.identity,
                bank,
                &self.drafts.answers,
            )),
            State::Guessing(round) => SyncMessage::Guessing(GuessingView::new(
                &self.record,
                round,
                &self.identity,
                bank,
                &self.drafts.guesses,
                self.context.now_millis(),
            )),
            State::Results { .. } => {
                SyncMessage::Results(ResultsView::new(&self.record, &self.identity))
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        questions::QuestionBank,
        store::{Mutator, Subscription, memory::MemoryStore},
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        State(SyncMessage),
        Update(UpdateMessage),
        Closed,
    }

    #[derive(Debug, Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Sent>>>);

    impl Recorder {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.0.lock())
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    impl Tunnel for Recorder {
        fn send_message(&self, message: &UpdateMessage) {
            self.0.lock().push(Sent::Update(message.clone()));
        }

        fn send_state(&self, state: &SyncMessage) {
            self.0.lock().push(Sent::State(state.clone()));
        }

        fn close(self) {
            self.0.lock().push(Sent::Closed);
        }
    }

    type Alarms = Vec<(AlarmMessage, Duration)>;

    fn ignore(_: AlarmMessage, _: Duration) {}

    struct Table {
        store: Arc<MemoryStore>,
        now: Arc<Mutex<SystemTime>>,
        settings: Settings,
    }

    impl Table {
        fn new() -> Self {
            Self::with_settings(Settings::default())
        }

        fn with_settings(settings: Settings) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                now: Arc::new(Mutex::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))),
                settings,
            }
        }

        fn context(&self) -> Context {
            let now = self.now.clone();
            Context::new(
                Arc::new(Persistence::new(self.store.clone())),
                self.settings.clone(),
            )
            .with_clock(Arc::new(move || *now.lock()))
        }

        fn tick(&self, by: Duration) {
            *self.now.lock() += by;
        }

        async fn host(&self, name: &str, max_players: usize) -> (Game<Recorder>, Recorder) {
            let tunnel = Recorder::default();
            let game = Game::create(self.context(), tunnel.clone(), name, max_players)
                .await
                .unwrap();
            (game, tunnel)
        }

        async fn join(&self, room: RoomCode, name: &str) -> (Game<Recorder>, Recorder) {
            let tunnel = Recorder::default();
            let game = Game::join(self.context(), tunnel.clone(), &room.to_string(), name)
                .await
                .unwrap();
            (game, tunnel)
        }

        /// Three players who have all answered; everyone is guessing Alice
        async fn guessing(&self) -> (Vec<Game<Recorder>>, Vec<Recorder>) {
            let (mut alice, alice_tunnel) = self.host("Alice", 3).await;
            let (mut bob, bob_tunnel) = self.join(alice.room(), "Bob").await;
            let (mut carol, carol_tunnel) = self.join(alice.room(), "Carol").await;

            alice.pump(ignore).await;
            alice.start(ignore).await.unwrap();
            bob.pump(ignore).await;
            carol.pump(ignore).await;

            alice.submit_answers(alice_answers(), ignore).await.unwrap();
            bob.submit_answers(bob_answers(), ignore).await.unwrap();
            carol.submit_answers(carol_answers(), ignore).await.unwrap();

            let mut games = vec![alice, bob, carol];
            pump_all(&mut games, &mut Alarms::new()).await;
            for game in &games {
                assert_eq!(game.phase(), Phase::Guessing);
            }
            let tunnels = vec![alice_tunnel, bob_tunnel, carol_tunnel];
            for tunnel in &tunnels {
                tunnel.take();
            }
            (games, tunnels)
        }
    }

    async fn pump_all(games: &mut [Game<Recorder>], alarms: &mut Alarms) {
        for game in games {
            game.pump(|m, d| alarms.push((m, d))).await;
        }
    }

    fn answers(values: [&str; 3]) -> Answers {
        QuestionBank::default()
            .questions()
            .iter()
            .zip(values)
            .map(|(q, v)| (q.id.clone(), v.to_owned()))
            .collect()
    }

    fn alice_answers() -> Answers {
        answers(["Boing!", "100% chill", "WeetBix"])
    }

    fn bob_answers() -> Answers {
        answers(["Evil laugh", "Heatwave vibes", "Jungle Oats"])
    }

    fn carol_answers() -> Answers {
        answers(["Ka-ching!", "100% chill", "Rice Krispies"])
    }

    #[tokio::test]
    async fn test_create_shows_waiting_room() {
        let table = Table::new();
        let (alice, tunnel) = table.host("  Alice ", 3).await;

        assert_eq!(alice.identity().player_name, "Alice");
        assert!(alice.identity().is_host);
        assert_eq!(table.store.room_count(), 1);

        let sent = tunnel.take();
        assert_eq!(sent.len(), 1);
        let Sent::State(SyncMessage::WaitingRoom(view)) = &sent[0] else {
            panic!("expected the waiting room, got {sent:?}");
        };
        assert_eq!(view.room, alice.room());
        assert_eq!(view.joined, 1);
        assert_eq!(view.max_players, 3);
        assert!(!view.can_start);
    }

    #[tokio::test]
    async fn test_create_capacity_bounds() {
        let table = Table::new();
        for max_players in [0, 1, MAX_PLAYERS + 1] {
            let e = Game::create(table.context(), Recorder::default(), "Alice", max_players)
                .await
                .unwrap_err();
            assert_eq!(
                e,
                Error::Validation(ValidationError::Capacity {
                    min: MIN_PLAYERS,
                    max: MAX_PLAYERS
                })
            );
        }
        assert_eq!(table.store.room_count(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let table = Table::new();
        let e = Game::create(table.context(), Recorder::default(), "   ", 3)
            .await
            .unwrap_err();
        assert_eq!(e, Error::Validation(ValidationError::Name(names::Error::Empty)));
    }

    #[tokio::test]
    async fn test_join_validation() {
        let table = Table::new();
        let (alice, _) = table.host("Alice", 2).await;
        let code = alice.room().to_string();

        let e = Game::join(table.context(), Recorder::default(), "123", "Bob")
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Validation(ValidationError::RoomCode(_))));

        let e = Game::join(table.context(), Recorder::default(), &code, "Alice")
            .await
            .unwrap_err();
        assert_eq!(e, Error::Validation(ValidationError::Name(names::Error::Used)));

        table.join(alice.room(), "Bob").await;
        let e = Game::join(table.context(), Recorder::default(), &code, "Carol")
            .await
            .unwrap_err();
        assert_eq!(e, Error::Validation(ValidationError::RoomFull));

        let record = table.store.get(alice.room()).await.unwrap().unwrap();
        assert_eq!(record.players.len(), 2);
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let table = Table::new();
        let e = Game::join(table.context(), Recorder::default(), "555555", "Bob")
            .await
            .unwrap_err();
        assert_eq!(e, Error::NotFound("555555".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_join_after_start() {
        let table = Table::new();
        let (mut alice, _) = table.host("Alice", 3).await;
        table.join(alice.room(), "Bob").await;
        alice.pump(ignore).await;
        alice.start(ignore).await.unwrap();

        let e = Game::join(
            table.context(),
            Recorder::default(),
            &alice.room().to_string(),
            "Carol",
        )
        .await
        .unwrap_err();
        assert_eq!(e, Error::Validation(ValidationError::GameInProgress));
    }

    #[tokio::test]
    async fn test_host_sees_players_join_in_place() {
        let table = Table::new();
        let (mut alice, tunnel) = table.host("Alice", 2).await;
        tunnel.take();
        table.join(alice.room(), "Bob").await;

        let results = alice.pump(ignore).await;
        assert!(results.contains(&Reconciled::Refreshed));

        let sent = tunnel.take();
        assert_eq!(sent.len(), 1);
        let Sent::Update(UpdateMessage::Players(view)) = &sent[0] else {
            panic!("expected a players update, got {sent:?}");
        };
        assert_eq!(view.joined, 2);
        assert!(view.can_start);
    }

    #[tokio::test]
    async fn test_only_host_starts() {
        let table = Table::new();
        let (alice, _) = table.host("Alice", 2).await;
        let (mut bob, _) = table.join(alice.room(), "Bob").await;
        assert_eq!(
            bob.start(ignore).await,
            Err(Error::Validation(ValidationError::NotHost))
        );
        assert_eq!(
            bob.play_again(ignore).await,
            Err(Error::Validation(ValidationError::NotHost))
        );
        assert_eq!(
            bob.continue_round(ignore).await,
            Err(Error::Validation(ValidationError::NotHost))
        );
    }

    #[tokio::test]
    async fn test_start_switches_every_view() {
        let table = Table::new();
        let (mut alice, alice_tunnel) = table.host("Alice", 3).await;
        let (mut bob, bob_tunnel) = table.join(alice.room(), "Bob").await;
        alice.pump(ignore).await;
        alice_tunnel.take();
        bob_tunnel.take();

        assert_eq!(
            alice.start(ignore).await,
            Ok(Change::Entered(Phase::Answering))
        );
        assert!(matches!(
            alice_tunnel.take().as_slice(),
            [Sent::State(SyncMessage::Answering(_))]
        ));

        assert_eq!(
            bob.pump(ignore).await.last(),
            Some(&Reconciled::Switched(Phase::Answering))
        );
        let sent = bob_tunnel.take();
        let [Sent::State(SyncMessage::Answering(view))] = sent.as_slice() else {
            panic!("expected the answering view, got {sent:?}");
        };
        assert_eq!(view.total, 2);
        assert!(!view.submitted);

        // A repeated start is a no-op.
        assert_eq!(alice.start(ignore).await, Ok(Change::Unchanged));
        assert!(alice_tunnel.take().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_answers_write_nothing() {
        let table = Table::new();
        let (mut alice, _) = table.host("Alice", 2).await;
        table.join(alice.room(), "Bob").await;
        alice.pump(ignore).await;
        alice.start(ignore).await.unwrap();

        let mut partial = alice_answers();
        partial.remove("q3");
        assert!(matches!(
            alice.submit_answers(partial, ignore).await,
            Err(Error::Validation(ValidationError::Selection(_)))
        ));
        let record = table.store.get(alice.room()).await.unwrap().unwrap();
        assert!(record.player_answers.is_empty());
    }

    #[tokio::test]
    async fn test_answer_selections() {
        let table = Table::new();
        let (mut alice, tunnel) = table.host("Alice", 2).await;
        let (mut bob, _) = table.join(alice.room(), "Bob").await;

        assert!(matches!(
            alice.select_answer("q1", "Boing!"),
            Err(Error::Validation(ValidationError::WrongPhase { .. }))
        ));

        alice.pump(ignore).await;
        alice.start(ignore).await.unwrap();
        assert!(alice.select_answer("q1", "Moo").is_err());
        for (question, option) in alice_answers() {
            alice.select_answer(&question, &option).unwrap();
        }
        assert_eq!(alice.answer_selections(), &alice_answers());

        // Someone else answering refreshes in place and keeps the selections.
        bob.pump(ignore).await;
        bob.submit_answers(bob_answers(), ignore).await.unwrap();
        tunnel.take();
        assert_eq!(
            alice.pump(ignore).await.last(),
            Some(&Reconciled::Refreshed)
        );
        assert_eq!(
            tunnel.take(),
            vec![Sent::Update(UpdateMessage::AnswerProgress {
                answered: 1,
                total: 2
            })]
        );
        assert_eq!(alice.answer_selections(), &alice_answers());

        // The last answer moves everyone on and clears the selections.
        assert_eq!(
            alice.submit_answer_selections(ignore).await,
            Ok(Change::Entered(Phase::Guessing))
        );
        assert!(alice.answer_selections().is_empty());
        assert_eq!(alice.record().round().unwrap().current_target, 0);
    }

    // Scenario A: both guessers match the target on every question.
    #[tokio::test]
    async fn test_perfect_guesses_score_three() {
        let table = Table::new();
        let (mut games, tunnels) = table.guessing().await;
        let mut alarms = Alarms::new();

        assert_eq!(
            games[1]
                .submit_guesses(alice_answers(), |m, d| alarms.push((m, d)))
                .await,
            Ok(GuessOutcome::Recorded { remaining: 1 })
        );
        let GuessOutcome::Resolved(reveal) = games[2]
            .submit_guesses(alice_answers(), |m, d| alarms.push((m, d)))
            .await
            .unwrap()
        else {
            panic!("the second guess completes the round");
        };
        assert_eq!(reveal.target, "Alice");
        assert_eq!(reveal.scores["Bob"], 3);
        assert_eq!(reveal.scores["Carol"], 3);
        assert!(alarms.is_empty());

        pump_all(&mut games, &mut alarms).await;
        for game in &games {
            let scores = &game.record().scores;
            assert_eq!(scores["Alice"], 0);
            assert_eq!(scores["Bob"], 3);
            assert_eq!(scores["Carol"], 3);
        }

        // Only the host schedules the advance, for the full countdown.
        assert_eq!(alarms.len(), 1);
        let (AlarmMessage::AdvanceRound(key), delay) = alarms[0];
        assert_eq!(key.target, 0);
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(games[0].pending_advance(), Some(key));

        let reveals = tunnels[0]
            .take()
            .into_iter()
            .filter(|s| matches!(s, Sent::Update(UpdateMessage::Reveal(_))))
            .count();
        assert_eq!(reveals, 1);
    }

    // Scenario B: one of three guesses matches.
    #[tokio::test]
    async fn test_one_right_two_wrong_scores_minus_one() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;

        let one_right = answers(["Boing!", "Heatwave vibes", "Jungle Oats"]);
        games[1].submit_guesses(one_right, ignore).await.unwrap();
        games[2]
            .submit_guesses(alice_answers(), ignore)
            .await
            .unwrap();

        let record = table.store.get(games[0].room()).await.unwrap().unwrap();
        assert_eq!(record.scores["Bob"], -1);
        assert_eq!(record.scores["Carol"], 3);
        assert_eq!(record.reveal().unwrap().scores["Bob"], -1);
    }

    // Scenario C: the host leaves before the game starts.
    #[tokio::test]
    async fn test_host_leaving_closes_room() {
        let table = Table::new();
        let (alice, alice_tunnel) = table.host("Alice", 3).await;
        let room = alice.room();
        let (mut bob, bob_tunnel) = table.join(room, "Bob").await;

        alice.leave().await.unwrap();
        assert_eq!(table.store.room_count(), 0);
        assert_eq!(alice_tunnel.take().last(), Some(&Sent::Closed));

        let e = Game::join(table.context(), Recorder::default(), &room.to_string(), "Carol")
            .await
            .unwrap_err();
        assert_eq!(e, Error::NotFound(room));

        bob_tunnel.take();
        let results = bob.pump(ignore).await;
        assert_eq!(results.last(), Some(&Reconciled::Closed));
        assert!(bob.is_closed());
        assert_eq!(bob_tunnel.take(), vec![Sent::State(SyncMessage::RoomClosed)]);

        // Nothing more happens once closed.
        assert!(bob.pump(ignore).await.is_empty());
        assert_eq!(bob.next_poll_in(), None);
    }

    #[tokio::test]
    async fn test_guest_leaving_keeps_room() {
        let table = Table::new();
        let (alice, _) = table.host("Alice", 3).await;
        let (bob, bob_tunnel) = table.join(alice.room(), "Bob").await;

        bob.leave().await.unwrap();
        assert_eq!(bob_tunnel.take().last(), Some(&Sent::Closed));
        let record = table.store.get(alice.room()).await.unwrap().unwrap();
        assert_eq!(record.players.len(), 2);
    }

    // Scenario D: both guessers submit in the same tick.
    #[tokio::test]
    async fn test_simultaneous_guesses_score_once() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        let [_, bob, carol] = games.as_mut_slice() else {
            unreachable!()
        };

        let (from_bob, from_carol) = tokio::join!(
            bob.submit_guesses(alice_answers(), ignore),
            carol.submit_guesses(carol_answers(), ignore),
        );
        let outcomes = [from_bob.unwrap(), from_carol.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, GuessOutcome::Resolved(_)))
                .count(),
            1
        );

        let record = table.store.get(games[0].room()).await.unwrap().unwrap();
        let guesses = record.current_guesses().unwrap();
        assert_eq!(guesses.len(), 2);
        assert!(!guesses.contains_key("Alice"));
        assert_eq!(record.scores["Bob"], 3);
        assert_eq!(record.scores["Carol"], -1);

        // A retried submission cannot score again.
        assert_eq!(
            games[1].submit_guesses(alice_answers(), ignore).await,
            Err(Error::Validation(ValidationError::RoundResolved))
        );
        let after = table.store.get(games[0].room()).await.unwrap().unwrap();
        assert_eq!(after.scores, record.scores);
    }

    #[tokio::test]
    async fn test_target_cannot_guess() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        assert_eq!(
            games[0].submit_guesses(bob_answers(), ignore).await,
            Err(Error::Validation(ValidationError::SelfGuess))
        );
        assert!(matches!(
            games[0].select_guess("q1", "Boing!"),
            Err(Error::Validation(ValidationError::SelfGuess))
        ));
    }

    #[tokio::test]
    async fn test_guess_twice_rejected() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        games[1]
            .submit_guesses(alice_answers(), ignore)
            .await
            .unwrap();
        assert_eq!(
            games[1].submit_guesses(bob_answers(), ignore).await,
            Err(Error::Validation(ValidationError::AlreadyGuessed))
        );
    }

    #[tokio::test]
    async fn test_alarm_advances_after_deadline() {
        let table = Table::new();
        let (mut games, tunnels) = table.guessing().await;
        let mut alarms = Alarms::new();
        games[1].submit_guesses(alice_answers(), ignore).await.unwrap();
        games[2].submit_guesses(alice_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        let (alarm, _) = alarms.remove(0);

        // Delivered early: rescheduled for the rest of the countdown.
        table.tick(Duration::from_secs(2));
        games[0]
            .receive_alarm(alarm, |m, d| alarms.push((m, d)))
            .await
            .unwrap();
        assert_eq!(alarms, vec![(alarm, Duration::from_secs(3))]);
        assert_eq!(games[0].record().round().unwrap().current_target, 0);
        alarms.clear();

        table.tick(Duration::from_secs(3));
        games[0]
            .receive_alarm(alarm, |m, d| alarms.push((m, d)))
            .await
            .unwrap();
        assert!(alarms.is_empty());
        assert_eq!(games[0].pending_advance(), None);

        let round = games[0].record().round().unwrap();
        assert_eq!(round.current_target, 1);
        assert!(round.reveal.is_none());

        tunnels[1].take();
        pump_all(&mut games, &mut alarms).await;
        let sent = tunnels[1].take();
        let [Sent::Update(UpdateMessage::NextTarget(view))] = sent.as_slice() else {
            panic!("expected the next target, got {sent:?}");
        };
        assert_eq!(view.target, "Bob");
        assert!(view.is_target);

        // Delivering the same alarm again cannot skip a round.
        games[0].receive_alarm(alarm, ignore).await.unwrap();
        assert_eq!(games[0].record().round().unwrap().current_target, 1);
    }

    #[tokio::test]
    async fn test_manual_continue_cancels_alarm() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        let mut alarms = Alarms::new();

        assert_eq!(
            games[0].continue_round(ignore).await,
            Err(Error::Validation(ValidationError::RoundNotResolved))
        );

        games[1].submit_guesses(alice_answers(), ignore).await.unwrap();
        games[2].submit_guesses(alice_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        let (alarm, _) = alarms.remove(0);

        assert_eq!(games[0].continue_round(ignore).await, Ok(Change::Updated));
        assert_eq!(games[0].pending_advance(), None);

        table.tick(Duration::from_secs(10));
        games[0].receive_alarm(alarm, ignore).await.unwrap();
        assert_eq!(games[0].record().round().unwrap().current_target, 1);
    }

    // Scenario E: the reveal deadline passes with no host connected.
    #[tokio::test]
    async fn test_no_advance_without_host() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        let alice = games.remove(0);
        let room = alice.room();
        drop(alice);

        let mut alarms = Alarms::new();
        games[0].submit_guesses(alice_answers(), ignore).await.unwrap();
        games[1]
            .submit_guesses(bob_answers(), |m, d| alarms.push((m, d)))
            .await
            .unwrap();

        table.tick(Duration::from_secs(60));
        pump_all(&mut games, &mut alarms).await;
        assert!(alarms.is_empty());
        for game in &games {
            assert!(!game.is_closed());
            assert_eq!(game.record().round().unwrap().current_target, 0);
            assert!(game.record().reveal().is_some());
        }

        // The host comes back; the missed advance is due immediately.
        let tunnel = Recorder::default();
        let mut alice = Game::resume(table.context(), tunnel.clone(), room, "Alice", |m, d| {
            alarms.push((m, d));
        })
        .await
        .unwrap();
        assert!(alice.identity().is_host);
        assert!(matches!(
            tunnel.take().as_slice(),
            [Sent::State(SyncMessage::Guessing(_))]
        ));
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].1, Duration::ZERO);

        // A manual continue advances once; the stale alarm then does nothing.
        assert_eq!(alice.continue_round(ignore).await, Ok(Change::Updated));
        let (alarm, _) = alarms[0];
        alice.receive_alarm(alarm, ignore).await.unwrap();

        pump_all(&mut games, &mut Alarms::new()).await;
        for game in &games {
            assert_eq!(game.record().round().unwrap().current_target, 1);
        }
    }

    #[tokio::test]
    async fn test_resume_unknown_player() {
        let table = Table::new();
        let (alice, _) = table.host("Alice", 2).await;
        let e = Game::resume(table.context(), Recorder::default(), alice.room(), "Zed", ignore)
            .await
            .unwrap_err();
        assert_eq!(
            e,
            Error::Validation(ValidationError::UnknownPlayer("Zed".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_zero_reveal_duration() {
        let settings = Settings {
            reveal_duration: Duration::ZERO,
            ..Settings::default()
        };
        let table = Table::with_settings(settings);
        let (alice, _) = table.host("Alice", 2).await;
        let (bob, _) = table.join(alice.room(), "Bob").await;
        let mut games = vec![alice, bob];
        let mut alarms = Alarms::new();

        pump_all(&mut games, &mut alarms).await;
        games[0].start(ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        games[0].submit_answers(alice_answers(), ignore).await.unwrap();
        games[1].submit_answers(bob_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;

        games[1].submit_guesses(alice_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        assert_eq!(alarms.len(), 1);
        let (alarm, delay) = alarms.remove(0);
        assert_eq!(delay, Duration::ZERO);

        games[0].receive_alarm(alarm, ignore).await.unwrap();
        assert_eq!(games[0].record().target().unwrap().name, "Bob");
    }

    #[tokio::test]
    async fn test_full_game_and_play_again() {
        let table = Table::new();
        let (alice, _) = table.host("Alice", 2).await;
        let (bob, bob_tunnel) = table.join(alice.room(), "Bob").await;
        let mut games = vec![alice, bob];
        let mut alarms = Alarms::new();

        pump_all(&mut games, &mut alarms).await;
        games[0].start(ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        games[0].submit_answers(alice_answers(), ignore).await.unwrap();
        games[1].submit_answers(bob_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;

        // Round one: Bob guesses Alice.
        games[1].submit_guesses(alice_answers(), ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        games[0].continue_round(ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;

        // Round two: Alice guesses Bob and gets one right.
        let one_right = answers(["Evil laugh", "100% chill", "WeetBix"]);
        games[0].submit_guesses(one_right, ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        bob_tunnel.take();
        assert_eq!(
            games[0].continue_round(ignore).await,
            Ok(Change::Entered(Phase::Results))
        );
        assert_eq!(
            games[1].pump(ignore).await,
            vec![Reconciled::Switched(Phase::Results)]
        );

        let sent = bob_tunnel.take();
        let [Sent::State(SyncMessage::Results(view))] = sent.as_slice() else {
            panic!("expected results, got {sent:?}");
        };
        assert_eq!(view.standings[0].name, "Bob");
        assert_eq!(view.standings[0].score, 3);
        assert!(view.standings[0].winner);
        assert_eq!(view.standings[1].score, -1);
        assert_eq!(view.answers["Bob"], bob_answers());
        assert!(!view.is_host);

        assert_eq!(
            games[0].play_again(ignore).await,
            Ok(Change::Entered(Phase::Waiting))
        );
        assert_eq!(
            games[1].pump(ignore).await,
            vec![Reconciled::Switched(Phase::Waiting)]
        );
        for game in &games {
            assert!(game.record().player_answers.is_empty());
            assert!(game.record().scores.values().all(|s| *s == 0));
            assert_eq!(game.record().players.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_reconcile_same_snapshot_twice() {
        let table = Table::new();
        let (mut games, tunnels) = table.guessing().await;
        games[1].submit_guesses(alice_answers(), ignore).await.unwrap();
        games[2].submit_guesses(alice_answers(), ignore).await.unwrap();
        let snapshot = table.store.get(games[0].room()).await.unwrap().unwrap();
        let mut alarms = Alarms::new();

        let incoming = Incoming {
            source: Source::Push,
            record: Some(snapshot),
        };
        let first = games[0].reconcile(incoming.clone(), |m, d| alarms.push((m, d)));
        let state = games[0].record().clone();
        let sent = tunnels[0].len();

        let second = games[0].reconcile(incoming.clone(), |m, d| alarms.push((m, d)));
        let from_poll = games[0].reconcile(
            Incoming {
                source: Source::Poll,
                ..incoming
            },
            |m, d| alarms.push((m, d)),
        );

        assert_eq!(first, Reconciled::Refreshed);
        assert_eq!(second, Reconciled::Unchanged);
        assert_eq!(from_poll, Reconciled::Unchanged);
        assert_eq!(games[0].record(), &state);
        assert_eq!(tunnels[0].len(), sent);
        assert_eq!(alarms.len(), 1);
    }

    /// A remote store whose change notifications never arrive
    struct Silent(Arc<MemoryStore>);

    #[async_trait]
    impl Store for Silent {
        async fn put(&self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError> {
            self.0.put(room, record).await
        }

        async fn get(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError> {
            self.0.get(room).await
        }

        async fn remove(&self, room: RoomCode) -> Result<(), StorageError> {
            self.0.remove(room).await
        }

        fn subscribe(&self, _room: RoomCode) -> Result<Subscription, StorageError> {
            Ok(Subscription::detached())
        }

        fn supports_transactions(&self) -> bool {
            true
        }

        async fn transact(
            &self,
            room: RoomCode,
            mutator: Mutator<'_>,
        ) -> Result<Option<GameRecord>, StorageError> {
            self.0.transact(room, mutator).await
        }
    }

    #[tokio::test]
    async fn test_waiting_room_poll_backstop() {
        let table = Table::new();
        let silent = Arc::new(Silent(table.store.clone()));
        let now = table.now.clone();
        let context = Context::new(Arc::new(Persistence::new(silent)), Settings::default())
            .with_clock(Arc::new(move || *now.lock()));

        let tunnel = Recorder::default();
        let mut alice = Game::create(context, tunnel.clone(), "Alice", 2)
            .await
            .unwrap();
        tunnel.take();
        assert_eq!(alice.next_poll_in(), Some(Duration::ZERO));

        // First poll finds nothing new.
        assert_eq!(alice.pump(ignore).await, vec![Reconciled::Unchanged]);
        assert_eq!(alice.next_poll_in(), Some(Duration::from_secs(2)));

        table.join(alice.room(), "Bob").await;
        assert!(alice.pump(ignore).await.is_empty());

        table.tick(Duration::from_secs(2));
        assert_eq!(alice.pump(ignore).await, vec![Reconciled::Refreshed]);
        assert!(matches!(
            tunnel.take().as_slice(),
            [Sent::Update(UpdateMessage::Players(_))]
        ));

        // No polling once the game has started.
        alice.start(ignore).await.unwrap();
        assert_eq!(alice.next_poll_in(), None);
    }

    #[tokio::test]
    async fn test_plays_on_when_remote_is_down() {
        let table = Table::new();
        table.store.set_offline(true);
        let (mut alice, _) = table.host("Alice", 2).await;

        assert_eq!(table.store.room_count(), 0);
        assert!(alice.context.persistence.is_degraded());
        assert_eq!(
            alice.start(ignore).await,
            Ok(Change::Entered(Phase::Answering))
        );
        assert_eq!(
            alice.submit_answers(alice_answers(), ignore).await,
            Ok(Change::Entered(Phase::Results))
        );
    }

    #[tokio::test]
    async fn test_guess_selections_cleared_on_next_target() {
        let table = Table::new();
        let (mut games, _) = table.guessing().await;
        for (question, option) in alice_answers() {
            games[1].select_guess(&question, &option).unwrap();
        }
        games[2].select_guess("q1", "Boing!").unwrap();

        games[1].submit_guess_selections(ignore).await.unwrap();
        games[2].submit_guesses(alice_answers(), ignore).await.unwrap();
        let mut alarms = Alarms::new();
        pump_all(&mut games, &mut alarms).await;
        assert_eq!(games[2].guess_selections().len(), 1);

        games[0].continue_round(ignore).await.unwrap();
        pump_all(&mut games, &mut alarms).await;
        assert!(games[2].guess_selections().is_empty());
    }

    #[tokio::test]
    async fn test_queued_pushes_older_than_own_write_are_dropped() {
        let table = Table::new();
        let (mut alice, _) = table.host("Alice", 2).await;
        let (mut bob, bob_tunnel) = table.join(alice.room(), "Bob").await;
        alice.pump(ignore).await;
        alice.start(ignore).await.unwrap();
        bob.pump(ignore).await;

        // Bob completes the answers without having seen Alice's.
        alice.submit_answers(alice_answers(), ignore).await.unwrap();
        assert_eq!(
            bob.submit_answers(bob_answers(), ignore).await,
            Ok(Change::Entered(Phase::Guessing))
        );
        bob.select_guess("q1", "Boing!").unwrap();
        bob_tunnel.take();

        let results = bob.pump(ignore).await;
        assert!(results.contains(&Reconciled::Stale));
        assert!(!results.iter().any(|r| matches!(r, Reconciled::Switched(_))));
        assert!(bob_tunnel.take().is_empty());
        assert_eq!(bob.phase(), Phase::Guessing);
        assert_eq!(bob.guess_selections().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_session_ignores_remote_changes() {
        let table = Table::new();
        let (mut alice, alice_tunnel) = table.host("Alice", 3).await;
        let room = alice.room();
        table.join(room, "Bob").await;
        alice.pump(ignore).await;
        assert_eq!(alice.record().players.len(), 2);

        table.store.set_offline(true);
        assert_eq!(
            alice.start(ignore).await,
            Ok(Change::Entered(Phase::Answering))
        );
        assert!(alice.context.persistence.is_degraded());
        table.store.set_offline(false);

        // The shared room carries on without Alice's session.
        table.join(room, "Carol").await;
        alice_tunnel.take();
        assert!(alice.pump(ignore).await.is_empty());
        assert!(alice_tunnel.take().is_empty());
        assert_eq!(alice.phase(), Phase::Answering);
        assert_eq!(alice.record().players.len(), 2);

        assert_eq!(
            alice.submit_answers(alice_answers(), ignore).await,
            Ok(Change::Updated)
        );
        assert_eq!(alice.record().players.len(), 2);
        let remote = table.store.get(room).await.unwrap().unwrap();
        assert_eq!(remote.phase(), Phase::Waiting);
        assert_eq!(remote.players.len(), 3);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn pick(indices: [usize; 3]) -> Answers {
            QuestionBank::default()
                .questions()
                .iter()
                .zip(indices)
                .map(|(q, i)| (q.id.clone(), q.options[i % q.options.len()].clone()))
                .collect()
        }

        /// Every snapshot a game of `players` passes through
        fn snapshots(players: usize, picks: &[[usize; 3]]) -> Vec<GameRecord> {
            let bank = QuestionBank::default();
            let mut record = GameRecord::new(Player::host("P0"), players);
            let mut out = vec![record.clone()];
            for i in 1..players {
                record.join(&format!("P{i}")).unwrap();
                out.push(record.clone());
            }
            record.start().unwrap();
            out.push(record.clone());
            for i in 0..players {
                record
                    .submit_answers(&format!("P{i}"), pick(picks[i]), &bank)
                    .unwrap();
                out.push(record.clone());
            }
            for target in 0..players {
                for guesser in (0..players).filter(|g| *g != target) {
                    record
                        .submit_guesses(
                            &format!("P{guesser}"),
                            target,
                            pick(picks[(guesser + target) % players]),
                            &bank,
                            0,
                            5_000,
                        )
                        .unwrap();
                    out.push(record.clone());
                }
                record.advance(target).unwrap();
                out.push(record.clone());
            }
            out
        }

        proptest! {
            #[test]
            fn prop_reconcile_is_idempotent(
                players in 2usize..5,
                picks in proptest::collection::vec(proptest::array::uniform3(0usize..4), 5),
                host in any::<bool>(),
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let table = Table::new();
                let tunnel = Recorder::default();
                let mut game = runtime
                    .block_on(Game::create(table.context(), tunnel.clone(), "P0", players))
                    .unwrap();
                game.identity.is_host = host;
                let mut alarms = Alarms::new();

                for snapshot in snapshots(players, &picks) {
                    let incoming = Incoming { source: Source::Push, record: Some(snapshot) };
                    game.reconcile(incoming.clone(), |m, d| alarms.push((m, d)));
                    let record = game.record().clone();
                    let sent = tunnel.len();
                    let scheduled = alarms.len();

                    prop_assert_eq!(
                        game.reconcile(incoming, |m, d| alarms.push((m, d))),
                        Reconciled::Unchanged
                    );
                    prop_assert_eq!(game.record(), &record);
                    prop_assert_eq!(tunnel.len(), sent);
                    prop_assert_eq!(alarms.len(), scheduled);
                }

                prop_assert_eq!(game.phase(), Phase::Results);
                prop_assert_eq!(alarms.len(), if host { players } else { 0 });
            }
        }
    }
}
