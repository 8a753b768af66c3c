//! Error taxonomy for the game controller
//!
//! Validation and not-found errors are shown to the player as a
//! dismissible message. Storage errors are normally absorbed by the
//! persistence adapter and only surface when the local fallback fails too.

use serde::Serialize;
use thiserror::Error;

use crate::{
    names,
    questions::SelectionError,
    record::Phase,
    room_code::{self, RoomCode},
    store::StorageError,
};

/// Local, synchronous rejections; nothing is written when one is returned
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The player name was rejected
    #[error(transparent)]
    Name(names::Error),
    /// The room code is malformed
    #[error(transparent)]
    RoomCode(room_code::Error),
    /// An answer or guess set is incomplete or refers to unknown options
    #[error(transparent)]
    Selection(SelectionError),
    /// The room already holds `maxPlayers` players
    #[error("this room is full")]
    RoomFull,
    /// The requested capacity is outside the supported bounds
    #[error("a room holds between {min} and {max} players")]
    Capacity {
        /// Smallest supported capacity
        min: usize,
        /// Largest supported capacity
        max: usize,
    },
    /// Players can only join a room that is still waiting
    #[error("this game has already started")]
    GameInProgress,
    /// The action does not apply to the room's current phase
    #[error("cannot do that while the game is {actual}")]
    WrongPhase {
        /// Phase the action requires
        expected: Phase,
        /// Phase the room is in
        actual: Phase,
    },
    /// Only the host may perform this action
    #[error("only the host can do that")]
    NotHost,
    /// The named player is not part of the room
    #[error("{0} is not in this room")]
    UnknownPlayer(String),
    /// A player tried to guess their own answers
    #[error("you cannot guess your own answers")]
    SelfGuess,
    /// The guesser already submitted for this target
    #[error("you already guessed for this player")]
    AlreadyGuessed,
    /// The guesses were for a target that is no longer current
    #[error("that round is over")]
    StaleTarget,
    /// Every guess for the current target is in and the reveal is running
    #[error("the answers are being revealed")]
    RoundResolved,
    /// The host tried to advance before the round resolved
    #[error("not everyone has guessed yet")]
    RoundNotResolved,
}

/// Errors returned by the game controller
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A local validation failure
    #[error(transparent)]
    Validation(ValidationError),
    /// No record exists for the room code
    #[error("room {0} not found")]
    NotFound(RoomCode),
    /// Both the remote store and the local fallback failed
    #[error(transparent)]
    Storage(StorageError),
}

impl From<names::Error> for ValidationError {
    fn from(e: names::Error) -> Self {
        Self::Name(e)
    }
}

impl From<room_code::Error> for ValidationError {
    fn from(e: room_code::Error) -> Self {
        Self::RoomCode(e)
    }
}

impl From<SelectionError> for ValidationError {
    fn from(e: SelectionError) -> Self {
        Self::Selection(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<names::Error> for Error {
    fn from(e: names::Error) -> Self {
        Self::Validation(e.into())
    }
}

impl From<SelectionError> for Error {
    fn from(e: SelectionError) -> Self {
        Self::Validation(e.into())
    }
}

impl From<room_code::Error> for Error {
    fn from(e: room_code::Error) -> Self {
        Self::Validation(e.into())
    }
}

impl Error {
    /// Whether this error should be shown to the player
    ///
    /// Storage failures are logged instead; the game keeps running on the
    /// local store.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}
