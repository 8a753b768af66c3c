//! Player name validation
//!
//! Names are the identity of a player inside a room: they key answers,
//! guesses and scores in the shared record. This module trims and checks
//! a requested name before it is ever written.

use rustrict::CensorStr;
use serde::Serialize;
use thiserror::Error;

use crate::{constants, record::Player};

/// Errors that can occur during name validation
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested name is already in use by another player in the room
    #[error("name already in-use")]
    Used,
    /// The name is empty or contains only whitespace
    #[error("name cannot be empty")]
    Empty,
    /// The name contains inappropriate content
    #[error("name is inappropriate")]
    Sinful,
    /// The name exceeds the maximum allowed length
    #[error("name is too long")]
    TooLong,
}

/// Cleans a requested name without looking at the room
///
/// # Errors
///
/// * `Error::TooLong` - Name exceeds the configured length
/// * `Error::Empty` - Name is empty after trimming whitespace
/// * `Error::Sinful` - Name contains inappropriate content
pub fn clean(name: &str) -> Result<String, Error> {
    if name.len() > constants::names::MAX_LENGTH {
        return Err(Error::TooLong);
    }
    let name = rustrict::trim_whitespace(name);
    if name.is_empty() {
        return Err(Error::Empty);
    }
    if name.is_inappropriate() {
        return Err(Error::Sinful);
    }
    Ok(name.to_owned())
}

/// Cleans a requested name and checks it is free among `players`
///
/// # Errors
///
/// Everything [`clean`] rejects, plus `Error::Used` when another player
/// already holds the cleaned name.
pub fn claim(name: &str, players: &[Player]) -> Result<String, Error> {
    let name = clean(name)?;
    if players.iter().any(|p| p.name == name) {
        return Err(Error::Used);
    }
    Ok(name)
}
