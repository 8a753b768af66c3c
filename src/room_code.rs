//! Room code generation and parsing
//!
//! A room is identified by a six digit decimal code that players read
//! aloud or type on their own device. Codes are drawn uniformly from the
//! valid range and are not checked for collisions.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::constants::room::{CODE_LENGTH, MAX_CODE, MIN_CODE};

/// A six digit identifier for a shared game record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoomCode(u32);

/// Errors produced when parsing a room code typed by a player
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The code does not have exactly six characters
    #[error("room code must be {CODE_LENGTH} digits")]
    Length,
    /// The code contains something other than ASCII digits
    #[error("room code may only contain digits")]
    NotNumeric,
    /// The code is six digits but outside the issued range
    #[error("room code is out of range")]
    OutOfRange,
}

impl RoomCode {
    /// Creates a new random room code
    pub fn new() -> Self {
        Self(fastrand::u32(MIN_CODE..=MAX_CODE))
    }

    /// Returns the numeric value of the code
    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for RoomCode {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl FromStr for RoomCode {
    type Err = Error;

    /// Parses a room code, ignoring surrounding whitespace
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] describing why the input is not a room code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != CODE_LENGTH {
            return Err(Error::Length);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::NotNumeric);
        }
        let value: u32 = s.parse().map_err(|_| Error::NotNumeric)?;
        if (MIN_CODE..=MAX_CODE).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::OutOfRange)
        }
    }
}

impl Serialize for RoomCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoomCode {
    fn deserialize<D>(deserializer: D) -> Result<RoomCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RoomCode::from_str(&s).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}
