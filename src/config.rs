//! Game settings
//!
//! Settings are fixed for the lifetime of a client session. They can be
//! loaded from JSON so that an embedding page can tweak timings or swap
//! the question bank without rebuilding.

use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    constants::timing::{
        MAX_POLL_MILLIS, MAX_REVEAL_MILLIS, MIN_POLL_MILLIS, POLL_MILLIS, REVEAL_MILLIS,
    },
    questions::QuestionBank,
};

/// Validates that a duration falls within inclusive millisecond bounds
fn validate_millis<const MIN_MILLIS: u64, const MAX_MILLIS: u64>(
    val: &Duration,
    _ctx: &(),
) -> garde::Result {
    let millis = u64::try_from(val.as_millis()).unwrap_or(u64::MAX);
    if (MIN_MILLIS..=MAX_MILLIS).contains(&millis) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "outside of bounds [{MIN_MILLIS},{MAX_MILLIS}] ms",
        )))
    }
}

/// Client-side settings for a game session
#[serde_with::serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// How long the reveal countdown runs after a round resolves
    #[garde(custom(validate_millis::<0, MAX_REVEAL_MILLIS>))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub reveal_duration: Duration,
    /// How often the waiting room polls the shared record
    #[garde(custom(validate_millis::<MIN_POLL_MILLIS, MAX_POLL_MILLIS>))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// The questions every player answers
    #[garde(dive)]
    pub questions: QuestionBank,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reveal_duration: Duration::from_millis(REVEAL_MILLIS),
            poll_interval: Duration::from_millis(POLL_MILLIS),
            questions: QuestionBank::default(),
        }
    }
}

/// Errors from loading settings
#[derive(Error, Debug)]
pub enum Error {
    /// The input is not well-formed settings JSON
    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    /// The settings parsed but are out of bounds
    #[error("invalid settings: {0}")]
    Invalid(#[from] garde::Report),
}

impl Settings {
    /// Parses and validates settings from JSON
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed JSON and [`Error::Invalid`]
    /// when a value is out of bounds.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}
