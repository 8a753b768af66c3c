//! Question bank and selection validation
//!
//! Every player answers the same bank of "If I were..." prompts, each with
//! a handful of fixed options. Guesses about another player use the same
//! bank, so the validation below is shared by both submissions.

use std::collections::{BTreeMap, HashSet};

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::questions::{
    MAX_COUNT, MAX_OPTION_LENGTH, MAX_OPTIONS, MAX_TEXT_LENGTH, MIN_OPTIONS,
};

/// A mapping from question id to the chosen option text
///
/// Used both for a player's own answers and for a guesser's guesses.
pub type Answers = BTreeMap<String, String>;

/// A single multiple-choice prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Question {
    /// Stable identifier used as the key in answer maps
    #[garde(length(min = 1, max = 32))]
    pub id: String,
    /// The prompt shown to players
    #[garde(length(min = 1, max = MAX_TEXT_LENGTH))]
    pub text: String,
    /// The options a player picks from
    #[garde(
        length(min = MIN_OPTIONS, max = MAX_OPTIONS),
        inner(length(min = 1, max = MAX_OPTION_LENGTH)),
        custom(distinct_options)
    )]
    pub options: Vec<String>,
}

#[allow(clippy::ptr_arg)]
fn distinct_options(options: &Vec<String>, _ctx: &()) -> garde::Result {
    let mut seen = HashSet::new();
    if options.iter().all(|o| seen.insert(o)) {
        Ok(())
    } else {
        Err(garde::Error::new(String::from("options must be distinct")))
    }
}

#[allow(clippy::ptr_arg)]
fn distinct_ids(questions: &Vec<Question>, _ctx: &()) -> garde::Result {
    let mut seen = HashSet::new();
    if questions.iter().all(|q| seen.insert(&q.id)) {
        Ok(())
    } else {
        Err(garde::Error::new(String::from("question ids must be distinct")))
    }
}

impl Question {
    /// Creates a question from borrowed parts
    pub fn new(id: &str, text: &str, options: &[&str]) -> Self {
        Self {
            id: id.to_owned(),
            text: text.to_owned(),
            options: options.iter().map(|&o| o.to_owned()).collect(),
        }
    }
}

/// The ordered set of questions every player answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(transparent)]
pub struct QuestionBank {
    #[garde(length(min = 1, max = MAX_COUNT), dive, custom(distinct_ids))]
    questions: Vec<Question>,
}

impl Default for QuestionBank {
    /// The bank shipped with the game
    fn default() -> Self {
        Self {
            questions: vec![
                Question::new(
                    "q1",
                    "If I were a sound effect, I'd be:",
                    &["Ka-ching!", "Dramatic gasp", "Boing!", "Evil laugh"],
                ),
                Question::new(
                    "q2",
                    "If I were a weather forecast, I'd be:",
                    &[
                        "100% chill",
                        "Partly dramatic with a chance of chaos!",
                        "Heatwave vibes",
                        "Sudden tornado of opinions",
                    ],
                ),
                Question::new(
                    "q3",
                    "If I were a breakfast cereal, I'd be:",
                    &["Jungle Oats", "WeetBix", "Rice Krispies"],
                ),
            ],
        }
    }
}

/// Reasons a set of selections is rejected before anything is written
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// One or more questions have no selection
    #[error("{missing} question(s) still need an answer")]
    Incomplete {
        /// Number of questions without a selection
        missing: usize,
    },
    /// A selection refers to a question that is not in the bank
    #[error("unknown question {0}")]
    UnknownQuestion(String),
    /// A selection is not one of the question's options
    #[error("{option:?} is not an option for question {question}")]
    UnknownOption {
        /// The question id
        question: String,
        /// The rejected option text
        option: String,
    },
}

impl QuestionBank {
    /// Creates a bank from a list of questions
    ///
    /// The bank is not validated here; call [`Validate::validate`] before use
    /// when the questions come from outside the crate.
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    /// Returns the questions in presentation order
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Returns the number of questions
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Checks if the bank has no questions
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Looks up a question by id
    pub fn get(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Checks that a single selection is valid for this bank
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::UnknownQuestion`] or
    /// [`SelectionError::UnknownOption`].
    pub fn check_selection(&self, question: &str, option: &str) -> Result<(), SelectionError> {
        let q = self
            .get(question)
            .ok_or_else(|| SelectionError::UnknownQuestion(question.to_owned()))?;
        if q.options.iter().any(|o| o == option) {
            Ok(())
        } else {
            Err(SelectionError::UnknownOption {
                question: question.to_owned(),
                option: option.to_owned(),
            })
        }
    }

    /// Checks that `answers` selects exactly one valid option for every question
    ///
    /// # Errors
    ///
    /// Returns the first problem found; unknown entries are reported before
    /// missing ones.
    pub fn check_complete(&self, answers: &Answers) -> Result<(), SelectionError> {
        for (question, option) in answers {
            self.check_selection(question, option)?;
        }
        let missing = self
            .questions
            .iter()
            .filter(|q| !answers.contains_key(&q.id))
            .count();
        if missing == 0 {
            Ok(())
        } else {
            Err(SelectionError::Incomplete { missing })
        }
    }
}
