//! Configuration constants for the "If I Were..." game
//!
//! This module contains the limits and defaults used throughout the
//! game so that validation boundaries live in one place.

/// Room configuration constants
pub mod room {
    /// Smallest valid room code (six digits, no leading zero)
    pub const MIN_CODE: u32 = 100_000;
    /// Largest valid room code
    pub const MAX_CODE: u32 = 999_999;
    /// Number of digits in a room code
    pub const CODE_LENGTH: usize = 6;
    /// Minimum capacity a room can be created with
    pub const MIN_PLAYERS: usize = 2;
    /// Maximum capacity a room can be created with
    pub const MAX_PLAYERS: usize = 32;
}

/// Player name constants
pub mod names {
    /// Maximum length of a player name in bytes, before trimming
    pub const MAX_LENGTH: usize = 30;
}

/// Question bank constants
pub mod questions {
    /// Maximum number of questions in a bank
    pub const MAX_COUNT: usize = 50;
    /// Minimum number of options per question
    pub const MIN_OPTIONS: usize = 2;
    /// Maximum number of options per question
    pub const MAX_OPTIONS: usize = 8;
    /// Maximum length of a question prompt
    pub const MAX_TEXT_LENGTH: usize = 200;
    /// Maximum length of a single option
    pub const MAX_OPTION_LENGTH: usize = 100;
}

/// Timing constants
pub mod timing {
    /// Default length of the post-round reveal countdown in milliseconds
    pub const REVEAL_MILLIS: u64 = 5_000;
    /// Upper bound for the reveal countdown in milliseconds
    pub const MAX_REVEAL_MILLIS: u64 = 60_000;
    /// Default interval between waiting-room polls in milliseconds
    pub const POLL_MILLIS: u64 = 2_000;
    /// Lower bound for the poll interval in milliseconds
    pub const MIN_POLL_MILLIS: u64 = 100;
    /// Upper bound for the poll interval in milliseconds
    pub const MAX_POLL_MILLIS: u64 = 60_000;
}

/// Local fallback store constants
pub mod local_store {
    /// Prefix of every key written to the single-device store
    pub const KEY_PREFIX: &str = "game_";
}
