//! # If I Were... Game Library
//!
//! This library provides the session logic for "If I Were...", a party
//! trivia game. Players join a room with a six-digit code, answer a short
//! set of playful questions about themselves, and then take turns guessing
//! each other's answers, scoring a point for every match and losing one for
//! every miss.
//!
//! Every client holds a [`game::Game`] over a shared record kept in a
//! [`store::Store`]. Changes are written through store transactions and
//! propagated to other clients by push notifications, with a polling
//! backstop while the room is waiting. When the shared store is
//! unreachable, [`persistence::Persistence`] carries on against a
//! device-local store.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::wildcard_imports)]

pub mod config;
pub mod constants;
pub mod error;
pub mod game;
pub mod leaderboard;
pub mod names;
pub mod persistence;
pub mod questions;
pub mod record;
pub mod room_code;
pub mod session;
pub mod store;
pub mod sync;
pub mod view;
