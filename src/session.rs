//! View output
//!
//! This module defines the trait through which the game controller hands
//! view descriptors to whatever renders them. The controller never touches
//! the page itself; an implementation might patch a DOM, drive a terminal
//! UI, or record messages in a test.

use crate::view::{SyncMessage, UpdateMessage};

/// Trait for handing view messages to the renderer
///
/// The split between the two message kinds mirrors how a page reacts to a
/// change: a [`SyncMessage`] replaces the active view, while an
/// [`UpdateMessage`] patches the current one in place so that selections
/// the player has not submitted yet are not lost.
pub trait Tunnel {
    /// Sends an in-place refresh of the current view
    ///
    /// # Arguments
    ///
    /// * `message` - The update to apply
    fn send_message(&self, message: &UpdateMessage);

    /// Sends a full view switch
    ///
    /// Used when the phase changes, when a client first attaches to a room,
    /// and when the room disappears.
    ///
    /// # Arguments
    ///
    /// * `state` - The view to switch to
    fn send_state(&self, state: &SyncMessage);

    /// Closes the view
    ///
    /// Called once when the player leaves the room.
    fn close(self);
}
