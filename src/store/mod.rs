//! Shared record storage
//!
//! The game only needs five things from a backing store: replace the
//! record at a room key, read it once, delete it, subscribe to changes,
//! and, where the backend can, run an atomic read-modify-write. Stores
//! without atomic transactions fall back to [`read_then_write`], which
//! leaves a window in which two writers can both act on the same read.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, channel::mpsc};
use serde::Serialize;
use thiserror::Error;

use crate::{record::GameRecord, room_code::RoomCode};

pub mod local;
pub mod memory;

/// Failures reported by a backing store
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the write, for example over quota
    #[error("write rejected: {0}")]
    Rejected(String),
    /// A transaction could not commit after retrying
    #[error("transaction conflict")]
    Conflict,
    /// The stored data is not a valid game record
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Decision returned by a transaction mutator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Write this record
    Commit(GameRecord),
    /// Leave the stored record as it is
    Abort,
}

/// A transaction body; called with the current record, or `None` when the
/// room does not exist
///
/// Stores may call it more than once if they retry.
pub type Mutator<'a> = &'a mut (dyn FnMut(Option<GameRecord>) -> Transaction + Send);

/// Change notifications for one room
///
/// Each item is the record after a change, or `None` once the room has
/// been removed. A detached subscription never yields.
pub struct Subscription {
    receiver: Option<mpsc::UnboundedReceiver<Option<GameRecord>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Subscription {
    /// Wraps the receiving end of a notification channel
    pub fn new(receiver: mpsc::UnboundedReceiver<Option<GameRecord>>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// A subscription for stores without push notifications
    pub fn detached() -> Self {
        Self { receiver: None }
    }

    /// Whether this subscription can ever yield
    pub fn is_detached(&self) -> bool {
        self.receiver.is_none()
    }

    /// Waits for the next notification
    ///
    /// Returns `None` when the store dropped the channel. Never resolves for
    /// a detached subscription.
    pub async fn next(&mut self) -> Option<Option<GameRecord>> {
        match &mut self.receiver {
            Some(receiver) => receiver.next().await,
            None => futures::future::pending().await,
        }
    }

    /// Returns a notification that is already queued, without waiting
    pub fn try_next(&mut self) -> Option<Option<GameRecord>> {
        self.next().now_or_never().flatten()
    }
}

/// A backing store for shared game records
#[async_trait]
pub trait Store: Send + Sync {
    /// Replaces the full record at `room`
    async fn put(&self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError>;

    /// Reads the record at `room` once
    async fn get(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError>;

    /// Deletes the record at `room`
    async fn remove(&self, room: RoomCode) -> Result<(), StorageError>;

    /// Subscribes to changes of the record at `room`
    ///
    /// Stores that deliver the current record on subscription should do so
    /// as the first item.
    fn subscribe(&self, room: RoomCode) -> Result<Subscription, StorageError>;

    /// Whether [`Store::transact`] is atomic
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Runs `mutator` against the record at `room` and writes its result
    ///
    /// Returns the committed record, or `None` when the mutator aborted. The
    /// default implementation is a plain read followed by a write.
    async fn transact(
        &self,
        room: RoomCode,
        mutator: Mutator<'_>,
    ) -> Result<Option<GameRecord>, StorageError> {
        read_then_write(self, room, mutator).await
    }
}

/// Non-atomic stand-in for a transaction
///
/// A concurrent writer can land between the read and the write; whichever
/// write lands last wins.
///
/// # Errors
///
/// Propagates the store's read or write failure.
pub async fn read_then_write<S: Store + ?Sized>(
    store: &S,
    room: RoomCode,
    mutator: Mutator<'_>,
) -> Result<Option<GameRecord>, StorageError> {
    tracing::warn!(room = %room, "transaction without atomic support");
    let current = store.get(room).await?;
    match mutator(current) {
        Transaction::Commit(record) => {
            store.put(room, &record).await?;
            Ok(Some(record))
        }
        Transaction::Abort => Ok(None),
    }
}
