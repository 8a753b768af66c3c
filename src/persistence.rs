//! Remote-first persistence with a local fallback
//!
//! [`Persistence`] forwards every operation to the remote store. The first
//! time the remote is unreachable or refuses a write, the adapter logs the
//! failure and switches to a [`LocalStore`] for the rest of the session.
//! From then on the game is only visible on this device, but it stays
//! playable.
//!
//! While the remote works, every record it returns is mirrored locally, so
//! the fallback starts from the last record this client saw.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use crate::{
    record::GameRecord,
    room_code::RoomCode,
    store::{Mutator, StorageError, Store, Subscription, local::LocalStore},
};

/// Store adapter that degrades to device-local storage
pub struct Persistence {
    remote: Option<Arc<dyn Store>>,
    local: LocalStore,
    degraded: AtomicBool,
}

impl Persistence {
    /// Wraps a shared remote store
    pub fn new(remote: Arc<dyn Store>) -> Self {
        Self {
            remote: Some(remote),
            local: LocalStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// An adapter with no remote store at all
    pub fn local_only() -> Self {
        Self {
            remote: None,
            local: LocalStore::new(),
            degraded: AtomicBool::new(true),
        }
    }

    /// Whether operations currently go to the local store
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn remote(&self) -> Option<&dyn Store> {
        if self.is_degraded() {
            None
        } else {
            self.remote.as_deref()
        }
    }

    /// Decides whether a remote failure moves the session to the local store
    ///
    /// Connectivity and quota failures do; corrupt data and exhausted
    /// transaction retries are reported to the caller.
    fn degrade(
        &self,
        room: RoomCode,
        operation: &str,
        error: StorageError,
    ) -> Result<(), StorageError> {
        match error {
            StorageError::Unavailable(_) | StorageError::Rejected(_) => {
                tracing::warn!(
                    room = %room,
                    operation,
                    error = %error,
                    "remote store failed, continuing on this device only"
                );
                self.degraded.store(true, Ordering::SeqCst);
                Ok(())
            }
            StorageError::Conflict | StorageError::Corrupt(_) => Err(error),
        }
    }

    async fn mirror(&self, room: RoomCode, record: &GameRecord) {
        if let Err(e) = self.local.put(room, record).await {
            tracing::debug!(room = %room, error = %e, "could not mirror record locally");
        }
    }

    async fn forget(&self, room: RoomCode) {
        if let Err(e) = self.local.remove(room).await {
            tracing::debug!(room = %room, error = %e, "could not drop local record");
        }
    }
}

#[async_trait]
impl Store for Persistence {
    async fn put(&self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError> {
        if let Some(remote) = self.remote() {
            match remote.put(room, record).await {
                Ok(()) => {
                    self.mirror(room, record).await;
                    return Ok(());
                }
                Err(e) => self.degrade(room, "put", e)?,
            }
        }
        self.local.put(room, record).await
    }

    /// Reads from the remote store
    ///
    /// A remote answer of "no such room" is final even if a local copy
    /// exists; the local copy is dropped.
    async fn get(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError> {
        if let Some(remote) = self.remote() {
            match remote.get(room).await {
                Ok(Some(record)) => {
                    self.mirror(room, &record).await;
                    return Ok(Some(record));
                }
                Ok(None) => {
                    self.forget(room).await;
                    return Ok(None);
                }
                Err(e) => self.degrade(room, "get", e)?,
            }
        }
        self.local.get(room).await
    }

    async fn remove(&self, room: RoomCode) -> Result<(), StorageError> {
        if let Some(remote) = self.remote() {
            if let Err(e) = remote.remove(room).await {
                self.degrade(room, "remove", e)?;
            }
        }
        self.local.remove(room).await
    }

    fn subscribe(&self, room: RoomCode) -> Result<Subscription, StorageError> {
        if let Some(remote) = self.remote() {
            match remote.subscribe(room) {
                Ok(subscription) => return Ok(subscription),
                Err(e) => self.degrade(room, "subscribe", e)?,
            }
        }
        self.local.subscribe(room)
    }

    fn supports_transactions(&self) -> bool {
        self.remote().map_or_else(
            || self.local.supports_transactions(),
            |remote| remote.supports_transactions(),
        )
    }

    async fn transact(
        &self,
        room: RoomCode,
        mutator: Mutator<'_>,
    ) -> Result<Option<GameRecord>, StorageError> {
        if let Some(remote) = self.remote() {
            match remote.transact(room, &mut *mutator).await {
                Ok(committed) => {
                    if let Some(record) = &committed {
                        self.mirror(room, record).await;
                    }
                    return Ok(committed);
                }
                Err(e) => self.degrade(room, "transact", e)?,
            }
        }
        self.local.transact(room, mutator).await
    }
}
