//! Device-local fallback store
//!
//! Records are kept as JSON strings under `game_<code>`, the same shape a
//! browser's key/value storage would hold. Nothing is shared with other
//! clients, so there are no change notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Mutator, StorageError, Store, Subscription, Transaction};
use crate::{constants::local_store::KEY_PREFIX, record::GameRecord, room_code::RoomCode};

/// Key/value storage private to this client
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: Mutex<HashMap<String, String>>,
}

fn key(room: RoomCode) -> String {
    format!("{KEY_PREFIX}{room}")
}

impl LocalStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw JSON stored for `room`
    pub fn raw(&self, room: RoomCode) -> Option<String> {
        self.entries.lock().get(&key(room)).cloned()
    }

    fn read(
        entries: &HashMap<String, String>,
        room: RoomCode,
    ) -> Result<Option<GameRecord>, StorageError> {
        entries
            .get(&key(room))
            .map(|json| serde_json::from_str(json))
            .transpose()
            .map_err(StorageError::from)
    }

    fn write(
        entries: &mut HashMap<String, String>,
        room: RoomCode,
        record: &GameRecord,
    ) -> Result<(), StorageError> {
        entries.insert(key(room), serde_json::to_string(record)?);
        Ok(())
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn put(&self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError> {
        Self::write(&mut self.entries.lock(), room, record)
    }

    async fn get(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError> {
        Self::read(&self.entries.lock(), room)
    }

    async fn remove(&self, room: RoomCode) -> Result<(), StorageError> {
        self.entries.lock().remove(&key(room));
        Ok(())
    }

    fn subscribe(&self, _room: RoomCode) -> Result<Subscription, StorageError> {
        Ok(Subscription::detached())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn transact(
        &self,
        room: RoomCode,
        mutator: Mutator<'_>,
    ) -> Result<Option<GameRecord>, StorageError> {
        let mut entries = self.entries.lock();
        match mutator(Self::read(&entries, room)?) {
            Transaction::Commit(record) => {
                Self::write(&mut entries, room, &record)?;
                Ok(Some(record))
            }
            Transaction::Abort => Ok(None),
        }
    }
}
