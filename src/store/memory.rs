//! In-process shared store
//!
//! [`MemoryStore`] behaves like a hosted real-time database shared by every
//! client that holds the same `Arc`: records are kept in their JSON wire
//! form, every write is pushed to subscribers (the writer included), and
//! transactions run under the store lock. It can be switched offline or
//! built without transaction support to exercise the degraded paths.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;

use super::{Mutator, StorageError, Store, Subscription, Transaction, read_then_write};
use crate::{record::GameRecord, room_code::RoomCode};

#[derive(Default)]
struct Inner {
    records: HashMap<RoomCode, serde_json::Value>,
    subscribers: HashMap<RoomCode, Vec<mpsc::UnboundedSender<Option<GameRecord>>>>,
}

impl Inner {
    fn read(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError> {
        self.records
            .get(&room)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(StorageError::from)
    }

    fn write(&mut self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError> {
        self.records.insert(room, serde_json::to_value(record)?);
        self.notify(room, Some(record));
        Ok(())
    }

    fn notify(&mut self, room: RoomCode, record: Option<&GameRecord>) {
        if let Some(subscribers) = self.subscribers.get_mut(&room) {
            subscribers.retain(|s| s.unbounded_send(record.cloned()).is_ok());
        }
    }
}

/// A shared in-process store with push notifications
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    atomic: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with atomic transactions
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            offline: AtomicBool::new(false),
            atomic: true,
        }
    }

    /// Creates an empty store that only supports whole-record replacement
    pub fn without_transactions() -> Self {
        Self {
            atomic: false,
            ..Self::new()
        }
    }

    /// Makes every subsequent operation fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of rooms currently stored
    pub fn room_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory store is offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, room: RoomCode, record: &GameRecord) -> Result<(), StorageError> {
        self.check_online()?;
        self.inner.lock().write(room, record)
    }

    async fn get(&self, room: RoomCode) -> Result<Option<GameRecord>, StorageError> {
        self.check_online()?;
        self.inner.lock().read(room)
    }

    async fn remove(&self, room: RoomCode) -> Result<(), StorageError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        if inner.records.remove(&room).is_some() {
            inner.notify(room, None);
        }
        Ok(())
    }

    fn subscribe(&self, room: RoomCode) -> Result<Subscription, StorageError> {
        self.check_online()?;
        let (sender, receiver) = mpsc::unbounded();
        let mut inner = self.inner.lock();
        if let Some(current) = inner.read(room)? {
            // Closed receivers are pruned on the next notify.
            let _ = sender.unbounded_send(Some(current));
        }
        inner.subscribers.entry(room).or_default().push(sender);
        Ok(Subscription::new(receiver))
    }

    fn supports_transactions(&self) -> bool {
        self.atomic
    }

    async fn transact(
        &self,
        room: RoomCode,
        mutator: Mutator<'_>,
    ) -> Result<Option<GameRecord>, StorageError> {
        if !self.atomic {
            return read_then_write(self, room, mutator).await;
        }
        self.check_online()?;
        let mut inner = self.inner.lock();
        let current = inner.read(room)?;
        match mutator(current) {
            Transaction::Commit(record) => {
                inner.write(room, &record)?;
                Ok(Some(record))
            }
            Transaction::Abort => Ok(None),
        }
    }
}
