//! Push and poll inputs for reconciliation
//!
//! A client learns about remote changes two ways: the store's push
//! subscription, and while the room is still waiting, a one-shot read on a
//! fixed interval in case the push channel is missing or silently dropped.
//! Both produce the same [`Incoming`] value and go through the same
//! reconciliation in [`crate::game::Game`]; neither path has side effects of
//! its own.

use web_time::{Duration, SystemTime};

use crate::{
    record::{GameRecord, Phase},
    room_code::RoomCode,
    store::{Store, Subscription},
};

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The store's change notification
    Push,
    /// The waiting-room poll
    Poll,
    /// This client's own committed write
    Local,
}

/// A snapshot of the shared record to reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Input that produced the snapshot
    pub source: Source,
    /// The record, or `None` when the room no longer exists
    pub record: Option<GameRecord>,
}

/// Collects remote snapshots for one room
#[derive(Debug)]
pub struct Synchronizer {
    room: RoomCode,
    subscription: Subscription,
    poll_interval: Duration,
    last_poll: Option<SystemTime>,
}

impl Synchronizer {
    /// Creates a synchronizer over an open subscription
    pub fn new(room: RoomCode, subscription: Subscription, poll_interval: Duration) -> Self {
        Self {
            room,
            subscription,
            poll_interval,
            last_poll: None,
        }
    }

    /// Whether pushes can ever arrive
    pub fn has_push(&self) -> bool {
        !self.subscription.is_detached()
    }

    /// Stops listening for pushes; queued notifications are discarded
    pub fn detach(&mut self) {
        self.subscription = Subscription::detached();
    }

    /// Takes every push notification that is already queued
    pub fn drain(&mut self) -> Vec<Incoming> {
        std::iter::from_fn(|| self.subscription.try_next())
            .map(|record| Incoming {
                source: Source::Push,
                record,
            })
            .collect()
    }

    /// Waits for the next push notification
    ///
    /// Returns `None` when the store closed the channel. Never resolves
    /// without a push channel.
    pub async fn next_push(&mut self) -> Option<Incoming> {
        self.subscription.next().await.map(|record| Incoming {
            source: Source::Push,
            record,
        })
    }

    /// Whether a poll should run now
    ///
    /// Polling only happens in the waiting phase.
    pub fn poll_due(&self, phase: Phase, now: SystemTime) -> bool {
        phase == Phase::Waiting
            && self.last_poll.is_none_or(|last| {
                now.duration_since(last)
                    .is_ok_and(|elapsed| elapsed >= self.poll_interval)
            })
    }

    /// Time until the next poll is due, if polling applies in `phase`
    pub fn next_poll_in(&self, phase: Phase, now: SystemTime) -> Option<Duration> {
        if phase != Phase::Waiting {
            return None;
        }
        Some(self.last_poll.map_or(Duration::ZERO, |last| {
            let elapsed = now.duration_since(last).unwrap_or_default();
            self.poll_interval.saturating_sub(elapsed)
        }))
    }

    /// Reads the record once
    ///
    /// A failed read is logged and yields nothing; the next poll tries again.
    pub async fn poll(&mut self, store: &dyn Store, now: SystemTime) -> Option<Incoming> {
        self.last_poll = Some(now);
        match store.get(self.room).await {
            Ok(record) => Some(Incoming {
                source: Source::Poll,
                record,
            }),
            Err(e) => {
                tracing::warn!(room = %self.room, error = %e, "poll failed");
                None
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{record::Player, store::memory::MemoryStore};

    const INTERVAL: Duration = Duration::from_millis(2_000);

    fn room() -> RoomCode {
        "135791".parse().unwrap()
    }

    #[tokio::test]
    async fn test_drain_collects_pushes() {
        let store = MemoryStore::new();
        let record = GameRecord::new(Player::host("Alice"), 2);
        store.put(room(), &record).await.unwrap();

        let mut sync = Synchronizer::new(room(), store.subscribe(room()).unwrap(), INTERVAL);
        assert!(sync.has_push());

        store.remove(room()).await.unwrap();
        let incoming = sync.drain();
        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[0].record, Some(record));
        assert_eq!(incoming[1].record, None);
        assert!(incoming.iter().all(|i| i.source == Source::Push));
        assert!(sync.drain().is_empty());
    }

    #[tokio::test]
    async fn test_next_push() {
        let store = MemoryStore::new();
        let mut sync = Synchronizer::new(room(), store.subscribe(room()).unwrap(), INTERVAL);
        let record = GameRecord::new(Player::host("Alice"), 2);
        store.put(room(), &record).await.unwrap();

        let incoming = sync.next_push().await.unwrap();
        assert_eq!(incoming.record, Some(record));
    }

    #[tokio::test]
    async fn test_detach_discards_pushes() {
        let store = MemoryStore::new();
        let mut sync = Synchronizer::new(room(), store.subscribe(room()).unwrap(), INTERVAL);
        store
            .put(room(), &GameRecord::new(Player::host("Alice"), 2))
            .await
            .unwrap();

        sync.detach();
        assert!(!sync.has_push());
        assert!(sync.drain().is_empty());
    }

    #[test]
    fn test_poll_only_while_waiting() {
        let sync = Synchronizer::new(room(), Subscription::detached(), INTERVAL);
        let now = SystemTime::now();
        assert!(sync.poll_due(Phase::Waiting, now));
        assert!(!sync.poll_due(Phase::Answering, now));
        assert_eq!(sync.next_poll_in(Phase::Guessing, now), None);
        assert_eq!(sync.next_poll_in(Phase::Waiting, now), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_poll_interval() {
        let store = MemoryStore::new();
        let record = GameRecord::new(Player::host("Alice"), 2);
        store.put(room(), &record).await.unwrap();

        let mut sync = Synchronizer::new(room(), Subscription::detached(), INTERVAL);
        let start = SystemTime::now();
        let incoming = sync.poll(&store, start).await.unwrap();
        assert_eq!(incoming.source, Source::Poll);
        assert_eq!(incoming.record, Some(record));

        let soon = start + Duration::from_millis(500);
        assert!(!sync.poll_due(Phase::Waiting, soon));
        assert_eq!(
            sync.next_poll_in(Phase::Waiting, soon),
            Some(Duration::from_millis(1_500))
        );
        assert!(sync.poll_due(Phase::Waiting, start + INTERVAL));
    }

    #[tokio::test]
    async fn test_failed_poll_yields_nothing() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let mut sync = Synchronizer::new(room(), Subscription::detached(), INTERVAL);
        let now = SystemTime::now();
        assert_eq!(sync.poll(&store, now).await, None);
        assert!(!sync.poll_due(Phase::Waiting, now));
    }
}
