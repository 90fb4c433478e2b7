use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::EngineEvent;
use crate::model::PlaybackSnapshot;
use crate::store::{StoreClient, StoreError};

/// The writes the bridge performs against the store.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    async fn set_playing(
        &self,
        guild: u64,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError>;

    async fn delete_playing(&self, guild: u64) -> Result<(), StoreError>;

    async fn clear_queue(&self, guild: u64) -> Result<(), StoreError>;
}

#[async_trait]
impl BridgeStore for StoreClient {
    async fn set_playing(
        &self,
        guild: u64,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError> {
        StoreClient::set_playing(self, guild, snapshot).await
    }

    async fn delete_playing(&self, guild: u64) -> Result<(), StoreError> {
        StoreClient::delete_playing(self, guild).await
    }

    async fn clear_queue(&self, guild: u64) -> Result<(), StoreError> {
        StoreClient::clear_queue(self, guild).await
    }
}

/// Event bridge: applies engine lifecycle transitions to the store as they
/// happen, so persisted state between checkpoints is only stale in position,
/// never in which track is playing. Store failures are logged and dropped;
/// the live session must not depend on persistence succeeding.
pub async fn run(store: impl BridgeStore, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        apply(&store, event).await;
    }
    debug!("event bridge channel closed");
}

/// All arms are idempotent: deleting an absent key or overwriting an
/// existing snapshot is fine, whichever order events and checkpoints land.
async fn apply(store: &dyn BridgeStore, event: EngineEvent) {
    match event {
        EngineEvent::TrackStarted {
            guild,
            channel,
            entry,
        } => {
            let snapshot = PlaybackSnapshot {
                entry,
                channel_id: channel,
                position_ms: 0,
            };
            if let Err(e) = store.set_playing(guild, &snapshot).await {
                warn!("guild {guild}: failed to persist track start: {e}");
            }
        }
        EngineEvent::TrackEnded { guild } => {
            if let Err(e) = store.delete_playing(guild).await {
                warn!("guild {guild}: failed to clear snapshot on track end: {e}");
            }
        }
        EngineEvent::SessionDestroyed { guild } => {
            if let Err(e) = store.delete_playing(guild).await {
                warn!("guild {guild}: failed to clear snapshot on destroy: {e}");
            }
            if let Err(e) = store.clear_queue(guild).await {
                warn!("guild {guild}: failed to clear queue on destroy: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use tokio::sync::Mutex;

    use super::*;
    use crate::model::{QueueEntry, TrackRef};

    fn entry(title: &str) -> QueueEntry {
        QueueEntry {
            track: TrackRef {
                url: format!("https://example.com/{title}"),
                title: title.into(),
                author: "a".into(),
                duration_ms: Some(180_000),
                artwork_url: None,
                live: false,
            },
            requester: "alice".into(),
        }
    }

    #[derive(Default)]
    struct FakeStore {
        snapshots: Mutex<HashMap<u64, PlaybackSnapshot>>,
        queues_cleared: Mutex<HashSet<u64>>,
    }

    #[async_trait]
    impl BridgeStore for FakeStore {
        async fn set_playing(
            &self,
            guild: u64,
            snapshot: &PlaybackSnapshot,
        ) -> Result<(), StoreError> {
            self.snapshots.lock().await.insert(guild, snapshot.clone());
            Ok(())
        }

        async fn delete_playing(&self, guild: u64) -> Result<(), StoreError> {
            self.snapshots.lock().await.remove(&guild);
            Ok(())
        }

        async fn clear_queue(&self, guild: u64) -> Result<(), StoreError> {
            self.queues_cleared.lock().await.insert(guild);
            Ok(())
        }
    }

    #[tokio::test]
    async fn track_started_writes_snapshot_at_position_zero() {
        let store = FakeStore::default();
        apply(
            &store,
            EngineEvent::TrackStarted {
                guild: 42,
                channel: 100,
                entry: entry("song"),
            },
        )
        .await;

        let snapshots = store.snapshots.lock().await;
        let snap = &snapshots[&42];
        assert_eq!(snap.position_ms, 0);
        assert_eq!(snap.channel_id, 100);
        assert_eq!(snap.entry.track.title, "song");
    }

    #[tokio::test]
    async fn track_ended_deletes_snapshot_immediately() {
        let store = FakeStore::default();
        apply(
            &store,
            EngineEvent::TrackStarted {
                guild: 42,
                channel: 100,
                entry: entry("song"),
            },
        )
        .await;
        apply(&store, EngineEvent::TrackEnded { guild: 42 }).await;
        assert!(store.snapshots.lock().await.is_empty());
        assert!(store.queues_cleared.lock().await.is_empty());
    }

    #[tokio::test]
    async fn track_ended_on_absent_snapshot_is_a_no_op() {
        let store = FakeStore::default();
        apply(&store, EngineEvent::TrackEnded { guild: 42 }).await;
        apply(&store, EngineEvent::TrackEnded { guild: 42 }).await;
        assert!(store.snapshots.lock().await.is_empty());
    }

    #[tokio::test]
    async fn session_destroyed_drops_snapshot_and_queue() {
        let store = FakeStore::default();
        apply(
            &store,
            EngineEvent::TrackStarted {
                guild: 42,
                channel: 100,
                entry: entry("song"),
            },
        )
        .await;
        apply(&store, EngineEvent::SessionDestroyed { guild: 42 }).await;
        // Destroy again: both deletes tolerate already-absent state.
        apply(&store, EngineEvent::SessionDestroyed { guild: 42 }).await;

        assert!(store.snapshots.lock().await.is_empty());
        assert!(store.queues_cleared.lock().await.contains(&42));
    }
}
