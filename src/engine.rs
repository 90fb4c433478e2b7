use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::QueueEntry;
use crate::queue::TrackQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Idle,
}

/// Lifecycle notifications pushed by the engine into the event bridge.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TrackStarted {
        guild: u64,
        channel: u64,
        entry: QueueEntry,
    },
    TrackEnded { guild: u64 },
    SessionDestroyed { guild: u64 },
}

/// A live playback session bound to one guild and one voice channel.
#[async_trait]
pub trait PlayerSession: Send + Sync {
    /// Start `entry` (or enqueue it behind the current track). `start_at`
    /// seeks into the track before audio is produced.
    async fn play(&self, entry: QueueEntry, start_at: Duration, enqueue: bool) -> Result<()>;

    async fn state(&self) -> PlayerState;

    async fn now_playing(&self) -> Option<QueueEntry>;

    /// Live playback position of the current track.
    async fn position(&self) -> Duration;

    fn channel(&self) -> u64;

    async fn stop(&self) -> Result<()>;
}

/// The audio engine consumed by the recovery subsystem. One implementation
/// runs over songbird; tests substitute their own.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Bind a new session to `channel`, wired to `queue` for auto-advance.
    /// Fails if the voice channel cannot be joined.
    async fn acquire(
        &self,
        guild: u64,
        channel: u64,
        queue: Arc<dyn TrackQueue>,
    ) -> Result<Arc<dyn PlayerSession>>;
}

/// Voice-channel membership, as seen by the chat platform.
#[async_trait]
pub trait VoiceRoster: Send + Sync {
    /// Number of connected members that are not bots.
    async fn non_bot_members(&self, guild: u64, channel: u64) -> Result<usize>;
}

/// Registry of live sessions, shared between the command layer (which
/// creates sessions) and the checkpointer (which polls them). This is the
/// engine's own state, never the store's.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<u64, Arc<dyn PlayerSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, guild: u64, session: Arc<dyn PlayerSession>) {
        self.inner.write().await.insert(guild, session);
    }

    pub async fn remove(&self, guild: u64) -> Option<Arc<dyn PlayerSession>> {
        self.inner.write().await.remove(&guild)
    }

    pub async fn get(&self, guild: u64) -> Option<Arc<dyn PlayerSession>> {
        self.inner.read().await.get(&guild).cloned()
    }

    pub async fn all(&self) -> Vec<(u64, Arc<dyn PlayerSession>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(guild, session)| (*guild, session.clone()))
            .collect()
    }
}
