use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use serenity::all::{Cache, ChannelId, GuildId, UserId};
use songbird::events::context_data::DisconnectReason;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Call, CoreEvent, Event, EventContext, EventHandler, Songbird, TrackEvent};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};

use crate::audio;
use crate::engine::{EngineEvent, PlaybackEngine, PlayerSession, PlayerState, SessionRegistry, VoiceRoster};
use crate::model::QueueEntry;
use crate::queue::{DequeueMode, TrackQueue};

/// Playback engine over songbird. Sessions it hands out are registered in
/// the shared registry so the checkpointer can poll them.
pub struct SongbirdEngine {
    manager: Arc<Songbird>,
    events: mpsc::UnboundedSender<EngineEvent>,
    registry: SessionRegistry,
}

impl SongbirdEngine {
    pub fn new(
        manager: Arc<Songbird>,
        events: mpsc::UnboundedSender<EngineEvent>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            manager,
            events,
            registry,
        }
    }
}

#[async_trait]
impl PlaybackEngine for SongbirdEngine {
    async fn acquire(
        &self,
        guild: u64,
        channel: u64,
        queue: Arc<dyn TrackQueue>,
    ) -> Result<Arc<dyn PlayerSession>> {
        let call = self
            .manager
            .join(GuildId::new(guild), ChannelId::new(channel))
            .await
            .with_context(|| format!("joining voice channel {channel} in guild {guild}"))?;

        let (events, registry) = (self.events.clone(), self.registry.clone());
        let manager = Arc::clone(&self.manager);
        let session = Arc::new_cyclic(|weak: &Weak<SongbirdSession>| SongbirdSession {
            manager,
            call: call.clone(),
            guild,
            channel,
            queue,
            events,
            registry,
            current: RwLock::new(None),
            stopping: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        {
            let mut call = call.lock().await;
            call.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier {
                    session: Arc::clone(&session),
                },
            );
        }

        self.registry
            .insert(guild, Arc::clone(&session) as Arc<dyn PlayerSession>)
            .await;
        info!("acquired session for guild {guild} in channel {channel}");
        Ok(session)
    }
}

struct SongbirdSession {
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    guild: u64,
    channel: u64,
    queue: Arc<dyn TrackQueue>,
    events: mpsc::UnboundedSender<EngineEvent>,
    registry: SessionRegistry,
    current: RwLock<Option<(QueueEntry, TrackHandle)>>,
    stopping: AtomicBool,
    // Sessions are only ever handed out inside an Arc; the event notifiers
    // attached to tracks need an owned handle back to the session.
    self_ref: Weak<SongbirdSession>,
}

impl SongbirdSession {
    fn strong(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| anyhow!("session already dropped"))
    }

    /// Fetch and start one entry, replacing whatever is playing.
    async fn start(&self, entry: QueueEntry, start_at: Duration) -> Result<()> {
        let path = audio::fetch_audio(&entry.track.url).await?;
        let source: songbird::input::Input = songbird::input::File::new(path).into();

        let handle = {
            let mut call = self.call.lock().await;
            call.stop();
            call.play_input(source)
        };
        let _ = handle.set_volume(0.5);
        if start_at > Duration::ZERO {
            let _ = handle.seek(start_at);
        }
        handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    session: self.strong()?,
                },
            )
            .map_err(|e| anyhow!("attaching track-end handler: {e}"))?;

        *self.current.write().await = Some((entry.clone(), handle));
        let _ = self.events.send(EngineEvent::TrackStarted {
            guild: self.guild,
            channel: self.channel,
            entry,
        });
        Ok(())
    }

    async fn advance(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        match self.queue.dequeue(DequeueMode::Normal).await {
            Ok(Some(next)) => {
                let title = next.track.title.clone();
                if let Err(e) = self.start(next, Duration::ZERO).await {
                    warn!(
                        "guild {}: failed to advance to '{title}': {e:#}",
                        self.guild
                    );
                    *self.current.write().await = None;
                    let _ = self.events.send(EngineEvent::TrackEnded { guild: self.guild });
                }
            }
            Ok(None) => {
                *self.current.write().await = None;
                let _ = self.events.send(EngineEvent::TrackEnded { guild: self.guild });
            }
            Err(e) => {
                warn!("guild {}: queue unavailable on track end: {e}", self.guild);
                *self.current.write().await = None;
                let _ = self.events.send(EngineEvent::TrackEnded { guild: self.guild });
            }
        }
    }

    async fn destroy(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.current.write().await = None;
        self.registry.remove(self.guild).await;
        let _ = self.events.send(EngineEvent::SessionDestroyed { guild: self.guild });
    }
}

#[async_trait]
impl PlayerSession for SongbirdSession {
    async fn play(&self, entry: QueueEntry, start_at: Duration, enqueue: bool) -> Result<()> {
        if enqueue && self.state().await == PlayerState::Playing {
            self.queue.append(entry).await?;
            return Ok(());
        }
        self.start(entry, start_at).await
    }

    async fn state(&self) -> PlayerState {
        if self.stopping.load(Ordering::SeqCst) {
            return PlayerState::Idle;
        }
        let handle = match &*self.current.read().await {
            Some((_, handle)) => handle.clone(),
            None => return PlayerState::Idle,
        };
        match handle.get_info().await {
            Ok(info) => match info.playing {
                PlayMode::Play => PlayerState::Playing,
                PlayMode::Pause => PlayerState::Paused,
                _ => PlayerState::Idle,
            },
            Err(_) => PlayerState::Idle,
        }
    }

    async fn now_playing(&self) -> Option<QueueEntry> {
        self.current.read().await.as_ref().map(|(entry, _)| entry.clone())
    }

    async fn position(&self) -> Duration {
        let handle = match &*self.current.read().await {
            Some((_, handle)) => handle.clone(),
            None => return Duration::ZERO,
        };
        handle
            .get_info()
            .await
            .map(|info| info.position)
            .unwrap_or(Duration::ZERO)
    }

    fn channel(&self) -> u64 {
        self.channel
    }

    async fn stop(&self) -> Result<()> {
        self.destroy().await;
        {
            let mut call = self.call.lock().await;
            call.stop();
        }
        // Leaving the channel fires DriverDisconnect; destroy() above has
        // already made that a no-op.
        let _ = self.manager.remove(GuildId::new(self.guild)).await;
        Ok(())
    }
}

struct TrackEndNotifier {
    session: Arc<SongbirdSession>,
}

#[async_trait]
impl EventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.session.advance().await;
        None
    }
}

struct DisconnectNotifier {
    session: Arc<SongbirdSession>,
}

/// A disconnect with no reason is a requested leave; a closed voice
/// websocket means Discord ended the session. Everything else the driver
/// retries on its own, reporting success through `DriverReconnect`.
fn disconnect_is_terminal(reason: Option<&DisconnectReason>) -> bool {
    matches!(reason, None | Some(DisconnectReason::WsClosed(_)))
}

#[async_trait]
impl EventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::DriverDisconnect(data) = ctx else {
            return None;
        };
        let stopping = self.session.stopping.load(Ordering::SeqCst);
        if stopping || disconnect_is_terminal(data.reason.as_ref()) {
            info!("guild {}: voice driver disconnected", self.session.guild);
            self.session.destroy().await;
        } else {
            warn!(
                "guild {}: transient voice disconnect ({:?}), waiting for driver reconnect",
                self.session.guild, data.reason
            );
        }
        None
    }
}

/// Voice-channel membership out of the serenity cache. Users the cache does
/// not know are counted as human, so a cache miss never abandons a session.
pub struct CacheRoster {
    cache: Arc<Cache>,
}

impl CacheRoster {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl VoiceRoster for CacheRoster {
    async fn non_bot_members(&self, guild: u64, channel: u64) -> Result<usize> {
        let occupants: Vec<(UserId, Option<bool>)> = {
            let guild = self
                .cache
                .guild(GuildId::new(guild))
                .ok_or_else(|| anyhow!("guild {guild} not in cache"))?;
            guild
                .voice_states
                .values()
                .filter(|vs| vs.channel_id.map(ChannelId::get) == Some(channel))
                .map(|vs| (vs.user_id, vs.member.as_ref().map(|m| m.user.bot)))
                .collect()
        };

        Ok(occupants
            .into_iter()
            .filter(|(user_id, known_bot)| match known_bot {
                Some(bot) => !bot,
                None => self.cache.user(*user_id).map(|u| !u.bot).unwrap_or(true),
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_requested_or_closed_disconnects_are_terminal() {
        assert!(disconnect_is_terminal(None));
        assert!(disconnect_is_terminal(Some(&DisconnectReason::WsClosed(None))));
        assert!(!disconnect_is_terminal(Some(&DisconnectReason::Io)));
        assert!(!disconnect_is_terminal(Some(&DisconnectReason::TimedOut)));
        assert!(!disconnect_is_terminal(Some(&DisconnectReason::Internal)));
    }
}
