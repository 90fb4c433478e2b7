use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::{PlayerSession, PlayerState, SessionRegistry};
use crate::model::PlaybackSnapshot;
use crate::store::StoreClient;

/// Periodic snapshot loop. Every tick captures the live position of every
/// actively playing session and overwrites its stored snapshot, bounding how
/// much position accuracy a crash can lose. Runs until `shutdown` flips.
pub async fn run(
    store: StoreClient,
    registry: SessionRegistry,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => tick(&store, &registry).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("checkpointer stopping");
                    return;
                }
            }
        }
    }
}

/// One checkpoint pass. A failing store write for one guild is logged and
/// never aborts the pass for the rest.
async fn tick(store: &StoreClient, registry: &SessionRegistry) {
    for (guild, session) in registry.all().await {
        let Some(snapshot) = capture(session.as_ref()).await else {
            continue;
        };
        if let Err(e) = store.set_playing(guild, &snapshot).await {
            warn!("checkpoint write failed for guild {guild}: {e}");
        }
    }
}

/// Snapshot of one session, or None when it is not actively playing.
/// Paused and idle sessions keep whatever snapshot the last event left.
async fn capture(session: &dyn PlayerSession) -> Option<PlaybackSnapshot> {
    if session.state().await != PlayerState::Playing {
        return None;
    }
    let entry = session.now_playing().await?;
    let position = session.position().await;
    Some(PlaybackSnapshot::new(entry, session.channel(), position))
}

/// Checkpointer handle: spawn the loop, flip the sender on shutdown, then
/// await the task before tearing the store down.
pub fn spawn(
    store: StoreClient,
    registry: SessionRegistry,
    interval: std::time::Duration,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(run(store, registry, interval, rx));
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use super::*;
    use crate::model::{QueueEntry, TrackRef};

    struct FakeSession {
        state: PlayerState,
        entry: Option<QueueEntry>,
        position: Duration,
        channel: u64,
    }

    #[async_trait]
    impl PlayerSession for FakeSession {
        async fn play(&self, _: QueueEntry, _: Duration, _: bool) -> Result<()> {
            Ok(())
        }
        async fn state(&self) -> PlayerState {
            self.state
        }
        async fn now_playing(&self) -> Option<QueueEntry> {
            self.entry.clone()
        }
        async fn position(&self) -> Duration {
            self.position
        }
        fn channel(&self) -> u64 {
            self.channel
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(title: &str) -> QueueEntry {
        QueueEntry {
            track: TrackRef {
                url: "https://example.com/t".into(),
                title: title.into(),
                author: "a".into(),
                duration_ms: Some(300_000),
                artwork_url: None,
                live: false,
            },
            requester: "alice".into(),
        }
    }

    #[tokio::test]
    async fn capture_records_live_position_for_playing_session() {
        let session = FakeSession {
            state: PlayerState::Playing,
            entry: Some(entry("song")),
            position: Duration::from_millis(5_200),
            channel: 100,
        };
        let snap = capture(&session).await.unwrap();
        assert_eq!(snap.channel_id, 100);
        assert_eq!(snap.position_ms, 5_200);
        assert_eq!(snap.entry.track.title, "song");
    }

    #[tokio::test]
    async fn capture_skips_paused_and_idle_sessions() {
        for state in [PlayerState::Paused, PlayerState::Idle] {
            let session = FakeSession {
                state,
                entry: Some(entry("song")),
                position: Duration::from_secs(1),
                channel: 100,
            };
            assert!(capture(&session).await.is_none(), "{state:?}");
        }
    }

    #[tokio::test]
    async fn capture_skips_session_without_current_entry() {
        let session = FakeSession {
            state: PlayerState::Playing,
            entry: None,
            position: Duration::ZERO,
            channel: 100,
        };
        assert!(capture(&session).await.is_none());
    }
}
