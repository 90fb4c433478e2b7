use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::engine::{PlaybackEngine, VoiceRoster};
use crate::model::PlaybackSnapshot;
use crate::queue::TrackQueue;
use crate::store::{StoreClient, StoreError};

/// The slice of the store the resumer needs: enumerate snapshots, read one,
/// and drop a guild's persisted state wholesale.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn scan_playing(&self) -> Result<Vec<u64>, StoreError>;
    async fn playing(&self, guild: u64) -> Result<Option<PlaybackSnapshot>, StoreError>;
    /// Delete both the snapshot and the queue for a guild.
    async fn forget(&self, guild: u64) -> Result<(), StoreError>;
}

#[async_trait]
impl RecoveryStore for StoreClient {
    async fn scan_playing(&self) -> Result<Vec<u64>, StoreError> {
        StoreClient::scan_playing(self).await
    }

    async fn playing(&self, guild: u64) -> Result<Option<PlaybackSnapshot>, StoreError> {
        StoreClient::playing(self, guild).await
    }

    async fn forget(&self, guild: u64) -> Result<(), StoreError> {
        self.delete_playing(guild).await?;
        self.clear_queue(guild).await
    }
}

/// Builds the queue implementation for one guild, per the configured
/// backend.
pub type QueueFactory = Arc<dyn Fn(u64) -> Arc<dyn TrackQueue> + Send + Sync>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub resumed: usize,
    pub abandoned: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum Outcome {
    Resumed,
    Abandoned,
    Failed,
    Skipped,
}

/// One-shot startup recovery: walk every persisted snapshot and bring the
/// sessions that still have an audience back to life. Runs with bounded
/// concurrency so a large deployment does not stampede the store or the
/// engine; every guild succeeds or fails on its own.
pub async fn run(
    store: Arc<dyn RecoveryStore>,
    engine: Arc<dyn PlaybackEngine>,
    roster: Arc<dyn VoiceRoster>,
    queues: QueueFactory,
    concurrency: usize,
) -> ResumeReport {
    let guilds = match store.scan_playing().await {
        Ok(guilds) => guilds,
        Err(e) => {
            warn!("resume scan failed, recovering nothing: {e}");
            return ResumeReport::default();
        }
    };
    info!("resume: {} candidate guild(s)", guilds.len());

    let (resumed, abandoned, failed, skipped) = (
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
    );

    futures_util::stream::iter(guilds)
        .for_each_concurrent(concurrency.max(1), |guild| {
            let (store, engine, roster, queues) = (
                Arc::clone(&store),
                Arc::clone(&engine),
                Arc::clone(&roster),
                Arc::clone(&queues),
            );
            let counters = (&resumed, &abandoned, &failed, &skipped);
            async move {
                let outcome = resume_one(&*store, &*engine, &*roster, &queues, guild).await;
                let (resumed, abandoned, failed, skipped) = counters;
                match outcome {
                    Outcome::Resumed => resumed.fetch_add(1, Ordering::Relaxed),
                    Outcome::Abandoned => abandoned.fetch_add(1, Ordering::Relaxed),
                    Outcome::Failed => failed.fetch_add(1, Ordering::Relaxed),
                    Outcome::Skipped => skipped.fetch_add(1, Ordering::Relaxed),
                };
            }
        })
        .await;

    let report = ResumeReport {
        resumed: resumed.into_inner(),
        abandoned: abandoned.into_inner(),
        failed: failed.into_inner(),
        skipped: skipped.into_inner(),
    };
    info!(
        "resume finished: {} resumed, {} abandoned, {} failed, {} skipped",
        report.resumed, report.abandoned, report.failed, report.skipped
    );
    report
}

async fn resume_one(
    store: &dyn RecoveryStore,
    engine: &dyn PlaybackEngine,
    roster: &dyn VoiceRoster,
    queues: &QueueFactory,
    guild: u64,
) -> Outcome {
    // The key can expire between the scan and this read; that is benign.
    let snapshot = match store.playing(guild).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return Outcome::Skipped,
        Err(e) => {
            warn!("guild {guild}: snapshot read failed, leaving state for next start: {e}");
            return Outcome::Failed;
        }
    };

    // Abandonment is only for a confirmed empty channel. If membership
    // cannot be resolved at all, the persisted state stays put for the next
    // start rather than being wiped on a guess.
    let listeners = match roster.non_bot_members(guild, snapshot.channel_id).await {
        Ok(count) => count,
        Err(e) => {
            warn!(
                "guild {guild}: cannot resolve channel {}, leaving state in place: {e}",
                snapshot.channel_id
            );
            return Outcome::Skipped;
        }
    };
    if listeners == 0 {
        info!("guild {guild}: channel {} is empty, abandoning session", snapshot.channel_id);
        forget(store, guild).await;
        return Outcome::Abandoned;
    }

    // Resume the snapshot's entry at its saved position. Deliberately not
    // dequeued: if the entry is still at the head of the persisted queue the
    // queue is left alone, and subsequent tracks advance from it as normal.
    let queue = queues(guild);
    let session = match engine.acquire(guild, snapshot.channel_id, queue).await {
        Ok(session) => session,
        Err(e) => {
            warn!("guild {guild}: session acquisition failed: {e:#}");
            forget(store, guild).await;
            return Outcome::Failed;
        }
    };
    if let Err(e) = session
        .play(snapshot.entry.clone(), snapshot.position(), false)
        .await
    {
        warn!("guild {guild}: resume playback failed: {e:#}");
        let _ = session.stop().await;
        forget(store, guild).await;
        return Outcome::Failed;
    }

    info!(
        "guild {guild}: resumed '{}' at {:?} in channel {}",
        snapshot.entry.track.title,
        snapshot.position(),
        snapshot.channel_id
    );
    Outcome::Resumed
}

/// A poisoned snapshot must not be retried on every restart; failures to
/// delete only get logged.
async fn forget(store: &dyn RecoveryStore, guild: u64) {
    if let Err(e) = store.forget(guild).await {
        warn!("guild {guild}: failed to drop persisted state: {e}");
    }
}
