use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::warn;

use crate::env::Config;
use crate::model::{PlaybackSnapshot, QueueEntry};

/// Keys expire a day after the last write; anything older than that is not
/// worth resuming.
const TTL_SECS: u64 = 86_400;

/// How often a guarded read-modify-write retries before giving up. Conflicts
/// only happen when two mutations for the same guild race, so a couple of
/// retries is plenty.
const CAS_ATTEMPTS: u32 = 4;

/// Commits a queue mutation only if the value is still what we read.
/// ARGV[1] = expected current raw value ("" when the key was absent),
/// ARGV[2] = new raw value, ARGV[3] = TTL in seconds.
static QUEUE_CAS: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r"
        local cur = redis.call('GET', KEYS[1])
        if cur == false then cur = '' end
        if cur ~= ARGV[1] then return 0 end
        redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
        return 1
        ",
    )
});

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue for guild {0} was modified concurrently, giving up after {CAS_ATTEMPTS} attempts")]
    Conflict(u64),
}

/// Pooled connection to the key-value store, shared by every component.
/// All calls carry a short timeout so a wedged connection cannot block an
/// engine event handler.
#[derive(Clone)]
pub struct StoreClient {
    conn: ConnectionManager,
    prefix: String,
    timeout: Duration,
}

impl StoreClient {
    pub async fn connect(cfg: &Config) -> Result<Self, StoreError> {
        let client = redis::Client::open(cfg.redis_uri.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: cfg.key_prefix.clone(),
            timeout: cfg.store_timeout,
        })
    }

    fn queue_key(&self, guild: u64) -> String {
        format!("{}queue:{guild}", self.prefix)
    }

    fn playing_key(&self, guild: u64) -> String {
        format!("{}playing:{guild}", self.prefix)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(StoreError::from)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn set_raw(&self, key: &str, raw: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let raw = raw.to_string();
        self.bounded(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(&raw)
                .arg("EX")
                .arg(TTL_SECS)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move {
            let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// The stored queue for a guild. Absent or expired keys read as an empty
    /// queue; an undecodable value is treated the same way (fail open).
    pub async fn queue(&self, guild: u64) -> Result<Vec<QueueEntry>, StoreError> {
        let raw = self.get_raw(&self.queue_key(guild)).await?;
        Ok(decode_queue(guild, raw.as_deref()))
    }

    pub async fn set_queue(&self, guild: u64, entries: &[QueueEntry]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(entries)?;
        self.set_raw(&self.queue_key(guild), &raw).await
    }

    /// Read-modify-write of the queue, committed through a compare-and-swap
    /// so a concurrent mutation for the same guild cannot be silently lost.
    /// Returns whatever the mutation closure returns for the list that was
    /// actually committed.
    pub async fn update_queue<T>(
        &self,
        guild: u64,
        mut mutate: impl FnMut(&mut Vec<QueueEntry>) -> T,
    ) -> Result<T, StoreError> {
        let key = self.queue_key(guild);
        for _ in 0..CAS_ATTEMPTS {
            let old_raw = self.get_raw(&key).await?.unwrap_or_default();
            let mut entries = decode_queue(guild, Some(&old_raw));
            let out = mutate(&mut entries);
            let new_raw = serde_json::to_string(&entries)?;

            let mut conn = self.conn.clone();
            let (k, old, new) = (key.clone(), old_raw, new_raw);
            let committed: i64 = self
                .bounded(async move {
                    QUEUE_CAS
                        .key(&k)
                        .arg(&old)
                        .arg(&new)
                        .arg(TTL_SECS)
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;
            if committed == 1 {
                return Ok(out);
            }
        }
        Err(StoreError::Conflict(guild))
    }

    pub async fn clear_queue(&self, guild: u64) -> Result<(), StoreError> {
        self.delete_raw(&self.queue_key(guild)).await
    }

    pub async fn playing(&self, guild: u64) -> Result<Option<PlaybackSnapshot>, StoreError> {
        let raw = self.get_raw(&self.playing_key(guild)).await?;
        Ok(raw.as_deref().and_then(|r| decode_snapshot(guild, r)))
    }

    pub async fn set_playing(
        &self,
        guild: u64,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(snapshot)?;
        self.set_raw(&self.playing_key(guild), &raw).await
    }

    pub async fn delete_playing(&self, guild: u64) -> Result<(), StoreError> {
        self.delete_raw(&self.playing_key(guild)).await
    }

    /// Guild ids with a present snapshot, via a cursor SCAN over the
    /// `playing` namespace. SCAN may hand back a key more than once across
    /// pages, so results are deduplicated.
    pub async fn scan_playing(&self) -> Result<Vec<u64>, StoreError> {
        let pattern = format!("{}playing*", self.prefix);
        let mut guilds = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut conn = self.conn.clone();
            let pat = pattern.clone();
            let (next, keys): (u64, Vec<String>) = self
                .bounded(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pat)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            for key in keys {
                match guild_from_key(&key) {
                    Some(guild) if !guilds.contains(&guild) => guilds.push(guild),
                    Some(_) => {}
                    None => warn!("ignoring malformed snapshot key: {key}"),
                }
            }
            if next == 0 {
                return Ok(guilds);
            }
            cursor = next;
        }
    }
}

fn decode_queue(guild: u64, raw: Option<&str>) -> Vec<QueueEntry> {
    match raw {
        None | Some("") => Vec::new(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("discarding undecodable queue for guild {guild}: {e}");
            Vec::new()
        }),
    }
}

fn decode_snapshot(guild: u64, raw: &str) -> Option<PlaybackSnapshot> {
    match serde_json::from_str(raw) {
        Ok(snap) => Some(snap),
        Err(e) => {
            warn!("discarding undecodable snapshot for guild {guild}: {e}");
            None
        }
    }
}

fn guild_from_key(key: &str) -> Option<u64> {
    key.rsplit(':').next()?.parse().ok()
}
