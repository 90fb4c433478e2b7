use std::time::Duration;

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_uri: String,
    pub key_prefix: String,
    pub queue_backend: QueueBackend,
    pub checkpoint_interval: Duration,
    pub store_timeout: Duration,
    pub resume_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let redis_uri = std::env::var("REDIS_URI")
            .map_err(|_| anyhow!("Set REDIS_URI in environment (e.g. redis://127.0.0.1/)"))?;

        let queue_backend = match std::env::var("QUEUE_BACKEND").as_deref() {
            Ok("memory") => QueueBackend::Memory,
            Ok("redis") | Err(_) => QueueBackend::Redis,
            Ok(other) => return Err(anyhow!("unknown QUEUE_BACKEND: {other} (redis|memory)")),
        };

        Ok(Self {
            redis_uri,
            key_prefix: std::env::var("REDIS_PREFIX").unwrap_or_else(|_| "rhea:".to_string()),
            queue_backend,
            checkpoint_interval: Duration::from_secs(read_u64("CHECKPOINT_SECS", 5, 1..=600)),
            store_timeout: Duration::from_millis(read_u64("STORE_TIMEOUT_MS", 3000, 100..=60_000)),
            resume_concurrency: read_u64("RESUME_CONCURRENCY", 4, 1..=64) as usize,
        })
    }
}

fn read_u64(key: &str, default: u64, range: std::ops::RangeInclusive<u64>) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

pub fn read_discord_token() -> Result<String> {
    const CANDIDATES: &[&str] = &[
        "DISCORD_TOKEN",
        "DISCORD_BOT_TOKEN",
        "BOT_TOKEN",
        "DOCKER_TOKEN",
    ];
    for key in CANDIDATES {
        if let Ok(val) = std::env::var(key) {
            if !val.is_empty() {
                return Ok(val);
            }
        }
    }
    Err(anyhow!(
        "Set one of DISCORD_TOKEN, DISCORD_BOT_TOKEN, BOT_TOKEN, or DOCKER_TOKEN in environment"
    ))
}
