use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serenity::{
    all::{
        Command as AppCommand, Context as SerenityContext, GatewayIntents, GuildId, Interaction,
        Ready,
    },
    async_trait,
};
use songbird::{Config as VoiceConfig, Songbird, driver::MixMode, serenity::SerenityInit};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod audio;
mod checkpoint;
mod commands;
mod discord;
mod engine;
mod env;
mod events;
mod model;
mod queue;
mod resume;
mod state;
mod store;

use discord::{CacheRoster, SongbirdEngine};
use engine::SessionRegistry;
use env::{Config, QueueBackend};
use queue::{MemoryQueue, RedisQueue, TrackQueue};
use resume::QueueFactory;
use state::{AppState, AppStateKey};
use store::StoreClient;

struct Handler {
    // Recovery must run exactly once; `cache_ready` re-fires on gateway
    // reconnects.
    resumed: AtomicBool,
}

#[async_trait]
impl serenity::prelude::EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        for def in [
            commands::play::definition(),
            commands::next::definition(),
            commands::stop::definition(),
            commands::queue::definition(),
            commands::shuffle::definition(),
        ] {
            if let Err(e) = AppCommand::create_global_command(&ctx.http, def).await {
                error!("failed to register global command: {e:?}");
            }
        }
    }

    // Recovery checks voice-channel membership, and voice states only land
    // in the cache with the GUILD_CREATE events that follow READY. Resuming
    // any earlier would see every guild as uncached.
    async fn cache_ready(&self, ctx: SerenityContext, guilds: Vec<GuildId>) {
        if self.resumed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "cache ready with {} guild(s), starting session recovery",
            guilds.len()
        );
        let Some(app) = state::get(&ctx).await else {
            error!("app state missing, cannot resume sessions");
            return;
        };
        let roster = Arc::new(CacheRoster::new(ctx.cache.clone()));
        tokio::spawn(async move {
            resume::run(
                Arc::new(app.store.clone()),
                Arc::clone(&app.engine),
                roster,
                Arc::clone(&app.queues),
                app.resume_concurrency,
            )
            .await;
        });
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction {
            let result = match cmd.data.name.as_str() {
                "play" => commands::play::handle(&ctx, &cmd).await,
                "next" => commands::next::handle(&ctx, &cmd).await,
                "stop" => commands::stop::handle(&ctx, &cmd).await,
                "queue" => commands::queue::handle(&ctx, &cmd).await,
                "shuffle" => commands::shuffle::handle(&ctx, &cmd).await,
                _ => Ok(()),
            };
            if let Err(why) = result {
                error!("/{} failed: {why:?}", cmd.data.name);
                // The user asked for something and it did not happen; say so.
                let _ = cmd
                    .edit_response(
                        &ctx.http,
                        serenity::all::EditInteractionResponse::new()
                            .content(format!("Something went wrong: {why}")),
                    )
                    .await;
            }
        }
    }
}

fn queue_factory(backend: QueueBackend, store: &StoreClient) -> QueueFactory {
    match backend {
        QueueBackend::Redis => {
            let store = store.clone();
            Arc::new(move |guild| Arc::new(RedisQueue::new(store.clone(), guild)) as Arc<dyn TrackQueue>)
        }
        QueueBackend::Memory => {
            // Queue identity has to be stable per guild for the lifetime of
            // the process.
            let queues: Arc<std::sync::Mutex<HashMap<u64, Arc<MemoryQueue>>>> = Arc::default();
            Arc::new(move |guild| {
                let mut map = queues.lock().unwrap_or_else(|e| e.into_inner());
                let queue = map
                    .entry(guild)
                    .or_insert_with(|| Arc::new(MemoryQueue::new()));
                Arc::clone(queue) as Arc<dyn TrackQueue>
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = env::read_discord_token()?;
    let config = Config::from_env()?;

    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;
    let voice_cfg = {
        let mix = match std::env::var("RHEA_MIX_MODE").as_deref() {
            Ok("mono") => MixMode::Mono,
            _ => MixMode::Stereo,
        };
        VoiceConfig::default()
            .preallocated_tracks(2)
            .use_softclip(false)
            .mix_mode(mix)
    };
    let manager = Songbird::serenity_from_config(voice_cfg);

    let store = StoreClient::connect(&config).await?;
    info!("connected to store with prefix {:?}", config.key_prefix);

    let registry = SessionRegistry::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(SongbirdEngine::new(
        Arc::clone(&manager),
        events_tx,
        registry.clone(),
    ));
    let queues = queue_factory(config.queue_backend, &store);

    let bridge = tokio::spawn(events::run(store.clone(), events_rx));
    let (checkpoint_stop, checkpoint_task) = checkpoint::spawn(
        store.clone(),
        registry.clone(),
        config.checkpoint_interval,
    );

    let app = Arc::new(AppState {
        store,
        engine,
        registry,
        queues,
        resume_concurrency: config.resume_concurrency,
    });

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(Handler {
            resumed: AtomicBool::new(false),
        })
        .register_songbird_with(manager)
        .await?;
    client.data.write().await.insert::<AppStateKey>(app);

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Commands: /play query:<term or url>, /next, /stop, /queue, /shuffle");
    if let Err(why) = client.start_autosharded().await {
        error!("Client error: {why:?}");
    }

    // Gateway is down; stop the checkpointer before the store connection
    // goes away so the final tick cannot race teardown.
    if checkpoint_stop.send(true).is_err() {
        warn!("checkpointer already gone at shutdown");
    }
    let _ = checkpoint_task.await;
    bridge.abort();
    Ok(())
}
