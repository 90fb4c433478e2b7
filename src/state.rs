use std::sync::Arc;

use serenity::prelude::{Context as SerenityContext, TypeMapKey};

use crate::engine::{PlaybackEngine, SessionRegistry};
use crate::resume::QueueFactory;
use crate::store::StoreClient;

/// Shared handles for everything the command layer and the resumer touch:
/// one store connection, one engine, one session registry, and the queue
/// factory for the configured backend.
pub struct AppState {
    pub store: StoreClient,
    pub engine: Arc<dyn PlaybackEngine>,
    pub registry: SessionRegistry,
    pub queues: QueueFactory,
    pub resume_concurrency: usize,
}

pub struct AppStateKey;

impl TypeMapKey for AppStateKey {
    type Value = Arc<AppState>;
}

pub async fn get(ctx: &SerenityContext) -> Option<Arc<AppState>> {
    ctx.data.read().await.get::<AppStateKey>().cloned()
}
