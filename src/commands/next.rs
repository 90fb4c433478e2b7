use std::time::Duration;

use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, Context as SerenityContext, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse,
};

use crate::queue::DequeueMode;
use crate::state;

pub fn definition() -> CreateCommand {
    CreateCommand::new("next").description("Skip to the next queued track")
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
    )
    .await
    .ok();

    let guild_id = cmd.guild_id.ok_or_else(|| anyhow!("not in a guild"))?;
    let app = state::get(ctx)
        .await
        .ok_or_else(|| anyhow!("app state not initialised"))?;

    let guild = guild_id.get();
    let Some(session) = app.registry.get(guild).await else {
        cmd.edit_response(
            &ctx.http,
            EditInteractionResponse::new().content("Not connected."),
        )
        .await
        .ok();
        return Ok(());
    };

    let queue = (app.queues)(guild);
    let msg = match queue.dequeue(DequeueMode::Normal).await? {
        Some(entry) => {
            let remaining = queue.len().await.unwrap_or(0);
            session.play(entry.clone(), Duration::ZERO, false).await?;
            format!(
                "Skipped. Now playing **{}** ({} track(s) remaining)",
                entry.track.title, remaining
            )
        }
        None => {
            session.stop().await?;
            "Queue is empty. Stopped and disconnected.".to_string()
        }
    };

    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(msg))
        .await
        .ok();
    Ok(())
}
