use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, Context as SerenityContext, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse,
};

use crate::state;

pub fn definition() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback and clear the queue")
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

    let msg = match app.registry.get(guild_id.get()).await {
        Some(session) => {
            // Persisted snapshot and queue are cleared by the session's
            // destroy event, not here.
            session.stop().await?;
            "Stopped, cleared the queue, and disconnected."
        }
        None => "Not connected.",
    };

    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(msg))
        .await
        .ok();
    Ok(())
}
