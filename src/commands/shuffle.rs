use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, Context as SerenityContext, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse,
};

use crate::state;

pub fn definition() -> CreateCommand {
    CreateCommand::new("shuffle").description("Shuffle the queue")
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

    let queue = (app.queues)(guild_id.get());
    let len = queue.len().await?;
    let msg = if len < 2 {
        "Not enough tracks to shuffle.".to_string()
    } else {
        queue.shuffle().await?;
        format!("🔀 Shuffled {len} tracks")
    };

    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(msg))
        .await
        .ok();
    Ok(())
}
