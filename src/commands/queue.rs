use anyhow::{Result, anyhow};
use serenity::all::{
    CommandInteraction, Context as SerenityContext, CreateCommand, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
};

use crate::state;

use super::format_duration;

const PAGE_SIZE: usize = 10;

pub fn definition() -> CreateCommand {
    CreateCommand::new("queue").description("Show what's in queue")
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

    let entries = (app.queues)(guild_id.get()).entries().await?;
    if entries.is_empty() {
        cmd.edit_response(
            &ctx.http,
            EditInteractionResponse::new().content("Nothing in queue"),
        )
        .await
        .ok();
        return Ok(());
    }

    let lines: Vec<String> = entries
        .iter()
        .take(PAGE_SIZE)
        .enumerate()
        .map(|(i, entry)| {
            format!(
                "{}. **{}** | {} | {}",
                i + 1,
                entry.track.title,
                entry
                    .track
                    .duration()
                    .map(format_duration)
                    .unwrap_or_else(|| "live".to_string()),
                entry.requester
            )
        })
        .collect();

    let embed = CreateEmbed::new()
        .title("Up Next")
        .description(lines.join("\n"))
        .footer(serenity::all::CreateEmbedFooter::new(format!(
            "{} track(s) queued",
            entries.len()
        )))
        .colour(0x5865F2);

    cmd.edit_response(
        &ctx.http,
        EditInteractionResponse::new().embeds(vec![embed]),
    )
    .await
    .ok();
    Ok(())
}
