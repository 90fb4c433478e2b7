use std::time::Duration;

use anyhow::{Result, anyhow};
use serenity::all::{
    CommandDataOptionValue, CommandInteraction, CommandOptionType, Context as SerenityContext,
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse,
};

use crate::audio;
use crate::engine::PlayerState;
use crate::model::QueueEntry;
use crate::state;

use super::{format_duration, requester_name, user_voice_channel};

pub fn definition() -> CreateCommand {
    let opt = CreateCommandOption::new(CommandOptionType::String, "query", "A search term or URL")
        .required(true);
    CreateCommand::new("play")
        .description("Play some music")
        .add_option(opt)
}

pub async fn handle(ctx: &SerenityContext, cmd: &CommandInteraction) -> Result<()> {
    let query = cmd
        .data
        .options
        .iter()
        .find(|o| o.name == "query")
        .and_then(|o| match &o.value {
            CommandDataOptionValue::String(s) => Some(s.as_str()),
            _ => None,
        })
        .ok_or_else(|| anyhow!("missing query"))?;

    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
    )
    .await
    .ok();

    let (guild_id, channel_id) = user_voice_channel(ctx, cmd)?;
    let app = state::get(ctx)
        .await
        .ok_or_else(|| anyhow!("app state not initialised"))?;

    let track = match audio::probe_track(query).await {
        Ok(track) => track,
        Err(_) => {
            cmd.edit_response(
                &ctx.http,
                EditInteractionResponse::new()
                    .content(format!("Unable to find anything for `{query}`")),
            )
            .await
            .ok();
            return Ok(());
        }
    };
    let entry = QueueEntry {
        track,
        requester: requester_name(cmd),
    };

    let guild = guild_id.get();
    let session = match app.registry.get(guild).await {
        Some(session) => session,
        None => {
            app.engine
                .acquire(guild, channel_id.get(), (app.queues)(guild))
                .await?
        }
    };
    if session.channel() != channel_id.get() {
        cmd.edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .content("You must be in the same voice channel as me to run this command."),
        )
        .await
        .ok();
        return Ok(());
    }

    let msg = if session.state().await == PlayerState::Playing {
        // Store failure here must surface; a silently dropped queue entry is
        // worse than a failed command.
        let position = (app.queues)(guild).append(entry.clone()).await?;
        format!(
            "Queued **{}** ({}) in position {position}",
            entry.track.title,
            entry
                .track
                .duration()
                .map(format_duration)
                .unwrap_or_else(|| "live".to_string()),
        )
    } else {
        session.play(entry.clone(), Duration::ZERO, false).await?;
        format!("Now playing **{}**", entry.track.title)
    };

    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(msg))
        .await
        .ok();
    Ok(())
}
