use std::time::Duration;

use anyhow::{Result, anyhow};
use serenity::all::{ChannelId, CommandInteraction, Context as SerenityContext, GuildId};

pub mod next;
pub mod play;
pub mod queue;
pub mod shuffle;
pub mod stop;

/// The guild and the voice channel the invoking user currently sits in.
pub(crate) fn user_voice_channel(
    ctx: &SerenityContext,
    cmd: &CommandInteraction,
) -> Result<(GuildId, ChannelId)> {
    let guild_id = cmd.guild_id.ok_or_else(|| anyhow!("not in a guild"))?;
    let channel_id = {
        let guild = ctx
            .cache
            .guild(guild_id)
            .ok_or_else(|| anyhow!("guild not in cache"))?;
        guild
            .voice_states
            .get(&cmd.user.id)
            .and_then(|vs| vs.channel_id)
            .ok_or_else(|| anyhow!("you must be in a voice channel"))?
    };
    Ok((guild_id, channel_id))
}

pub(crate) fn requester_name(cmd: &CommandInteraction) -> String {
    cmd.user
        .global_name
        .clone()
        .unwrap_or_else(|| cmd.user.name.clone())
}

/// `m:ss` / `h:mm:ss`, for queue listings.
pub(crate) fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_like_clocks() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(59)), "0:59");
        assert_eq!(format_duration(Duration::from_secs(213)), "3:33");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1:00:00");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
