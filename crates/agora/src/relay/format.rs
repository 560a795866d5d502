//! Text rendering of relayed events.

use super::events::{PostedMessage, Reaction, RelayEvent};
use crate::hub::ChannelId;

/// Render the text sent to every target channel for `event`.
pub fn render(event: &RelayEvent) -> String {
    match event {
        RelayEvent::MessagePosted(message) => render_message(message),
        RelayEvent::ReactionAdded(reaction) => format!(
            "**{}** reacted with {} to [a message]({}) in <#{}>",
            reaction.user.name,
            reaction.emoji,
            reaction_link(reaction),
            reaction.channel_id
        ),
        RelayEvent::ReactionRemoved(reaction) => format!(
            "**{}** removed their {} reaction from [a message]({}) in <#{}>",
            reaction.user.name,
            reaction.emoji,
            reaction_link(reaction),
            reaction.channel_id
        ),
    }
}

fn render_message(message: &PostedMessage) -> String {
    let mut text = format!(
        "**{}** (from <#{}>):\n{}",
        message.author.name, message.channel_id, message.content
    );
    for url in &message.attachments {
        text.push('\n');
        text.push_str(url);
    }
    text
}

fn reaction_link(reaction: &Reaction) -> String {
    message_link(
        reaction.guild_id.as_deref(),
        &reaction.channel_id,
        &reaction.message_id,
    )
}

/// Jump link to a message. Direct messages have no guild and use `@me`.
pub fn message_link(guild_id: Option<&str>, channel_id: &ChannelId, message_id: &str) -> String {
    format!(
        "https://discord.com/channels/{}/{}/{}",
        guild_id.unwrap_or("@me"),
        channel_id,
        message_id
    )
}
