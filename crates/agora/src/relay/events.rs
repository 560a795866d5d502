//! Inbound events the relay reacts to.

use serde::{Deserialize, Serialize};

use crate::hub::ChannelId;

/// The user behind an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    /// Display name used in relayed text.
    pub name: String,
}

/// A message posted in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedMessage {
    pub channel_id: ChannelId,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    /// Attachment URLs, relayed one per line after the content.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// A reaction added to or removed from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Absent for direct messages.
    #[serde(default)]
    pub guild_id: Option<String>,
    pub channel_id: ChannelId,
    pub message_id: String,
    pub user: Author,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    MessagePosted(PostedMessage),
    ReactionAdded(Reaction),
    ReactionRemoved(Reaction),
}

impl RelayEvent {
    /// Channel the event happened in.
    pub fn origin(&self) -> &ChannelId {
        match self {
            RelayEvent::MessagePosted(m) => &m.channel_id,
            RelayEvent::ReactionAdded(r) | RelayEvent::ReactionRemoved(r) => &r.channel_id,
        }
    }

    pub fn author(&self) -> &Author {
        match self {
            RelayEvent::MessagePosted(m) => &m.author,
            RelayEvent::ReactionAdded(r) | RelayEvent::ReactionRemoved(r) => &r.user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::MessagePosted(_) => "message_posted",
            RelayEvent::ReactionAdded(_) => "reaction_added",
            RelayEvent::ReactionRemoved(_) => "reaction_removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_line() {
        let line = r#"{"type":"message_posted","channel_id":"c1","author":{"id":"u1","name":"ana"},"content":"hi"}"#;
        let event: RelayEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.kind(), "message_posted");
        assert_eq!(event.origin(), &ChannelId::from("c1"));
        assert_eq!(event.author().name, "ana");
        match event {
            RelayEvent::MessagePosted(m) => assert!(m.attachments.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_reaction_without_guild() {
        let line = r#"{"type":"reaction_removed","channel_id":"c2","message_id":"m9","user":{"id":"u2","name":"bo"},"emoji":"👍"}"#;
        let event: RelayEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.kind(), "reaction_removed");
        assert_eq!(event.author().id, "u2");
        match event {
            RelayEvent::ReactionRemoved(r) => assert!(r.guild_id.is_none()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let line = r#"{"type":"typing_started","channel_id":"c1"}"#;
        assert!(serde_json::from_str::<RelayEvent>(line).is_err());
    }
}
