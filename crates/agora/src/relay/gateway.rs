//! Outbound side of the chat platform.

use async_trait::async_trait;
use thiserror::Error;

use crate::hub::ChannelId;

/// Why a single send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send to {channel} failed: {reason}")]
    Failed { channel: ChannelId, reason: String },

    #[error("send to {0} timed out")]
    TimedOut(ChannelId),

    #[error("gateway closed")]
    Closed,
}

/// Connection to the chat platform used for relaying.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Author ID the relay posts as. Events from this author are not relayed.
    fn self_id(&self) -> &str;

    /// Post `content` to `channel`.
    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), SendError>;
}
