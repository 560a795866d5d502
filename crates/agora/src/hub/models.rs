//! Hub data models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque hub identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HubId(String);

impl HubId {
    /// Generate a fresh hub ID (e.g. `hub_V1StGXR8_Z5j`).
    pub fn generate() -> Self {
        Self(format!("hub_{}", nanoid::nanoid!(12)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HubId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HubId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque identifier of a channel on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A named group of channels whose traffic is mirrored to one another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    /// Unique hub ID, immutable once created.
    pub id: HubId,
    /// User that created the hub.
    pub owner_id: String,
    /// Display label. Not required to be unique.
    pub name: String,
    /// Member channels in the order they were added.
    #[serde(default)]
    pub channels: Vec<ChannelId>,
}

impl Hub {
    /// Create an empty hub with a generated ID.
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(HubId::generate(), owner_id, name)
    }

    /// Create an empty hub with a caller-supplied ID.
    pub fn with_id(id: HubId, owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            name: name.into(),
            channels: Vec::new(),
        }
    }

    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains(channel_id)
    }

    /// Every member channel except `origin`, in membership order.
    pub fn targets_excluding<'a>(
        &'a self,
        origin: &'a ChannelId,
    ) -> impl Iterator<Item = &'a ChannelId> + 'a {
        self.channels.iter().filter(move |c| *c != origin)
    }
}
