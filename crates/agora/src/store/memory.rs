//! In-process hub store.
//!
//! State lives for the lifetime of the process only. A single `RwLock`
//! guards both the hub list and the channel -> hub index so every
//! check-then-mutate sequence runs under one write guard.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{HubStore, StoreError, StoreResult};
use crate::hub::{ChannelId, Hub, HubId};

#[derive(Debug, Default)]
struct MemoryState {
    /// Hubs in insertion order.
    hubs: Vec<Hub>,
    /// Channel -> owning hub.
    channel_index: HashMap<ChannelId, HubId>,
}

impl MemoryState {
    fn position(&self, id: &HubId) -> Option<usize> {
        self.hubs.iter().position(|h| &h.id == id)
    }

    fn hub_mut(&mut self, id: &HubId) -> StoreResult<&mut Hub> {
        self.hubs
            .iter_mut()
            .find(|h| &h.id == id)
            .ok_or_else(|| StoreError::HubNotFound(id.clone()))
    }

    fn insert_hub(&mut self, hub: Hub) -> StoreResult<()> {
        if self.position(&hub.id).is_some() {
            return Err(StoreError::AlreadyExists(hub.id));
        }
        // Channels supplied with a new hub are subject to the same exclusivity rule.
        let mut hub = hub;
        let mut seen = Vec::with_capacity(hub.channels.len());
        for channel in hub.channels.drain(..) {
            if let Some(owner) = self.channel_index.get(&channel) {
                return Err(StoreError::ChannelInUse {
                    channel,
                    hub: owner.clone(),
                });
            }
            if !seen.contains(&channel) {
                seen.push(channel);
            }
        }
        for channel in &seen {
            self.channel_index.insert(channel.clone(), hub.id.clone());
        }
        hub.channels = seen;
        self.hubs.push(hub);
        Ok(())
    }

    /// Returns `Ok(false)` when the channel was already a member of this hub.
    fn check_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<bool> {
        match self.channel_index.get(channel_id) {
            Some(owner) if owner == hub_id => Ok(false),
            Some(owner) => Err(StoreError::ChannelInUse {
                channel: channel_id.clone(),
                hub: owner.clone(),
            }),
            None => Ok(true),
        }
    }

    fn insert_channel(&mut self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<()> {
        self.hub_mut(hub_id)?;
        if !self.check_channel(hub_id, channel_id)? {
            return Ok(());
        }
        self.hub_mut(hub_id)?.channels.push(channel_id.clone());
        self.channel_index
            .insert(channel_id.clone(), hub_id.clone());
        Ok(())
    }
}

/// Ephemeral hub store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryHubStore {
    state: RwLock<MemoryState>,
}

impl MemoryHubStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HubStore for MemoryHubStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn add_hub(&self, hub: Hub) -> StoreResult<()> {
        self.state.write().await.insert_hub(hub)
    }

    async fn add_hub_capped(&self, hub: Hub, max_hubs: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.hubs.len() as u64 >= max_hubs {
            return Err(StoreError::CapacityExceeded {
                what: "hubs",
                limit: max_hubs,
            });
        }
        state.insert_hub(hub)
    }

    async fn delete_hub(&self, id: &HubId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(index) = state.position(id) else {
            return Ok(false);
        };
        let hub = state.hubs.remove(index);
        for channel in &hub.channels {
            state.channel_index.remove(channel);
        }
        debug!(hub_id = %id, channels = hub.channels.len(), "removed hub from memory");
        Ok(true)
    }

    async fn get_hub(&self, id: &HubId) -> StoreResult<Hub> {
        let state = self.state.read().await;
        state
            .hubs
            .iter()
            .find(|h| &h.id == id)
            .cloned()
            .ok_or_else(|| StoreError::HubNotFound(id.clone()))
    }

    async fn get_hubs(&self) -> StoreResult<Vec<Hub>> {
        Ok(self.state.read().await.hubs.clone())
    }

    async fn add_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<()> {
        self.state.write().await.insert_channel(hub_id, channel_id)
    }

    async fn add_channel_capped(
        &self,
        hub_id: &HubId,
        channel_id: &ChannelId,
        max_channels: u64,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let count = state.hub_mut(hub_id)?.channels.len() as u64;
        if count >= max_channels {
            return Err(StoreError::CapacityExceeded {
                what: "channels per hub",
                limit: max_channels,
            });
        }
        state.insert_channel(hub_id, channel_id)
    }

    async fn delete_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Ok(hub) = state.hub_mut(hub_id) else {
            return Ok(false);
        };
        let Some(index) = hub.channels.iter().position(|c| c == channel_id) else {
            return Ok(false);
        };
        hub.channels.remove(index);
        state.channel_index.remove(channel_id);
        Ok(true)
    }

    async fn get_hubs_count(&self) -> StoreResult<u64> {
        Ok(self.state.read().await.hubs.len() as u64)
    }

    async fn get_channels_count(&self, hub_id: &HubId) -> StoreResult<u64> {
        let state = self.state.read().await;
        state
            .hubs
            .iter()
            .find(|h| &h.id == hub_id)
            .map(|h| h.channels.len() as u64)
            .ok_or_else(|| StoreError::HubNotFound(hub_id.clone()))
    }

    async fn get_hub_of_channel(&self, channel_id: &ChannelId) -> StoreResult<Hub> {
        let state = self.state.read().await;
        state
            .channel_index
            .get(channel_id)
            .and_then(|hub_id| state.hubs.iter().find(|h| &h.id == hub_id))
            .cloned()
            .ok_or_else(|| StoreError::ChannelNotFound(channel_id.clone()))
    }
}
