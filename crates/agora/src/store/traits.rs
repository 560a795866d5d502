//! Hub store trait definition.

use async_trait::async_trait;

use super::StoreResult;
use crate::hub::{ChannelId, Hub, HubId};

/// Capability set every hub store backend provides.
///
/// The store owns the canonical hub records. Every read hands back an owned
/// snapshot; mutations go through the store again. Capacity ceilings are not
/// checked by the plain mutators, only by the `*_capped` variants, which must
/// perform the check and the mutation atomically.
#[async_trait]
pub trait HubStore: Send + Sync {
    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;

    /// Insert a new hub. Fails with `AlreadyExists` on a duplicate ID.
    async fn add_hub(&self, hub: Hub) -> StoreResult<()>;

    /// Insert a new hub unless `max_hubs` hubs already exist.
    async fn add_hub_capped(&self, hub: Hub, max_hubs: u64) -> StoreResult<()>;

    /// Remove a hub. Returns whether a record was removed.
    async fn delete_hub(&self, id: &HubId) -> StoreResult<bool>;

    /// Fetch a hub by ID.
    async fn get_hub(&self, id: &HubId) -> StoreResult<Hub>;

    /// Fetch every hub. Callers must not depend on the order.
    async fn get_hubs(&self) -> StoreResult<Vec<Hub>>;

    /// Add a channel to a hub's membership.
    ///
    /// Adding a channel that is already a member of the same hub is a no-op.
    /// Fails with `HubNotFound` if the hub is missing and `ChannelInUse` if
    /// another hub already owns the channel.
    async fn add_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<()>;

    /// Add a channel unless the hub already has `max_channels` members.
    async fn add_channel_capped(
        &self,
        hub_id: &HubId,
        channel_id: &ChannelId,
        max_channels: u64,
    ) -> StoreResult<()>;

    /// Remove a channel from a hub. Returns whether it was a member.
    async fn delete_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<bool>;

    /// Number of hubs in the store.
    async fn get_hubs_count(&self) -> StoreResult<u64>;

    /// Number of channels in a hub.
    async fn get_channels_count(&self, hub_id: &HubId) -> StoreResult<u64>;

    /// Reverse lookup: the hub that contains `channel_id`.
    async fn get_hub_of_channel(&self, channel_id: &ChannelId) -> StoreResult<Hub>;
}
