//! Hub operations with capacity limits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use super::models::Hub;
use super::params::{
    AddChannelParams, AddHubParams, DeleteChannelParams, DeleteHubParams, GetChannelsCountParams,
    GetHubOfChannelParams, GetHubParams, GetHubsCountParams, GetHubsParams,
};
use crate::settings::{RelaySettings, TimeoutSettings};
use crate::store::{HubStore, StoreError, StoreResult};

/// Capacity ceilings enforced on mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubLimits {
    pub max_hubs: u64,
    pub max_channels_per_hub: u64,
}

impl From<&RelaySettings> for HubLimits {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            max_hubs: settings.max_hubs,
            max_channels_per_hub: settings.max_channels_per_hub,
        }
    }
}

impl Default for HubLimits {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

/// Administrative hub operations.
///
/// Add operations reject with `CapacityExceeded` once a ceiling is reached;
/// the check and the write happen atomically inside the store. Everything
/// else passes straight through. Each store call is bounded by the store
/// timeout.
#[derive(Clone)]
pub struct HubService {
    store: Arc<dyn HubStore>,
    limits: HubLimits,
    store_timeout: Duration,
}

impl HubService {
    /// Create a new hub service.
    pub fn new(store: Arc<dyn HubStore>, limits: HubLimits, store_timeout: Duration) -> Self {
        Self {
            store,
            limits,
            store_timeout,
        }
    }

    /// Create a hub service from relay and timeout settings.
    pub fn from_settings(
        store: Arc<dyn HubStore>,
        relay: &RelaySettings,
        timeouts: &TimeoutSettings,
    ) -> Self {
        Self::new(store, HubLimits::from(relay), timeouts.store())
    }

    pub fn limits(&self) -> HubLimits {
        self.limits
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::BackendUnavailable(format!(
                "{op} timed out after {}ms",
                self.store_timeout.as_millis()
            ))),
        }
    }

    /// Create a hub unless `max_hubs` is reached.
    #[instrument(skip(self, params), fields(hub_id = %params.hub.id))]
    pub async fn add_hub(&self, params: AddHubParams) -> StoreResult<Hub> {
        let hub = params.hub;
        if hub.channels.len() as u64 > self.limits.max_channels_per_hub {
            return Err(StoreError::CapacityExceeded {
                what: "channels per hub",
                limit: self.limits.max_channels_per_hub,
            });
        }
        self.bounded(
            "add_hub",
            self.store.add_hub_capped(hub.clone(), self.limits.max_hubs),
        )
        .await?;
        info!(hub_id = %hub.id, owner_id = %hub.owner_id, name = %hub.name, "created hub");
        Ok(hub)
    }

    /// Delete a hub. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn delete_hub(&self, params: DeleteHubParams) -> StoreResult<bool> {
        let removed = self
            .bounded("delete_hub", self.store.delete_hub(&params.id))
            .await?;
        if removed {
            info!(hub_id = %params.id, "deleted hub");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub async fn get_hub(&self, params: GetHubParams) -> StoreResult<Hub> {
        self.bounded("get_hub", self.store.get_hub(&params.id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_hubs(&self, _params: GetHubsParams) -> StoreResult<Vec<Hub>> {
        self.bounded("get_hubs", self.store.get_hubs()).await
    }

    /// Add a channel to a hub unless the hub is full.
    #[instrument(skip(self))]
    pub async fn add_channel(&self, params: AddChannelParams) -> StoreResult<()> {
        self.bounded(
            "add_channel",
            self.store.add_channel_capped(
                &params.hub_id,
                &params.channel_id,
                self.limits.max_channels_per_hub,
            ),
        )
        .await?;
        info!(hub_id = %params.hub_id, channel_id = %params.channel_id, "added channel to hub");
        Ok(())
    }

    /// Remove a channel from a hub. Returns whether it was a member.
    #[instrument(skip(self))]
    pub async fn delete_channel(&self, params: DeleteChannelParams) -> StoreResult<bool> {
        let removed = self
            .bounded(
                "delete_channel",
                self.store
                    .delete_channel(&params.hub_id, &params.channel_id),
            )
            .await?;
        if removed {
            info!(hub_id = %params.hub_id, channel_id = %params.channel_id, "removed channel from hub");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub async fn get_hubs_count(&self, _params: GetHubsCountParams) -> StoreResult<u64> {
        self.bounded("get_hubs_count", self.store.get_hubs_count())
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_channels_count(&self, params: GetChannelsCountParams) -> StoreResult<u64> {
        self.bounded(
            "get_channels_count",
            self.store.get_channels_count(&params.hub_id),
        )
        .await
    }

    /// Reverse lookup used by the relay for every inbound event.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_hub_of_channel(&self, params: GetHubOfChannelParams) -> StoreResult<Hub> {
        self.bounded(
            "get_hub_of_channel",
            self.store.get_hub_of_channel(&params.channel_id),
        )
        .await
    }
}

impl std::fmt::Debug for HubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubService")
            .field("store", &self.store.kind())
            .field("limits", &self.limits)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}
