//! Parameter structs for hub operations.

use serde::{Deserialize, Serialize};

use super::models::{ChannelId, Hub, HubId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddHubParams {
    pub hub: Hub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHubParams {
    pub id: HubId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHubParams {
    pub id: HubId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetHubsParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChannelParams {
    pub hub_id: HubId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteChannelParams {
    pub hub_id: HubId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetHubsCountParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChannelsCountParams {
    pub hub_id: HubId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHubOfChannelParams {
    pub channel_id: ChannelId,
}
