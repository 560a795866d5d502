//! Hubs and the operations that manage them.

pub mod models;
pub mod params;
pub mod service;

pub use models::{ChannelId, Hub, HubId};
pub use params::*;
pub use service::{HubLimits, HubService};
