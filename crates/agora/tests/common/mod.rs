//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora::hub::{AddChannelParams, AddHubParams, ChannelId, Hub, HubId, HubLimits, HubService};
use agora::relay::{ChatGateway, SendError};
use agora::settings::PersistentSettings;
use agora::store::{HubStore, MemoryHubStore, SqliteHubStore};
use async_trait::async_trait;
use tempfile::TempDir;

/// Gateway that records every send instead of posting it.
#[derive(Default)]
pub struct RecordingGateway {
    self_id: String,
    sent: Mutex<Vec<(ChannelId, String)>>,
    failing: HashSet<ChannelId>,
    delays: HashMap<ChannelId, Duration>,
}

impl RecordingGateway {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            ..Default::default()
        }
    }

    /// Sends to `channel` fail.
    pub fn failing(mut self, channel: &str) -> Self {
        self.failing.insert(channel.into());
        self
    }

    /// Sends to `channel` take `delay` before completing.
    pub fn delayed(mut self, channel: &str, delay: Duration) -> Self {
        self.delays.insert(channel.into(), delay);
        self
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| c.as_str() == channel)
            .map(|(_, content)| content)
            .collect()
    }
}

#[async_trait]
impl ChatGateway for RecordingGateway {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), SendError> {
        if let Some(delay) = self.delays.get(channel) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(channel) {
            return Err(SendError::Failed {
                channel: channel.clone(),
                reason: "missing permissions".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.clone(), content.to_string()));
        Ok(())
    }
}

/// A store under test, with the tempdir that backs it (if any).
pub struct TestStore {
    pub store: Arc<dyn HubStore>,
    _dir: Option<TempDir>,
}

impl TestStore {
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryHubStore::new()),
            _dir: None,
        }
    }

    /// On-disk SQLite store with a multi-connection pool.
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("hubs.db").display());
        let settings = PersistentSettings {
            max_connections: 5,
            ..Default::default()
        };
        let store = SqliteHubStore::connect(&url, &settings).await.unwrap();
        Self {
            store: Arc::new(store),
            _dir: Some(dir),
        }
    }

    /// One of each backend.
    pub async fn all() -> Vec<Self> {
        vec![Self::memory(), Self::sqlite().await]
    }

    pub fn service(&self, limits: HubLimits) -> HubService {
        HubService::new(self.store.clone(), limits, Duration::from_secs(5))
    }
}

pub fn limits(max_hubs: u64, max_channels_per_hub: u64) -> HubLimits {
    HubLimits {
        max_hubs,
        max_channels_per_hub,
    }
}

/// Create hub `id` containing `channels`, in order.
pub async fn seed_hub(service: &HubService, id: &str, channels: &[&str]) -> HubId {
    let hub_id = HubId::from(id);
    service
        .add_hub(AddHubParams {
            hub: Hub::with_id(hub_id.clone(), "owner", id),
        })
        .await
        .unwrap();
    for channel in channels {
        service
            .add_channel(AddChannelParams {
                hub_id: hub_id.clone(),
                channel_id: (*channel).into(),
            })
            .await
            .unwrap();
    }
    hub_id
}
