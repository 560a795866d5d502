//! Hub store abstraction layer.
//!
//! Provides a trait-based store with implementations for:
//! - In-process memory (ephemeral, lost on exit)
//! - SQLite (persistent)

mod error;
mod memory;
mod sqlite;
mod traits;

use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryHubStore;
pub use sqlite::SqliteHubStore;
pub use traits::HubStore;

use crate::settings::PersistentSettings;

/// Which backend holds hub state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Persistent,
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "persistent" | "sqlite" => Ok(StoreKind::Persistent),
            _ => Err(StoreError::UnsupportedStoreType(s.to_string())),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// Create the hub store named by `store_type`.
///
/// `database_url` is only used by the persistent store. An unknown store type
/// fails with `UnsupportedStoreType`; an unreachable database with
/// `BackendUnavailable`.
pub async fn load_store(
    store_type: &str,
    database_url: &str,
    persistent: &PersistentSettings,
) -> StoreResult<Arc<dyn HubStore>> {
    let kind: StoreKind = store_type.parse()?;
    let store: Arc<dyn HubStore> = match kind {
        StoreKind::Memory => Arc::new(MemoryHubStore::new()),
        StoreKind::Persistent => {
            Arc::new(SqliteHubStore::connect(database_url, persistent).await?)
        }
    };
    info!(store = store.kind(), "hub store ready");
    Ok(store)
}
