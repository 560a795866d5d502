//! SQLite-backed persistent hub store.
//!
//! Hub records live in `hubs`; membership lives in `hub_channels`, keyed by
//! channel ID so a channel can never be in two hubs. Capped inserts are a
//! single conditional `INSERT ... SELECT` statement, so the limit check and
//! the write cannot interleave with another writer.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use super::{HubStore, StoreError, StoreResult};
use crate::db::Database;
use crate::hub::{ChannelId, Hub, HubId};
use crate::settings::PersistentSettings;

/// Attempts for a conditional insert whose failure could not be explained
/// because a concurrent writer changed the rows in between.
const MAX_INSERT_ATTEMPTS: usize = 3;

#[derive(Debug, FromRow)]
struct HubRow {
    id: String,
    owner_id: String,
    name: String,
}

impl HubRow {
    fn into_hub(self, channels: Vec<ChannelId>) -> Hub {
        Hub {
            id: HubId::from(self.id),
            owner_id: self.owner_id,
            name: self.name,
            channels,
        }
    }
}

/// Persistent hub store.
#[derive(Debug, Clone)]
pub struct SqliteHubStore {
    pool: SqlitePool,
}

impl SqliteHubStore {
    /// Create a store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database named by `settings` and run migrations.
    ///
    /// `database_url` must already be resolved; see
    /// [`PersistentSettings::resolve_url`].
    pub async fn connect(database_url: &str, settings: &PersistentSettings) -> StoreResult<Self> {
        let database = Database::connect(database_url, settings.max_connections)
            .await
            .map_err(|e| StoreError::BackendUnavailable(format!("{e:#}")))?;
        Ok(Self::new(database.pool().clone()))
    }

    /// Store over a fresh in-memory database (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        let database = Database::in_memory()
            .await
            .map_err(|e| StoreError::BackendUnavailable(format!("{e:#}")))?;
        Ok(Self::new(database.pool().clone()))
    }

    async fn fetch_hub(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> StoreResult<Option<Hub>> {
        let row = sqlx::query_as::<_, HubRow>("SELECT id, owner_id, name FROM hubs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let channels: Vec<(String,)> = sqlx::query_as(
            "SELECT channel_id FROM hub_channels WHERE hub_id = ? ORDER BY rowid",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(Some(row.into_hub(
            channels.into_iter().map(|(c,)| ChannelId::from(c)).collect(),
        )))
    }

    async fn owner_of(&self, channel_id: &ChannelId) -> StoreResult<Option<HubId>> {
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT hub_id FROM hub_channels WHERE channel_id = ?")
                .bind(channel_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner.map(|(id,)| HubId::from(id)))
    }

    /// Insert a membership row, bounded by `max_channels` when given.
    async fn insert_channel(
        &self,
        hub_id: &HubId,
        channel_id: &ChannelId,
        max_channels: Option<u64>,
    ) -> StoreResult<()> {
        let limit = max_channels.map_or(i64::MAX, |m| i64::try_from(m).unwrap_or(i64::MAX));

        for _ in 0..MAX_INSERT_ATTEMPTS {
            let result = sqlx::query(
                r#"
                INSERT INTO hub_channels (channel_id, hub_id)
                SELECT ?1, ?2
                WHERE EXISTS (SELECT 1 FROM hubs WHERE id = ?2)
                  AND (SELECT COUNT(*) FROM hub_channels WHERE hub_id = ?2) < ?3
                ON CONFLICT(channel_id) DO NOTHING
                "#,
            )
            .bind(channel_id.as_str())
            .bind(hub_id.as_str())
            .bind(limit)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            // Nothing inserted: find out which condition failed.
            let count: Option<(i64,)> = sqlx::query_as(
                "SELECT (SELECT COUNT(*) FROM hub_channels WHERE hub_id = ?1) FROM hubs WHERE id = ?1",
            )
            .bind(hub_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

            let Some((count,)) = count else {
                return Err(StoreError::HubNotFound(hub_id.clone()));
            };
            if let Some(max) = max_channels {
                if count as u64 >= max {
                    return Err(StoreError::CapacityExceeded {
                        what: "channels per hub",
                        limit: max,
                    });
                }
            }
            match self.owner_of(channel_id).await? {
                Some(owner) if &owner == hub_id => return Ok(()),
                Some(owner) => {
                    return Err(StoreError::ChannelInUse {
                        channel: channel_id.clone(),
                        hub: owner,
                    });
                }
                None => {
                    debug!(hub_id = %hub_id, channel_id = %channel_id, "membership changed during insert, retrying");
                }
            }
        }

        Err(StoreError::Backend(format!(
            "could not add channel {channel_id} to hub {hub_id}: concurrent updates"
        )))
    }

    /// Insert the hub row and any initial channels in one transaction.
    async fn insert_hub(&self, hub: Hub, max_hubs: Option<u64>) -> StoreResult<()> {
        let limit = max_hubs.map_or(i64::MAX, |m| i64::try_from(m).unwrap_or(i64::MAX));
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO hubs (id, owner_id, name)
            SELECT ?1, ?2, ?3
            WHERE (SELECT COUNT(*) FROM hubs) < ?4
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(hub.id.as_str())
        .bind(&hub.owner_id)
        .bind(&hub.name)
        .bind(limit)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hubs")
                .fetch_one(&mut *tx)
                .await?;
            if let Some(max) = max_hubs {
                if count.0 as u64 >= max {
                    return Err(StoreError::CapacityExceeded {
                        what: "hubs",
                        limit: max,
                    });
                }
            }
            return Err(StoreError::AlreadyExists(hub.id));
        }

        for channel in &hub.channels {
            let inserted = sqlx::query(
                "INSERT INTO hub_channels (channel_id, hub_id) VALUES (?, ?) ON CONFLICT(channel_id) DO NOTHING",
            )
            .bind(channel.as_str())
            .bind(hub.id.as_str())
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                let owner: (String,) =
                    sqlx::query_as("SELECT hub_id FROM hub_channels WHERE channel_id = ?")
                        .bind(channel.as_str())
                        .fetch_one(&mut *tx)
                        .await?;
                if owner.0 != hub.id.as_str() {
                    return Err(StoreError::ChannelInUse {
                        channel: channel.clone(),
                        hub: HubId::from(owner.0),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl HubStore for SqliteHubStore {
    fn kind(&self) -> &'static str {
        "persistent"
    }

    #[instrument(skip(self, hub), fields(hub_id = %hub.id))]
    async fn add_hub(&self, hub: Hub) -> StoreResult<()> {
        self.insert_hub(hub, None).await
    }

    #[instrument(skip(self, hub), fields(hub_id = %hub.id))]
    async fn add_hub_capped(&self, hub: Hub, max_hubs: u64) -> StoreResult<()> {
        self.insert_hub(hub, Some(max_hubs)).await
    }

    #[instrument(skip(self))]
    async fn delete_hub(&self, id: &HubId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM hub_channels WHERE hub_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM hubs WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_hub(&self, id: &HubId) -> StoreResult<Hub> {
        let mut tx = self.pool.begin().await?;
        let hub = Self::fetch_hub(&mut tx, id.as_str()).await?;
        tx.commit().await?;

        hub.ok_or_else(|| StoreError::HubNotFound(id.clone()))
    }

    #[instrument(skip(self))]
    async fn get_hubs(&self) -> StoreResult<Vec<Hub>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, HubRow>("SELECT id, owner_id, name FROM hubs ORDER BY rowid")
            .fetch_all(&mut *tx)
            .await?;
        let memberships: Vec<(String, String)> =
            sqlx::query_as("SELECT hub_id, channel_id FROM hub_channels ORDER BY rowid")
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        let mut by_hub: HashMap<String, Vec<ChannelId>> = HashMap::new();
        for (hub_id, channel_id) in memberships {
            by_hub
                .entry(hub_id)
                .or_default()
                .push(ChannelId::from(channel_id));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let channels = by_hub.remove(&row.id).unwrap_or_default();
                row.into_hub(channels)
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn add_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<()> {
        self.insert_channel(hub_id, channel_id, None).await
    }

    #[instrument(skip(self))]
    async fn add_channel_capped(
        &self,
        hub_id: &HubId,
        channel_id: &ChannelId,
        max_channels: u64,
    ) -> StoreResult<()> {
        self.insert_channel(hub_id, channel_id, Some(max_channels))
            .await
    }

    #[instrument(skip(self))]
    async fn delete_channel(&self, hub_id: &HubId, channel_id: &ChannelId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM hub_channels WHERE hub_id = ? AND channel_id = ?")
            .bind(hub_id.as_str())
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_hubs_count(&self) -> StoreResult<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hubs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0 as u64)
    }

    #[instrument(skip(self))]
    async fn get_channels_count(&self, hub_id: &HubId) -> StoreResult<u64> {
        let count: Option<(i64,)> = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM hub_channels WHERE hub_id = ?1) FROM hubs WHERE id = ?1",
        )
        .bind(hub_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|(c,)| c as u64)
            .ok_or_else(|| StoreError::HubNotFound(hub_id.clone()))
    }

    #[instrument(skip(self))]
    async fn get_hub_of_channel(&self, channel_id: &ChannelId) -> StoreResult<Hub> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<(String,)> =
            sqlx::query_as("SELECT hub_id FROM hub_channels WHERE channel_id = ?")
                .bind(channel_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let hub = match owner {
            Some((hub_id,)) => Self::fetch_hub(&mut tx, &hub_id).await?,
            None => None,
        };
        tx.commit().await?;

        hub.ok_or_else(|| StoreError::ChannelNotFound(channel_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteHubStore {
        SqliteHubStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_preserves_record() {
        let store = store().await;
        let mut hub = Hub::with_id("hub_a".into(), "owner-1", "General");
        hub.channels = vec!["c2".into(), "c1".into()];

        store.add_hub(hub.clone()).await.unwrap();
        assert_eq!(store.get_hub(&hub.id).await.unwrap(), hub);
    }

    #[tokio::test]
    async fn test_channels_keep_insertion_order() {
        let store = store().await;
        let id = HubId::from("hub_a");
        store.add_hub(Hub::with_id(id.clone(), "u1", "a")).await.unwrap();
        for c in ["c3", "c1", "c2"] {
            store.add_channel(&id, &c.into()).await.unwrap();
        }
        assert!(store.delete_channel(&id, &"c1".into()).await.unwrap());
        store.add_channel(&id, &"c4".into()).await.unwrap();

        let hub = store.get_hub(&id).await.unwrap();
        assert_eq!(
            hub.channels,
            vec![ChannelId::from("c3"), "c2".into(), "c4".into()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_hub_rejected() {
        let store = store().await;
        store
            .add_hub(Hub::with_id("hub_a".into(), "u1", "one"))
            .await
            .unwrap();

        let err = store
            .add_hub(Hub::with_id("hub_a".into(), "u1", "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_missing_hub_errors() {
        let store = store().await;
        let missing = HubId::from("hub_missing");

        assert!(matches!(
            store.get_hub(&missing).await.unwrap_err(),
            StoreError::HubNotFound(_)
        ));
        assert!(matches!(
            store.get_channels_count(&missing).await.unwrap_err(),
            StoreError::HubNotFound(_)
        ));
        assert!(matches!(
            store.add_channel(&missing, &"c1".into()).await.unwrap_err(),
            StoreError::HubNotFound(_)
        ));
        assert!(!store.delete_hub(&missing).await.unwrap());
        assert!(!store.delete_channel(&missing, &"c1".into()).await.unwrap());
        assert_eq!(store.get_hubs_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channel_exclusive_across_hubs() {
        let store = store().await;
        let a = HubId::from("hub_a");
        let b = HubId::from("hub_b");
        store.add_hub(Hub::with_id(a.clone(), "u1", "a")).await.unwrap();
        store.add_hub(Hub::with_id(b.clone(), "u1", "b")).await.unwrap();
        store.add_channel(&a, &"c1".into()).await.unwrap();
        // Re-adding to the same hub is a no-op.
        store.add_channel(&a, &"c1".into()).await.unwrap();

        let err = store.add_channel(&b, &"c1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::ChannelInUse { ref hub, .. } if *hub == a));
        assert_eq!(store.get_channels_count(&a).await.unwrap(), 1);
        assert_eq!(store.get_channels_count(&b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let store = store().await;
        let a = HubId::from("hub_a");
        store.add_hub(Hub::with_id(a.clone(), "u1", "a")).await.unwrap();
        store.add_channel(&a, &"c1".into()).await.unwrap();
        store.add_channel(&a, &"c2".into()).await.unwrap();

        let hub = store.get_hub_of_channel(&"c2".into()).await.unwrap();
        assert_eq!(hub.id, a);
        assert_eq!(hub.channels.len(), 2);

        assert!(matches!(
            store.get_hub_of_channel(&"c9".into()).await.unwrap_err(),
            StoreError::ChannelNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_hub_releases_channels() {
        let store = store().await;
        let a = HubId::from("hub_a");
        store.add_hub(Hub::with_id(a.clone(), "u1", "a")).await.unwrap();
        store.add_channel(&a, &"c1".into()).await.unwrap();

        assert!(store.delete_hub(&a).await.unwrap());
        assert!(store.get_hub_of_channel(&"c1".into()).await.is_err());

        let b = HubId::from("hub_b");
        store.add_hub(Hub::with_id(b.clone(), "u1", "b")).await.unwrap();
        store.add_channel(&b, &"c1".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_capped_inserts() {
        let store = store().await;
        store
            .add_hub_capped(Hub::with_id("hub_a".into(), "u1", "a"), 1)
            .await
            .unwrap();
        let err = store
            .add_hub_capped(Hub::with_id("hub_b".into(), "u1", "b"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
        assert_eq!(store.get_hubs_count().await.unwrap(), 1);

        let a = HubId::from("hub_a");
        store.add_channel_capped(&a, &"c1".into(), 1).await.unwrap();
        let err = store
            .add_channel_capped(&a, &"c2".into(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
        assert!(store.get_hub_of_channel(&"c2".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("agora.db").display());
        let settings = PersistentSettings::default();

        {
            let store = SqliteHubStore::connect(&url, &settings).await.unwrap();
            store
                .add_hub(Hub::with_id("hub_a".into(), "u1", "a"))
                .await
                .unwrap();
            store
                .add_channel(&"hub_a".into(), &"c1".into())
                .await
                .unwrap();
            store.pool.close().await;
        }

        let store = SqliteHubStore::connect(&url, &settings).await.unwrap();
        let hubs = store.get_hubs().await.unwrap();
        assert_eq!(hubs.len(), 1);
        assert_eq!(hubs[0].channels, vec![ChannelId::from("c1")]);
    }
}
