//! Hub store error types.

use thiserror::Error;

use crate::hub::{ChannelId, HubId};

/// Result type for hub store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during hub store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Hub does not exist.
    #[error("hub {0} not found")]
    HubNotFound(HubId),

    /// Channel is not a member of any hub.
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    /// A hub with the same ID already exists.
    #[error("hub {0} already exists")]
    AlreadyExists(HubId),

    /// Channel is already a member of another hub.
    #[error("channel {channel} already belongs to hub {hub}")]
    ChannelInUse { channel: ChannelId, hub: HubId },

    /// Configured ceiling reached.
    #[error("maximum number of {what} reached ({limit})")]
    CapacityExceeded { what: &'static str, limit: u64 },

    /// Backing store cannot be reached or did not answer in time.
    #[error("store unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration names a store that does not exist.
    #[error("store type {0} not supported")]
    UnsupportedStoreType(String),

    /// Query or decode failure inside the backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error is a "not found" outcome, for hubs or channels.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HubNotFound(_) | Self::ChannelNotFound(_))
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// SQLite primary result codes for a contended database.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Whether a database error means another connection holds the lock.
fn is_lock_contention(err: &dyn sqlx::error::DatabaseError) -> bool {
    // Extended codes carry the primary code in the low byte.
    let primary = err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
        || err.message().contains("database is locked")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::BackendUnavailable(err.to_string())
            }
            sqlx::Error::Database(ref db) if is_lock_contention(&**db) => {
                Self::BackendUnavailable(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}
