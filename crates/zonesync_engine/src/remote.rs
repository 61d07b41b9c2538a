//! Remote store contract consumed by the engine.

use async_trait::async_trait;
use thiserror::Error;
use zonesync_protocol::{
    ChangeToken, DatabaseChanges, DatabaseScope, RecordId, RecordOutcome, RemoteRecord, ZoneId,
    ZoneChangesPage,
};

/// Error codes reported by the remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request did not reach the store or the response was lost.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The store no longer accepts the supplied change token.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// The zone does not exist.
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),

    /// The user removed the zone and all of its data.
    #[error("zone {0} was deleted by the user")]
    UserDeletedZone(ZoneId),

    /// The record was modified remotely since the submitted version.
    #[error("record {0} changed on the server")]
    ServerRecordChanged(RecordId),

    /// The record does not exist.
    #[error("unknown record {0}")]
    UnknownItem(RecordId),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Creates a network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure(message.into())
    }

    /// Returns true for failures that go away by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::NetworkFailure(_))
    }
}

/// Change feeds and record submission of a zoned record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Zones changed or deleted in a scope since `token`.
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        token: Option<&ChangeToken>,
    ) -> Result<DatabaseChanges, RemoteError>;

    /// One round of record changes in a zone since `token`.
    async fn fetch_zone_changes(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
    ) -> Result<ZoneChangesPage, RemoteError>;

    /// Saves and deletes records in one submission.
    ///
    /// Per-record problems are reported as outcomes. An `Err` means the whole
    /// submission failed and nothing was applied.
    async fn modify_records(
        &self,
        scope: DatabaseScope,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RecordOutcome>, RemoteError>;

    /// Fetches a single record.
    async fn fetch_record(
        &self,
        scope: DatabaseScope,
        id: &RecordId,
    ) -> Result<RemoteRecord, RemoteError>;
}

/// Creation and deletion of zones.
#[async_trait]
pub trait ZoneProvisioner: Send + Sync {
    /// Creates a zone. Creating an existing zone succeeds.
    async fn create_zone(&self, zone: &ZoneId) -> Result<(), RemoteError>;

    /// Deletes a zone and all of its records.
    async fn delete_zone(&self, zone: &ZoneId) -> Result<(), RemoteError>;
}
