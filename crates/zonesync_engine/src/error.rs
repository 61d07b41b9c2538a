//! Error types for the sync engine.

use crate::remote::RemoteError;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;
use zonesync_protocol::{ProtocolError, RecordId, ZoneId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store rejected a request.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// Encoding or decoding of persisted sync state failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An entity type has no resolvable service attributes.
    #[error("entity {entity} has no resolvable service attributes")]
    MissingServiceAttributes {
        /// Entity type name.
        entity: String,
    },

    /// An object has no record name to build a remote record from.
    #[error("object of entity {entity} has no remote identity")]
    MissingIdentity {
        /// Entity type name.
        entity: String,
    },

    /// The remote version of a record differs from the one the edit was based on.
    #[error("version conflict for record {record_id}")]
    Conflict {
        /// The conflicting record.
        record_id: RecordId,
    },

    /// A zone was removed remotely and its local data was purged.
    #[error("zone {0} was deleted remotely, local data purged")]
    ZonePurged(ZoneId),

    /// Staging an asset file for upload failed.
    #[error("asset staging failed: {0}")]
    AssetStaging(#[from] std::io::Error),

    /// Invalid engine configuration or persisted setup state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sync is not enabled.
    #[error("sync is disabled")]
    Disabled,

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Coarse classification of errors, used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary failure; retried automatically.
    Transient,
    /// The remote store reset state (token expired, zone deleted).
    StateDivergence,
    /// Per-record version mismatch.
    Conflict,
    /// An entity type cannot be synchronized.
    SchemaMismatch,
    /// Setup or configuration problem.
    Configuration,
    /// Local store or filesystem failure.
    Local,
    /// Cancelled by the caller.
    Cancelled,
    /// Anything else.
    Other,
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(remote) => match remote {
                RemoteError::NetworkFailure(_) => ErrorKind::Transient,
                RemoteError::ChangeTokenExpired
                | RemoteError::ZoneNotFound(_)
                | RemoteError::UserDeletedZone(_) => ErrorKind::StateDivergence,
                RemoteError::ServerRecordChanged(_) => ErrorKind::Conflict,
                RemoteError::UnknownItem(_) | RemoteError::Other(_) => ErrorKind::Other,
            },
            SyncError::ZonePurged(_) => ErrorKind::StateDivergence,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::MissingServiceAttributes { .. } | SyncError::MissingIdentity { .. } => {
                ErrorKind::SchemaMismatch
            }
            SyncError::Configuration(_) | SyncError::Disabled => ErrorKind::Configuration,
            SyncError::Store(_) | SyncError::AssetStaging(_) => ErrorKind::Local,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Protocol(_) | SyncError::InvalidStateTransition { .. } => ErrorKind::Other,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns the remote error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// Direction of the sync operation an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    /// Enabling sync and provisioning.
    Setup,
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStage::Setup => f.write_str("setup"),
            SyncStage::Pull => f.write_str("pull"),
            SyncStage::Push => f.write_str("push"),
        }
    }
}
