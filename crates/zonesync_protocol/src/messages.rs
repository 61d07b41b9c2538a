//! Change-feed pages and submission outcomes exchanged with a remote store.

use crate::ids::{RecordId, ZoneId};
use crate::record::RemoteRecord;
use crate::token::ChangeToken;

/// Zone-membership changes of one database scope since a scope token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseChanges {
    /// Zones that contain changed records (or were created).
    pub changed_zones: Vec<ZoneId>,
    /// Zones that were deleted or purged.
    pub deleted_zones: Vec<ZoneId>,
    /// Token covering this page.
    pub new_token: Option<ChangeToken>,
    /// Whether another page is waiting.
    pub more_coming: bool,
}

impl DatabaseChanges {
    /// Creates a page with no changes.
    pub fn empty(new_token: Option<ChangeToken>) -> Self {
        Self {
            new_token,
            ..Self::default()
        }
    }

    /// Returns true if the page carries no zone changes.
    pub fn is_empty(&self) -> bool {
        self.changed_zones.is_empty() && self.deleted_zones.is_empty()
    }
}

/// A single change in a zone's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneChange {
    /// A record was created or modified; carries its current state.
    Changed(RemoteRecord),
    /// A record was deleted.
    Deleted {
        /// The deleted record.
        id: RecordId,
        /// Type of the deleted record.
        record_type: String,
    },
}

/// One round of a zone's change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChangesPage {
    /// The zone this page belongs to.
    pub zone: ZoneId,
    /// Changes in the order the store reported them.
    pub changes: Vec<ZoneChange>,
    /// Token covering this page.
    pub new_token: Option<ChangeToken>,
    /// Whether more rounds are pending.
    pub more_coming: bool,
}

impl ZoneChangesPage {
    /// Creates a page.
    pub fn new(
        zone: ZoneId,
        changes: Vec<ZoneChange>,
        new_token: Option<ChangeToken>,
        more_coming: bool,
    ) -> Self {
        Self {
            zone,
            changes,
            new_token,
            more_coming,
        }
    }

    /// Number of changed records in this page.
    pub fn changed_count(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, ZoneChange::Changed(_)))
            .count()
    }

    /// Number of deleted records in this page.
    pub fn deleted_count(&self) -> usize {
        self.changes.len() - self.changed_count()
    }
}

/// Outcome of one record in a modify submission.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The record was saved; carries the stored record with new system fields.
    Saved(RemoteRecord),
    /// The record was deleted (or was already gone).
    Deleted(RecordId),
    /// The stored version differs from the submitted one.
    Conflict {
        /// The submitted record.
        id: RecordId,
        /// The record as currently stored.
        server: RemoteRecord,
    },
    /// The record was rejected for another reason.
    Failed {
        /// The submitted record.
        id: RecordId,
        /// Store-provided reason.
        message: String,
    },
}

impl RecordOutcome {
    /// Returns the record this outcome refers to.
    pub fn record_id(&self) -> &RecordId {
        match self {
            RecordOutcome::Saved(record) => &record.id,
            RecordOutcome::Deleted(id) => id,
            RecordOutcome::Conflict { id, .. } => id,
            RecordOutcome::Failed { id, .. } => id,
        }
    }

    /// Returns true if the record was saved or deleted.
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Saved(_) | RecordOutcome::Deleted(_))
    }
}
