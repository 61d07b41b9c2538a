//! Version-mismatch conflicts.

use crate::ids::RecordId;
use crate::record::RemoteRecord;

/// A record whose submitted version stamp did not match the stored one.
///
/// Conflicts are never merged automatically. The local edit stays pending
/// and the caller picks a [`ConflictResolution`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordConflict {
    /// The conflicting record.
    pub record_id: RecordId,
    /// The record as the client tried to save it.
    pub local: RemoteRecord,
    /// The record as currently stored remotely.
    pub server: RemoteRecord,
}

impl RecordConflict {
    /// Creates a conflict.
    pub fn new(local: RemoteRecord, server: RemoteRecord) -> Self {
        Self {
            record_id: local.id.clone(),
            local,
            server,
        }
    }

    /// Version stamp the client based its edit on.
    pub fn local_change_tag(&self) -> Option<String> {
        self.local.change_tag()
    }

    /// Version stamp currently stored remotely.
    pub fn server_change_tag(&self) -> Option<String> {
        self.server.change_tag()
    }

    /// Names of fields whose values differ between the two versions.
    pub fn differing_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .local
            .fields
            .keys()
            .chain(self.server.fields.keys())
            .map(String::as_str)
            .filter(|name| self.local.fields.get(*name) != self.server.fields.get(*name))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// How a caller settles a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Rebase the local edit on the stored version and push it again.
    KeepLocal,
    /// Discard the local edit and apply the stored version locally.
    AcceptRemote,
}

impl ConflictResolution {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictResolution::KeepLocal => 1,
            ConflictResolution::AcceptRemote => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictResolution::KeepLocal),
            2 => Some(ConflictResolution::AcceptRemote),
            _ => None,
        }
    }
}
