//! Identifiers for database scopes, zones and records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner name used by the remote store for zones owned by the signed-in user.
pub const CURRENT_USER_OWNER: &str = "__defaultOwner__";

/// A top-level partition of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatabaseScope {
    /// World-readable records. Never pulled incrementally.
    Public,
    /// Records owned by the current user.
    Private,
    /// Records other users shared with the current user.
    Shared,
}

impl DatabaseScope {
    /// Scopes that carry change feeds.
    pub const SYNCABLE: [DatabaseScope; 2] = [DatabaseScope::Private, DatabaseScope::Shared];

    /// Converts to a numeric code for encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            DatabaseScope::Public => 1,
            DatabaseScope::Private => 2,
            DatabaseScope::Shared => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DatabaseScope::Public),
            2 => Some(DatabaseScope::Private),
            3 => Some(DatabaseScope::Shared),
            _ => None,
        }
    }

    /// Parses a scope name as used in entity annotations.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "public" => Some(DatabaseScope::Public),
            "private" => Some(DatabaseScope::Private),
            "shared" => Some(DatabaseScope::Shared),
            _ => None,
        }
    }

    /// Returns the annotation name of this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseScope::Public => "public",
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
        }
    }

    /// Returns the scope a record owned by `owner_name` is stored in.
    pub fn for_owner(owner_name: &str) -> Self {
        if owner_name == CURRENT_USER_OWNER {
            DatabaseScope::Private
        } else {
            DatabaseScope::Shared
        }
    }
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a zone: a sub-partition with its own change token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    /// Zone name, unique per owner.
    pub zone_name: String,
    /// Owner of the zone.
    pub owner_name: String,
}

impl ZoneId {
    /// Creates a zone identifier.
    pub fn new(zone_name: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            owner_name: owner_name.into(),
        }
    }

    /// Creates an identifier for a zone owned by the current user.
    pub fn owned(zone_name: impl Into<String>) -> Self {
        Self::new(zone_name, CURRENT_USER_OWNER)
    }

    /// Returns true if the current user owns this zone.
    pub fn is_owned_by_current_user(&self) -> bool {
        self.owner_name == CURRENT_USER_OWNER
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone_name, self.owner_name)
    }
}

/// Identifies a remote record: `(recordName, zoneID, ownerName)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Record name, unique within the zone.
    pub record_name: String,
    /// Zone holding the record.
    pub zone: ZoneId,
}

impl RecordId {
    /// Creates a record identifier.
    pub fn new(record_name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            record_name: record_name.into(),
            zone,
        }
    }

    /// Owner of the zone holding this record.
    pub fn owner_name(&self) -> &str {
        &self.zone.owner_name
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.record_name, self.zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_codes() {
        for scope in [
            DatabaseScope::Public,
            DatabaseScope::Private,
            DatabaseScope::Shared,
        ] {
            assert_eq!(DatabaseScope::from_code(scope.to_code()), Some(scope));
            assert_eq!(DatabaseScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(DatabaseScope::from_code(0), None);
        assert_eq!(DatabaseScope::parse("global"), None);
    }

    #[test]
    fn scope_for_owner() {
        assert_eq!(
            DatabaseScope::for_owner(CURRENT_USER_OWNER),
            DatabaseScope::Private
        );
        assert_eq!(DatabaseScope::for_owner("_alice"), DatabaseScope::Shared);
    }

    #[test]
    fn record_id_display() {
        let id = RecordId::new("r1", ZoneId::owned("Notes"));
        assert_eq!(id.to_string(), format!("r1@Notes:{CURRENT_USER_OWNER}"));
        assert_eq!(id.owner_name(), CURRENT_USER_OWNER);
        assert!(id.zone.is_owned_by_current_user());
    }
}
