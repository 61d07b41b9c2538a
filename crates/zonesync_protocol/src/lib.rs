//! # ZoneSync Protocol
//!
//! Record, change-token and ledger types shared by the ZoneSync engine and
//! the remote stores it talks to.
//!
//! This crate provides:
//! - Identifiers for scopes, zones and records
//! - Opaque `ChangeToken` cursors
//! - `RemoteRecord` with typed field values and opaque system fields
//! - Change-feed pages and per-record submission outcomes
//! - `RecordConflict` for version-mismatch reporting
//! - `TokenLedger` with a versioned CBOR encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod ids;
mod ledger;
mod messages;
mod record;
mod token;

pub use conflict::{ConflictResolution, RecordConflict};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{DatabaseScope, RecordId, ZoneId, CURRENT_USER_OWNER};
pub use ledger::{TokenLedger, LEDGER_FORMAT_VERSION};
pub use messages::{DatabaseChanges, RecordOutcome, ZoneChange, ZoneChangesPage};
pub use record::{
    AssetRef, FieldValue, RemoteRecord, SystemFields, SHARE_RECORD_TYPE, SHARE_ROOT_FIELD,
};
pub use token::ChangeToken;
