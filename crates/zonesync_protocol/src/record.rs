//! Remote records and their opaque system fields.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::RecordId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Record type of share pointer records.
pub const SHARE_RECORD_TYPE: &str = "cloudkit.share";

/// Field of a share record holding the shared root record.
pub const SHARE_ROOT_FIELD: &str = "rootRecord";

/// A large blob uploaded from a locally cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Path of the file holding the blob.
    pub path: PathBuf,
}

impl AssetRef {
    /// Creates an asset reference for a file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A typed field value of a remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Small inline binary value.
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Reference to another record.
    Reference(RecordId),
    /// References to several records.
    ReferenceList(Vec<RecordId>),
    /// Large blob backed by a file.
    Asset(AssetRef),
}

impl FieldValue {
    /// Returns the referenced record ids, if this is a reference field.
    pub fn references(&self) -> Vec<&RecordId> {
        match self {
            FieldValue::Reference(id) => vec![id],
            FieldValue::ReferenceList(ids) => ids.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// The system fields the remote store keeps for every record.
///
/// The engine stores the encoded form verbatim in each local object's
/// record-data attribute. The change tag is the remote version stamp used to
/// detect concurrent modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFields {
    /// Identity of the record.
    pub record_id: RecordId,
    /// Record type.
    pub record_type: String,
    /// Version stamp assigned by the store on every save.
    pub change_tag: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: i64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub modified_at_ms: i64,
}

impl SystemFields {
    /// Creates system fields for a record that was never saved.
    pub fn unsaved(record_id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            change_tag: None,
            created_at_ms: 0,
            modified_at_ms: 0,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.is_empty() {
            return Err(ProtocolError::invalid_structure("empty system fields"));
        }
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// A record in the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Record identity.
    pub id: RecordId,
    /// Type tag, equal to the local entity name.
    pub record_type: String,
    /// Field values by name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Encoded `SystemFields`, absent for records never saved.
    pub system_fields: Option<Bytes>,
}

impl RemoteRecord {
    /// Creates an empty record that was never saved.
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            system_fields: None,
        }
    }

    /// Restores an empty record from previously stored system fields.
    ///
    /// The restored record keeps the identity and version stamp of the
    /// record it was archived from, so saving it is an update rather than
    /// an insert.
    pub fn from_system_fields(encoded: &[u8]) -> ProtocolResult<Self> {
        let fields = SystemFields::decode(encoded)?;
        Ok(Self {
            id: fields.record_id,
            record_type: fields.record_type,
            fields: BTreeMap::new(),
            system_fields: Some(Bytes::copy_from_slice(encoded)),
        })
    }

    /// Sets a field value.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Sets a field value, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.set(name, value);
        self
    }

    /// Gets a field value.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Decodes the system fields, if present.
    pub fn decoded_system_fields(&self) -> ProtocolResult<Option<SystemFields>> {
        self.system_fields
            .as_deref()
            .map(SystemFields::decode)
            .transpose()
    }

    /// Returns the version stamp, if the record was saved before.
    pub fn change_tag(&self) -> Option<String> {
        self.decoded_system_fields()
            .ok()
            .flatten()
            .and_then(|f| f.change_tag)
    }

    /// Returns true if this record is a share pointer.
    pub fn is_share(&self) -> bool {
        self.record_type == SHARE_RECORD_TYPE
    }

    /// Returns the shared root record of a share pointer.
    pub fn share_root(&self) -> Option<&RecordId> {
        if !self.is_share() {
            return None;
        }
        match self.get(SHARE_ROOT_FIELD) {
            Some(FieldValue::Reference(id)) => Some(id),
            _ => None,
        }
    }

    /// Returns the files backing asset fields.
    pub fn asset_paths(&self) -> Vec<&PathBuf> {
        self.fields
            .values()
            .filter_map(|value| match value {
                FieldValue::Asset(asset) => Some(&asset.path),
                _ => None,
            })
            .collect()
    }
}
