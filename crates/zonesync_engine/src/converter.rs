//! Conversion between local objects and remote records.

use crate::attributes::{AttributeResolver, ServiceAttributeNames};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{
    AttributeKind, AttributeValue, EntityDescription, LocalObject, LocalObjectId, ObjectModel,
    Predicate,
};
use crate::store::{LocalTransaction, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;
use zonesync_protocol::{
    AssetRef, FieldValue, RecordId, RemoteRecord, SystemFields, ZoneId, CURRENT_USER_OWNER,
};

/// Unresolved references of one object, by relationship name.
pub type MissingReferences = BTreeMap<String, BTreeSet<RecordId>>;

/// References that could not be linked yet, accumulated over a pull session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingReferenceSet {
    entries: BTreeMap<LocalObjectId, MissingReferences>,
}

impl MissingReferenceSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the unresolved references of an object.
    pub fn insert(&mut self, object: LocalObjectId, references: MissingReferences) {
        for (relationship, targets) in references {
            if targets.is_empty() {
                continue;
            }
            self.entries
                .entry(object)
                .or_default()
                .entry(relationship)
                .or_default()
                .extend(targets);
        }
    }

    /// Drops every reference held by an object.
    pub fn forget(&mut self, object: LocalObjectId) {
        self.entries.remove(&object);
    }

    /// Unresolved references of an object.
    pub fn get(&self, object: LocalObjectId) -> Option<&MissingReferences> {
        self.entries.get(&object)
    }

    /// Number of unresolved references.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|references| references.values())
            .map(BTreeSet::len)
            .sum()
    }

    /// Returns true if nothing is unresolved.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over objects and their unresolved references.
    pub fn iter(&self) -> impl Iterator<Item = (&LocalObjectId, &MissingReferences)> {
        self.entries.iter()
    }
}

/// Result of applying a remote record to the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// The created or updated object.
    pub object: LocalObjectId,
    /// Whether the object was created.
    pub created: bool,
    /// References that did not resolve.
    pub missing: MissingReferences,
}

/// Temporary files holding asset contents for one outgoing record.
///
/// The files are removed when the guard drops.
#[derive(Debug, Default)]
pub struct StagedAssets {
    files: Vec<NamedTempFile>,
}

impl StagedAssets {
    /// Number of staged files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no file was staged.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths of the staged files.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|file| file.path().to_path_buf()).collect()
    }
}

/// An outgoing record built from a local object.
#[derive(Debug)]
pub struct PreparedRecord {
    /// Source object.
    pub object: LocalObjectId,
    /// Record to submit.
    pub record: RemoteRecord,
    /// Asset files referenced by the record.
    pub assets: StagedAssets,
}

/// Maps local objects to remote records and back.
pub struct Converter {
    resolver: AttributeResolver,
    zone_name: String,
    staging_dir: Option<PathBuf>,
}

impl Converter {
    /// Creates a converter for a configuration.
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            resolver: AttributeResolver::new(config.attributes.clone()),
            zone_name: config.zone_name.clone(),
            staging_dir: config.asset_staging_dir.clone(),
        }
    }

    /// Service attribute names of an entity, or `None` if it is excluded.
    pub fn discover_service_attributes(
        &self,
        entity: &EntityDescription,
    ) -> Option<Arc<ServiceAttributeNames>> {
        self.resolver.service_attributes(entity)
    }

    /// All entities taking part in sync.
    pub fn syncable_entities<'m>(
        &self,
        model: &'m ObjectModel,
    ) -> Vec<(&'m EntityDescription, Arc<ServiceAttributeNames>)> {
        model
            .entities()
            .filter_map(|entity| {
                self.discover_service_attributes(entity)
                    .map(|names| (entity, names))
            })
            .collect()
    }

    /// Service attribute names of an object's entity.
    pub fn names_for(
        &self,
        model: &ObjectModel,
        entity: &str,
    ) -> SyncResult<Arc<ServiceAttributeNames>> {
        let description = model
            .entity(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        self.discover_service_attributes(description)
            .ok_or_else(|| SyncError::MissingServiceAttributes {
                entity: entity.to_string(),
            })
    }

    /// The remote identity of an object, if it has one.
    ///
    /// Stored system fields take precedence over the name attributes.
    pub fn record_id_of(
        &self,
        object: &LocalObject,
        names: &ServiceAttributeNames,
    ) -> Option<RecordId> {
        let archived = object
            .bytes(&names.record_data)
            .filter(|data| !data.is_empty())
            .and_then(|data| SystemFields::decode(data).ok());
        if let Some(fields) = archived {
            return Some(fields.record_id);
        }
        let record_name = object.text(&names.record_name).filter(|s| !s.is_empty())?;
        let owner_name = object.text(&names.owner_name).filter(|s| !s.is_empty())?;
        Some(RecordId::new(
            record_name,
            ZoneId::new(self.zone_name.clone(), owner_name),
        ))
    }

    /// Assigns a record name and owner to an object that has none.
    ///
    /// Returns true if the object changed.
    pub fn prepare_identity(&self, object: &mut LocalObject, names: &ServiceAttributeNames) -> bool {
        let mut changed = false;
        if object.text(&names.record_name).map_or(true, str::is_empty) {
            object.set(
                names.record_name.clone(),
                AttributeValue::Text(Uuid::new_v4().to_string()),
            );
            changed = true;
        }
        if object.text(&names.owner_name).map_or(true, str::is_empty) {
            object.set(
                names.owner_name.clone(),
                AttributeValue::Text(CURRENT_USER_OWNER.to_string()),
            );
            changed = true;
        }
        changed
    }

    fn find_in_entity<T: LocalTransaction>(
        &self,
        txn: &T,
        entity: &str,
        names: &ServiceAttributeNames,
        id: &RecordId,
    ) -> SyncResult<Option<LocalObject>> {
        let predicate = Predicate::And(vec![
            Predicate::equals(
                names.record_name.clone(),
                AttributeValue::Text(id.record_name.clone()),
            ),
            Predicate::equals(
                names.owner_name.clone(),
                AttributeValue::Text(id.owner_name().to_string()),
            ),
        ]);
        Ok(txn.fetch(entity, &predicate)?.into_iter().next())
    }

    fn find_in_destination<T: LocalTransaction>(
        &self,
        txn: &T,
        model: &ObjectModel,
        destination: &str,
        id: &RecordId,
    ) -> SyncResult<Option<LocalObject>> {
        match model
            .entity(destination)
            .and_then(|entity| self.discover_service_attributes(entity))
        {
            Some(names) => self.find_in_entity(txn, destination, &names, id),
            None => Ok(None),
        }
    }

    /// Finds the local object of a remote record in any syncable entity.
    pub fn find_by_record_id<T: LocalTransaction>(
        &self,
        txn: &T,
        model: &ObjectModel,
        id: &RecordId,
    ) -> SyncResult<Option<LocalObject>> {
        for (entity, names) in self.syncable_entities(model) {
            if let Some(found) = self.find_in_entity(txn, &entity.name, &names, id)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Applies a remote record to the local store.
    ///
    /// Finds or creates the object by record name and owner, copies declared
    /// attributes, links references that already exist locally and reports
    /// the others as missing. Returns `None` for records whose type is not a
    /// syncable entity.
    pub fn record_to_object<T: LocalTransaction>(
        &self,
        record: &RemoteRecord,
        txn: &mut T,
        model: &ObjectModel,
    ) -> SyncResult<Option<Conversion>> {
        let Some(entity) = model.entity(&record.record_type) else {
            debug!(record_type = %record.record_type, "no local entity for record type");
            return Ok(None);
        };
        let Some(names) = self.discover_service_attributes(entity) else {
            return Ok(None);
        };

        let existing = self.find_in_entity(txn, &entity.name, &names, &record.id)?;
        let created = existing.is_none();
        let mut object = existing.unwrap_or_else(|| LocalObject::new(entity.name.clone()));
        let mut missing = MissingReferences::new();

        for (name, value) in &record.fields {
            if names.contains(name) {
                continue;
            }
            if let Some(attribute) = entity.attribute(name) {
                match attribute_value(attribute.kind, value)? {
                    Some(converted) => object.set(name.clone(), converted),
                    None => debug!(field = %name, "field type does not match attribute, skipped"),
                }
            } else if let Some(relationship) = entity.relationship(name) {
                let mut resolved = BTreeSet::new();
                for target in value.references() {
                    match self.find_in_destination(txn, model, &relationship.destination, target)? {
                        Some(found) => {
                            resolved.insert(found.id);
                        }
                        None => {
                            missing
                                .entry(name.clone())
                                .or_default()
                                .insert(target.clone());
                        }
                    }
                }
                object.set_related(name.clone(), resolved);
            }
        }

        object.set(
            names.record_name.clone(),
            AttributeValue::Text(record.id.record_name.clone()),
        );
        object.set(
            names.owner_name.clone(),
            AttributeValue::Text(record.id.owner_name().to_string()),
        );
        if let Some(system_fields) = &record.system_fields {
            object.set(
                names.record_data.clone(),
                AttributeValue::Bytes(system_fields.to_vec()),
            );
        }
        object.set(names.marked_for_deletion.clone(), AttributeValue::Bool(false));

        let id = object.id;
        txn.save(object)?;
        Ok(Some(Conversion {
            object: id,
            created,
            missing,
        }))
    }

    /// Links references that became resolvable.
    ///
    /// Resolved entries are removed from `missing`; the rest stay for a later
    /// attempt. Returns the number of references resolved.
    pub fn resolve_missing<T: LocalTransaction>(
        &self,
        txn: &mut T,
        model: &ObjectModel,
        missing: &mut MissingReferenceSet,
    ) -> SyncResult<usize> {
        let mut resolved = 0;
        for (object_id, mut references) in std::mem::take(&mut missing.entries) {
            let Some(mut object) = txn.get(object_id) else {
                continue;
            };
            let Some(entity) = model.entity(&object.entity) else {
                continue;
            };

            let mut changed = false;
            for (name, targets) in references.iter_mut() {
                let Some(relationship) = entity.relationship(name) else {
                    targets.clear();
                    continue;
                };
                let mut unresolved = BTreeSet::new();
                for target in std::mem::take(targets) {
                    match self.find_in_destination(txn, model, &relationship.destination, &target)? {
                        Some(found) if relationship.to_many => {
                            object.relate(name.clone(), found.id);
                            changed = true;
                            resolved += 1;
                        }
                        Some(found) => {
                            object.set_related(name.clone(), BTreeSet::from([found.id]));
                            changed = true;
                            resolved += 1;
                        }
                        None => {
                            unresolved.insert(target);
                        }
                    }
                }
                *targets = unresolved;
            }
            references.retain(|_, targets| !targets.is_empty());

            if changed {
                txn.save(object)?;
            }
            if !references.is_empty() {
                missing.entries.insert(object_id, references);
            }
        }
        Ok(resolved)
    }

    /// Deletes the local object of a remote record, if present.
    pub fn delete_by_record_id<T: LocalTransaction>(
        &self,
        txn: &mut T,
        model: &ObjectModel,
        id: &RecordId,
        record_type: &str,
    ) -> SyncResult<Option<LocalObjectId>> {
        let found = match model.entity(record_type) {
            Some(_) => self.find_in_destination(txn, model, record_type, id)?,
            None => self.find_by_record_id(txn, model, id)?,
        };
        Ok(found.map(|object| {
            txn.delete(object.id);
            object.id
        }))
    }

    /// Deletes every local object owned by `owner_name`.
    pub fn delete_owned_by<T: LocalTransaction>(
        &self,
        txn: &mut T,
        model: &ObjectModel,
        owner_name: &str,
    ) -> SyncResult<usize> {
        let mut deleted = 0;
        for (entity, names) in self.syncable_entities(model) {
            let predicate = Predicate::equals(
                names.owner_name.clone(),
                AttributeValue::Text(owner_name.to_string()),
            );
            for object in txn.fetch(&entity.name, &predicate)? {
                if txn.delete(object.id) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    /// Builds the outgoing record of a local object.
    ///
    /// Reuses the identity and version stamp of stored system fields, or
    /// creates a fresh record on first upload. Asset attributes are staged to
    /// temporary files owned by the returned record.
    pub fn object_to_record<T: LocalTransaction>(
        &self,
        object: &LocalObject,
        txn: &T,
        model: &ObjectModel,
    ) -> SyncResult<PreparedRecord> {
        let entity = model
            .entity(&object.entity)
            .ok_or_else(|| StoreError::UnknownEntity(object.entity.clone()))?;
        let names = self.names_for(model, &object.entity)?;

        let mut record = match object
            .bytes(&names.record_data)
            .filter(|data| !data.is_empty())
        {
            Some(data) => RemoteRecord::from_system_fields(data)?,
            None => {
                let id =
                    self.record_id_of(object, &names)
                        .ok_or_else(|| SyncError::MissingIdentity {
                            entity: entity.name.clone(),
                        })?;
                RemoteRecord::new(id, entity.name.clone())
            }
        };

        let mut assets = StagedAssets::default();
        for (name, attribute) in &entity.attributes {
            if names.contains(name) {
                continue;
            }
            let Some(value) = object.get(name) else {
                continue;
            };
            match value {
                AttributeValue::Bytes(bytes) if attribute.is_asset() => {
                    let file = self.stage(bytes)?;
                    record.set(name.clone(), FieldValue::Asset(AssetRef::new(file.path())));
                    assets.files.push(file);
                }
                other => {
                    if let Some(field) = field_value(other) {
                        record.set(name.clone(), field);
                    }
                }
            }
        }

        for (name, relationship) in &entity.relationships {
            if !relationship.is_sync_enabled() {
                continue;
            }
            let Ok(destination) = self.names_for(model, &relationship.destination) else {
                continue;
            };
            let targets: Vec<RecordId> = object
                .related(name)
                .filter_map(|id| txn.get(id))
                .filter_map(|target| self.record_id_of(&target, &destination))
                .collect();
            if relationship.to_many {
                record.set(name.clone(), FieldValue::ReferenceList(targets));
            } else if let Some(target) = targets.into_iter().next() {
                record.set(name.clone(), FieldValue::Reference(target));
            }
        }

        Ok(PreparedRecord {
            object: object.id,
            record,
            assets,
        })
    }

    fn stage(&self, bytes: &[u8]) -> SyncResult<NamedTempFile> {
        let mut file = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file)
    }
}

fn read_asset(path: &Path) -> SyncResult<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

fn attribute_value(kind: AttributeKind, value: &FieldValue) -> SyncResult<Option<AttributeValue>> {
    let converted = match (kind, value) {
        (AttributeKind::Bool, FieldValue::Bool(v)) => AttributeValue::Bool(*v),
        (AttributeKind::Int, FieldValue::Int(v)) => AttributeValue::Int(*v),
        (AttributeKind::Double, FieldValue::Double(v)) => AttributeValue::Double(*v),
        (AttributeKind::Double, FieldValue::Int(v)) => AttributeValue::Double(*v as f64),
        (AttributeKind::Text, FieldValue::Text(v)) => AttributeValue::Text(v.clone()),
        (AttributeKind::Bytes, FieldValue::Bytes(v)) => AttributeValue::Bytes(v.clone()),
        (AttributeKind::Bytes, FieldValue::Asset(asset)) => {
            AttributeValue::Bytes(read_asset(&asset.path)?)
        }
        (AttributeKind::Timestamp, FieldValue::Timestamp(v))
        | (AttributeKind::Timestamp, FieldValue::Int(v)) => AttributeValue::Timestamp(*v),
        _ => return Ok(None),
    };
    Ok(Some(converted))
}

fn field_value(value: &AttributeValue) -> Option<FieldValue> {
    match value {
        AttributeValue::Null => None,
        AttributeValue::Bool(v) => Some(FieldValue::Bool(*v)),
        AttributeValue::Int(v) => Some(FieldValue::Int(*v)),
        AttributeValue::Double(v) => Some(FieldValue::Double(*v)),
        AttributeValue::Text(v) => Some(FieldValue::Text(v.clone())),
        AttributeValue::Bytes(v) => Some(FieldValue::Bytes(v.clone())),
        AttributeValue::Timestamp(v) => Some(FieldValue::Timestamp(*v)),
    }
}
