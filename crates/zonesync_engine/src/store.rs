//! Local store contract consumed by the engine.

use crate::model::{LocalObject, LocalObjectId, ObjectModel, Predicate};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Errors raised by a local store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The commit was rejected; nothing was written.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// The entity is not part of the store's model.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// No object with this identifier exists.
    #[error("object {0} not found")]
    NotFound(LocalObjectId),
}

/// An updated object together with the keys that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedObject {
    /// The object after the update.
    pub object: LocalObject,
    /// Names of attributes and relationships whose value changed.
    pub changed_keys: BTreeSet<String>,
}

/// Everything a committed transaction changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitEvent {
    /// Origin tag of the committing transaction.
    pub origin: String,
    /// Objects that did not exist before.
    pub inserted: Vec<LocalObject>,
    /// Objects that were modified.
    pub updated: Vec<UpdatedObject>,
    /// Snapshots of objects that were deleted.
    pub deleted: Vec<LocalObject>,
}

impl CommitEvent {
    /// Returns true if the commit changed no objects.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// A write transaction on the local store.
///
/// Reads observe committed state plus this transaction's own writes.
/// Dropping a transaction without committing rolls it back.
pub trait LocalTransaction: Send {
    /// Origin tag passed to `begin`.
    fn origin(&self) -> &str;

    /// Fetches objects of an entity matching a predicate.
    fn fetch(&self, entity: &str, predicate: &Predicate) -> Result<Vec<LocalObject>, StoreError>;

    /// Gets an object by identifier.
    fn get(&self, id: LocalObjectId) -> Option<LocalObject>;

    /// Inserts or replaces an object.
    fn save(&mut self, object: LocalObject) -> Result<(), StoreError>;

    /// Deletes an object. Returns false if it did not exist.
    fn delete(&mut self, id: LocalObjectId) -> bool;

    /// Reads a metadata entry.
    fn metadata(&self, key: &str) -> Option<Vec<u8>>;

    /// Writes a metadata entry.
    fn set_metadata(&mut self, key: &str, value: Vec<u8>);

    /// Returns true if the transaction has pending writes.
    fn has_changes(&self) -> bool;
}

/// A local object store the engine synchronizes.
pub trait LocalStore: Send + Sync {
    /// Transaction type.
    type Transaction: LocalTransaction;

    /// The store's object model.
    fn model(&self) -> &ObjectModel;

    /// Starts a write transaction tagged with an origin.
    fn begin(&self, origin: &str) -> Self::Transaction;

    /// Commits a transaction atomically, then notifies subscribers.
    fn commit(&self, txn: Self::Transaction) -> Result<(), StoreError>;

    /// Reads a committed metadata entry.
    fn metadata(&self, key: &str) -> Option<Vec<u8>>;

    /// Subscribes to commit events.
    fn subscribe(&self) -> UnboundedReceiver<CommitEvent>;

    /// Runs `f` in a new transaction and commits it if `f` succeeds.
    fn perform_and_wait<T, E, F>(&self, origin: &str, f: F) -> Result<T, E>
    where
        Self: Sized,
        E: From<StoreError>,
        F: FnOnce(&mut Self::Transaction) -> Result<T, E>,
    {
        let mut txn = self.begin(origin);
        let value = f(&mut txn)?;
        self.commit(txn)?;
        Ok(value)
    }
}
