//! In-memory local store.

use crate::model::{LocalObject, LocalObjectId, ObjectModel, Predicate};
use crate::store::{CommitEvent, LocalStore, LocalTransaction, StoreError, UpdatedObject};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Commit origins kept by [`MemoryStore::commit_log`].
pub const COMMIT_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<LocalObjectId, LocalObject>,
    metadata: BTreeMap<String, Vec<u8>>,
}

/// An in-memory local store with commit notifications.
///
/// Useful for tests and for embedding the engine without a persistent
/// object store. Supports injecting commit failures.
pub struct MemoryStore {
    model: Arc<ObjectModel>,
    state: Arc<RwLock<StoreState>>,
    subscribers: Mutex<Vec<UnboundedSender<CommitEvent>>>,
    fail_commits: AtomicUsize,
    commit_log: Mutex<VecDeque<String>>,
}

impl MemoryStore {
    /// Creates an empty store for a model.
    pub fn new(model: ObjectModel) -> Self {
        Self {
            model: Arc::new(model),
            state: Arc::new(RwLock::new(StoreState::default())),
            subscribers: Mutex::new(Vec::new()),
            fail_commits: AtomicUsize::new(0),
            commit_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Makes the next `count` commits fail without writing anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Gets a committed object.
    pub fn object(&self, id: LocalObjectId) -> Option<LocalObject> {
        self.state.read().objects.get(&id).cloned()
    }

    /// All committed objects of an entity.
    pub fn objects(&self, entity: &str) -> Vec<LocalObject> {
        self.state
            .read()
            .objects
            .values()
            .filter(|object| object.entity == entity)
            .cloned()
            .collect()
    }

    /// Number of committed objects across all entities.
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Origins of the most recent successful commits, oldest first.
    ///
    /// Only the last [`COMMIT_LOG_CAPACITY`] commits are kept.
    pub fn commit_log(&self) -> Vec<String> {
        self.commit_log.lock().iter().cloned().collect()
    }

    fn publish(&self, event: CommitEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl LocalStore for MemoryStore {
    type Transaction = MemoryTransaction;

    fn model(&self) -> &ObjectModel {
        &self.model
    }

    fn begin(&self, origin: &str) -> MemoryTransaction {
        MemoryTransaction {
            origin: origin.to_string(),
            model: Arc::clone(&self.model),
            state: Arc::clone(&self.state),
            writes: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn commit(&self, txn: MemoryTransaction) -> Result<(), StoreError> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::CommitFailed("injected commit failure".into()));
        }

        let mut event = CommitEvent {
            origin: txn.origin.clone(),
            ..CommitEvent::default()
        };
        {
            let mut state = self.state.write();
            for (id, write) in txn.writes {
                match write {
                    Some(object) => match state.objects.insert(id, object.clone()) {
                        None => event.inserted.push(object),
                        Some(previous) => {
                            let changed_keys = changed_keys(&previous, &object);
                            if !changed_keys.is_empty() {
                                event.updated.push(UpdatedObject {
                                    object,
                                    changed_keys,
                                });
                            }
                        }
                    },
                    None => {
                        if let Some(previous) = state.objects.remove(&id) {
                            event.deleted.push(previous);
                        }
                    }
                }
            }
            state.metadata.extend(txn.metadata);
        }
        {
            let mut log = self.commit_log.lock();
            if log.len() == COMMIT_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(txn.origin);
        }

        if !event.is_empty() {
            self.publish(event);
        }
        Ok(())
    }

    fn metadata(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().metadata.get(key).cloned()
    }

    fn subscribe(&self) -> UnboundedReceiver<CommitEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

fn changed_keys(before: &LocalObject, after: &LocalObject) -> BTreeSet<String> {
    let attributes = before
        .attributes
        .keys()
        .chain(after.attributes.keys())
        .filter(|key| before.attributes.get(*key) != after.attributes.get(*key));
    let relationships = before
        .relationships
        .keys()
        .chain(after.relationships.keys())
        .filter(|key| before.relationships.get(*key) != after.relationships.get(*key));
    attributes.chain(relationships).cloned().collect()
}

/// Transaction of a [`MemoryStore`].
pub struct MemoryTransaction {
    origin: String,
    model: Arc<ObjectModel>,
    state: Arc<RwLock<StoreState>>,
    writes: BTreeMap<LocalObjectId, Option<LocalObject>>,
    metadata: BTreeMap<String, Vec<u8>>,
}

impl LocalTransaction for MemoryTransaction {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn fetch(&self, entity: &str, predicate: &Predicate) -> Result<Vec<LocalObject>, StoreError> {
        if self.model.entity(entity).is_none() {
            return Err(StoreError::UnknownEntity(entity.to_string()));
        }
        let state = self.state.read();
        let committed = state
            .objects
            .values()
            .filter(|object| !self.writes.contains_key(&object.id));
        let written = self.writes.values().flatten();
        Ok(committed
            .chain(written)
            .filter(|object| object.entity == entity && predicate.matches(object))
            .cloned()
            .collect())
    }

    fn get(&self, id: LocalObjectId) -> Option<LocalObject> {
        match self.writes.get(&id) {
            Some(write) => write.clone(),
            None => self.state.read().objects.get(&id).cloned(),
        }
    }

    fn save(&mut self, object: LocalObject) -> Result<(), StoreError> {
        if self.model.entity(&object.entity).is_none() {
            return Err(StoreError::UnknownEntity(object.entity));
        }
        self.writes.insert(object.id, Some(object));
        Ok(())
    }

    fn delete(&mut self, id: LocalObjectId) -> bool {
        let existed = self.get(id).is_some();
        if existed {
            self.writes.insert(id, None);
        }
        existed
    }

    fn metadata(&self, key: &str) -> Option<Vec<u8>> {
        self.metadata
            .get(key)
            .cloned()
            .or_else(|| self.state.read().metadata.get(key).cloned())
    }

    fn set_metadata(&mut self, key: &str, value: Vec<u8>) {
        self.metadata.insert(key.to_string(), value);
    }

    fn has_changes(&self) -> bool {
        !self.writes.is_empty() || !self.metadata.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeKind, AttributeValue, EntityDescription};

    fn store() -> MemoryStore {
        MemoryStore::new(
            ObjectModel::new().with_entity(
                EntityDescription::new("Note")
                    .with_attribute("title", AttributeKind::Text)
                    .with_to_many("tags", "Note", false),
            ),
        )
    }

    fn note(title: &str) -> LocalObject {
        LocalObject::new("Note").with("title", AttributeValue::Text(title.into()))
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let store = store();
        let mut txn = store.begin("test");
        let object = note("a");
        let id = object.id;
        txn.save(object).unwrap();

        assert!(txn.get(id).is_some());
        assert_eq!(txn.fetch("Note", &Predicate::All).unwrap().len(), 1);
        assert!(store.object(id).is_none());

        drop(txn);
        assert!(store.is_empty());
    }

    #[test]
    fn commit_publishes_diff() {
        let store = store();
        let mut rx = store.subscribe();

        let mut object = note("a");
        let id = object.id;
        store
            .perform_and_wait("user", |txn| txn.save(object.clone()))
            .unwrap();

        object.set("title", AttributeValue::Text("b".into()));
        object.relate("tags", LocalObjectId::new());
        store
            .perform_and_wait("user", |txn| txn.save(object.clone()))
            .unwrap();

        store
            .perform_and_wait::<_, StoreError, _>("user", |txn| {
                txn.delete(id);
                Ok(())
            })
            .unwrap();

        let inserted = rx.try_recv().unwrap();
        assert_eq!(inserted.origin, "user");
        assert_eq!(inserted.inserted.len(), 1);

        let updated = rx.try_recv().unwrap();
        let keys: Vec<_> = updated.updated[0].changed_keys.iter().cloned().collect();
        assert_eq!(keys, vec!["tags".to_string(), "title".to_string()]);

        let deleted = rx.try_recv().unwrap();
        assert_eq!(deleted.deleted[0].text("title"), Some("b"));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.commit_log().len(), 3);
    }

    #[test]
    fn commit_log_keeps_recent_origins() {
        let store = store();
        for i in 0..COMMIT_LOG_CAPACITY + 10 {
            store
                .perform_and_wait(&format!("origin-{i}"), |txn| txn.save(note("a")))
                .unwrap();
        }
        let log = store.commit_log();
        assert_eq!(log.len(), COMMIT_LOG_CAPACITY);
        assert_eq!(log.first().map(String::as_str), Some("origin-10"));
        assert_eq!(
            log.last(),
            Some(&format!("origin-{}", COMMIT_LOG_CAPACITY + 9))
        );
    }

    #[test]
    fn unchanged_save_publishes_nothing() {
        let store = store();
        let object = note("a");
        store
            .perform_and_wait("user", |txn| txn.save(object.clone()))
            .unwrap();

        let mut rx = store.subscribe();
        store
            .perform_and_wait("user", |txn| txn.save(object.clone()))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn injected_failure_writes_nothing() {
        let store = store();
        store.fail_next_commits(1);

        let mut txn = store.begin("user");
        txn.save(note("a")).unwrap();
        txn.set_metadata("k", vec![1]);
        assert!(matches!(
            store.commit(txn),
            Err(StoreError::CommitFailed(_))
        ));
        assert!(store.is_empty());
        assert!(store.metadata("k").is_none());

        let mut txn = store.begin("user");
        txn.set_metadata("k", vec![2]);
        store.commit(txn).unwrap();
        assert_eq!(store.metadata("k"), Some(vec![2]));
    }

    #[test]
    fn unknown_entity_rejected() {
        let store = store();
        let mut txn = store.begin("user");
        assert!(matches!(
            txn.save(LocalObject::new("Ghost")),
            Err(StoreError::UnknownEntity(_))
        ));
        assert!(txn.fetch("Ghost", &Predicate::All).is_err());
        assert!(!txn.has_changes());
    }
}
