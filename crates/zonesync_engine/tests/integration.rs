//! Integration tests for the sync engine.
//!
//! These run the engine against the in-memory local and remote stores and
//! check the behavior visible to an embedding application.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zonesync_engine::{
    AttributeKind, AttributeValue, EntityDescription, LocalObject, LocalStore, LocalTransaction,
    MemoryRemote, MemoryStore, MemoryTransaction, ObjectModel, PullResult, PushOutcome, PushState,
    RemoteError, RemoteOp, RemoteStore, RetryConfig, SyncConfig, SyncDelegate, SyncEngine,
    SyncError, SyncStage, UserInfo, USER_INFO_ASSET, USER_INFO_SYNC_SCOPES,
};
use zonesync_protocol::{
    ChangeToken, ConflictResolution, DatabaseChanges, DatabaseScope, FieldValue, RecordConflict,
    RecordId, RecordOutcome, RemoteRecord, TokenLedger, ZoneChangesPage, ZoneId,
    SHARE_RECORD_TYPE, SHARE_ROOT_FIELD,
};

/// Delegate recording the callbacks it receives.
#[derive(Default)]
struct RecordingDelegate {
    conflicts: Mutex<Vec<RecordConflict>>,
    purges: Mutex<Vec<ZoneId>>,
    errors: Mutex<Vec<(String, SyncStage)>>,
    pulls: AtomicUsize,
}

impl SyncDelegate for RecordingDelegate {
    fn did_sync_from_remote(&self, _result: PullResult) {
        self.pulls.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &SyncError, stage: SyncStage) {
        self.errors.lock().push((error.to_string(), stage));
    }

    fn on_conflict(&self, conflict: &RecordConflict) {
        self.conflicts.lock().push(conflict.clone());
    }

    fn on_purge(&self, zone: &ZoneId) {
        self.purges.lock().push(zone.clone());
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    remote: Arc<MemoryRemote>,
    engine: SyncEngine<MemoryStore>,
    delegate: Arc<RecordingDelegate>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: SyncConfig) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        Self::with_remote(config, Arc::clone(&remote) as Arc<dyn RemoteStore>, remote)
    }

    fn with_remote(
        config: SyncConfig,
        transport: Arc<dyn RemoteStore>,
        remote: Arc<MemoryRemote>,
    ) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new(model()));
        let delegate = Arc::new(RecordingDelegate::default());
        let engine = SyncEngine::new(config, Arc::clone(&store), transport, remote.clone())
            .unwrap()
            .with_delegate(delegate.clone());
        Self {
            store,
            remote,
            engine,
            delegate,
        }
    }

    /// Commits a local edit the way the application would.
    fn edit(&self, f: impl FnOnce(&mut MemoryTransaction) -> Result<(), SyncError>) {
        let origin = self.engine.config().push_context_name.clone();
        self.store.perform_and_wait(&origin, f).unwrap();
    }

    fn create_note(&self, title: &str) -> LocalObject {
        let note = LocalObject::new("Note").with("title", text(title));
        let saved = note.clone();
        self.edit(|txn| Ok(txn.save(note)?));
        saved
    }

    fn retitle(&self, record_name: &str, title: &str) {
        let mut note = self.note(record_name).unwrap();
        note.set("title", text(title));
        self.edit(|txn| Ok(txn.save(note)?));
    }

    fn note(&self, record_name: &str) -> Option<LocalObject> {
        self.store
            .objects("Note")
            .into_iter()
            .find(|note| note.text("recordName") == Some(record_name))
    }

    fn titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = self
            .store
            .objects("Note")
            .iter()
            .filter_map(|note| note.text("title").map(str::to_string))
            .collect();
        titles.sort();
        titles
    }

    fn stored_ledger(&self) -> TokenLedger {
        let key = &self.engine.config().metadata_key_tokens;
        TokenLedger::decode(&self.store.metadata(key).unwrap()).unwrap()
    }
}

/// Logs to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn model() -> ObjectModel {
    let mut asset = UserInfo::new();
    asset.insert(USER_INFO_ASSET.into(), "true".into());
    let service = |entity: EntityDescription| {
        entity
            .with_attribute("recordName", AttributeKind::Text)
            .with_attribute("ownerName", AttributeKind::Text)
            .with_attribute("recordData", AttributeKind::Bytes)
            .with_attribute("markedForDeletion", AttributeKind::Bool)
            .with_user_info(USER_INFO_SYNC_SCOPES, "private,shared")
    };
    ObjectModel::new()
        .with_entity(service(
            EntityDescription::new("Note")
                .with_attribute("title", AttributeKind::Text)
                .with_annotated_attribute("image", AttributeKind::Bytes, asset)
                .with_to_one("folder", "Folder"),
        ))
        .with_entity(service(
            EntityDescription::new("Folder")
                .with_attribute("name", AttributeKind::Text)
                .with_to_many("notes", "Note", true),
        ))
}

fn config() -> SyncConfig {
    SyncConfig::default().with_retry(
        RetryConfig::unbounded()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false),
    )
}

fn zone() -> ZoneId {
    ZoneId::owned("ZoneSync")
}

fn text(value: &str) -> AttributeValue {
    AttributeValue::Text(value.into())
}

fn remote_note(name: &str, title: &str) -> RemoteRecord {
    RemoteRecord::new(RecordId::new(name, zone()), "Note")
        .with_field("title", FieldValue::Text(title.into()))
}

fn remote_title(remote: &MemoryRemote, name: &str) -> Option<String> {
    match remote.record(&RecordId::new(name, zone()))?.get("title") {
        Some(FieldValue::Text(title)) => Some(title.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn pull_applies_changes_and_advances_tokens() {
    let h = Harness::new();

    // Another device writes three notes and deletes one
    h.remote.put_record(remote_note("r1", "first"));
    h.remote.put_record(remote_note("r2", "second"));
    h.remote.put_record(remote_note("r3", "third"));
    assert!(h.remote.delete_record(&RecordId::new("r3", zone())));

    // Enabling runs the initial pull
    assert_eq!(h.engine.enable().await.unwrap(), PullResult::NewData);
    assert_eq!(h.titles(), vec!["first", "second"]);
    assert!(h.note("r3").is_none());

    let ledger = h.engine.ledger();
    assert!(ledger.zone_token(&zone()).is_some());
    assert!(ledger.scope_token(DatabaseScope::Private).is_some());
    assert_eq!(h.stored_ledger(), ledger);

    // Nothing new since
    assert_eq!(h.engine.pull(None).await.unwrap(), PullResult::NoData);
    assert_eq!(h.delegate.pulls.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.stats().records_pulled, 2);
}

#[tokio::test]
async fn pulled_objects_are_not_pushed_back() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "first"));
    h.engine.enable().await.unwrap();

    assert_eq!(h.engine.dirty_count(), 0);
    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));
    assert_eq!(h.remote.calls(RemoteOp::ModifyRecords), 0);
}

#[tokio::test]
async fn references_resolve_within_one_round() {
    let h = Harness::new();

    // The note arrives before the folder it points to
    let folder_id = RecordId::new("f1", zone());
    let note_id = RecordId::new("n1", zone());
    h.remote.put_record(
        remote_note("n1", "inside").with_field("folder", FieldValue::Reference(folder_id.clone())),
    );
    h.remote.put_record(
        RemoteRecord::new(folder_id, "Folder")
            .with_field("name", FieldValue::Text("inbox".into()))
            .with_field("notes", FieldValue::ReferenceList(vec![note_id])),
    );

    h.engine.enable().await.unwrap();

    let note = h.note("n1").unwrap();
    let folder = h.store.objects("Folder").pop().unwrap();
    assert_eq!(note.related("folder").collect::<Vec<_>>(), vec![folder.id]);
    assert_eq!(folder.related("notes").collect::<Vec<_>>(), vec![note.id]);
}

#[tokio::test]
async fn references_resolve_across_rounds() {
    let h = Harness::new();
    h.remote.set_page_size(1);

    let folder_id = RecordId::new("f1", zone());
    h.remote.put_record(
        remote_note("n1", "inside").with_field("folder", FieldValue::Reference(folder_id.clone())),
    );
    h.remote.put_record(
        RemoteRecord::new(folder_id, "Folder")
            .with_field("name", FieldValue::Text("inbox".into())),
    );

    h.engine.enable().await.unwrap();

    // One round per record
    assert!(h.remote.calls(RemoteOp::FetchZoneChanges) >= 2);
    let note = h.note("n1").unwrap();
    let folder = h.store.objects("Folder").pop().unwrap();
    assert_eq!(note.related("folder").collect::<Vec<_>>(), vec![folder.id]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "first"));

    // Drop the network twice
    h.remote
        .fail_next(RemoteOp::FetchZoneChanges, RemoteError::network("timeout"));
    h.remote
        .fail_next(RemoteOp::FetchZoneChanges, RemoteError::network("timeout"));

    assert_eq!(h.engine.enable().await.unwrap(), PullResult::NewData);
    assert_eq!(h.titles(), vec!["first"]);
    assert!(h.engine.stats().retries >= 2);
}

#[tokio::test]
async fn failed_commit_leaves_token_in_place() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();
    let before = h.engine.ledger().zone_token(&zone()).cloned();

    h.remote.put_record(remote_note("r1", "first"));
    h.store.fail_next_commits(1);

    // The round is lost as a whole
    let err = h.engine.pull(Some(DatabaseScope::Private)).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));
    assert!(h.store.objects("Note").is_empty());
    assert_eq!(h.engine.ledger().zone_token(&zone()).cloned(), before);
    assert_eq!(h.stored_ledger().zone_token(&zone()).cloned(), before);

    // Pulling again fetches the same changes
    assert_eq!(
        h.engine.pull(Some(DatabaseScope::Private)).await.unwrap(),
        PullResult::NewData
    );
    assert_eq!(h.titles(), vec!["first"]);
    assert_ne!(h.engine.ledger().zone_token(&zone()).cloned(), before);
}

#[tokio::test]
async fn own_zone_deletion_is_suppressed_once() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "first"));
    h.engine.enable().await.unwrap();

    // Deleting the zone ourselves keeps local data
    h.engine.delete_zone().await.unwrap();
    assert_eq!(h.engine.pending_zone_deletions(), 1);
    assert_eq!(
        h.engine.pull(Some(DatabaseScope::Private)).await.unwrap(),
        PullResult::NoData
    );
    assert_eq!(h.titles(), vec!["first"]);
    assert_eq!(h.engine.pending_zone_deletions(), 0);
    assert!(h.delegate.purges.lock().is_empty());

    // A deletion by the user elsewhere purges
    h.remote.user_delete_zone(&zone());
    assert_eq!(
        h.engine.pull(Some(DatabaseScope::Private)).await.unwrap(),
        PullResult::NewData
    );
    assert!(h.store.objects("Note").is_empty());
    assert_eq!(*h.delegate.purges.lock(), vec![zone()]);
    assert_eq!(h.engine.stats().purges, 1);
    assert!(h
        .delegate
        .errors
        .lock()
        .iter()
        .any(|(_, stage)| *stage == SyncStage::Pull));
}

#[tokio::test]
async fn push_uploads_local_changes() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();

    let note = h.create_note("draft");
    assert_eq!(h.engine.dirty_count(), 1);

    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));
    assert_eq!(h.engine.dirty_count(), 0);

    // Identity and version were written back
    let pushed = h.store.object(note.id).unwrap();
    let name = pushed.text("recordName").unwrap().to_string();
    assert!(pushed.bytes("recordData").is_some());
    assert_eq!(remote_title(&h.remote, &name).as_deref(), Some("draft"));

    // A local tombstone deletes the record
    let mut tombstone = pushed;
    tombstone.set("markedForDeletion", AttributeValue::Bool(true));
    h.edit(|txn| Ok(txn.save(tombstone)?));
    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));
    assert!(h.remote.record(&RecordId::new(name, zone())).is_none());
    assert!(h.store.object(note.id).is_none());
}

#[tokio::test]
async fn conflicts_are_reported_and_kept_local_on_request() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "original"));
    h.engine.enable().await.unwrap();

    // Both sides edit the same record
    h.retitle("r1", "local");
    h.remote.put_record(remote_note("r1", "remote"));

    let outcome = h.engine.push_pending_changes().await.unwrap();
    let PushOutcome::PartialFailure(errors) = outcome else {
        panic!("expected a partial failure, got {outcome:?}");
    };
    assert!(matches!(&errors[..], [SyncError::Conflict { .. }]));

    // Nothing was merged
    assert_eq!(remote_title(&h.remote, "r1").as_deref(), Some("remote"));
    assert_eq!(h.titles(), vec!["local"]);
    assert_eq!(h.engine.dirty_count(), 1);
    assert_eq!(h.engine.stats().conflicts_encountered, 1);

    let conflict = h.delegate.conflicts.lock().pop().unwrap();
    assert_eq!(conflict.record_id, RecordId::new("r1", zone()));
    h.engine
        .resolve_conflict(&conflict, ConflictResolution::KeepLocal)
        .await
        .unwrap();

    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));
    assert_eq!(remote_title(&h.remote, "r1").as_deref(), Some("local"));
}

#[tokio::test]
async fn conflicts_can_accept_the_remote_version() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "original"));
    h.engine.enable().await.unwrap();

    h.retitle("r1", "local");
    h.remote.put_record(remote_note("r1", "remote"));
    h.engine.push_pending_changes().await.unwrap();

    let conflict = h.delegate.conflicts.lock().pop().unwrap();
    h.engine
        .resolve_conflict(&conflict, ConflictResolution::AcceptRemote)
        .await
        .unwrap();

    assert_eq!(h.titles(), vec!["remote"]);
    assert_eq!(h.engine.dirty_count(), 0);
}

#[tokio::test]
async fn missing_zone_is_recreated_and_reuploaded() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();

    let kept = h.create_note("kept");
    let edited = h.create_note("edited");
    h.engine.push_pending_changes().await.unwrap();
    let kept_name = h.store.object(kept.id).unwrap().text("recordName").unwrap().to_string();
    let edited_name = h
        .store
        .object(edited.id)
        .unwrap()
        .text("recordName")
        .unwrap()
        .to_string();

    // The server loses the zone without telling anyone
    h.remote.reset_zone(&zone());
    assert!(!h.remote.zone_exists(&zone()));

    h.retitle(&edited_name, "edited again");
    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));

    // Everything local is back, including untouched objects
    assert!(h.remote.zone_exists(&zone()));
    assert_eq!(remote_title(&h.remote, &kept_name).as_deref(), Some("kept"));
    assert_eq!(
        remote_title(&h.remote, &edited_name).as_deref(),
        Some("edited again")
    );
    assert_eq!(h.engine.dirty_count(), 0);
}

#[tokio::test]
async fn expired_zone_token_refetches_the_zone() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "first"));
    h.engine.enable().await.unwrap();

    h.remote.put_record(remote_note("r2", "second"));
    h.remote.expire_zone_tokens(&zone());

    assert_eq!(h.engine.pull(None).await.unwrap(), PullResult::NewData);
    assert_eq!(h.titles(), vec!["first", "second"]);
    assert_eq!(h.store.objects("Note").len(), 2);
}

#[tokio::test]
async fn assets_are_uploaded_from_staged_files() {
    let staging = tempfile::tempdir().unwrap();
    let h = Harness::with_config(config().with_asset_staging_dir(staging.path()));
    h.engine.enable().await.unwrap();

    let note = LocalObject::new("Note")
        .with("title", text("photo"))
        .with("image", AttributeValue::Bytes(vec![0x89, 0x50, 0x4e, 0x47]));
    let id = note.id;
    h.edit(|txn| Ok(txn.save(note)?));

    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));

    let name = h.store.object(id).unwrap().text("recordName").unwrap().to_string();
    let record = h.remote.record(&RecordId::new(name, zone())).unwrap();
    assert_eq!(
        record.get("image"),
        Some(&FieldValue::Bytes(vec![0x89, 0x50, 0x4e, 0x47]))
    );

    // Staged files are gone once the push finished
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn accepted_share_activates_its_root_object() {
    let h = Harness::new();
    let shared = ZoneId::new("Shared", "_alice");
    let root_id = RecordId::new("f1", shared.clone());
    h.remote.put_record(
        RemoteRecord::new(root_id.clone(), "Folder")
            .with_field("name", FieldValue::Text("trip".into())),
    );
    h.engine.enable().await.unwrap();

    // The local shadow of the root is hidden until the share arrives
    let mut folder = h.store.objects("Folder").pop().unwrap();
    assert_eq!(folder.text("ownerName"), Some("_alice"));
    folder.set("markedForDeletion", AttributeValue::Bool(true));
    h.store
        .perform_and_wait::<_, SyncError, _>("import", |txn| Ok(txn.save(folder.clone())?))
        .unwrap();

    h.remote.put_record(
        RemoteRecord::new(RecordId::new("share-1", shared), SHARE_RECORD_TYPE)
            .with_field(SHARE_ROOT_FIELD, FieldValue::Reference(root_id)),
    );

    assert_eq!(
        h.engine.pull(Some(DatabaseScope::Shared)).await.unwrap(),
        PullResult::NewData
    );
    let folder = h.store.object(folder.id).unwrap();
    assert!(!folder.flag("markedForDeletion"));
    assert_eq!(h.store.objects("Folder").len(), 1);
}

#[tokio::test]
async fn offline_push_is_deferred_until_reconnect() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();

    h.engine.set_online(false);
    let note = h.create_note("offline");
    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Deferred
    ));
    assert_eq!(h.remote.calls(RemoteOp::ModifyRecords), 0);

    // Reconnecting pushes in the background
    h.engine.set_online(true);
    for _ in 0..200 {
        if h.engine.dirty_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.engine.dirty_count(), 0);
    let name = h.store.object(note.id).unwrap().text("recordName").unwrap().to_string();
    assert_eq!(remote_title(&h.remote, &name).as_deref(), Some("offline"));
}

#[tokio::test]
async fn tokens_survive_restart() {
    let h = Harness::new();
    h.remote.put_record(remote_note("r1", "first"));
    h.engine.enable().await.unwrap();
    let ledger = h.engine.ledger();
    h.engine.disable();

    // A new engine on the same store starts from the stored tokens
    let engine = SyncEngine::new(
        config(),
        Arc::clone(&h.store),
        h.remote.clone(),
        h.remote.clone(),
    )
    .unwrap();
    assert_eq!(engine.ledger(), ledger);
    assert_eq!(engine.enable().await.unwrap(), PullResult::NoData);
    assert_eq!(h.titles(), vec!["first"]);
}

#[tokio::test]
async fn edit_during_push_is_pushed_next_cycle() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();
    let note = h.create_note("v1");
    h.engine.push_pending_changes().await.unwrap();
    let name = h.store.object(note.id).unwrap().text("recordName").unwrap().to_string();

    h.retitle(&name, "v2");
    h.remote.set_latency(Duration::from_millis(100));

    // The user edits again while v2 is on the wire
    let (pushed, ()) = tokio::join!(h.engine.push_pending_changes(), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.retitle(&name, "v3");
        assert_eq!(h.engine.dirty_count(), 1);
    });
    assert!(matches!(pushed.unwrap(), PushOutcome::Success));
    assert_eq!(remote_title(&h.remote, &name).as_deref(), Some("v2"));
    assert_eq!(h.engine.dirty_count(), 1);
    assert_eq!(h.engine.push_state(note.id), Some(PushState::Dirty));

    h.remote.set_latency(Duration::ZERO);
    assert!(matches!(
        h.engine.push_pending_changes().await.unwrap(),
        PushOutcome::Success
    ));
    assert_eq!(remote_title(&h.remote, &name).as_deref(), Some("v3"));
    assert_eq!(h.engine.dirty_count(), 0);
}

#[tokio::test]
async fn reenable_after_failed_pull() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();
    h.create_note("draft");
    h.engine.push_pending_changes().await.unwrap();

    h.remote
        .fail_next(RemoteOp::FetchDatabaseChanges, RemoteError::Other("boom".into()));
    assert!(h.engine.pull(Some(DatabaseScope::Shared)).await.is_err());

    // Provisioning must not be mistaken for the failed pull
    h.engine.disable();
    h.engine.enable().await.unwrap();
    assert_eq!(h.titles(), vec!["draft"]);
    assert_eq!(h.engine.dirty_count(), 0);
}

#[tokio::test]
async fn disable_during_pull_keeps_committed_state() {
    let h = Harness::new();
    h.engine.enable().await.unwrap();
    let ledger = h.engine.ledger();

    h.remote.put_record(remote_note("r1", "first"));
    h.remote.put_record(remote_note("r2", "second"));
    h.remote.set_latency(Duration::from_millis(50));

    // Disable while the zone fetch is in flight
    let (pulled, ()) = tokio::join!(h.engine.pull(Some(DatabaseScope::Private)), async {
        tokio::time::sleep(Duration::from_millis(75)).await;
        h.engine.disable();
    });
    assert!(matches!(pulled, Err(SyncError::Cancelled)));
    assert_eq!(h.engine.ledger(), ledger);
    assert_eq!(h.stored_ledger(), ledger);
    assert!(h.store.objects("Note").is_empty());

    h.remote.set_latency(Duration::ZERO);
    assert_eq!(h.engine.enable().await.unwrap(), PullResult::NewData);
    assert_eq!(h.titles(), vec!["first", "second"]);
}

#[tokio::test]
async fn full_resync_resolves_references_in_one_round() {
    let h = Harness::new();
    assert!(h.engine.ledger().zone_token(&zone()).is_none());

    // R2 points at R1 and arrives first; R3 is only a tombstone
    let r1 = RecordId::new("R1", zone());
    h.remote.put_record(
        remote_note("R2", "second").with_field("folder", FieldValue::Reference(r1.clone())),
    );
    h.remote.put_record(
        RemoteRecord::new(r1, "Folder").with_field("name", FieldValue::Text("first".into())),
    );
    h.remote.put_record(remote_note("R3", "gone"));
    assert!(h.remote.delete_record(&RecordId::new("R3", zone())));

    assert_eq!(h.engine.enable().await.unwrap(), PullResult::NewData);
    assert_eq!(h.remote.calls(RemoteOp::FetchZoneChanges), 1);

    let note = h.note("R2").unwrap();
    let folders = h.store.objects("Folder");
    assert_eq!(h.store.objects("Note").len() + folders.len(), 2);
    assert_eq!(folders[0].text("recordName"), Some("R1"));
    assert_eq!(note.related("folder").collect::<Vec<_>>(), vec![folders[0].id]);
    assert!(h.note("R3").is_none());

    let token = h.engine.ledger().zone_token(&zone()).cloned();
    assert!(token.is_some());
    assert_eq!(h.stored_ledger().zone_token(&zone()).cloned(), token);
}

/// Remote wrapper that detects a zone fetch running during a submission.
struct OverlapDetector {
    inner: Arc<MemoryRemote>,
    fetching: AtomicUsize,
    submitting: AtomicUsize,
    overlapped: AtomicBool,
}

impl OverlapDetector {
    fn new(inner: Arc<MemoryRemote>) -> Self {
        Self {
            inner,
            fetching: AtomicUsize::new(0),
            submitting: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        }
    }

    async fn observe(&self, mine: &AtomicUsize, other: &AtomicUsize) {
        mine.fetch_add(1, Ordering::SeqCst);
        for _ in 0..3 {
            if other.load(Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl RemoteStore for OverlapDetector {
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        token: Option<&ChangeToken>,
    ) -> Result<DatabaseChanges, RemoteError> {
        self.inner.fetch_database_changes(scope, token).await
    }

    async fn fetch_zone_changes(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
    ) -> Result<ZoneChangesPage, RemoteError> {
        self.observe(&self.fetching, &self.submitting).await;
        let page = self.inner.fetch_zone_changes(scope, zone, token).await;
        self.fetching.fetch_sub(1, Ordering::SeqCst);
        page
    }

    async fn modify_records(
        &self,
        scope: DatabaseScope,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RecordOutcome>, RemoteError> {
        self.observe(&self.submitting, &self.fetching).await;
        let outcomes = self.inner.modify_records(scope, saves, deletes).await;
        self.submitting.fetch_sub(1, Ordering::SeqCst);
        outcomes
    }

    async fn fetch_record(
        &self,
        scope: DatabaseScope,
        id: &RecordId,
    ) -> Result<RemoteRecord, RemoteError> {
        self.inner.fetch_record(scope, id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_rounds_and_push_cycles_do_not_overlap() {
    let remote = Arc::new(MemoryRemote::new());
    let detector = Arc::new(OverlapDetector::new(Arc::clone(&remote)));
    let h = Harness::with_remote(config(), detector.clone(), remote);
    h.remote.set_page_size(1);
    h.engine.enable().await.unwrap();

    for round in 0..3 {
        // Remote and local changes at the same time
        for i in 0..3 {
            h.remote
                .put_record(remote_note(&format!("r{round}-{i}"), "remote"));
        }
        h.create_note(&format!("local {round}"));

        let (pulled, pushed) = tokio::join!(h.engine.pull(None), h.engine.push_pending_changes());
        assert_eq!(pulled.unwrap(), PullResult::NewData);
        assert!(matches!(pushed.unwrap(), PushOutcome::Success));
    }

    assert!(!detector.overlapped.load(Ordering::SeqCst));
    assert_eq!(h.store.objects("Note").len(), 12);
}
