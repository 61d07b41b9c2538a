//! Upload of local changes.
//!
//! The push path observes commits made under the push context, keeps a set
//! of dirty objects and submits them to the remote store in one batch per
//! database scope. Each object moves through [`PushState`]:
//!
//! ```text
//! Dirty -> Converting -> Submitted -> Acknowledged
//!                                  -> Conflicted
//!                                  -> Failed
//! ```
//!
//! Conflicted and failed objects stay dirty and are submitted again by the
//! next cycle. Returned system fields are committed locally only after the
//! remote store acknowledged the save.

use crate::context::SyncContext;
use crate::converter::{Converter, MissingReferenceSet, PreparedRecord};
use crate::error::{SyncError, SyncResult};
use crate::model::{AttributeValue, LocalObject, LocalObjectId, ObjectModel, Predicate};
use crate::remote::RemoteError;
use crate::store::{CommitEvent, LocalStore, LocalTransaction};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, instrument, trace, warn};
use zonesync_protocol::{
    ConflictResolution, DatabaseScope, RecordConflict, RecordId, RecordOutcome, ZoneId,
};

/// Upload state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Changed locally, waiting for the next cycle.
    Dirty,
    /// Being converted to a record.
    Converting,
    /// Submitted, waiting for the outcome.
    Submitted,
    /// Saved or deleted remotely.
    Acknowledged,
    /// Rejected because the remote record changed.
    Conflicted,
    /// Rejected for another reason.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirtyEntry {
    Save { entity: String },
    Delete { record_id: RecordId },
}

/// Snapshot of the dirty set taken at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DirtySet {
    pub(crate) saves: BTreeMap<LocalObjectId, String>,
    pub(crate) deletes: BTreeMap<LocalObjectId, RecordId>,
    /// Generation of each entry when the snapshot was taken.
    pub(crate) generations: BTreeMap<LocalObjectId, u64>,
}

impl DirtySet {
    pub(crate) fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }
}

/// Tracks objects changed under the push context.
#[derive(Default)]
pub(crate) struct DirtyTracker {
    feed: Option<UnboundedReceiver<CommitEvent>>,
    entries: BTreeMap<LocalObjectId, DirtyEntry>,
    states: BTreeMap<LocalObjectId, PushState>,
    // Bumped on every mark.
    generation: u64,
    generations: BTreeMap<LocalObjectId, u64>,
}

impl DirtyTracker {
    pub(crate) fn attach(&mut self, feed: UnboundedReceiver<CommitEvent>) {
        self.feed = Some(feed);
    }

    pub(crate) fn detach(&mut self) {
        self.feed = None;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn state(&self, id: LocalObjectId) -> Option<PushState> {
        self.states.get(&id).copied()
    }

    pub(crate) fn set_state(&mut self, id: LocalObjectId, state: PushState) {
        if self.entries.contains_key(&id) {
            trace!(object = %id, ?state, "push state");
            self.states.insert(id, state);
        }
    }

    pub(crate) fn mark_save(&mut self, id: LocalObjectId, entity: impl Into<String>) {
        self.entries.insert(
            id,
            DirtyEntry::Save {
                entity: entity.into(),
            },
        );
        self.touch(id);
    }

    pub(crate) fn mark_delete(&mut self, id: LocalObjectId, record_id: RecordId) {
        self.entries.insert(id, DirtyEntry::Delete { record_id });
        self.touch(id);
    }

    fn touch(&mut self, id: LocalObjectId) {
        self.generation += 1;
        self.generations.insert(id, self.generation);
        self.states.insert(id, PushState::Dirty);
    }

    /// Forgets an object.
    pub(crate) fn clear(&mut self, id: LocalObjectId) {
        self.entries.remove(&id);
        self.states.remove(&id);
        self.generations.remove(&id);
    }

    /// Clears an acknowledged object unless it was marked again after the
    /// snapshot that saw generation `seen`. Returns whether it was cleared.
    pub(crate) fn settle(&mut self, id: LocalObjectId, seen: Option<u64>) -> bool {
        match self.generations.get(&id) {
            Some(current) if Some(*current) != seen => {
                trace!(object = %id, "changed during upload, stays dirty");
                self.states.insert(id, PushState::Dirty);
                false
            }
            _ => {
                trace!(object = %id, state = ?PushState::Acknowledged, "push state");
                self.clear(id);
                true
            }
        }
    }

    /// Drops pending deletes of records in `zone`.
    pub(crate) fn forget_deletes_in(&mut self, zone: &ZoneId) {
        let stale: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(entry, DirtyEntry::Delete { record_id } if &record_id.zone == zone)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.clear(id);
        }
    }

    pub(crate) fn snapshot(&self) -> DirtySet {
        let mut set = DirtySet::default();
        for (id, entry) in &self.entries {
            match entry {
                DirtyEntry::Save { entity } => {
                    set.saves.insert(*id, entity.clone());
                }
                DirtyEntry::Delete { record_id } => {
                    set.deletes.insert(*id, record_id.clone());
                }
            }
        }
        set.generations = self.generations.clone();
        set
    }

    /// Consumes queued commit events.
    pub(crate) fn drain(&mut self, converter: &Converter, model: &ObjectModel, origin: &str) {
        let mut events = Vec::new();
        if let Some(feed) = self.feed.as_mut() {
            while let Ok(event) = feed.try_recv() {
                events.push(event);
            }
        }
        for event in events {
            self.record(event, converter, model, origin);
        }
    }

    fn record(
        &mut self,
        event: CommitEvent,
        converter: &Converter,
        model: &ObjectModel,
        origin: &str,
    ) {
        if event.origin != origin {
            return;
        }
        for object in event.inserted {
            self.record_change(&object, converter, model);
        }
        for updated in event.updated {
            let Some(entity) = model.entity(&updated.object.entity) else {
                continue;
            };
            let relevant = updated
                .changed_keys
                .iter()
                .any(|key| entity.relationship(key).map_or(true, |r| r.is_sync_enabled()));
            if relevant {
                self.record_change(&updated.object, converter, model);
            } else {
                trace!(object = %updated.object.id, "only unsynchronized relationships changed");
            }
        }
        for object in event.deleted {
            let Ok(names) = converter.names_for(model, &object.entity) else {
                continue;
            };
            match converter.record_id_of(&object, &names) {
                Some(record_id) => self.mark_delete(object.id, record_id),
                None => self.clear(object.id),
            }
        }
    }

    fn record_change(&mut self, object: &LocalObject, converter: &Converter, model: &ObjectModel) {
        let Ok(names) = converter.names_for(model, &object.entity) else {
            return;
        };
        if !object.flag(&names.marked_for_deletion) {
            self.mark_save(object.id, object.entity.clone());
            return;
        }
        match converter.record_id_of(object, &names) {
            Some(record_id) => self.mark_delete(object.id, record_id),
            None => self.clear(object.id),
        }
    }
}

/// Per-cycle results of a push.
#[derive(Debug, Default)]
pub struct PushReport {
    /// Records saved remotely.
    pub saved: usize,
    /// Records deleted remotely.
    pub deleted: usize,
    /// Saves rejected because the remote record changed.
    pub conflicts: Vec<RecordConflict>,
    /// Other failures; the affected objects stay dirty.
    pub errors: Vec<SyncError>,
}

impl PushReport {
    /// Returns true if nothing was rejected.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.errors.is_empty()
    }

    /// Converts into the caller-facing outcome.
    pub fn into_outcome(self) -> PushOutcome {
        if self.is_clean() {
            return PushOutcome::Success;
        }
        let mut errors: Vec<SyncError> = self
            .conflicts
            .into_iter()
            .map(|conflict| SyncError::Conflict {
                record_id: conflict.record_id,
            })
            .collect();
        errors.extend(self.errors);
        PushOutcome::PartialFailure(errors)
    }
}

/// Outcome of [`SyncEngine::push_pending_changes`](crate::SyncEngine::push_pending_changes).
#[derive(Debug)]
pub enum PushOutcome {
    /// Every dirty object was uploaded.
    Success,
    /// Some objects were rejected and stay dirty.
    PartialFailure(Vec<SyncError>),
    /// Offline; nothing was submitted.
    Deferred,
}

#[derive(Default)]
struct Batch {
    saves: Vec<PreparedRecord>,
    deletes: Vec<(LocalObjectId, RecordId)>,
}

impl Batch {
    fn object_of(&self, record_id: &RecordId) -> Option<LocalObjectId> {
        self.saves
            .iter()
            .find(|prepared| &prepared.record.id == record_id)
            .map(|prepared| prepared.object)
            .or_else(|| {
                self.deletes
                    .iter()
                    .find(|(_, id)| id == record_id)
                    .map(|(object, _)| *object)
            })
    }
}

/// Runs one push cycle under the store gate.
///
/// A missing managed zone aborts the cycle with `ZoneNotFound`; other
/// submission errors are collected in the report.
#[instrument(name = "push_cycle", skip_all)]
pub(crate) async fn push_cycle<S: LocalStore>(ctx: &SyncContext<S>) -> SyncResult<PushReport> {
    let _gate = ctx.gate.lock().await;
    ctx.refresh_dirty();
    let pending = ctx.dirty.lock().snapshot();
    let mut report = PushReport::default();
    if pending.is_empty() {
        trace!("nothing to push");
        return Ok(report);
    }

    let delegate = ctx.delegate();
    delegate.will_sync_to_remote();
    info!(
        saves = pending.saves.len(),
        deletes = pending.deletes.len(),
        "push started"
    );

    let batches = prepare_batches(ctx, &pending, &mut report)?;
    for (scope, batch) in batches {
        let saves = batch
            .saves
            .iter()
            .map(|prepared| prepared.record.clone())
            .collect();
        let deletes = batch.deletes.iter().map(|(_, id)| id.clone()).collect();
        set_batch_state(ctx, &batch, PushState::Submitted);

        let outcomes = match ctx.remote.modify_records(scope, saves, deletes).await {
            Ok(outcomes) => outcomes,
            Err(err @ RemoteError::ZoneNotFound(_)) => {
                set_batch_state(ctx, &batch, PushState::Failed);
                return Err(err.into());
            }
            Err(err) => {
                warn!(scope = scope.as_str(), error = %err, "submission failed");
                set_batch_state(ctx, &batch, PushState::Failed);
                report.errors.push(err.into());
                continue;
            }
        };
        acknowledge(ctx, &pending, &batch, outcomes, &mut report);
        // Staged asset files are removed here
        drop(batch);
    }

    for conflict in &report.conflicts {
        delegate.on_conflict(conflict);
    }
    {
        let mut stats = ctx.stats.write();
        stats.pushes_completed += 1;
        stats.records_pushed += (report.saved + report.deleted) as u64;
        stats.conflicts_encountered += report.conflicts.len() as u64;
    }
    info!(
        saved = report.saved,
        deleted = report.deleted,
        conflicts = report.conflicts.len(),
        errors = report.errors.len(),
        "push finished"
    );
    delegate.did_sync_to_remote(&report);
    Ok(report)
}

fn set_batch_state<S: LocalStore>(ctx: &SyncContext<S>, batch: &Batch, state: PushState) {
    let mut dirty = ctx.dirty.lock();
    for prepared in &batch.saves {
        dirty.set_state(prepared.object, state);
    }
    for (object, _) in &batch.deletes {
        dirty.set_state(*object, state);
    }
}

/// Assigns identities, then converts dirty objects into per-scope batches.
fn prepare_batches<S: LocalStore>(
    ctx: &SyncContext<S>,
    pending: &DirtySet,
    report: &mut PushReport,
) -> SyncResult<BTreeMap<DatabaseScope, Batch>> {
    let model = ctx.model();
    let converter = &ctx.converter;
    let mut txn = ctx.store.begin(&ctx.config.sync_context_name);
    let mut vanished = Vec::new();
    let mut objects = Vec::with_capacity(pending.saves.len());

    for &id in pending.saves.keys() {
        let Some(mut object) = txn.get(id) else {
            vanished.push(id);
            continue;
        };
        let Ok(names) = converter.names_for(model, &object.entity) else {
            vanished.push(id);
            continue;
        };
        if converter.prepare_identity(&mut object, &names) {
            txn.save(object.clone())?;
        }
        objects.push((object, names));
    }

    let mut batches: BTreeMap<DatabaseScope, Batch> = BTreeMap::new();
    let mut dirty_states = Vec::new();
    for (object, names) in objects {
        dirty_states.push((object.id, PushState::Converting));
        let scope = match converter.record_id_of(&object, &names) {
            Some(record_id) => DatabaseScope::for_owner(record_id.owner_name()),
            None => DatabaseScope::Private,
        };
        if !names.participates_in(scope) {
            debug!(entity = %object.entity, scope = scope.as_str(), "entity does not sync in scope");
            vanished.push(object.id);
            continue;
        }
        match converter.object_to_record(&object, &txn, model) {
            Ok(prepared) => batches.entry(scope).or_default().saves.push(prepared),
            Err(err) => {
                warn!(object = %object.id, error = %err, "conversion failed");
                dirty_states.push((object.id, PushState::Failed));
                report.errors.push(err);
            }
        }
    }
    for (&id, record_id) in &pending.deletes {
        batches
            .entry(DatabaseScope::for_owner(record_id.owner_name()))
            .or_default()
            .deletes
            .push((id, record_id.clone()));
    }

    if txn.has_changes() {
        ctx.store.commit(txn)?;
    }

    let mut dirty = ctx.dirty.lock();
    for id in vanished {
        dirty.clear(id);
    }
    for (id, state) in dirty_states {
        dirty.set_state(id, state);
    }
    Ok(batches)
}

/// Applies per-record outcomes and commits returned system fields.
fn acknowledge<S: LocalStore>(
    ctx: &SyncContext<S>,
    pending: &DirtySet,
    batch: &Batch,
    outcomes: Vec<RecordOutcome>,
    report: &mut PushReport,
) {
    let model = ctx.model();
    let mut txn = ctx.store.begin(&ctx.config.sync_context_name);
    let mut acknowledged = Vec::new();
    let mut rejected = Vec::new();
    let mut saved = 0;
    let mut deleted = 0;

    for outcome in outcomes {
        let Some(object_id) = batch.object_of(outcome.record_id()) else {
            debug!(record = %outcome.record_id(), "outcome for unknown record ignored");
            continue;
        };
        match outcome {
            RecordOutcome::Saved(record) => {
                if let Some(mut object) = txn.get(object_id) {
                    if let (Ok(names), Some(system_fields)) = (
                        ctx.converter.names_for(model, &object.entity),
                        record.system_fields.as_ref(),
                    ) {
                        object.set(
                            names.record_data.clone(),
                            AttributeValue::Bytes(system_fields.to_vec()),
                        );
                        if let Err(err) = txn.save(object) {
                            report.errors.push(err.into());
                            rejected.push((object_id, PushState::Failed));
                            continue;
                        }
                    }
                }
                acknowledged.push(object_id);
                saved += 1;
            }
            RecordOutcome::Deleted(_) => {
                txn.delete(object_id);
                acknowledged.push(object_id);
                deleted += 1;
            }
            RecordOutcome::Conflict { id, server } => {
                debug!(record = %id, "record changed on the server");
                if let Some(local) = batch
                    .saves
                    .iter()
                    .find(|prepared| prepared.object == object_id)
                {
                    report
                        .conflicts
                        .push(RecordConflict::new(local.record.clone(), server));
                }
                rejected.push((object_id, PushState::Conflicted));
            }
            RecordOutcome::Failed { id, message } => {
                warn!(record = %id, %message, "record rejected");
                report.errors.push(RemoteError::Other(message).into());
                rejected.push((object_id, PushState::Failed));
            }
        }
    }

    let committed = match ctx.store.commit(txn) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "acknowledgement commit failed, objects stay dirty");
            report.errors.push(err.into());
            false
        }
    };

    let mut dirty = ctx.dirty.lock();
    if committed {
        for id in acknowledged {
            dirty.settle(id, pending.generations.get(&id).copied());
        }
        report.saved += saved;
        report.deleted += deleted;
    } else {
        for id in acknowledged {
            dirty.set_state(id, PushState::Failed);
        }
    }
    for (id, state) in rejected {
        dirty.set_state(id, state);
    }
}

/// Prepares a full re-upload of everything owned in `zone`.
///
/// Stored system fields are dropped, since the remote history is gone.
/// Tombstoned objects are deleted locally instead.
pub(crate) async fn mark_zone_for_reupload<S: LocalStore>(
    ctx: &SyncContext<S>,
    zone: &ZoneId,
) -> SyncResult<usize> {
    let _gate = ctx.gate.lock().await;
    let model = ctx.model();
    let mut txn = ctx.store.begin(&ctx.config.sync_context_name);
    let mut marked = Vec::new();

    for (entity, names) in ctx.converter.syncable_entities(model) {
        let predicate = Predicate::equals(
            names.owner_name.clone(),
            AttributeValue::Text(zone.owner_name.clone()),
        );
        for mut object in txn.fetch(&entity.name, &predicate)? {
            if object.flag(&names.marked_for_deletion) {
                txn.delete(object.id);
                continue;
            }
            object.set(names.record_data.clone(), AttributeValue::Null);
            marked.push((object.id, entity.name.clone()));
            txn.save(object)?;
        }
    }
    ctx.store.commit(txn)?;

    let mut dirty = ctx.dirty.lock();
    dirty.forget_deletes_in(zone);
    for (id, entity) in &marked {
        dirty.mark_save(*id, entity.clone());
    }
    info!(zone = %zone, objects = marked.len(), "zone marked for re-upload");
    Ok(marked.len())
}

/// Applies a caller's decision on a conflict.
///
/// `AcceptRemote` overwrites the object with the server record and clears
/// its dirty mark. `KeepLocal` adopts the server's version stamp so the next
/// push overwrites the server record.
pub(crate) async fn resolve_conflict<S: LocalStore>(
    ctx: &SyncContext<S>,
    conflict: &RecordConflict,
    resolution: ConflictResolution,
) -> SyncResult<()> {
    let _gate = ctx.gate.lock().await;
    ctx.refresh_dirty();
    let model = ctx.model();
    let converter = &ctx.converter;
    let mut txn = ctx.store.begin(&ctx.config.sync_context_name);

    let Some(mut object) = converter.find_by_record_id(&txn, model, &conflict.record_id)? else {
        debug!(record = %conflict.record_id, "conflicting object no longer exists");
        return Ok(());
    };

    match resolution {
        ConflictResolution::AcceptRemote => {
            let mut missing = MissingReferenceSet::new();
            if let Some(conversion) = converter.record_to_object(&conflict.server, &mut txn, model)? {
                missing.insert(conversion.object, conversion.missing);
            }
            converter.resolve_missing(&mut txn, model, &mut missing)?;
            ctx.store.commit(txn)?;
            ctx.dirty.lock().clear(object.id);
        }
        ConflictResolution::KeepLocal => {
            let names = converter.names_for(model, &object.entity)?;
            if let Some(system_fields) = &conflict.server.system_fields {
                object.set(
                    names.record_data.clone(),
                    AttributeValue::Bytes(system_fields.to_vec()),
                );
                txn.save(object.clone())?;
            }
            ctx.store.commit(txn)?;
            ctx.dirty.lock().mark_save(object.id, object.entity.clone());
        }
    }
    info!(record = %conflict.record_id, ?resolution, "conflict resolved");
    Ok(())
}
