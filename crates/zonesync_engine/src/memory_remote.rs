//! In-memory remote store.

use crate::remote::{RemoteError, RemoteStore, ZoneProvisioner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use zonesync_protocol::{
    ChangeToken, DatabaseChanges, DatabaseScope, FieldValue, RecordId, RecordOutcome,
    RemoteRecord, SystemFields, ZoneChange, ZoneChangesPage, ZoneId,
};

/// Operations of [`MemoryRemote`] that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// `fetch_database_changes`.
    FetchDatabaseChanges,
    /// `fetch_zone_changes`.
    FetchZoneChanges,
    /// `modify_records`.
    ModifyRecords,
    /// `fetch_record`.
    FetchRecord,
    /// `create_zone`.
    CreateZone,
    /// `delete_zone`.
    DeleteZone,
}

struct ZoneState {
    epoch: u64,
    records: BTreeMap<String, RemoteRecord>,
    // (record name, record type) per change, in commit order
    log: Vec<(String, String)>,
}

#[derive(Default)]
struct ScopeState {
    zones: BTreeMap<ZoneId, ZoneState>,
    user_deleted: BTreeSet<ZoneId>,
    // (zone, deleted) per zone-level change
    db_log: Vec<(ZoneId, bool)>,
}

#[derive(Default)]
struct RemoteState {
    scopes: BTreeMap<DatabaseScope, ScopeState>,
    next_epoch: u64,
    next_tag: u64,
    clock_ms: i64,
}

impl RemoteState {
    fn scope(&mut self, scope: DatabaseScope) -> &mut ScopeState {
        self.scopes.entry(scope).or_default()
    }

    fn create_zone(&mut self, zone: &ZoneId) -> bool {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let scope = self.scope(DatabaseScope::for_owner(&zone.owner_name));
        if scope.zones.contains_key(zone) {
            return false;
        }
        scope.zones.insert(
            zone.clone(),
            ZoneState {
                epoch,
                records: BTreeMap::new(),
                log: Vec::new(),
            },
        );
        scope.user_deleted.remove(zone);
        scope.db_log.push((zone.clone(), false));
        true
    }

    fn zone_mut(&mut self, scope: DatabaseScope, zone: &ZoneId) -> Result<&mut ZoneState, RemoteError> {
        let state = self.scope(scope);
        if state.user_deleted.contains(zone) {
            return Err(RemoteError::UserDeletedZone(zone.clone()));
        }
        state
            .zones
            .get_mut(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.clone()))
    }

    /// Stores a record with fresh system fields. Returns the stored record.
    fn store(&mut self, scope: DatabaseScope, record: RemoteRecord) -> Result<RemoteRecord, String> {
        self.next_tag += 1;
        self.clock_ms += 1;
        let change_tag = self.next_tag.to_string();
        let now = self.clock_ms;

        let fields = record
            .fields
            .into_iter()
            .map(|(name, value)| match value {
                FieldValue::Asset(asset) => std::fs::read(&asset.path)
                    .map(|bytes| (name, FieldValue::Bytes(bytes)))
                    .map_err(|e| format!("asset {} unreadable: {e}", asset.path.display())),
                other => Ok((name, other)),
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let zone = self
            .zone_mut(scope, &record.id.zone)
            .map_err(|e| e.to_string())?;
        let created_at_ms = zone
            .records
            .get(&record.id.record_name)
            .and_then(|existing| existing.decoded_system_fields().ok().flatten())
            .map_or(now, |existing| existing.created_at_ms);
        let system_fields = SystemFields {
            record_id: record.id.clone(),
            record_type: record.record_type.clone(),
            change_tag: Some(change_tag),
            created_at_ms,
            modified_at_ms: now,
        }
        .encode()
        .map_err(|e| e.to_string())?;

        let stored = RemoteRecord {
            id: record.id.clone(),
            record_type: record.record_type,
            fields,
            system_fields: Some(system_fields),
        };
        zone.log
            .push((stored.id.record_name.clone(), stored.record_type.clone()));
        zone.records
            .insert(stored.id.record_name.clone(), stored.clone());
        Ok(stored)
    }

    fn remove(&mut self, scope: DatabaseScope, id: &RecordId) -> Result<bool, RemoteError> {
        let zone = self.zone_mut(scope, &id.zone)?;
        match zone.records.remove(&id.record_name) {
            Some(removed) => {
                zone.log.push((id.record_name.clone(), removed.record_type));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn touch(&mut self, scope: DatabaseScope, zones: impl IntoIterator<Item = ZoneId>) {
        let state = self.scope(scope);
        for zone in zones {
            state.db_log.push((zone, false));
        }
    }
}

fn zone_token(epoch: u64, position: usize) -> ChangeToken {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&epoch.to_be_bytes());
    bytes.extend_from_slice(&(position as u64).to_be_bytes());
    ChangeToken::from_bytes(bytes)
}

fn parse_zone_token(token: &ChangeToken) -> Option<(u64, usize)> {
    let bytes: [u8; 16] = token.as_bytes().try_into().ok()?;
    let (epoch, position) = bytes.split_at(8);
    Some((
        u64::from_be_bytes(epoch.try_into().ok()?),
        usize::try_from(u64::from_be_bytes(position.try_into().ok()?)).ok()?,
    ))
}

fn parse_position_token(token: &ChangeToken) -> Option<usize> {
    let bytes: [u8; 8] = token.as_bytes().try_into().ok()?;
    usize::try_from(u64::from_be_bytes(bytes)).ok()
}

/// An in-memory zoned record store.
///
/// Implements both [`RemoteStore`] and [`ZoneProvisioner`] with version
/// stamps, paged change feeds, token expiry and zone deletion. Helpers let
/// tests write records as another device would and inject faults.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    faults: Mutex<HashMap<RemoteOp, VecDeque<RemoteError>>>,
    calls: Mutex<HashMap<RemoteOp, usize>>,
    page_size: AtomicUsize,
    latency_ms: AtomicU64,
}

impl MemoryRemote {
    /// Creates an empty store with a page size of 100.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            page_size: AtomicUsize::new(100),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Sets the maximum number of changes per zone round.
    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Delays every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the next call of `op` fail with `error`. Faults queue up.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.faults.lock().entry(op).or_default().push_back(error);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Writes a record as another device would, ignoring version stamps.
    ///
    /// Creates the zone if it does not exist.
    pub fn put_record(&self, record: RemoteRecord) -> RemoteRecord {
        let mut state = self.state.lock();
        let zone = record.id.zone.clone();
        let scope = DatabaseScope::for_owner(&zone.owner_name);
        state.create_zone(&zone);
        let fallback = record.clone();
        let stored = state.store(scope, record).unwrap_or(fallback);
        state.touch(scope, [zone]);
        stored
    }

    /// Deletes a record as another device would.
    pub fn delete_record(&self, id: &RecordId) -> bool {
        let mut state = self.state.lock();
        let scope = DatabaseScope::for_owner(id.owner_name());
        let removed = state.remove(scope, id).unwrap_or(false);
        if removed {
            state.touch(scope, [id.zone.clone()]);
        }
        removed
    }

    /// Deletes a zone as the user would from another device.
    ///
    /// Later zone fetches fail with `UserDeletedZone`.
    pub fn user_delete_zone(&self, zone: &ZoneId) {
        let mut state = self.state.lock();
        let scope = state.scope(DatabaseScope::for_owner(&zone.owner_name));
        scope.zones.remove(zone);
        scope.user_deleted.insert(zone.clone());
        scope.db_log.push((zone.clone(), true));
    }

    /// Removes a zone without a change-feed entry, as a server-side reset would.
    pub fn reset_zone(&self, zone: &ZoneId) {
        let mut state = self.state.lock();
        state
            .scope(DatabaseScope::for_owner(&zone.owner_name))
            .zones
            .remove(zone);
    }

    /// Invalidates every token issued for a zone.
    pub fn expire_zone_tokens(&self, zone: &ZoneId) {
        let mut state = self.state.lock();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        if let Some(zone) = state
            .scope(DatabaseScope::for_owner(&zone.owner_name))
            .zones
            .get_mut(zone)
        {
            zone.epoch = epoch;
        }
    }

    /// Returns true if the zone exists.
    pub fn zone_exists(&self, zone: &ZoneId) -> bool {
        let mut state = self.state.lock();
        state
            .scope(DatabaseScope::for_owner(&zone.owner_name))
            .zones
            .contains_key(zone)
    }

    /// Gets a stored record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        let mut state = self.state.lock();
        state
            .scope(DatabaseScope::for_owner(id.owner_name()))
            .zones
            .get(&id.zone)
            .and_then(|zone| zone.records.get(&id.record_name).cloned())
    }

    /// All records stored in a zone.
    pub fn records(&self, zone: &ZoneId) -> Vec<RemoteRecord> {
        let mut state = self.state.lock();
        state
            .scope(DatabaseScope::for_owner(&zone.owner_name))
            .zones
            .get(zone)
            .map(|zone| zone.records.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        match self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        token: Option<&ChangeToken>,
    ) -> Result<DatabaseChanges, RemoteError> {
        self.enter(RemoteOp::FetchDatabaseChanges).await?;
        let mut state = self.state.lock();
        let log = &state.scope(scope).db_log;

        let start = match token {
            None => 0,
            Some(token) => match parse_position_token(token) {
                Some(position) if position <= log.len() => position,
                _ => return Err(RemoteError::ChangeTokenExpired),
            },
        };

        let mut latest: BTreeMap<&ZoneId, bool> = BTreeMap::new();
        for (zone, deleted) in &log[start..] {
            latest.insert(zone, *deleted);
        }
        let mut changes = DatabaseChanges::empty(Some(ChangeToken::from_bytes(
            (log.len() as u64).to_be_bytes().to_vec(),
        )));
        for (zone, deleted) in latest {
            if deleted {
                changes.deleted_zones.push(zone.clone());
            } else {
                changes.changed_zones.push(zone.clone());
            }
        }
        Ok(changes)
    }

    async fn fetch_zone_changes(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
    ) -> Result<ZoneChangesPage, RemoteError> {
        self.enter(RemoteOp::FetchZoneChanges).await?;
        let page_size = self.page_size.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        let zone_state = state.zone_mut(scope, zone)?;

        let start = match token {
            None => 0,
            Some(token) => match parse_zone_token(token) {
                Some((epoch, position))
                    if epoch == zone_state.epoch && position <= zone_state.log.len() =>
                {
                    position
                }
                _ => return Err(RemoteError::ChangeTokenExpired),
            },
        };
        let end = (start + page_size).min(zone_state.log.len());

        let changes = zone_state.log[start..end]
            .iter()
            .map(|(record_name, record_type)| match zone_state.records.get(record_name) {
                Some(record) => ZoneChange::Changed(record.clone()),
                None => ZoneChange::Deleted {
                    id: RecordId::new(record_name.clone(), zone.clone()),
                    record_type: record_type.clone(),
                },
            })
            .collect();

        Ok(ZoneChangesPage::new(
            zone.clone(),
            changes,
            Some(zone_token(zone_state.epoch, end)),
            end < zone_state.log.len(),
        ))
    }

    async fn modify_records(
        &self,
        scope: DatabaseScope,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RecordOutcome>, RemoteError> {
        self.enter(RemoteOp::ModifyRecords).await?;
        let mut state = self.state.lock();

        let zones: BTreeSet<ZoneId> = saves
            .iter()
            .map(|record| record.id.zone.clone())
            .chain(deletes.iter().map(|id| id.zone.clone()))
            .collect();
        for zone in &zones {
            state.zone_mut(scope, zone).map_err(|e| match e {
                RemoteError::UserDeletedZone(zone) => RemoteError::ZoneNotFound(zone),
                other => other,
            })?;
        }

        let mut outcomes = Vec::with_capacity(saves.len() + deletes.len());
        for record in saves {
            let current = state
                .zone_mut(scope, &record.id.zone)?
                .records
                .get(&record.id.record_name)
                .cloned();
            if let Some(server) = current {
                if server.change_tag() != record.change_tag() {
                    outcomes.push(RecordOutcome::Conflict {
                        id: record.id.clone(),
                        server,
                    });
                    continue;
                }
            }
            let id = record.id.clone();
            match state.store(scope, record) {
                Ok(stored) => outcomes.push(RecordOutcome::Saved(stored)),
                Err(message) => outcomes.push(RecordOutcome::Failed { id, message }),
            }
        }
        for id in deletes {
            state.remove(scope, &id)?;
            outcomes.push(RecordOutcome::Deleted(id));
        }

        state.touch(scope, zones);
        Ok(outcomes)
    }

    async fn fetch_record(
        &self,
        scope: DatabaseScope,
        id: &RecordId,
    ) -> Result<RemoteRecord, RemoteError> {
        self.enter(RemoteOp::FetchRecord).await?;
        let mut state = self.state.lock();
        state
            .zone_mut(scope, &id.zone)?
            .records
            .get(&id.record_name)
            .cloned()
            .ok_or_else(|| RemoteError::UnknownItem(id.clone()))
    }
}

#[async_trait]
impl ZoneProvisioner for MemoryRemote {
    async fn create_zone(&self, zone: &ZoneId) -> Result<(), RemoteError> {
        self.enter(RemoteOp::CreateZone).await?;
        self.state.lock().create_zone(zone);
        Ok(())
    }

    async fn delete_zone(&self, zone: &ZoneId) -> Result<(), RemoteError> {
        self.enter(RemoteOp::DeleteZone).await?;
        let mut state = self.state.lock();
        let scope = state.scope(DatabaseScope::for_owner(&zone.owner_name));
        if scope.zones.remove(zone).is_none() {
            return Err(RemoteError::ZoneNotFound(zone.clone()));
        }
        scope.db_log.push((zone.clone(), true));
        Ok(())
    }
}
