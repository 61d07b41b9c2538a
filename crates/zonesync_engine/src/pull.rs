//! Download of remote changes.
//!
//! A pull session walks one database scope:
//!
//! ```text
//! Idle -> FetchingZoneList -> ApplyingZoneChanges -> Done
//! ```
//!
//! and each changed zone in rounds:
//!
//! ```text
//! Fetching -> Applying -> Committed -> (PendingMoreData -> Fetching)*
//! ```
//!
//! A round converts changed records, deletes removed ones, links references
//! that became resolvable and commits all of it together with the zone's new
//! token in one local transaction. References to records not seen yet are
//! carried to later rounds of the same session.

use crate::context::SyncContext;
use crate::converter::MissingReferenceSet;
use crate::error::{SyncError, SyncResult, SyncStage};
use crate::remote::RemoteError;
use crate::scheduler::{TaskId, TaskQueue};
use crate::store::LocalStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;
use zonesync_protocol::{
    DatabaseScope, RemoteRecord, TokenLedger, ZoneChange, ZoneChangesPage, ZoneId,
};

/// Whether a pull brought anything new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    /// Nothing changed locally.
    NoData,
    /// Local objects were created, updated or deleted.
    NewData,
}

impl PullResult {
    /// Combines the results of two pulls.
    pub fn merge(self, other: PullResult) -> PullResult {
        match (self, other) {
            (PullResult::NoData, PullResult::NoData) => PullResult::NoData,
            _ => PullResult::NewData,
        }
    }
}

/// Progress of a scope session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    /// Not started.
    Idle,
    /// Fetching changed and deleted zones.
    FetchingZoneList,
    /// Pulling changed zones.
    ApplyingZoneChanges,
    /// Finished.
    Done,
}

/// Progress of a zone within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePhase {
    /// Fetching a round of changes.
    Fetching,
    /// More rounds are waiting.
    PendingMoreData,
    /// Applying a round locally.
    Applying,
    /// The round and its token are committed.
    Committed,
}

/// Identifier of a self-initiated zone deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeleteRequestId(Uuid);

impl DeleteRequestId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeleteRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zone deletions the engine requested itself.
///
/// The deleted-zone signal caused by such a request must not purge local
/// data. Each request suppresses exactly one signal.
#[derive(Default)]
pub(crate) struct PendingZoneDeletions {
    // In registration order.
    requests: Mutex<Vec<(DeleteRequestId, ZoneId)>>,
}

impl PendingZoneDeletions {
    pub(crate) fn register(&self, zone: ZoneId) -> DeleteRequestId {
        let id = DeleteRequestId::new();
        self.requests.lock().push((id, zone));
        id
    }

    /// Consumes the oldest request for `zone`, if any.
    pub(crate) fn consume(&self, zone: &ZoneId) -> Option<DeleteRequestId> {
        let mut requests = self.requests.lock();
        let index = requests.iter().position(|(_, pending)| pending == zone)?;
        Some(requests.remove(index).0)
    }

    pub(crate) fn cancel(&self, id: DeleteRequestId) -> bool {
        let mut requests = self.requests.lock();
        match requests.iter().position(|(pending, _)| *pending == id) {
            Some(index) => {
                requests.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

/// How a failed round is recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RoundRecovery {
    /// Back off and fetch again from the last committed token.
    Retry,
    /// Drop the zone token and start over.
    ResetToken,
    /// The zone is gone; purge its local data.
    Purge(ZoneId),
    /// Give up and report.
    Surface,
}

pub(crate) fn recovery_for(err: &SyncError) -> RoundRecovery {
    match err.as_remote() {
        Some(RemoteError::NetworkFailure(_)) => RoundRecovery::Retry,
        Some(RemoteError::ChangeTokenExpired) => RoundRecovery::ResetToken,
        Some(RemoteError::UserDeletedZone(zone)) | Some(RemoteError::ZoneNotFound(zone)) => {
            RoundRecovery::Purge(zone.clone())
        }
        _ => RoundRecovery::Surface,
    }
}

/// Pulls one database scope to completion.
#[instrument(name = "pull_session", skip_all, fields(scope = scope.as_str()))]
pub(crate) async fn pull_scope<S: LocalStore + 'static>(
    ctx: &Arc<SyncContext<S>>,
    scope: DatabaseScope,
) -> SyncResult<PullResult> {
    let mut session = PullSession::new(ctx, scope);
    let outcome = session.run().await;
    session.finish();
    outcome.map(|()| session.result)
}

struct PullSession<'a, S: LocalStore + 'static> {
    ctx: &'a Arc<SyncContext<S>>,
    scope: DatabaseScope,
    phase: ScopePhase,
    /// Serial queue for the zones of this session. Dropped with the session.
    zones: TaskQueue,
    missing: Arc<Mutex<MissingReferenceSet>>,
    result: PullResult,
    applied: u64,
}

impl<'a, S: LocalStore + 'static> PullSession<'a, S> {
    fn new(ctx: &'a Arc<SyncContext<S>>, scope: DatabaseScope) -> Self {
        Self {
            ctx,
            scope,
            phase: ScopePhase::Idle,
            zones: TaskQueue::new(format!("zones-{scope}"), 1),
            missing: Arc::new(Mutex::new(MissingReferenceSet::new())),
            result: PullResult::NoData,
            applied: 0,
        }
    }

    fn enter(&mut self, phase: ScopePhase) {
        trace!(from = ?self.phase, to = ?phase, "scope phase");
        self.phase = phase;
    }

    async fn run(&mut self) -> SyncResult<()> {
        let ctx = Arc::clone(self.ctx);
        let mut attempt = 0;
        let mut token_reset = false;

        loop {
            self.enter(ScopePhase::FetchingZoneList);
            let token = ctx.ledger.lock().scope_token(self.scope).cloned();
            let changes = match ctx
                .remote
                .fetch_database_changes(self.scope, token.as_ref())
                .await
            {
                Ok(changes) => {
                    attempt = 0;
                    changes
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if !backoff(&ctx, attempt, err.to_string()).await {
                        return Err(err.into());
                    }
                    continue;
                }
                Err(RemoteError::ChangeTokenExpired) if !token_reset => {
                    token_reset = true;
                    warn!("scope token expired, fetching zone list from the start");
                    let _gate = ctx.gate.lock().await;
                    ctx.update_ledger(|ledger| {
                        ledger.reset_scope(self.scope);
                    })?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            debug!(
                changed = changes.changed_zones.len(),
                deleted = changes.deleted_zones.len(),
                more_coming = changes.more_coming,
                "zone list fetched"
            );

            self.enter(ScopePhase::ApplyingZoneChanges);
            for zone in &changes.deleted_zones {
                if zone_deleted(&ctx, zone).await? {
                    self.result = PullResult::NewData;
                }
            }
            self.pull_zones(&changes.changed_zones).await?;

            if changes.new_token.is_some() {
                let _gate = ctx.gate.lock().await;
                ctx.update_ledger(|ledger| {
                    ledger.set_scope_token(self.scope, changes.new_token.clone());
                })?;
            }
            if !changes.more_coming {
                break;
            }
        }
        Ok(())
    }

    /// Runs one task per zone, each depending on the one before it.
    ///
    /// The first failure is returned and the zones after it are cancelled.
    async fn pull_zones(&mut self, zones: &[ZoneId]) -> SyncResult<()> {
        let mut handles = Vec::with_capacity(zones.len());
        let mut previous: Option<TaskId> = None;
        for zone in zones {
            let pull = ZonePull {
                ctx: Arc::clone(self.ctx),
                scope: self.scope,
                zone: zone.clone(),
                missing: Arc::clone(&self.missing),
            };
            let dependencies: Vec<TaskId> = previous.into_iter().collect();
            let handle = self
                .zones
                .submit(&format!("zone-{zone}"), &dependencies, pull.run());
            previous = Some(handle.id());
            handles.push((zone, handle));
        }

        let mut first_error = None;
        for (zone, handle) in handles {
            match handle.join().await {
                Ok(outcome) => {
                    if outcome.changed {
                        self.result = PullResult::NewData;
                    }
                    self.applied += outcome.applied;
                }
                Err(SyncError::Cancelled) if first_error.is_some() => {
                    debug!(%zone, "zone skipped after an earlier failure");
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => self.ctx.report_error(&err, SyncStage::Pull),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn finish(&mut self) {
        self.enter(ScopePhase::Done);
        let missing = self.missing.lock();
        for (object, references) in missing.iter() {
            for (relationship, targets) in references {
                warn!(
                    %object,
                    %relationship,
                    unresolved = targets.len(),
                    "references still unresolved at end of pull"
                );
            }
        }
        let mut stats = self.ctx.stats.write();
        stats.records_pulled += self.applied;
    }
}

/// What one zone task changed locally.
#[derive(Debug, Default)]
struct ZoneOutcome {
    applied: u64,
    changed: bool,
}

/// Round-by-round pull of one zone, run as a task of its session.
struct ZonePull<S: LocalStore> {
    ctx: Arc<SyncContext<S>>,
    scope: DatabaseScope,
    zone: ZoneId,
    missing: Arc<Mutex<MissingReferenceSet>>,
}

impl<S: LocalStore> ZonePull<S> {
    #[instrument(name = "pull_zone", skip_all, fields(zone = %self.zone))]
    async fn run(self) -> SyncResult<ZoneOutcome> {
        let mut outcome = ZoneOutcome::default();
        let mut attempt = 0;
        let mut token_reset = false;

        loop {
            let checkpoint = self.missing.lock().clone();
            let err = match self.round(&mut outcome).await {
                Ok(true) => {
                    attempt = 0;
                    trace!(phase = ?ZonePhase::PendingMoreData, "zone phase");
                    continue;
                }
                Ok(false) => return Ok(outcome),
                Err(err) => err,
            };

            *self.missing.lock() = checkpoint;
            match recovery_for(&err) {
                RoundRecovery::Retry => {
                    attempt += 1;
                    if !backoff(&self.ctx, attempt, err.to_string()).await {
                        return Err(err);
                    }
                }
                RoundRecovery::ResetToken if !token_reset => {
                    token_reset = true;
                    warn!("zone token expired, refetching the zone from the start");
                    let _gate = self.ctx.gate.lock().await;
                    self.ctx.update_ledger(|ledger| {
                        ledger.reset_zone(&self.zone);
                    })?;
                }
                RoundRecovery::Purge(deleted) => {
                    outcome.changed |= zone_deleted(&self.ctx, &deleted).await?;
                    return Ok(outcome);
                }
                RoundRecovery::ResetToken | RoundRecovery::Surface => return Err(err),
            }
        }
    }

    /// Fetches and applies one round. Returns whether more rounds are waiting.
    async fn round(&self, outcome: &mut ZoneOutcome) -> SyncResult<bool> {
        let ctx: &SyncContext<S> = &self.ctx;
        let zone = &self.zone;
        let _gate = ctx.gate.lock().await;

        trace!(phase = ?ZonePhase::Fetching, "zone phase");
        let token = ctx.ledger.lock().zone_token(zone).cloned();
        let page = ctx
            .remote
            .fetch_zone_changes(self.scope, zone, token.as_ref())
            .await?;

        let mut share_roots = Vec::new();
        for change in &page.changes {
            let ZoneChange::Changed(record) = change else {
                continue;
            };
            let Some(root) = record.share_root() else {
                continue;
            };
            match ctx.remote.fetch_record(self.scope, root).await {
                Ok(root) => share_roots.push(root),
                Err(RemoteError::UnknownItem(id)) => debug!(record = %id, "shared root is gone"),
                Err(err) => return Err(err.into()),
            }
        }

        trace!(phase = ?ZonePhase::Applying, "zone phase");
        let (applied, ledger) = {
            let mut missing = self.missing.lock();
            apply_round(ctx, &page, &share_roots, &mut missing)?
        };
        *ctx.ledger.lock() = ledger;
        trace!(phase = ?ZonePhase::Committed, "zone phase");

        let unresolved = self.missing.lock().len();
        debug!(
            changed = page.changed_count(),
            deleted = page.deleted_count(),
            applied,
            unresolved,
            more_coming = page.more_coming,
            "round committed"
        );
        if applied > 0 {
            outcome.changed = true;
            outcome.applied += applied as u64;
        }
        Ok(page.more_coming)
    }
}

/// Waits before a retry. Returns false once the retry budget is spent.
async fn backoff<S: LocalStore>(ctx: &SyncContext<S>, attempt: u32, error: String) -> bool {
    let retry = &ctx.config.retry;
    if !retry.allows_attempt(attempt) {
        return false;
    }
    let delay = retry.delay_for_attempt(attempt);
    warn!(attempt, ?delay, %error, "transient failure, retrying");
    ctx.stats.write().retries += 1;
    tokio::time::sleep(delay).await;
    true
}

/// Handles a zone reported as deleted. Returns whether local data was purged.
async fn zone_deleted<S: LocalStore>(ctx: &SyncContext<S>, zone: &ZoneId) -> SyncResult<bool> {
    let managed = zone.zone_name == ctx.config.zone_name && zone.is_owned_by_current_user();

    if managed {
        if let Some(request) = ctx.pending_deletions.consume(zone) {
            info!(%zone, %request, "zone deleted on request, local data kept");
            let _gate = ctx.gate.lock().await;
            ctx.update_ledger(|ledger| {
                ledger.reset_zone(zone);
            })?;
            return Ok(false);
        }
    }

    let purged = {
        let _gate = ctx.gate.lock().await;
        purge_zone(ctx, zone)?
    };

    if managed {
        warn!(%zone, objects = purged, "zone deleted remotely, local data purged");
        ctx.stats.write().purges += 1;
        let delegate = ctx.delegate();
        delegate.on_purge(zone);
        ctx.report_error(&SyncError::ZonePurged(zone.clone()), SyncStage::Pull);
    } else {
        info!(%zone, objects = purged, "shared zone removed");
    }
    Ok(true)
}

/// Applies a round and commits it with the zone's new token.
///
/// Returns the number of objects touched and the committed ledger.
fn apply_round<S: LocalStore>(
    ctx: &SyncContext<S>,
    page: &ZoneChangesPage,
    share_roots: &[RemoteRecord],
    missing: &mut MissingReferenceSet,
) -> SyncResult<(usize, TokenLedger)> {
    let model = ctx.model();
    let converter = &ctx.converter;
    let mut txn = ctx.store.begin(&ctx.config.pull_context_name);
    let mut applied = 0;

    for change in &page.changes {
        match change {
            ZoneChange::Changed(record) if record.is_share() => {}
            ZoneChange::Changed(record) => {
                if let Some(conversion) = converter.record_to_object(record, &mut txn, model)? {
                    missing.insert(conversion.object, conversion.missing);
                    applied += 1;
                }
            }
            ZoneChange::Deleted { id, record_type } => {
                if let Some(object) = converter.delete_by_record_id(&mut txn, model, id, record_type)? {
                    missing.forget(object);
                    applied += 1;
                }
            }
        }
    }

    for root in share_roots {
        if let Some(conversion) = converter.record_to_object(root, &mut txn, model)? {
            debug!(record = %root.id, "share activated");
            missing.insert(conversion.object, conversion.missing);
            applied += 1;
        }
    }

    let resolved = converter.resolve_missing(&mut txn, model, missing)?;
    if !missing.is_empty() {
        debug!(resolved, unresolved = missing.len(), "references left for a later round");
    }

    let mut ledger = ctx.ledger.lock().clone();
    ledger.set_zone_token(&page.zone, page.new_token.clone());
    ctx.stage_ledger(&mut txn, &ledger)?;
    ctx.store.commit(txn)?;
    Ok((applied, ledger))
}

/// Deletes every local object owned in `zone` and drops its token.
fn purge_zone<S: LocalStore>(ctx: &SyncContext<S>, zone: &ZoneId) -> SyncResult<usize> {
    let mut txn = ctx.store.begin(&ctx.config.sync_context_name);
    let purged = ctx
        .converter
        .delete_owned_by(&mut txn, ctx.model(), &zone.owner_name)?;
    let mut ledger = ctx.ledger.lock().clone();
    ledger.reset_zone(zone);
    ctx.stage_ledger(&mut txn, &ledger)?;
    ctx.store.commit(txn)?;
    *ctx.ledger.lock() = ledger;
    Ok(purged)
}
