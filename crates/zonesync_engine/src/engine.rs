//! Engine façade.

use crate::config::SyncConfig;
use crate::context::{load_ledger, SyncContext};
use crate::delegate::SyncDelegate;
use crate::error::{SyncError, SyncResult, SyncStage};
use crate::model::LocalObjectId;
use crate::pull::{pull_scope, DeleteRequestId, PullResult};
use crate::push::{mark_zone_for_reupload, push_cycle, resolve_conflict, PushOutcome, PushReport, PushState};
use crate::remote::{RemoteError, RemoteStore, ZoneProvisioner};
use crate::scheduler::{TaskHandle, TaskId, TaskQueue};
use crate::store::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use zonesync_protocol::{ConflictResolution, DatabaseScope, RecordConflict, TokenLedger, ZoneId};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not observing or syncing.
    Disabled,
    /// Observing local commits and accepting sync requests.
    Enabled,
    /// Setup failed; sync stays off until enabled again.
    Failed,
}

impl EngineState {
    /// Returns true if sync requests are accepted.
    pub fn is_enabled(&self) -> bool {
        matches!(self, EngineState::Enabled)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed pulls.
    pub pulls_completed: u64,
    /// Objects created, updated or deleted by pulls.
    pub records_pulled: u64,
    /// Completed push cycles.
    pub pushes_completed: u64,
    /// Records saved or deleted remotely.
    pub records_pushed: u64,
    /// Conflicts reported by push cycles.
    pub conflicts_encountered: u64,
    /// Managed zones purged after remote deletion.
    pub purges: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Last successful pull or clean push.
    pub last_sync_time: Option<Instant>,
    /// Last surfaced error.
    pub last_error: Option<String>,
}

struct EngineInner<S: LocalStore + 'static> {
    ctx: Arc<SyncContext<S>>,
    pull_queue: TaskQueue,
    push_queue: TaskQueue,
    state: RwLock<EngineState>,
    online: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
}

/// Synchronizes a local store with one zone of a remote record store.
///
/// Cloning is cheap; clones share the same engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = SyncEngine::new(config, store, remote.clone(), remote)?;
/// engine.enable().await?;
/// engine.push_pending_changes().await?;
/// ```
pub struct SyncEngine<S: LocalStore + 'static> {
    inner: Arc<EngineInner<S>>,
}

impl<S: LocalStore + 'static> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: LocalStore + 'static> SyncEngine<S> {
    /// Creates a disabled engine.
    ///
    /// Fails if the configuration is invalid or the stored tokens cannot be
    /// read.
    pub fn new(
        config: SyncConfig,
        store: Arc<S>,
        remote: Arc<dyn RemoteStore>,
        provisioner: Arc<dyn ZoneProvisioner>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let ledger = load_ledger(store.as_ref(), &config.metadata_key_tokens)?;
        let pull_concurrency = config.pull_concurrency;
        let ctx = SyncContext::new(config, store, remote, provisioner, ledger);

        Ok(Self {
            inner: Arc::new(EngineInner {
                ctx: Arc::new(ctx),
                pull_queue: TaskQueue::new("pull", pull_concurrency),
                push_queue: TaskQueue::new("push", 1),
                state: RwLock::new(EngineState::Disabled),
                online: AtomicBool::new(true),
                lifecycle: Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Sets the delegate, builder style.
    pub fn with_delegate(self, delegate: Arc<dyn SyncDelegate>) -> Self {
        self.set_delegate(delegate);
        self
    }

    /// Replaces the delegate.
    pub fn set_delegate(&self, delegate: Arc<dyn SyncDelegate>) {
        *self.inner.ctx.delegate.write() = delegate;
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.ctx.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    /// Returns true unless marked offline.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Current statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.ctx.stats.read().clone()
    }

    /// Last committed change tokens.
    pub fn ledger(&self) -> TokenLedger {
        self.inner.ctx.ledger.lock().clone()
    }

    /// Number of objects waiting to be pushed.
    pub fn dirty_count(&self) -> usize {
        self.inner.ctx.refresh_dirty()
    }

    /// Upload state of an object, if it is waiting to be pushed.
    pub fn push_state(&self, object: LocalObjectId) -> Option<PushState> {
        self.inner.ctx.refresh_dirty();
        self.inner.ctx.dirty.lock().state(object)
    }

    /// Number of zone deletions whose signal has not been seen yet.
    pub fn pending_zone_deletions(&self) -> usize {
        self.inner.ctx.pending_deletions.len()
    }

    fn ensure_enabled(&self) -> SyncResult<()> {
        if self.state().is_enabled() {
            Ok(())
        } else {
            Err(SyncError::Disabled)
        }
    }

    fn report(&self, err: &SyncError, stage: SyncStage) {
        if !matches!(err, SyncError::Cancelled) {
            self.inner.ctx.report_error(err, stage);
        }
    }

    /// Starts syncing.
    ///
    /// Loads the token ledger, starts observing local commits, provisions
    /// the managed zone and runs an initial pull of every scope. Setup
    /// errors leave the engine in [`EngineState::Failed`].
    #[instrument(name = "enable", skip_all)]
    pub async fn enable(&self) -> SyncResult<PullResult> {
        let ctx = &self.inner.ctx;
        let current = self.state();
        if current.is_enabled() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{current:?}"),
                to: format!("{:?}", EngineState::Enabled),
            });
        }

        if let Err(err) = self.load_setup() {
            *self.inner.state.write() = EngineState::Failed;
            self.report(&err, SyncStage::Setup);
            return Err(err);
        }
        ctx.dirty.lock().attach(ctx.store.subscribe());
        *self.inner.state.write() = EngineState::Enabled;

        let lifecycle = CancellationToken::new();
        *self.inner.lifecycle.lock() = lifecycle.clone();
        if let Some(interval) = ctx.config.auto_push_interval {
            self.spawn_auto_push(interval, lifecycle);
        }
        info!(zone = %ctx.config.zone_name, "sync enabled");

        let provision = self.submit_provision(&self.inner.pull_queue, ctx.config.private_zone());
        ctx.delegate().will_sync_from_remote();
        let pulls = self.submit_pulls(&DatabaseScope::SYNCABLE, &[provision.id()]);
        if let Err(err) = provision.join().await {
            self.report(&err, SyncStage::Setup);
            return Err(err);
        }
        self.join_pulls(pulls).await
    }

    fn load_setup(&self) -> SyncResult<()> {
        let ctx = &self.inner.ctx;
        if ctx.converter.syncable_entities(ctx.model()).is_empty() {
            return Err(SyncError::configuration(
                "no entity has resolvable service attributes",
            ));
        }
        let ledger = load_ledger(ctx.store.as_ref(), &ctx.config.metadata_key_tokens)?;
        *ctx.ledger.lock() = ledger;
        Ok(())
    }

    /// Stops syncing and cancels queued and running work.
    pub fn disable(&self) {
        self.inner.lifecycle.lock().cancel();
        self.inner.pull_queue.cancel_all();
        self.inner.push_queue.cancel_all();
        self.inner.ctx.dirty.lock().detach();
        let previous = std::mem::replace(&mut *self.inner.state.write(), EngineState::Disabled);
        info!(?previous, "sync disabled");
    }

    /// Marks the engine online or offline.
    ///
    /// Going online pushes accumulated changes in the background.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        debug!(online, "connectivity changed");
        if !online || was_online || !self.state().is_enabled() || self.dirty_count() == 0 {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = self.clone();
                runtime.spawn(async move {
                    if let Err(err) = engine.push_pending_changes().await {
                        debug!(error = %err, "push after reconnect failed");
                    }
                });
            }
            Err(_) => warn!("no runtime to push on reconnect, changes wait for the next push"),
        }
    }

    /// Pulls remote changes of one scope, or of every syncable scope.
    ///
    /// The public scope is never synchronized and yields `NoData`.
    pub async fn pull(&self, scope: Option<DatabaseScope>) -> SyncResult<PullResult> {
        self.ensure_enabled()?;
        let scopes = match scope {
            None => DatabaseScope::SYNCABLE.to_vec(),
            Some(DatabaseScope::Public) => return Ok(PullResult::NoData),
            Some(scope) => vec![scope],
        };
        self.inner.ctx.delegate().will_sync_from_remote();
        let handles = self.submit_pulls(&scopes, &[]);
        self.join_pulls(handles).await
    }

    fn submit_pulls(
        &self,
        scopes: &[DatabaseScope],
        dependencies: &[TaskId],
    ) -> Vec<TaskHandle<PullResult>> {
        scopes
            .iter()
            .map(|&scope| {
                let ctx = Arc::clone(&self.inner.ctx);
                self.inner
                    .pull_queue
                    .submit(&format!("pull-{scope}"), dependencies, async move {
                        pull_scope(&ctx, scope).await
                    })
            })
            .collect()
    }

    async fn join_pulls(&self, handles: Vec<TaskHandle<PullResult>>) -> SyncResult<PullResult> {
        let ctx = &self.inner.ctx;
        let mut result = PullResult::NoData;
        let mut first_error = None;
        for handle in handles {
            match handle.join().await {
                Ok(scope_result) => result = result.merge(scope_result),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => self.report(&err, SyncStage::Pull),
            }
        }
        if let Some(err) = first_error {
            self.report(&err, SyncStage::Pull);
            return Err(err);
        }

        {
            let mut stats = ctx.stats.write();
            stats.pulls_completed += 1;
            stats.last_sync_time = Some(Instant::now());
        }
        info!(?result, "pull finished");
        ctx.delegate().did_sync_from_remote(result);
        Ok(result)
    }

    /// Creates `zone` on `queue`, the queue of the tasks depending on it.
    fn submit_provision(&self, queue: &TaskQueue, zone: ZoneId) -> TaskHandle<()> {
        let ctx = Arc::clone(&self.inner.ctx);
        queue.submit("provision", &[], async move {
            ctx.provisioner.create_zone(&zone).await?;
            debug!(%zone, "zone provisioned");
            Ok(())
        })
    }

    /// Uploads every dirty object.
    ///
    /// Returns `Deferred` without submitting anything while offline. If the
    /// managed zone no longer exists remotely, it is created again and all
    /// local objects of the zone are uploaded from scratch.
    pub async fn push_pending_changes(&self) -> SyncResult<PushOutcome> {
        self.ensure_enabled()?;
        if !self.is_online() {
            debug!(dirty = self.dirty_count(), "offline, push deferred");
            return Ok(PushOutcome::Deferred);
        }

        let ctx = Arc::clone(&self.inner.ctx);
        let push = self
            .inner
            .push_queue
            .submit("push", &[], async move { push_cycle(&ctx).await });
        match push.join().await {
            Ok(report) => Ok(self.finish_push(report)),
            Err(SyncError::Remote(RemoteError::ZoneNotFound(zone)))
                if zone.is_owned_by_current_user() =>
            {
                self.recover_missing_zone(zone).await
            }
            Err(err) => {
                self.report(&err, SyncStage::Push);
                Err(err)
            }
        }
    }

    async fn recover_missing_zone(&self, zone: ZoneId) -> SyncResult<PushOutcome> {
        warn!(%zone, "zone missing remotely, re-creating it and uploading everything");
        let provision = self.submit_provision(&self.inner.push_queue, zone.clone());

        let ctx = Arc::clone(&self.inner.ctx);
        let reupload = self
            .inner
            .push_queue
            .submit("reupload", &[provision.id()], async move {
                mark_zone_for_reupload(&ctx, &zone).await?;
                push_cycle(&ctx).await
            });

        if let Err(err) = provision.join().await {
            self.report(&err, SyncStage::Setup);
            return Err(err);
        }
        match reupload.join().await {
            Ok(report) => Ok(self.finish_push(report)),
            Err(err) => {
                self.report(&err, SyncStage::Push);
                Err(err)
            }
        }
    }

    fn finish_push(&self, report: PushReport) -> PushOutcome {
        for err in &report.errors {
            self.report(err, SyncStage::Push);
        }
        if report.is_clean() {
            self.inner.ctx.stats.write().last_sync_time = Some(Instant::now());
        }
        report.into_outcome()
    }

    /// Deletes the managed zone remotely.
    ///
    /// The deletion signal this causes on the next pull does not purge local
    /// data. Each request suppresses exactly one signal.
    pub async fn delete_zone(&self) -> SyncResult<DeleteRequestId> {
        self.ensure_enabled()?;
        let ctx = &self.inner.ctx;
        let zone = ctx.config.private_zone();
        let request = ctx.pending_deletions.register(zone.clone());
        if let Err(err) = ctx.provisioner.delete_zone(&zone).await {
            ctx.pending_deletions.cancel(request);
            let err = SyncError::from(err);
            self.report(&err, SyncStage::Setup);
            return Err(err);
        }
        info!(%zone, %request, "zone deleted");
        Ok(request)
    }

    /// Applies a decision on a conflict reported by a push.
    pub async fn resolve_conflict(
        &self,
        conflict: &RecordConflict,
        resolution: ConflictResolution,
    ) -> SyncResult<()> {
        self.ensure_enabled()?;
        resolve_conflict(&self.inner.ctx, conflict, resolution).await
    }

    fn spawn_auto_push(&self, interval: Duration, lifecycle: CancellationToken) {
        let engine: Weak<EngineInner<S>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = lifecycle.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let engine = SyncEngine { inner };
                if engine.dirty_count() == 0 {
                    continue;
                }
                if let Err(err) = engine.push_pending_changes().await {
                    debug!(error = %err, "periodic push failed");
                }
            }
            debug!("periodic push stopped");
        });
    }
}
