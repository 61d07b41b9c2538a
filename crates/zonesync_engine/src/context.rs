//! State shared by the push and pull paths of one engine.

use crate::config::SyncConfig;
use crate::converter::Converter;
use crate::delegate::{NoopDelegate, SyncDelegate};
use crate::engine::SyncStats;
use crate::error::{SyncError, SyncResult, SyncStage};
use crate::model::ObjectModel;
use crate::pull::PendingZoneDeletions;
use crate::push::DirtyTracker;
use crate::remote::{RemoteStore, ZoneProvisioner};
use crate::store::{LocalStore, LocalTransaction};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::error;
use zonesync_protocol::TokenLedger;

pub(crate) struct SyncContext<S: LocalStore> {
    pub(crate) store: Arc<S>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) provisioner: Arc<dyn ZoneProvisioner>,
    pub(crate) converter: Converter,
    pub(crate) config: SyncConfig,
    /// Last committed tokens. Written only while `gate` is held.
    pub(crate) ledger: Mutex<TokenLedger>,
    /// Serializes pull rounds and push cycles on the store.
    pub(crate) gate: tokio::sync::Mutex<()>,
    pub(crate) delegate: RwLock<Arc<dyn SyncDelegate>>,
    pub(crate) stats: RwLock<SyncStats>,
    pub(crate) dirty: Mutex<DirtyTracker>,
    pub(crate) pending_deletions: PendingZoneDeletions,
}

impl<S: LocalStore> SyncContext<S> {
    pub(crate) fn new(
        config: SyncConfig,
        store: Arc<S>,
        remote: Arc<dyn RemoteStore>,
        provisioner: Arc<dyn ZoneProvisioner>,
        ledger: TokenLedger,
    ) -> Self {
        Self {
            store,
            remote,
            provisioner,
            converter: Converter::new(&config),
            config,
            ledger: Mutex::new(ledger),
            gate: tokio::sync::Mutex::new(()),
            delegate: RwLock::new(Arc::new(NoopDelegate)),
            stats: RwLock::new(SyncStats::default()),
            dirty: Mutex::new(DirtyTracker::default()),
            pending_deletions: PendingZoneDeletions::default(),
        }
    }

    pub(crate) fn model(&self) -> &ObjectModel {
        self.store.model()
    }

    pub(crate) fn delegate(&self) -> Arc<dyn SyncDelegate> {
        Arc::clone(&self.delegate.read())
    }

    /// Logs an error, records it and notifies the delegate.
    pub(crate) fn report_error(&self, err: &SyncError, stage: SyncStage) {
        error!(%stage, error = %err, "sync failed");
        self.stats.write().last_error = Some(err.to_string());
        self.delegate().on_error(err, stage);
    }

    /// Drains pending commit events and returns the number of dirty objects.
    pub(crate) fn refresh_dirty(&self) -> usize {
        let mut dirty = self.dirty.lock();
        dirty.drain(
            &self.converter,
            self.store.model(),
            &self.config.push_context_name,
        );
        dirty.len()
    }

    /// Writes `ledger` into a transaction's metadata.
    pub(crate) fn stage_ledger<T: LocalTransaction>(
        &self,
        txn: &mut T,
        ledger: &TokenLedger,
    ) -> SyncResult<()> {
        txn.set_metadata(&self.config.metadata_key_tokens, ledger.encode()?);
        Ok(())
    }

    /// Applies `update` to the ledger and persists it in its own transaction.
    ///
    /// The in-memory ledger changes only after the commit succeeded. Callers
    /// hold `gate`.
    pub(crate) fn update_ledger(&self, update: impl FnOnce(&mut TokenLedger)) -> SyncResult<()> {
        let mut ledger = self.ledger.lock().clone();
        update(&mut ledger);
        let mut txn = self.store.begin(&self.config.sync_context_name);
        self.stage_ledger(&mut txn, &ledger)?;
        self.store.commit(txn)?;
        *self.ledger.lock() = ledger;
        Ok(())
    }
}

/// Reads the persisted ledger, or an empty one if none was stored.
pub(crate) fn load_ledger<S: LocalStore>(store: &S, key: &str) -> SyncResult<TokenLedger> {
    match store.metadata(key) {
        None => Ok(TokenLedger::new()),
        Some(bytes) if bytes.is_empty() => Ok(TokenLedger::new()),
        Some(bytes) => TokenLedger::decode(&bytes).map_err(|err| {
            SyncError::configuration(format!("stored change tokens are unreadable: {err}"))
        }),
    }
}
