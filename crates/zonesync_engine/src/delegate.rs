//! Sync lifecycle callbacks.

use crate::error::{SyncError, SyncStage};
use crate::pull::PullResult;
use crate::push::PushReport;
use zonesync_protocol::{RecordConflict, ZoneId};

/// Observer of sync activity.
///
/// All methods have empty defaults. Callbacks run on engine tasks and must
/// not block.
pub trait SyncDelegate: Send + Sync {
    /// A pull is about to start.
    fn will_sync_from_remote(&self) {}

    /// A pull finished.
    fn did_sync_from_remote(&self, _result: PullResult) {}

    /// A push is about to start.
    fn will_sync_to_remote(&self) {}

    /// A push finished.
    fn did_sync_to_remote(&self, _report: &PushReport) {}

    /// An error was raised during `stage`.
    fn on_error(&self, _error: &SyncError, _stage: SyncStage) {}

    /// The remote store rejected a save because the record changed.
    ///
    /// Resolve with [`SyncEngine::resolve_conflict`](crate::SyncEngine::resolve_conflict).
    fn on_conflict(&self, _conflict: &RecordConflict) {}

    /// Local data of a remotely deleted zone was purged.
    fn on_purge(&self, _zone: &ZoneId) {}
}

/// A delegate that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl SyncDelegate for NoopDelegate {}
