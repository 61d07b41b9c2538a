//! Task queue with dependencies, bounded concurrency and cancellation.
//!
//! Each [`TaskQueue`] runs submitted futures on the tokio runtime. A task
//! starts once every dependency reached a terminal status; if any dependency
//! did not succeed, the task is cancelled without running. Concurrency is
//! bounded by a semaphore. [`TaskQueue::cancel_all`] cancels everything
//! submitted so far, while later submissions run normally. Dropping a queue
//! cancels its remaining tasks.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Terminal entries kept before pruning.
const STATUS_RETENTION: usize = 1024;

static NEXT_QUEUE: AtomicU64 = AtomicU64::new(1);

/// Identifier of a submitted task, unique across queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    queue: u64,
    seq: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.queue, self.seq)
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for dependencies or a free slot.
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed(String),
    /// Cancelled before or while running.
    Cancelled,
}

impl TaskStatus {
    /// Returns true once the task will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed(_) | TaskStatus::Cancelled
        )
    }
}

struct QueueState {
    statuses: HashMap<TaskId, watch::Receiver<TaskStatus>>,
    root: CancellationToken,
}

impl QueueState {
    fn prune(&mut self) {
        if self.statuses.len() > STATUS_RETENTION {
            self.statuses.retain(|_, status| !status.borrow().is_terminal());
        }
    }
}

/// Handle to the result of a submitted task.
pub struct TaskHandle<T> {
    id: TaskId,
    result: oneshot::Receiver<SyncResult<T>>,
}

impl<T> TaskHandle<T> {
    /// The task's identifier, usable as a dependency.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the task and returns its result.
    pub async fn join(self) -> SyncResult<T> {
        self.result.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

/// A named queue of dependent asynchronous tasks.
pub struct TaskQueue {
    id: u64,
    name: String,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    state: Mutex<QueueState>,
    active: Arc<watch::Sender<usize>>,
}

impl TaskQueue {
    /// Creates a queue running at most `max_concurrent` tasks at once.
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            id: NEXT_QUEUE.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_id: AtomicU64::new(1),
            state: Mutex::new(QueueState {
                statuses: HashMap::new(),
                root: CancellationToken::new(),
            }),
            active: Arc::new(active),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a task that starts after `dependencies` succeeded.
    ///
    /// Unknown or pruned dependencies of this queue count as satisfied.
    /// Dependencies on tasks of another queue cancel the task. Must be
    /// called from within a tokio runtime.
    pub fn submit<T, F>(&self, name: &str, dependencies: &[TaskId], task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let id = TaskId {
            queue: self.id,
            seq: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let foreign: Vec<TaskId> = dependencies
            .iter()
            .filter(|dependency| dependency.queue != self.id)
            .copied()
            .collect();
        if !foreign.is_empty() {
            warn!(queue = %self.name, task = name, ?foreign, "dependencies on another queue");
        }
        let rejected = !foreign.is_empty();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Pending);
        let (result_tx, result_rx) = oneshot::channel();

        let (waits, cancel) = {
            let mut state = self.state.lock();
            state.prune();
            let waits: Vec<_> = dependencies
                .iter()
                .filter_map(|dependency| state.statuses.get(dependency).cloned())
                .collect();
            state.statuses.insert(id, status_rx);
            (waits, state.root.child_token())
        };
        self.active.send_modify(|count| *count += 1);

        let queue = self.name.clone();
        let task_name = name.to_string();
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        trace!(queue = %queue, task = %task_name, id = %id, "task submitted");

        tokio::spawn(async move {
            let run = async {
                if rejected {
                    return Err(SyncError::Cancelled);
                }
                for mut dependency in waits {
                    let finished = dependency.wait_for(TaskStatus::is_terminal).await.is_ok();
                    let status = dependency.borrow().clone();
                    if !finished || status != TaskStatus::Succeeded {
                        debug!(queue = %queue, task = %task_name, ?status, "dependency did not succeed");
                        return Err(SyncError::Cancelled);
                    }
                }
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Cancelled)?;
                status_tx.send_replace(TaskStatus::Running);
                task.await
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                result = run => result,
            };

            let status = match &result {
                Ok(_) => TaskStatus::Succeeded,
                Err(SyncError::Cancelled) => TaskStatus::Cancelled,
                Err(err) => TaskStatus::Failed(err.to_string()),
            };
            debug!(queue = %queue, task = %task_name, id = %id, ?status, "task finished");
            status_tx.send_replace(status);
            let _ = result_tx.send(result);
            active.send_modify(|count| *count -= 1);
        });

        TaskHandle {
            id,
            result: result_rx,
        }
    }

    /// Current status of a task, if still tracked.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.state
            .lock()
            .statuses
            .get(&id)
            .map(|status| status.borrow().clone())
    }

    /// Waits until a task reaches a terminal status.
    pub async fn wait(&self, id: TaskId) -> Option<TaskStatus> {
        let mut status = self.state.lock().statuses.get(&id).cloned()?;
        let _ = status.wait_for(TaskStatus::is_terminal).await;
        let current = status.borrow().clone();
        Some(current)
    }

    /// Number of tasks not yet finished.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Waits until no task is pending or running.
    pub async fn wait_idle(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Cancels every task submitted so far.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        state.root.cancel();
        state.root = CancellationToken::new();
        debug!(queue = %self.name, "all tasks cancelled");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.state.get_mut().root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_task_and_returns_result() {
        let queue = TaskQueue::new("test", 2);
        let handle = queue.submit("answer", &[], async { Ok(42) });
        let id = handle.id();
        assert_eq!(handle.join().await.unwrap(), 42);
        assert_eq!(queue.wait(id).await, Some(TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn dependent_runs_after_dependency() {
        let queue = TaskQueue::new("test", 4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let first = queue.submit("first", &[], async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first_order.lock().push("first");
            Ok(())
        });
        let second_order = Arc::clone(&order);
        let second = queue.submit("second", &[first.id()], async move {
            second_order.lock().push("second");
            Ok(())
        });

        second.join().await.unwrap();
        first.join().await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failed_dependency_cancels_dependent() {
        let queue = TaskQueue::new("test", 2);
        let ran = Arc::new(AtomicUsize::new(0));

        let failing = queue.submit::<(), _>("failing", &[], async {
            Err(SyncError::configuration("boom"))
        });
        let ran_clone = Arc::clone(&ran);
        let dependent = queue.submit("dependent", &[failing.id()], async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let dependent_id = dependent.id();

        assert!(matches!(
            dependent.join().await,
            Err(SyncError::Cancelled)
        ));
        assert!(failing.join().await.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.status(dependent_id), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let queue = TaskQueue::new("serial", 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.submit(&format!("task-{i}"), &[], async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_stops_pending_and_allows_new_work() {
        let queue = TaskQueue::new("test", 1);
        let slow = queue.submit("slow", &[], async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let queued = queue.submit("queued", &[], async { Ok(()) });

        queue.cancel_all();
        assert!(matches!(slow.join().await, Err(SyncError::Cancelled)));
        assert!(matches!(queued.join().await, Err(SyncError::Cancelled)));

        let fresh = queue.submit("fresh", &[], async { Ok(7) });
        assert_eq!(fresh.join().await.unwrap(), 7);
        queue.wait_idle().await;
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test]
    async fn unknown_dependency_is_satisfied() {
        let queue = TaskQueue::new("test", 1);
        let unknown = TaskId {
            queue: queue.id,
            seq: 999,
        };
        let handle = queue.submit("orphan", &[unknown], async { Ok("done") });
        assert_eq!(handle.join().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dependency_on_another_queue_is_rejected() {
        let setup = TaskQueue::new("setup", 1);
        let work = TaskQueue::new("work", 1);

        // Same sequence number on both queues
        let failed = work.submit::<(), _>("failed", &[], async {
            Err(SyncError::configuration("boom"))
        });
        assert!(failed.join().await.is_err());
        let provision = setup.submit("provision", &[], async { Ok(()) });
        assert_eq!(provision.id().seq, 1);
        assert_ne!(provision.id(), TaskId { queue: work.id, seq: 1 });

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let dependent = work.submit("dependent", &[provision.id()], async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(dependent.join().await, Err(SyncError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        provision.join().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_queue_cancels_its_tasks() {
        let queue = TaskQueue::new("scoped", 1);
        let slow = queue.submit("slow", &[], async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        drop(queue);
        assert!(matches!(slow.join().await, Err(SyncError::Cancelled)));
    }
}
