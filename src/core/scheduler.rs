//! Background task scheduler.
//!
//! Tasks move through `Queued -> Running -> {Completed | Failed | Cancelled}`.
//! Queued tasks run one at a time, in arrival order, on a single worker.
//! Priority tasks skip the queue and run inline inside [`Scheduler::add`],
//! blocking the caller until they finish; they never interrupt the task the
//! worker is running.
//!
//! The task table and the identifier pool sit behind one lock. Task bodies
//! always run outside it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::ids::{ConnectionId, IdPool, TaskId};
use super::progress::{OperationSnapshot, Progress};
use crate::error::{EndpointError, SchedulerError, TaskError};
use crate::frame::Outbox;
use crate::rpc::protocol::{INTERNAL_ERROR, RequestId};

/// Future produced by a task body.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// Deferred task body. It is only invoked when the task starts, so a task
/// cancelled while queued never runs any of its code.
pub type TaskJob = Box<dyn FnOnce(Progress) -> TaskFuture + Send>;

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(EndpointError),
    Cancelled,
}

impl TaskOutcome {
    fn from_result(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Completed(value),
            Err(TaskError::Cancelled) => TaskOutcome::Cancelled,
            Err(TaskError::Failed(e)) => TaskOutcome::Failed(e),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed(_) => "completed",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Queued { id: Option<TaskId>, label: String },
    Started { id: Option<TaskId>, label: String },
    Finished { id: Option<TaskId>, label: String, outcome: TaskOutcome },
}

/// A unit of work submitted to the scheduler.
pub struct Task {
    id: Option<TaskId>,
    owner: ConnectionId,
    request_id: Option<RequestId>,
    priority: bool,
    label: String,
    notifier: Option<Outbox>,
    job: TaskJob,
}

impl Task {
    /// Create an untracked (fire-and-forget) task owned by `owner`.
    pub fn new<F>(label: impl Into<String>, owner: ConnectionId, job: F) -> Self
    where
        F: FnOnce(Progress) -> TaskFuture + Send + 'static,
    {
        Self {
            id: None,
            owner,
            request_id: None,
            priority: false,
            label: label.into(),
            notifier: None,
            job: Box::new(job),
        }
    }

    /// Make the task addressable. The id should come from
    /// [`Scheduler::allocate_id`].
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Originating request, used to address progress notifications.
    pub fn with_request(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_notifier(mut self, outbox: Outbox) -> Self {
        self.notifier = Some(outbox);
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }
}

enum TaskState {
    Queued,
    Running,
    Finished(TaskOutcome),
}

struct Tracked {
    serial: u64,
    owner: ConnectionId,
    progress: Progress,
    state: TaskState,
    done: watch::Receiver<Option<TaskOutcome>>,
}

struct Pending {
    id: Option<TaskId>,
    serial: u64,
    owner: ConnectionId,
    label: String,
    progress: Progress,
    job: TaskJob,
    done: watch::Sender<Option<TaskOutcome>>,
}

struct Current {
    serial: u64,
    owner: ConnectionId,
    progress: Progress,
}

#[derive(Default)]
struct State {
    ids: IdPool,
    next_serial: u64,
    tracked: HashMap<TaskId, Tracked>,
    queue: VecDeque<Pending>,
    current: Option<Current>,
}

impl State {
    /// Forget a tracked task and recycle its id.
    fn retire(&mut self, id: TaskId) {
        if self.tracked.remove(&id).is_some() {
            self.ids.release(id);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
}

/// Handle to the task scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler and spawn its worker. Must be called from within a
    /// tokio runtime.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let scheduler = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                events,
                shutdown: CancellationToken::new(),
            }),
        };

        let worker = scheduler.clone();
        tokio::spawn(async move { worker.run_worker().await });
        scheduler
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Reserve a task id for a task about to be added.
    pub async fn allocate_id(&self) -> TaskId {
        self.shared.state.lock().await.ids.acquire()
    }

    /// Give back an id that was allocated but never used.
    pub async fn release_id(&self, id: TaskId) {
        let mut state = self.shared.state.lock().await;
        if !state.tracked.contains_key(&id) {
            state.ids.release(id);
        }
    }

    /// Admit a task.
    ///
    /// Non-priority tasks are queued and the worker is woken. Priority tasks
    /// run to completion before this returns; their result stays collectable
    /// through [`Scheduler::wait`].
    pub async fn add(&self, task: Task) -> Result<Option<TaskId>, SchedulerError> {
        let Task {
            id,
            owner,
            request_id,
            priority,
            label,
            notifier,
            job,
        } = task;

        let progress = Progress::new(id, request_id, notifier);
        let (done_tx, done_rx) = watch::channel(None);

        let pending = {
            let mut state = self.shared.state.lock().await;
            if let Some(id) = id
                && state.tracked.contains_key(&id)
            {
                return Err(SchedulerError::DuplicateTaskId(id));
            }

            let serial = state.next_serial;
            state.next_serial += 1;

            if let Some(id) = id {
                state.tracked.insert(
                    id,
                    Tracked {
                        serial,
                        owner,
                        progress: progress.clone(),
                        state: if priority {
                            TaskState::Running
                        } else {
                            TaskState::Queued
                        },
                        done: done_rx,
                    },
                );
            }

            let pending = Pending {
                id,
                serial,
                owner,
                label,
                progress,
                job,
                done: done_tx,
            };

            if priority {
                pending
            } else {
                debug!(task_id = ?id, label = %pending.label, queued = state.queue.len(), "Task queued");
                self.emit(TaskEvent::Queued {
                    id,
                    label: pending.label.clone(),
                });
                state.queue.push_back(pending);
                self.shared.wake.notify_one();
                return Ok(id);
            }
        };

        debug!(task_id = ?id, label = %pending.label, "Running priority task inline");
        self.execute(pending).await;
        Ok(id)
    }

    /// Current progress of a task: the live snapshot while it runs, a
    /// "not started yet" sentinel while it is queued.
    pub async fn current_operation(&self, id: TaskId) -> Result<OperationSnapshot, SchedulerError> {
        let state = self.shared.state.lock().await;
        match state.tracked.get(&id) {
            Some(Tracked {
                state: TaskState::Running,
                progress,
                ..
            }) => Ok(progress.snapshot()),
            Some(Tracked {
                state: TaskState::Queued,
                ..
            }) => Ok(OperationSnapshot::not_started()),
            _ => Err(SchedulerError::UnknownTaskId(id)),
        }
    }

    /// Cancel a task. A queued task is dropped without ever starting; a
    /// running task has its cancellation flag raised. Either way the id can
    /// no longer be used to address it.
    pub async fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock().await;
        let tracked = state
            .tracked
            .remove(&id)
            .ok_or(SchedulerError::UnknownTaskId(id))?;

        match tracked.state {
            TaskState::Queued => {
                if let Some(pos) = state.queue.iter().position(|p| p.id == Some(id)) {
                    if let Some(pending) = state.queue.remove(pos) {
                        self.drop_pending(pending);
                    }
                }
                state.ids.release(id);
                info!(task_id = id, "Queued task cancelled");
            }
            TaskState::Running => {
                // id is recycled once the body returns
                tracked.progress.cancel();
                info!(task_id = id, "Cancellation requested for running task");
            }
            TaskState::Finished(_) => {
                state.ids.release(id);
                debug!(task_id = id, "Discarded uncollected task result");
            }
        }
        Ok(())
    }

    /// Wait for a task to resolve and collect its outcome. The id is recycled
    /// once collected.
    pub async fn wait(&self, id: TaskId) -> Result<TaskOutcome, SchedulerError> {
        let (serial, mut done) = {
            let mut state = self.shared.state.lock().await;
            let tracked = state
                .tracked
                .get(&id)
                .ok_or(SchedulerError::UnknownTaskId(id))?;
            if let TaskState::Finished(outcome) = &tracked.state {
                let outcome = outcome.clone();
                state.retire(id);
                return Ok(outcome);
            }
            (tracked.serial, tracked.done.clone())
        };

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(TaskOutcome::Cancelled),
            Err(_) => TaskOutcome::Cancelled,
        };

        let mut state = self.shared.state.lock().await;
        let finished = matches!(
            state.tracked.get(&id),
            Some(Tracked { serial: s, state: TaskState::Finished(_), .. }) if *s == serial
        );
        if finished {
            state.retire(id);
        }
        Ok(outcome)
    }

    /// Tell every task owned by a dropped connection to stop. Queued tasks
    /// are removed without running; running tasks have their cancellation
    /// flag raised and keep running until they observe it. Uncollected
    /// results are discarded.
    pub async fn disconnect(&self, owner: ConnectionId) {
        let mut state = self.shared.state.lock().await;

        let (dropped, kept): (VecDeque<_>, VecDeque<_>) =
            state.queue.drain(..).partition(|p| p.owner == owner);
        state.queue = kept;

        let dropped_count = dropped.len();
        for pending in dropped {
            if let Some(id) = pending.id {
                state.retire(id);
            }
            self.drop_pending(pending);
        }

        let owned: Vec<TaskId> = state
            .tracked
            .iter()
            .filter(|(_, t)| t.owner == owner)
            .map(|(id, _)| *id)
            .collect();

        let mut signalled = 0;
        for id in owned {
            let Some(tracked) = state.tracked.remove(&id) else {
                continue;
            };
            match tracked.state {
                TaskState::Running => {
                    tracked.progress.disconnect();
                    signalled += 1;
                }
                TaskState::Queued | TaskState::Finished(_) => state.ids.release(id),
            }
        }

        if let Some(current) = &state.current
            && current.owner == owner
            && !current.progress.is_cancelled()
        {
            current.progress.disconnect();
            signalled += 1;
        }

        if dropped_count > 0 || signalled > 0 {
            info!(
                conn = owner,
                dropped = dropped_count,
                signalled,
                "Disconnected tasks of closed connection"
            );
        }
    }

    /// Number of tasks waiting for the worker.
    pub async fn queued_len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    /// Number of addressable tasks (queued, running or awaiting collection).
    pub async fn tracked_len(&self) -> usize {
        self.shared.state.lock().await.tracked.len()
    }

    /// Whether the worker is busy with a task.
    pub async fn is_busy(&self) -> bool {
        self.shared.state.lock().await.current.is_some()
    }

    /// Stop the worker after its current task. Queued tasks are dropped.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let mut state = self.shared.state.lock().await;
        let queued: Vec<Pending> = state.queue.drain(..).collect();
        for pending in queued {
            if let Some(id) = pending.id {
                state.retire(id);
            }
            self.drop_pending(pending);
        }
        if let Some(current) = &state.current {
            current.progress.cancel();
        }
    }

    async fn run_worker(self) {
        debug!("Task worker started");
        loop {
            let next = {
                let mut state = self.shared.state.lock().await;
                let next = state.queue.pop_front();
                if let Some(pending) = &next {
                    state.current = Some(Current {
                        serial: pending.serial,
                        owner: pending.owner,
                        progress: pending.progress.clone(),
                    });
                    if let Some(id) = pending.id
                        && let Some(tracked) = state.tracked.get_mut(&id)
                    {
                        tracked.state = TaskState::Running;
                    }
                }
                next
            };

            match next {
                Some(pending) => self.execute(pending).await,
                None => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = self.shared.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!("Task worker stopped");
    }

    /// Run a task body to completion and record its outcome.
    async fn execute(&self, pending: Pending) {
        let Pending {
            id,
            serial,
            label,
            progress,
            job,
            done,
            ..
        } = pending;

        self.emit(TaskEvent::Started {
            id,
            label: label.clone(),
        });

        let span = info_span!("task", task_id = ?id, label = %label);
        let result = async move {
            debug!("Task started");
            AssertUnwindSafe(async move { job(progress).await })
                .catch_unwind()
                .await
        }
        .instrument(span)
        .await;

        let outcome = match result {
            Ok(result) => TaskOutcome::from_result(result),
            Err(_) => {
                warn!(task_id = ?id, label = %label, "Task body panicked");
                TaskOutcome::Failed(
                    EndpointError::new("task panicked").with_code(INTERNAL_ERROR),
                )
            }
        };

        {
            let mut state = self.shared.state.lock().await;
            if state.current.as_ref().is_some_and(|c| c.serial == serial) {
                state.current = None;
            }
            if let Some(id) = id {
                match state.tracked.get_mut(&id) {
                    Some(tracked) if tracked.serial == serial => {
                        tracked.state = TaskState::Finished(outcome.clone());
                    }
                    // cancelled or disconnected while running
                    _ => state.ids.release(id),
                }
            }
        }

        info!(task_id = ?id, label = %label, outcome = outcome.as_str(), "Task finished");
        done.send_replace(Some(outcome.clone()));
        self.emit(TaskEvent::Finished { id, label, outcome });
    }

    fn drop_pending(&self, pending: Pending) {
        pending.done.send_replace(Some(TaskOutcome::Cancelled));
        self.emit(TaskEvent::Finished {
            id: pending.id,
            label: pending.label,
            outcome: TaskOutcome::Cancelled,
        });
    }

    fn emit(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
