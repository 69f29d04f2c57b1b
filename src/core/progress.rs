//! Live progress and cooperative cancellation for one task.
//!
//! The [`Progress`] handle is given to a task body when it starts. Its two
//! mutation points, [`Progress::update`] and [`Progress::next_operation`],
//! first check the cancellation flag and fail with [`TaskError::Cancelled`]
//! once it is set, so a body written with `?` unwinds on its next report.
//! Nothing interrupts a body between reports.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::TaskId;
use crate::error::TaskError;
use crate::frame::Outbox;
use crate::logging::LogThrottle;
use crate::rpc::protocol::{self, Envelope, RequestId};

/// Operation description reported by tasks that have not started.
pub const NOT_STARTED: &str = "not started yet";

/// Point-in-time view of a task's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub operation: String,
    /// Completion ratio in [0, 1]
    pub amount: f64,
    pub started: bool,
}

impl OperationSnapshot {
    /// Sentinel for a task still waiting in the queue.
    pub fn not_started() -> Self {
        Self {
            operation: NOT_STARTED.to_string(),
            amount: 0.0,
            started: false,
        }
    }
}

/// Progress reporter and cancellation flag shared between a running task
/// body and the scheduler.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

struct Inner {
    task_id: Option<TaskId>,
    request_id: Option<RequestId>,
    snapshot: Mutex<OperationSnapshot>,
    cancel: CancellationToken,
    notifier: Mutex<Option<Outbox>>,
    throttle: LogThrottle,
}

impl Progress {
    /// Create a reporter. When both a request id and an outbox are given,
    /// every report is also pushed to the client as a progress notification.
    pub fn new(task_id: Option<TaskId>, request_id: Option<RequestId>, notifier: Option<Outbox>) -> Self {
        Self {
            inner: Arc::new(Inner {
                task_id,
                request_id,
                snapshot: Mutex::new(OperationSnapshot {
                    operation: String::new(),
                    amount: 0.0,
                    started: true,
                }),
                cancel: CancellationToken::new(),
                notifier: Mutex::new(notifier),
                throttle: LogThrottle::new(Duration::from_millis(500)),
            }),
        }
    }

    /// A reporter that is not connected to any client.
    pub fn detached() -> Self {
        Self::new(None, None, None)
    }

    /// Fail with [`TaskError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Report the completion ratio of the current operation. Values outside
    /// [0, 1] are clamped.
    pub fn update(&self, amount: f64) -> Result<(), TaskError> {
        self.check_cancelled()?;
        let amount = if amount.is_nan() { 0.0 } else { amount.clamp(0.0, 1.0) };
        let snapshot = {
            let mut snapshot = self.lock_snapshot();
            snapshot.amount = amount;
            snapshot.clone()
        };
        self.publish(&snapshot);
        Ok(())
    }

    /// Start a new named operation. The completion ratio is left as is.
    pub fn next_operation(&self, description: impl Into<String>) -> Result<(), TaskError> {
        self.check_cancelled()?;
        let snapshot = {
            let mut snapshot = self.lock_snapshot();
            snapshot.operation = description.into();
            snapshot.clone()
        };
        self.publish(&snapshot);
        Ok(())
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        self.lock_snapshot().clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// The owning connection went away: cancel and stop notifying it.
    pub fn disconnect(&self) {
        self.lock_notifier().take();
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested, for bodies that want to
    /// `select!` on it while waiting.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    fn publish(&self, snapshot: &OperationSnapshot) {
        if self.inner.throttle.should_log() || snapshot.amount >= 1.0 {
            debug!(
                task_id = ?self.inner.task_id,
                operation = %snapshot.operation,
                amount = snapshot.amount,
                "Task progress"
            );
        }

        let Some(request_id) = &self.inner.request_id else {
            return;
        };
        let notifier = self.lock_notifier();
        let Some(outbox) = notifier.as_ref() else {
            return;
        };
        let envelope = Envelope::progress(request_id.clone(), &snapshot.operation, snapshot.amount);
        match protocol::encode(&envelope, None) {
            Ok(message) => {
                if !outbox.try_send(message) {
                    trace!(request_id = %request_id, "Outbox full, progress notification dropped");
                }
            }
            Err(e) => debug!(error = %e, "Failed to encode progress notification"),
        }
    }

    fn lock_snapshot(&self) -> MutexGuard<'_, OperationSnapshot> {
        self.inner.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_notifier(&self) -> MutexGuard<'_, Option<Outbox>> {
        self.inner.notifier.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("task_id", &self.inner.task_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
