//! Events - タスクのライフサイクルイベント
//!
//! EventSink（ports）に渡されます。配送先（message bus など）は外部の責務です。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::{RunId, TaskId};
use super::pool::WorkerIdentity;
use super::state::ReasonResolved;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DomainEvent {
    TaskDefined {
        task_id: TaskId,
    },
    /// A run became claimable.
    TaskPending {
        task_id: TaskId,
        run_id: RunId,
    },
    TaskRunning {
        task_id: TaskId,
        run_id: RunId,
        worker: WorkerIdentity,
        taken_until: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        run_id: RunId,
    },
    TaskFailed {
        task_id: TaskId,
        run_id: RunId,
        reason: ReasonResolved,
    },
    TaskException {
        task_id: TaskId,
        run_id: RunId,
        reason: ReasonResolved,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            DomainEvent::TaskDefined { task_id }
            | DomainEvent::TaskPending { task_id, .. }
            | DomainEvent::TaskRunning { task_id, .. }
            | DomainEvent::TaskCompleted { task_id, .. }
            | DomainEvent::TaskFailed { task_id, .. }
            | DomainEvent::TaskException { task_id, .. } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskDefined { .. } => "task-defined",
            DomainEvent::TaskPending { .. } => "task-pending",
            DomainEvent::TaskRunning { .. } => "task-running",
            DomainEvent::TaskCompleted { .. } => "task-completed",
            DomainEvent::TaskFailed { .. } => "task-failed",
            DomainEvent::TaskException { .. } => "task-exception",
        }
    }
}
