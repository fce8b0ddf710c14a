//! Errors - エラー型と分類
//!
//! ports ごとのエラー（TableError / QueueError / ArtifactError）と、
//! 呼び出し側に返す QuayError をここにまとめています。
//! `QuayError::kind()` で運用上の分類を取り出せます。

use thiserror::Error;

use super::ids::{RunId, TaskId};
use super::state::RunState;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Optimistic-concurrency collision that outlasted the local retries.
    Conflict,
    /// Caller asked for something the current state does not allow.
    User,
    /// Store or queue temporarily unavailable; safe to retry later.
    Transient,
    /// Cannot recover without outside intervention (e.g. a queue vanished).
    Fatal,
}

/// Errors from a `TaskTable` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("entity already exists")]
    EntityAlreadyExists,

    #[error("entity not found")]
    NotFound,

    /// The row changed since it was read.
    #[error("version mismatch")]
    VersionMismatch,

    #[error("task table unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a `DeliveryQueue` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    /// Message is gone, or the receipt no longer matches its current lease.
    #[error("message not found or receipt mismatch in queue {0}")]
    MessageNotFound(String),

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

/// Errors from an `ArtifactStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),

    #[error("artifact storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuayError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {0} already exists with a different definition")]
    TaskAlreadyExists(TaskId),

    #[error("task definition rejected: {0}")]
    InvalidTask(String),

    #[error("run {run_id} of {task_id} not found")]
    RunNotFound { task_id: TaskId, run_id: RunId },

    #[error("run {run_id} of {task_id} is {state}, it cannot be claimed")]
    RunAlreadyClaimed {
        task_id: TaskId,
        run_id: RunId,
        state: RunState,
    },

    #[error("run {run_id} of {task_id} is not running for this worker ({state})")]
    RunNotRunning {
        task_id: TaskId,
        run_id: RunId,
        state: RunState,
    },

    #[error("deadline of task {0} has passed")]
    DeadlineExceeded(TaskId),

    #[error("task {0} reached the maximum number of runs")]
    RunLimitExceeded(TaskId),

    #[error("task {task_id} still contended after {attempts} attempts")]
    Conflict { task_id: TaskId, attempts: u32 },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QuayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuayError::TaskNotFound(_)
            | QuayError::TaskAlreadyExists(_)
            | QuayError::InvalidTask(_)
            | QuayError::RunNotFound { .. }
            | QuayError::RunAlreadyClaimed { .. }
            | QuayError::RunNotRunning { .. }
            | QuayError::DeadlineExceeded(_)
            | QuayError::RunLimitExceeded(_) => ErrorKind::User,
            QuayError::Conflict { .. } | QuayError::Table(TableError::VersionMismatch) => {
                ErrorKind::Conflict
            }
            QuayError::Queue(QueueError::QueueNotFound(_)) | QuayError::Config(_) => {
                ErrorKind::Fatal
            }
            QuayError::Table(_) | QuayError::Queue(_) | QuayError::Artifact(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// The hint that led to this claim attempt pointed at a run that is no
    /// longer claimable. Consuming the hint is the right response.
    pub fn is_stale_hint(&self) -> bool {
        matches!(
            self,
            QuayError::TaskNotFound(_)
                | QuayError::RunNotFound { .. }
                | QuayError::RunAlreadyClaimed { .. }
                | QuayError::DeadlineExceeded(_)
        )
    }
}
