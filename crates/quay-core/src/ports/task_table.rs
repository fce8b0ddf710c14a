//! TaskTable port - Task 行の正本（source of truth）
//!
//! 1 task = 1 行。run は行の中に埋め込まれます。
//!
//! # 設計原則
//! - 読み出しは version を返し、書き込みはその version が最新のときだけ成功する
//! - claim の排他はこの条件付き書き込みだけで保証する（キューは候補通知に過ぎない）
//! - 状態遷移のロジックは持たない（`app::task_store` の責務）

use async_trait::async_trait;

use crate::domain::{TableError, Task, TaskId};

/// Opaque row version (etag).
pub type Version = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: Version,
    pub value: T,
}

#[async_trait]
pub trait TaskTable: Send + Sync {
    /// Insert a new row. Fails with `EntityAlreadyExists` if the key is taken.
    async fn insert(&self, task: &Task) -> Result<Version, TableError>;

    async fn load(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, TableError>;

    /// Overwrite the row if it is still at `expected`.
    /// Fails with `VersionMismatch` otherwise, `NotFound` if the row is gone.
    async fn replace(&self, task: &Task, expected: Version) -> Result<Version, TableError>;

    /// Ids of tasks whose latest run is pending or running.
    async fn scan_active(&self) -> Result<Vec<TaskId>, TableError>;
}
