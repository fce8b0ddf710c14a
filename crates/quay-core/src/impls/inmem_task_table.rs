//! InMemoryTaskTable - 開発・テスト用の TaskTable
//!
//! 行ごとに version を持ち、replace は version が一致したときだけ成功します。
//! `set_unavailable(true)` で全操作を失敗させられます（障害時の挙動のテスト用）。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::domain::{TableError, Task, TaskId};
use crate::ports::{TaskTable, Version, Versioned};

#[derive(Default)]
struct Rows {
    rows: HashMap<TaskId, Versioned<Task>>,
    next_version: Version,
}

impl Rows {
    fn bump(&mut self) -> Version {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Default)]
pub struct InMemoryTaskTable {
    state: Mutex<Rows>,
    unavailable: AtomicBool,
}

impl InMemoryTaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), TableError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TableError::Unavailable("table marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskTable for InMemoryTaskTable {
    async fn insert(&self, task: &Task) -> Result<Version, TableError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.rows.contains_key(&task.task_id) {
            return Err(TableError::EntityAlreadyExists);
        }
        let version = state.bump();
        state.rows.insert(
            task.task_id,
            Versioned {
                version,
                value: task.clone(),
            },
        );
        Ok(version)
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, TableError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.rows.get(&task_id).cloned())
    }

    async fn replace(&self, task: &Task, expected: Version) -> Result<Version, TableError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let current = state
            .rows
            .get(&task.task_id)
            .map(|row| row.version)
            .ok_or(TableError::NotFound)?;
        if current != expected {
            return Err(TableError::VersionMismatch);
        }
        let version = state.bump();
        state.rows.insert(
            task.task_id,
            Versioned {
                version,
                value: task.clone(),
            },
        );
        Ok(version)
    }

    async fn scan_active(&self) -> Result<Vec<TaskId>, TableError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut ids: Vec<TaskId> = state
            .rows
            .values()
            .filter(|row| row.value.active_run().is_some())
            .map(|row| row.value.task_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
