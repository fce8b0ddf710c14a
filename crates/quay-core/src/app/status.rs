//! Status - タスクの状態ビュー
//!
//! API / CLI にそのまま出せる形（camelCase JSON）。
//! `TaskStore` の create / resolve / rerun / cancel / status が返します。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    ReasonCreated, ReasonResolved, RunId, RunState, Task, TaskId, WorkerIdentity,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub reason_created: ReasonCreated,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_resolved: Option<ReasonResolved>,
    pub scheduled: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: TaskId,
    pub deadline: DateTime<Utc>,
    pub retries_left: u32,
    /// State of the latest run.
    pub state: RunState,
    pub runs: Vec<RunStatus>,
}

impl TaskStatus {
    pub fn latest_run_id(&self) -> Option<RunId> {
        self.runs.last().map(|run| run.run_id)
    }
}

impl From<&Task> for TaskStatus {
    fn from(task: &Task) -> Self {
        let def = &task.definition;
        let runs: Vec<RunStatus> = task
            .runs
            .iter()
            .map(|run| {
                let (worker_group, worker_id) = match &run.worker {
                    Some(WorkerIdentity {
                        worker_group,
                        worker_id,
                    }) => (Some(worker_group.clone()), Some(worker_id.clone())),
                    None => (None, None),
                };
                RunStatus {
                    run_id: run.run_id,
                    state: run.state,
                    reason_created: run.reason_created,
                    reason_resolved: run.reason_resolved,
                    scheduled: run.scheduled,
                    worker_group,
                    worker_id,
                    taken_until: run.taken_until,
                    resolved: run.resolved,
                }
            })
            .collect();
        Self {
            task_id: task.task_id,
            provisioner_id: def.provisioner_id.clone(),
            worker_type: def.worker_type.clone(),
            scheduler_id: def.scheduler_id.clone(),
            task_group_id: def.task_group_id,
            deadline: def.deadline,
            retries_left: task.retries_left,
            state: runs.last().map_or(RunState::Pending, |run| run.state),
            runs,
        }
    }
}
