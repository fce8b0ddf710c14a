//! TaskStore - Task 行の状態機械（claim の排他はここで決まる）
//!
//! # フロー
//! 1. TaskTable::load() で行と version を読む
//! 2. domain::Task の純粋なメソッドで遷移させる
//! 3. TaskTable::replace(expected version) で条件付き書き込み
//! 4. VersionMismatch なら 1 からやり直す（max_modify_attempts 回まで）
//!
//! 書き込みが成功した後に hint の enqueue とイベント通知を行います。
//! hint の enqueue に失敗しても行は巻き戻しません。同じ操作をもう一度
//! 呼べば（create / resolve は冪等）hint が入り直します。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::domain::{
    DomainEvent, Expiry, QuayError, ReasonResolved, Resolution, RunId, RunState, TableError,
    Task, TaskDefinition, TaskId, WorkerIdentity,
};
use crate::ports::{Clock, EventSink, TaskTable};

use super::queue_service::QueueService;
use super::status::TaskStatus;

/// A run the caller now holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedRun {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub worker_group: String,
    pub worker_id: String,
    pub taken_until: DateTime<Utc>,
    pub task: TaskDefinition,
}

pub struct TaskStore {
    table: Arc<dyn TaskTable>,
    queues: Arc<QueueService>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    claim_timeout: chrono::Duration,
    max_modify_attempts: u32,
}

impl TaskStore {
    pub fn new(
        table: Arc<dyn TaskTable>,
        queues: Arc<QueueService>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        claim_timeout: chrono::Duration,
        max_modify_attempts: u32,
    ) -> Self {
        Self {
            table,
            queues,
            events,
            clock,
            claim_timeout,
            max_modify_attempts,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a task with run 0 pending and enqueue its hint.
    ///
    /// Creating the same task again with an identical definition succeeds and
    /// re-enqueues the hint while run 0 is still pending.
    pub async fn create(
        &self,
        task_id: TaskId,
        definition: TaskDefinition,
    ) -> Result<TaskStatus, QuayError> {
        definition.validate()?;
        let task = Task::new(task_id, definition, self.clock.now());

        match self.table.insert(&task).await {
            Ok(_) => {
                tracing::info!(%task_id, pool = %task.pool(), "task defined");
                self.events.emit(DomainEvent::TaskDefined { task_id });
                self.enqueue(&task, 0).await?;
                self.events.emit(DomainEvent::TaskPending { task_id, run_id: 0 });
                Ok(TaskStatus::from(&task))
            }
            Err(TableError::EntityAlreadyExists) => {
                let existing = self
                    .table
                    .load(task_id)
                    .await?
                    .ok_or(QuayError::TaskNotFound(task_id))?
                    .value;
                if existing.definition != task.definition {
                    return Err(QuayError::TaskAlreadyExists(task_id));
                }
                if existing.pending_run_id() == Some(0) {
                    tracing::debug!(%task_id, "repeated create, hint re-enqueued");
                    self.enqueue(&existing, 0).await?;
                }
                Ok(TaskStatus::from(&existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// pending → running for `worker`.
    pub async fn claim(
        &self,
        task_id: TaskId,
        run_id: RunId,
        worker: &WorkerIdentity,
    ) -> Result<ClaimedRun, QuayError> {
        worker.validate()?;
        let now = self.clock.now();
        let timeout = self.claim_timeout;
        let (task, taken_until) = self
            .modify(task_id, |task| task.claim(run_id, worker, now, timeout))
            .await?;

        tracing::debug!(%task_id, run_id, %worker, %taken_until, "run claimed");
        self.events.emit(DomainEvent::TaskRunning {
            task_id,
            run_id,
            worker: worker.clone(),
            taken_until,
        });
        Ok(ClaimedRun {
            task_id,
            run_id,
            worker_group: worker.worker_group.clone(),
            worker_id: worker.worker_id.clone(),
            taken_until,
            task: task.definition,
        })
    }

    /// Extend the claim `worker` holds. Returns the new `taken_until`.
    pub async fn reclaim(
        &self,
        task_id: TaskId,
        run_id: RunId,
        worker: &WorkerIdentity,
    ) -> Result<DateTime<Utc>, QuayError> {
        let now = self.clock.now();
        let timeout = self.claim_timeout;
        let (_, taken_until) = self
            .modify(task_id, |task| task.reclaim(run_id, worker, now, timeout))
            .await?;
        tracing::debug!(%task_id, run_id, %worker, %taken_until, "claim extended");
        Ok(taken_until)
    }

    /// Resolve a running run; a retry run appended here gets its hint enqueued.
    pub async fn resolve(
        &self,
        task_id: TaskId,
        run_id: RunId,
        resolution: Resolution,
    ) -> Result<TaskStatus, QuayError> {
        let now = self.clock.now();
        let (task, resolved) = self
            .modify(task_id, |task| task.resolve(run_id, resolution, now))
            .await?;

        if !resolved.repeated {
            tracing::info!(%task_id, run_id, state = %resolution.state(), "run resolved");
            self.events.emit(resolved_event(
                task_id,
                run_id,
                resolution.state(),
                resolution.reason(),
            ));
        }
        if let Some(retry_run) = resolved.retry_run {
            self.enqueue(&task, retry_run).await?;
            if !resolved.repeated {
                self.events.emit(DomainEvent::TaskPending {
                    task_id,
                    run_id: retry_run,
                });
            }
        }
        Ok(TaskStatus::from(&task))
    }

    /// Append a rerun if the task is resolved and has retries left; otherwise
    /// return the current status unchanged.
    pub async fn rerun(&self, task_id: TaskId) -> Result<TaskStatus, QuayError> {
        self.rerun_with(task_id, false).await
    }

    /// Operator rerun that ignores the retry budget.
    pub async fn force_rerun(&self, task_id: TaskId) -> Result<TaskStatus, QuayError> {
        self.rerun_with(task_id, true).await
    }

    async fn rerun_with(&self, task_id: TaskId, force: bool) -> Result<TaskStatus, QuayError> {
        let now = self.clock.now();
        let (task, run_id) = self
            .modify(task_id, |task| task.rerun(now, force))
            .await?;
        if let Some(run_id) = run_id {
            tracing::info!(%task_id, run_id, force, "task rerun");
            self.enqueue(&task, run_id).await?;
            self.events.emit(DomainEvent::TaskPending { task_id, run_id });
        }
        Ok(TaskStatus::from(&task))
    }

    /// Resolve the active run (if any) as failed / canceled.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus, QuayError> {
        let now = self.clock.now();
        let (task, canceled) = self
            .modify(task_id, |task| Ok(task.cancel(now)))
            .await?;
        if let Some(run_id) = canceled {
            tracing::info!(%task_id, run_id, "task canceled");
            self.events.emit(resolved_event(
                task_id,
                run_id,
                RunState::Failed,
                ReasonResolved::Canceled,
            ));
        }
        Ok(TaskStatus::from(&task))
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatus, QuayError> {
        let row = self
            .table
            .load(task_id)
            .await?
            .ok_or(QuayError::TaskNotFound(task_id))?;
        Ok(TaskStatus::from(&row.value))
    }

    /// Reaper entry point: resolve whatever has expired at `now`.
    pub async fn expire(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Expiry>, QuayError> {
        let (task, expiry) = self
            .modify(task_id, |task| Ok(task.expire(now)))
            .await?;
        match expiry {
            Some(Expiry::Deadline { run_id }) => {
                tracing::info!(%task_id, run_id, "deadline exceeded");
                self.events.emit(resolved_event(
                    task_id,
                    run_id,
                    RunState::Failed,
                    ReasonResolved::DeadlineExceeded,
                ));
            }
            Some(Expiry::Claim { run_id, retry_run }) => {
                tracing::info!(%task_id, run_id, ?retry_run, "claim expired");
                self.events.emit(resolved_event(
                    task_id,
                    run_id,
                    RunState::Exception,
                    ReasonResolved::ClaimExpired,
                ));
                if let Some(retry_run) = retry_run {
                    self.enqueue(&task, retry_run).await?;
                    self.events.emit(DomainEvent::TaskPending {
                        task_id,
                        run_id: retry_run,
                    });
                }
            }
            None => {}
        }
        Ok(expiry)
    }

    async fn enqueue(&self, task: &Task, run_id: RunId) -> Result<(), QuayError> {
        let def = &task.definition;
        self.queues
            .put_task(&task.pool(), task.task_id, run_id, def.priority, def.deadline)
            .await?;
        Ok(())
    }

    /// Versioned read-modify-write of one row.
    ///
    /// `f` runs against a fresh copy on every attempt. When it leaves the task
    /// unchanged the write is skipped.
    async fn modify<F, R>(&self, task_id: TaskId, mut f: F) -> Result<(Task, R), QuayError>
    where
        F: FnMut(&mut Task) -> Result<R, QuayError> + Send,
        R: Send,
    {
        for attempt in 1..=self.max_modify_attempts {
            let row = self
                .table
                .load(task_id)
                .await?
                .ok_or(QuayError::TaskNotFound(task_id))?;
            let mut task = row.value.clone();
            let outcome = f(&mut task)?;
            if task == row.value {
                return Ok((task, outcome));
            }
            match self.table.replace(&task, row.version).await {
                Ok(_) => return Ok((task, outcome)),
                Err(TableError::VersionMismatch) => {
                    tracing::debug!(%task_id, attempt, "row changed underneath, retrying");
                }
                Err(TableError::NotFound) => return Err(QuayError::TaskNotFound(task_id)),
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(%task_id, attempts = self.max_modify_attempts, "giving up on contended row");
        Err(QuayError::Conflict {
            task_id,
            attempts: self.max_modify_attempts,
        })
    }
}

fn resolved_event(
    task_id: TaskId,
    run_id: RunId,
    state: RunState,
    reason: ReasonResolved,
) -> DomainEvent {
    match state {
        RunState::Completed => DomainEvent::TaskCompleted { task_id, run_id },
        RunState::Exception => DomainEvent::TaskException {
            task_id,
            run_id,
            reason,
        },
        _ => DomainEvent::TaskFailed {
            task_id,
            run_id,
            reason,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::task::tests::{definition, t0};
    use crate::domain::{PoolKey, ReasonCreated};
    use crate::impls::{InMemoryDeliveryQueue, InMemoryTaskTable, RecordingEventSink};
    use crate::ports::{FixedClock, Version, Versioned};
    use async_trait::async_trait;
    use std::time::Duration;

    /// In-memory wiring shared by the app tests.
    pub(crate) struct Harness {
        pub table: Arc<InMemoryTaskTable>,
        pub delivery: Arc<InMemoryDeliveryQueue>,
        pub clock: Arc<FixedClock>,
        pub events: Arc<RecordingEventSink>,
        pub queues: Arc<QueueService>,
        pub store: Arc<TaskStore>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let table = Arc::new(InMemoryTaskTable::new());
            Self::with_table(table.clone(), table)
        }

        fn with_table(table: Arc<InMemoryTaskTable>, port: Arc<dyn TaskTable>) -> Self {
            let delivery = Arc::new(InMemoryDeliveryQueue::new());
            let clock = Arc::new(FixedClock::new(t0()));
            let events = Arc::new(RecordingEventSink::new());
            let queues = Arc::new(QueueService::new(
                delivery.clone(),
                clock.clone(),
                "quay",
                Duration::from_secs(300),
                chrono::Duration::minutes(30),
            ));
            let store = Arc::new(TaskStore::new(
                port,
                queues.clone(),
                events.clone(),
                clock.clone(),
                chrono::Duration::minutes(20),
                5,
            ));
            Self {
                table,
                delivery,
                clock,
                events,
                queues,
                store,
            }
        }

        pub(crate) fn pool(&self) -> PoolKey {
            PoolKey::new("prov", "linux")
        }

        pub(crate) async fn create(&self, retries: u32) -> TaskId {
            let task_id = TaskId::generate();
            self.store.create(task_id, definition(retries)).await.unwrap();
            task_id
        }

        pub(crate) async fn pending_hints(&self) -> usize {
            self.queues.count_pending(&self.pool()).await.unwrap()
        }

        pub(crate) async fn version(&self, task_id: TaskId) -> Version {
            self.table.load(task_id).await.unwrap().unwrap().version
        }
    }

    pub(crate) fn worker(id: &str) -> WorkerIdentity {
        WorkerIdentity::new("group", id)
    }

    #[tokio::test]
    async fn create_stores_pending_run_and_enqueues_hint() {
        let h = Harness::new();
        let task_id = h.create(1).await;

        let status = h.store.status(task_id).await.unwrap();
        assert_eq!(status.state, RunState::Pending);
        assert_eq!(status.runs[0].reason_created, ReasonCreated::NewTask);
        assert_eq!(h.pending_hints().await, 1);
        assert_eq!(h.events.names(), vec!["task-defined", "task-pending"]);
    }

    #[tokio::test]
    async fn identical_create_is_idempotent_and_re_enqueues() {
        let h = Harness::new();
        let task_id = TaskId::generate();
        let def = definition(0);
        h.store.create(task_id, def.clone()).await.unwrap();
        let again = h.store.create(task_id, def.clone()).await.unwrap();

        assert_eq!(again.runs.len(), 1);
        assert_eq!(h.pending_hints().await, 2);

        let mut different = def;
        different.retries = 3;
        let err = h.store.create(task_id, different).await.unwrap_err();
        assert_eq!(err, QuayError::TaskAlreadyExists(task_id));
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_before_insert() {
        let h = Harness::new();
        let mut def = definition(0);
        def.provisioner_id = "has spaces".to_string();
        let err = h.store.create(TaskId::generate(), def).await.unwrap_err();
        assert!(matches!(err, QuayError::InvalidTask(_)));
        assert!(h.table.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_claims_grant_exactly_one() {
        let h = Harness::new();
        let task_id = h.create(0).await;

        let attempts = (0..8).map(|i| {
            let store = h.store.clone();
            tokio::spawn(async move { store.claim(task_id, 0, &worker(&format!("w{i}"))).await })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(result.is_stale_hint(), "unexpected error {result:?}");
        }
    }

    #[tokio::test]
    async fn claim_reports_definition_and_claim_expiry() {
        let h = Harness::new();
        let task_id = h.create(0).await;
        let claimed = h.store.claim(task_id, 0, &worker("w1")).await.unwrap();
        assert_eq!(claimed.taken_until, t0() + chrono::Duration::minutes(20));
        assert_eq!(claimed.worker_id, "w1");
        assert_eq!(claimed.task.worker_type, "linux");

        h.clock.advance(chrono::Duration::minutes(5));
        let until = h.store.reclaim(task_id, 0, &worker("w1")).await.unwrap();
        assert_eq!(until, t0() + chrono::Duration::minutes(25));
    }

    #[tokio::test]
    async fn claim_of_unknown_task_is_not_found() {
        let h = Harness::new();
        let task_id = TaskId::generate();
        let err = h.store.claim(task_id, 0, &worker("w1")).await.unwrap_err();
        assert_eq!(err, QuayError::TaskNotFound(task_id));
    }

    #[tokio::test]
    async fn failed_resolution_enqueues_retry() {
        let h = Harness::new();
        let task_id = h.create(1).await;
        h.store.claim(task_id, 0, &worker("w1")).await.unwrap();
        let status = h.store.resolve(task_id, 0, Resolution::Failed).await.unwrap();

        assert_eq!(status.runs.len(), 2);
        assert_eq!(status.retries_left, 0);
        assert_eq!(status.state, RunState::Pending);
        // one hint for run 0 (still in the queue), one for the retry
        assert_eq!(h.pending_hints().await, 2);
        assert_eq!(
            h.events.names(),
            vec!["task-defined", "task-pending", "task-running", "task-failed", "task-pending"]
        );

        // repeating the resolution is quiet but re-enqueues the retry's hint
        h.store.resolve(task_id, 0, Resolution::Failed).await.unwrap();
        assert_eq!(h.events.events().len(), 5);
        assert_eq!(h.pending_hints().await, 3);
    }

    #[tokio::test]
    async fn rerun_is_idempotent_when_nothing_changes() {
        let h = Harness::new();
        let task_id = h.create(1).await;

        // active run: no-op, no write
        let before = h.version(task_id).await;
        h.store.rerun(task_id).await.unwrap();
        assert_eq!(h.version(task_id).await, before);

        h.store.claim(task_id, 0, &worker("w1")).await.unwrap();
        h.store.resolve(task_id, 0, Resolution::Completed).await.unwrap();
        let status = h.store.rerun(task_id).await.unwrap();
        assert_eq!(status.runs[1].reason_created, ReasonCreated::Rerun);

        let again = h.store.rerun(task_id).await.unwrap();
        assert_eq!(again.runs.len(), 2);
    }

    #[tokio::test]
    async fn force_rerun_ignores_retry_budget() {
        let h = Harness::new();
        let task_id = h.create(0).await;
        h.store.cancel(task_id).await.unwrap();

        assert_eq!(h.store.rerun(task_id).await.unwrap().runs.len(), 1);
        let status = h.store.force_rerun(task_id).await.unwrap();
        assert_eq!(status.runs.len(), 2);
        assert_eq!(status.retries_left, 0);
    }

    #[tokio::test]
    async fn cancel_marks_failed_canceled() {
        let h = Harness::new();
        let task_id = h.create(2).await;
        let status = h.store.cancel(task_id).await.unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.runs[0].reason_resolved, Some(ReasonResolved::Canceled));

        // the leftover hint is stale now
        let err = h.store.claim(task_id, 0, &worker("w1")).await.unwrap_err();
        assert!(err.is_stale_hint());
    }

    #[tokio::test]
    async fn expire_handles_deadline_then_nothing() {
        let h = Harness::new();
        let task_id = h.create(3).await;
        let late = t0() + chrono::Duration::hours(2);

        let expiry = h.store.expire(task_id, late).await.unwrap();
        assert_eq!(expiry, Some(Expiry::Deadline { run_id: 0 }));
        assert_eq!(h.store.expire(task_id, late).await.unwrap(), None);
        assert!(h.events.names().contains(&"task-failed"));
    }

    #[tokio::test]
    async fn expired_claim_is_retried_with_new_hint() {
        let h = Harness::new();
        let task_id = h.create(1).await;
        h.store.claim(task_id, 0, &worker("w1")).await.unwrap();

        let after = t0() + chrono::Duration::minutes(30);
        h.clock.set(after);
        let expiry = h.store.expire(task_id, after).await.unwrap();
        assert_eq!(expiry, Some(Expiry::Claim { run_id: 0, retry_run: Some(1) }));
        assert_eq!(h.pending_hints().await, 2);
        assert_eq!(h.events.names().last(), Some(&"task-pending"));
    }

    /// Table whose rows always look modified by someone else.
    struct ContendedTable(Arc<InMemoryTaskTable>);

    #[async_trait]
    impl TaskTable for ContendedTable {
        async fn insert(&self, task: &Task) -> Result<Version, TableError> {
            self.0.insert(task).await
        }

        async fn load(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, TableError> {
            self.0.load(task_id).await
        }

        async fn replace(&self, _task: &Task, _expected: Version) -> Result<Version, TableError> {
            Err(TableError::VersionMismatch)
        }

        async fn scan_active(&self) -> Result<Vec<TaskId>, TableError> {
            self.0.scan_active().await
        }
    }

    #[tokio::test]
    async fn persistent_contention_surfaces_conflict() {
        let inner = Arc::new(InMemoryTaskTable::new());
        let h = Harness::with_table(inner.clone(), Arc::new(ContendedTable(inner)));
        let task_id = h.create(0).await;

        let err = h.store.claim(task_id, 0, &worker("w1")).await.unwrap_err();
        assert_eq!(err, QuayError::Conflict { task_id, attempts: 5 });
        assert!(!err.is_stale_hint());
    }

    #[tokio::test]
    async fn unavailable_table_is_transient() {
        let h = Harness::new();
        let task_id = h.create(0).await;
        h.table.set_unavailable(true);
        let err = h.store.claim(task_id, 0, &worker("w1")).await.unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Transient);
    }
}
