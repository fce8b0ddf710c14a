//! Task entity and its run state machine.
//!
//! Design:
//! - A `Task` row is the single source of truth; runs are embedded and append-only.
//! - Every transition here is pure (no I/O). `TaskStore` wraps these in a
//!   versioned read-modify-write, so a transition and the run it appends land
//!   in the same conditional write.
//! - At most one run is active (pending/running) and it is always the last one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QuayError;
use super::ids::{MAX_RUN_ID, RunId, TaskId};
use super::pool::{PoolKey, WorkerIdentity, validate_identifier};
use super::state::{Priority, ReasonCreated, ReasonResolved, RunState};

/// Upper bound on `retries` a definition may ask for.
pub const MAX_RETRIES: u32 = 999;

pub const ROUTING_MAX_LENGTH: usize = 128;

/// What the producer submits. Compared field by field for idempotent create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: TaskId,
    #[serde(default)]
    pub priority: Priority,
    pub retries: u32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub routing: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Opaque to the queue.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDefinition {
    pub fn pool(&self) -> PoolKey {
        PoolKey::new(&self.provisioner_id, &self.worker_type)
    }

    pub fn validate(&self) -> Result<(), QuayError> {
        self.pool().validate()?;
        validate_identifier("schedulerId", &self.scheduler_id)?;
        if self.deadline <= self.created {
            return Err(QuayError::InvalidTask(
                "deadline must be after created".to_string(),
            ));
        }
        if self.retries > MAX_RETRIES {
            return Err(QuayError::InvalidTask(format!(
                "retries {} exceeds {MAX_RETRIES}",
                self.retries
            )));
        }
        if self.routing.len() > ROUTING_MAX_LENGTH {
            return Err(QuayError::InvalidTask(format!(
                "routing longer than {ROUTING_MAX_LENGTH} characters"
            )));
        }
        Ok(())
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub state: RunState,
    pub reason_created: ReasonCreated,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_resolved: Option<ReasonResolved>,
    pub scheduled: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Claim expiry. Only meaningful while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<DateTime<Utc>>,
}

impl Run {
    fn pending(run_id: RunId, reason_created: ReasonCreated, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            reason_created,
            reason_resolved: None,
            scheduled: now,
            worker: None,
            started: None,
            taken_until: None,
            resolved: None,
        }
    }

    fn finish(&mut self, state: RunState, reason: ReasonResolved, now: DateTime<Utc>) {
        self.state = state;
        self.reason_resolved = Some(reason);
        self.resolved = Some(now);
    }

    fn is_held_by(&self, worker: &WorkerIdentity) -> bool {
        self.state == RunState::Running && self.worker.as_ref() == Some(worker)
    }
}

/// Outcome a worker reports for the run it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Completed,
    Failed,
    /// The worker is going away; the task itself is fine to retry.
    WorkerShutdown,
}

impl Resolution {
    pub fn state(self) -> RunState {
        match self {
            Resolution::Completed => RunState::Completed,
            Resolution::Failed => RunState::Failed,
            Resolution::WorkerShutdown => RunState::Exception,
        }
    }

    pub fn reason(self) -> ReasonResolved {
        match self {
            Resolution::Completed => ReasonResolved::Completed,
            Resolution::Failed => ReasonResolved::Failed,
            Resolution::WorkerShutdown => ReasonResolved::WorkerShutdown,
        }
    }

    /// Reason for the automatic run appended after this resolution, if any.
    pub fn retry_reason(self) -> Option<ReasonCreated> {
        match self {
            Resolution::Completed => None,
            Resolution::Failed => Some(ReasonCreated::Retry),
            Resolution::WorkerShutdown => Some(ReasonCreated::TaskRetry),
        }
    }
}

/// Result of `Task::resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Pending run appended by the automatic retry path.
    pub retry_run: Option<RunId>,
    /// The run was already resolved the same way; nothing changed.
    pub repeated: bool,
}

/// What the reaper did to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Deadline {
        run_id: RunId,
    },
    Claim {
        run_id: RunId,
        retry_run: Option<RunId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub definition: TaskDefinition,
    pub retries_left: u32,
    pub runs: Vec<Run>,
}

impl Task {
    /// New task with run 0 pending.
    pub fn new(task_id: TaskId, definition: TaskDefinition, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            retries_left: definition.retries,
            definition,
            runs: vec![Run::pending(0, ReasonCreated::NewTask, now)],
        }
    }

    pub fn pool(&self) -> PoolKey {
        self.definition.pool()
    }

    pub fn latest_run(&self) -> Option<&Run> {
        self.runs.last()
    }

    pub fn active_run(&self) -> Option<&Run> {
        self.runs.last().filter(|run| run.state.is_active())
    }

    /// Run id of the latest run if it is still waiting for a claim.
    pub fn pending_run_id(&self) -> Option<RunId> {
        self.active_run()
            .filter(|run| run.state == RunState::Pending)
            .map(|run| run.run_id)
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.definition.deadline
    }

    /// Does the reaper have anything to do with this task at `now`?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.active_run() {
            None => false,
            Some(_) if self.deadline_passed(now) => true,
            Some(run) => run.state == RunState::Running && run.taken_until.is_some_and(|t| t <= now),
        }
    }

    fn run_mut(&mut self, run_id: RunId) -> Result<&mut Run, QuayError> {
        let task_id = self.task_id;
        self.runs
            .get_mut(run_id as usize)
            .ok_or(QuayError::RunNotFound { task_id, run_id })
    }

    /// pending → running
    pub fn claim(
        &mut self,
        run_id: RunId,
        worker: &WorkerIdentity,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<DateTime<Utc>, QuayError> {
        let task_id = self.task_id;
        let deadline_passed = self.deadline_passed(now);
        let run = self.run_mut(run_id)?;
        if run.state != RunState::Pending {
            return Err(QuayError::RunAlreadyClaimed {
                task_id,
                run_id,
                state: run.state,
            });
        }
        if deadline_passed {
            return Err(QuayError::DeadlineExceeded(task_id));
        }
        let taken_until = now + claim_timeout;
        run.state = RunState::Running;
        run.worker = Some(worker.clone());
        run.started = Some(now);
        run.taken_until = Some(taken_until);
        Ok(taken_until)
    }

    /// Extend the claim held by `worker`.
    pub fn reclaim(
        &mut self,
        run_id: RunId,
        worker: &WorkerIdentity,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<DateTime<Utc>, QuayError> {
        let task_id = self.task_id;
        let deadline_passed = self.deadline_passed(now);
        let run = self.run_mut(run_id)?;
        if !run.is_held_by(worker) {
            return Err(QuayError::RunNotRunning {
                task_id,
                run_id,
                state: run.state,
            });
        }
        if deadline_passed {
            return Err(QuayError::DeadlineExceeded(task_id));
        }
        let taken_until = now + claim_timeout;
        run.taken_until = Some(taken_until);
        Ok(taken_until)
    }

    /// running → completed / failed / exception, appending a retry run when allowed.
    pub fn resolve(
        &mut self,
        run_id: RunId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Resolved, QuayError> {
        let task_id = self.task_id;
        let run = self.run_mut(run_id)?;
        match run.state {
            RunState::Running => {}
            state if state == resolution.state()
                && run.reason_resolved == Some(resolution.reason()) =>
            {
                let retry_run = self
                    .runs
                    .get(run_id as usize + 1)
                    .filter(|next| next.state == RunState::Pending)
                    .map(|next| next.run_id);
                return Ok(Resolved {
                    retry_run,
                    repeated: true,
                });
            }
            state => {
                return Err(QuayError::RunNotRunning {
                    task_id,
                    run_id,
                    state,
                });
            }
        }

        run.finish(resolution.state(), resolution.reason(), now);
        let retry_run = resolution
            .retry_reason()
            .and_then(|reason| self.append_retry(reason, now));
        Ok(Resolved {
            retry_run,
            repeated: false,
        })
    }

    /// Operator rerun of a resolved task.
    ///
    /// Without `force` this consumes one of `retries_left` and is a no-op when
    /// none are left. Returns the appended run, or `None` for a no-op.
    pub fn rerun(&mut self, now: DateTime<Utc>, force: bool) -> Result<Option<RunId>, QuayError> {
        if self.active_run().is_some() {
            return Ok(None);
        }
        if self.deadline_passed(now) {
            return Err(QuayError::DeadlineExceeded(self.task_id));
        }
        if !force && self.retries_left == 0 {
            return Ok(None);
        }
        let run_id = self.next_run_id().ok_or(QuayError::RunLimitExceeded(self.task_id))?;
        if !force {
            self.retries_left -= 1;
        }
        self.runs.push(Run::pending(run_id, ReasonCreated::Rerun, now));
        Ok(Some(run_id))
    }

    /// Resolve the active run as failed/canceled. Returns the canceled run.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Option<RunId> {
        let run = self.runs.last_mut().filter(|run| run.state.is_active())?;
        run.finish(RunState::Failed, ReasonResolved::Canceled, now);
        Some(run.run_id)
    }

    /// Deadline first, then claim expiry. Deadline expiry never retries.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<Expiry> {
        if !self.is_expired(now) {
            return None;
        }
        let deadline_passed = self.deadline_passed(now);
        let run = self.runs.last_mut()?;
        let run_id = run.run_id;
        if deadline_passed {
            run.finish(RunState::Failed, ReasonResolved::DeadlineExceeded, now);
            return Some(Expiry::Deadline { run_id });
        }
        run.finish(RunState::Exception, ReasonResolved::ClaimExpired, now);
        let retry_run = self.append_retry(ReasonCreated::Retry, now);
        Some(Expiry::Claim { run_id, retry_run })
    }

    fn next_run_id(&self) -> Option<RunId> {
        let next = self.runs.len() as RunId;
        (next <= MAX_RUN_ID).then_some(next)
    }

    fn append_retry(&mut self, reason: ReasonCreated, now: DateTime<Utc>) -> Option<RunId> {
        if self.retries_left == 0 || self.deadline_passed(now) {
            return None;
        }
        let run_id = self.next_run_id()?;
        self.retries_left -= 1;
        self.runs.push(Run::pending(run_id, reason, now));
        Some(run_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn definition(retries: u32) -> TaskDefinition {
        TaskDefinition {
            provisioner_id: "prov".to_string(),
            worker_type: "linux".to_string(),
            scheduler_id: "test-scheduler".to_string(),
            task_group_id: TaskId::generate(),
            priority: Priority::Normal,
            retries,
            created: t0(),
            deadline: t0() + Duration::hours(1),
            routing: "my.routing.key".to_string(),
            scopes: vec![],
            payload: serde_json::json!({"cmd": "true"}),
        }
    }

    fn worker() -> WorkerIdentity {
        WorkerIdentity::new("group", "w1")
    }

    fn claimed(task: &mut Task, run_id: RunId) {
        task.claim(run_id, &worker(), t0(), Duration::minutes(20))
            .unwrap();
    }

    #[test]
    fn new_task_has_single_pending_run() {
        let task = Task::new(TaskId::generate(), definition(2), t0());
        assert_eq!(task.runs.len(), 1);
        assert_eq!(task.runs[0].state, RunState::Pending);
        assert_eq!(task.runs[0].reason_created, ReasonCreated::NewTask);
        assert_eq!(task.pending_run_id(), Some(0));
    }

    #[test]
    fn claim_twice_is_rejected() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        let until = task.claim(0, &worker(), t0(), Duration::minutes(20)).unwrap();
        assert_eq!(until, t0() + Duration::minutes(20));

        let err = task
            .claim(0, &WorkerIdentity::new("group", "w2"), t0(), Duration::minutes(20))
            .unwrap_err();
        assert!(matches!(err, QuayError::RunAlreadyClaimed { state: RunState::Running, .. }));
    }

    #[test]
    fn claim_unknown_run_is_not_found() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        let err = task.claim(4, &worker(), t0(), Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, QuayError::RunNotFound { run_id: 4, .. }));
    }

    #[test]
    fn claim_after_deadline_is_refused() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        let late = t0() + Duration::hours(2);
        let err = task.claim(0, &worker(), late, Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, QuayError::DeadlineExceeded(_)));
    }

    #[test]
    fn reclaim_requires_same_worker() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        claimed(&mut task, 0);

        let later = t0() + Duration::minutes(10);
        let until = task.reclaim(0, &worker(), later, Duration::minutes(20)).unwrap();
        assert_eq!(until, later + Duration::minutes(20));

        let err = task
            .reclaim(0, &WorkerIdentity::new("group", "other"), later, Duration::minutes(20))
            .unwrap_err();
        assert!(matches!(err, QuayError::RunNotRunning { .. }));
    }

    #[test]
    fn failed_runs_retry_until_budget_is_spent() {
        let mut task = Task::new(TaskId::generate(), definition(2), t0());

        claimed(&mut task, 0);
        let resolved = task.resolve(0, Resolution::Failed, t0()).unwrap();
        assert_eq!(resolved.retry_run, Some(1));
        assert_eq!(task.runs[1].reason_created, ReasonCreated::Retry);
        assert_eq!(task.retries_left, 1);

        claimed(&mut task, 1);
        let resolved = task.resolve(1, Resolution::Failed, t0()).unwrap();
        assert_eq!(resolved.retry_run, Some(2));
        assert_eq!(task.retries_left, 0);

        claimed(&mut task, 2);
        let resolved = task.resolve(2, Resolution::Failed, t0()).unwrap();
        assert_eq!(resolved.retry_run, None);
        assert_eq!(task.runs.len(), 3);
        assert!(task.active_run().is_none());
    }

    #[rstest]
    #[case(Resolution::Completed, RunState::Completed, None)]
    #[case(Resolution::Failed, RunState::Failed, Some(ReasonCreated::Retry))]
    #[case(Resolution::WorkerShutdown, RunState::Exception, Some(ReasonCreated::TaskRetry))]
    fn resolution_maps_to_state_and_retry(
        #[case] resolution: Resolution,
        #[case] state: RunState,
        #[case] retry: Option<ReasonCreated>,
    ) {
        let mut task = Task::new(TaskId::generate(), definition(1), t0());
        claimed(&mut task, 0);
        task.resolve(0, resolution, t0()).unwrap();
        assert_eq!(task.runs[0].state, state);
        assert_eq!(task.runs.get(1).map(|r| r.reason_created), retry);
    }

    #[test]
    fn resolving_twice_the_same_way_is_idempotent() {
        let mut task = Task::new(TaskId::generate(), definition(1), t0());
        claimed(&mut task, 0);
        task.resolve(0, Resolution::Failed, t0()).unwrap();
        let snapshot = task.clone();

        let again = task.resolve(0, Resolution::Failed, t0()).unwrap();
        assert!(again.repeated);
        assert_eq!(again.retry_run, Some(1));
        assert_eq!(task, snapshot);

        let err = task.resolve(0, Resolution::Completed, t0()).unwrap_err();
        assert!(matches!(err, QuayError::RunNotRunning { state: RunState::Failed, .. }));
    }

    #[test]
    fn resolving_a_pending_run_is_rejected() {
        let mut task = Task::new(TaskId::generate(), definition(1), t0());
        let err = task.resolve(0, Resolution::Completed, t0()).unwrap_err();
        assert!(matches!(err, QuayError::RunNotRunning { state: RunState::Pending, .. }));
    }

    #[test]
    fn rerun_appends_once_then_is_a_noop() {
        let mut task = Task::new(TaskId::generate(), definition(1), t0());
        claimed(&mut task, 0);
        task.resolve(0, Resolution::Completed, t0()).unwrap();

        assert_eq!(task.rerun(t0(), false).unwrap(), Some(1));
        assert_eq!(task.runs[1].reason_created, ReasonCreated::Rerun);
        assert_eq!(task.retries_left, 0);

        let snapshot = task.clone();
        assert_eq!(task.rerun(t0(), false).unwrap(), None);
        assert_eq!(task, snapshot);
    }

    #[test]
    fn rerun_without_retries_needs_force() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        claimed(&mut task, 0);
        task.resolve(0, Resolution::Completed, t0()).unwrap();

        assert_eq!(task.rerun(t0(), false).unwrap(), None);
        assert_eq!(task.rerun(t0(), true).unwrap(), Some(1));
        assert_eq!(task.retries_left, 0);
    }

    #[test]
    fn rerun_past_deadline_is_refused() {
        let mut task = Task::new(TaskId::generate(), definition(3), t0());
        task.cancel(t0());
        let err = task.rerun(t0() + Duration::hours(2), true).unwrap_err();
        assert!(matches!(err, QuayError::DeadlineExceeded(_)));
    }

    #[test]
    fn cancel_resolves_active_run_as_canceled() {
        let mut task = Task::new(TaskId::generate(), definition(3), t0());
        assert_eq!(task.cancel(t0()), Some(0));
        assert_eq!(task.runs[0].state, RunState::Failed);
        assert_eq!(task.runs[0].reason_resolved, Some(ReasonResolved::Canceled));
        assert_eq!(task.cancel(t0()), None);
        assert_eq!(task.runs.len(), 1);
    }

    #[test]
    fn deadline_expiry_happens_once_and_never_retries() {
        let mut task = Task::new(TaskId::generate(), definition(5), t0());
        let late = t0() + Duration::hours(1);
        assert!(task.is_expired(late));
        assert_eq!(task.expire(late), Some(Expiry::Deadline { run_id: 0 }));
        assert_eq!(task.runs[0].reason_resolved, Some(ReasonResolved::DeadlineExceeded));
        assert_eq!(task.expire(late), None);
        assert_eq!(task.runs.len(), 1);
    }

    #[test]
    fn claim_expiry_retries_with_budget() {
        let mut task = Task::new(TaskId::generate(), definition(1), t0());
        claimed(&mut task, 0);
        assert!(!task.is_expired(t0() + Duration::minutes(19)));
        assert_eq!(task.expire(t0() + Duration::minutes(19)), None);

        let after_claim = t0() + Duration::minutes(21);
        assert!(task.is_expired(after_claim));
        assert_eq!(
            task.expire(after_claim),
            Some(Expiry::Claim { run_id: 0, retry_run: Some(1) })
        );
        assert_eq!(task.runs[0].state, RunState::Exception);
        assert_eq!(task.runs[1].state, RunState::Pending);
        assert_eq!(task.retries_left, 0);
    }

    #[test]
    fn run_ids_stop_at_the_limit() {
        let mut task = Task::new(TaskId::generate(), definition(0), t0());
        for run_id in 0..MAX_RUN_ID {
            task.cancel(t0());
            assert_eq!(task.rerun(t0(), true).unwrap(), Some(run_id + 1));
        }
        task.cancel(t0());
        let err = task.rerun(t0(), true).unwrap_err();
        assert!(matches!(err, QuayError::RunLimitExceeded(_)));
    }

    #[test]
    fn definition_validation() {
        let mut def = definition(0);
        assert!(def.validate().is_ok());

        def.deadline = def.created;
        assert!(matches!(def.validate(), Err(QuayError::InvalidTask(_))));

        let mut def = definition(MAX_RETRIES + 1);
        assert!(def.validate().is_err());
        def.retries = 1;
        def.worker_type = "bad.type".to_string();
        assert!(def.validate().is_err());
    }
}
