//! ReaperLoop - 期限切れの回収
//!
//! # フロー
//! 1. TaskTable::scan_active() で pending / running の run を持つ task を列挙
//! 2. TaskStore::expire() で 1 件ずつ条件付き書き込み
//!    - deadline 超過: failed / deadline-exceeded（retry なし）
//!    - claim 期限（takenUntil）超過: exception / claim-expired（retry あり）
//! 3. task ごとのエラーは数えてログに出す。error_limit を超えたら sweep を打ち切る
//!
//! `ReaperLoop` は interval ごとに sweep と ArtifactGc を回します。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{Expiry, QuayError};
use crate::ports::{Clock, TaskTable};

use super::gc_loop::ArtifactGc;
use super::task_store::TaskStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deadline_expired: usize,
    pub claims_expired: usize,
    pub errors: usize,
    /// Stopped early because `errors` went past the limit.
    pub aborted: bool,
}

pub struct Reaper {
    table: Arc<dyn TaskTable>,
    store: Arc<TaskStore>,
    error_limit: usize,
}

impl Reaper {
    pub fn new(table: Arc<dyn TaskTable>, store: Arc<TaskStore>, error_limit: usize) -> Self {
        Self {
            table,
            store,
            error_limit,
        }
    }

    /// Resolve every run that has expired at `now`.
    ///
    /// Fails only when the active set cannot be listed at all.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, QuayError> {
        let mut report = SweepReport::default();
        for task_id in self.table.scan_active().await? {
            report.scanned += 1;
            match self.store.expire(task_id, now).await {
                Ok(Some(Expiry::Deadline { .. })) => report.deadline_expired += 1,
                Ok(Some(Expiry::Claim { .. })) => report.claims_expired += 1,
                Ok(None) => {}
                // resolved or removed since the scan
                Err(QuayError::TaskNotFound(_)) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(%task_id, error = %e, "failed to expire task");
                    if report.errors > self.error_limit {
                        tracing::error!(errors = report.errors, "too many errors, sweep aborted");
                        report.aborted = true;
                        break;
                    }
                }
            }
        }
        tracing::info!(
            scanned = report.scanned,
            deadline_expired = report.deadline_expired,
            claims_expired = report.claims_expired,
            errors = report.errors,
            "reaper sweep finished"
        );
        Ok(report)
    }
}

/// Background handle for the periodic sweeps.
/// `shutdown_and_join()` waits for the in-flight sweep to finish.
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(
        reaper: Arc<Reaper>,
        gc: Option<Arc<ArtifactGc>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                let now = clock.now();
                if let Err(e) = reaper.sweep(now).await {
                    tracing::error!(error = %e, "reaper sweep failed");
                }
                if let Some(gc) = &gc {
                    if let Err(e) = gc.sweep(now).await {
                        tracing::error!(error = %e, "artifact gc failed");
                    }
                }
            }
            tracing::debug!("reaper loop stopped");
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver is gone once the loop exits
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
