//! WorkerGroup - claim → 実行 → resolve を回すワーカー群
//!
//! # フロー
//! 1. WorkClaimer::claim()（count 1、shutdown で abort）
//! 2. RunHandler::run() で実行して Resolution を得る
//! 3. TaskStore::resolve() で結果を書く
//!
//! claim が失敗したら `backoff` だけ待ってやり直す。
//! shutdown は新しい claim を止めるだけで、実行中の run は最後まで走らせます。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{PoolKey, Resolution, WorkerIdentity};

use super::task_store::{ClaimedRun, TaskStore};
use super::work_claimer::WorkClaimer;

/// Executes a claimed run.
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn run(&self, claimed: &ClaimedRun) -> Resolution;
}

/// Worker group handle.
/// - `request_shutdown()` でワーカー全体が新しい claim をやめる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers named `{group}-{i}` against `pool`.
    /// `backoff` is the pause after a failed claim.
    pub fn spawn(
        n: usize,
        group: &str,
        claimer: Arc<WorkClaimer>,
        store: Arc<TaskStore>,
        pool: PoolKey,
        handler: Arc<dyn RunHandler>,
        backoff: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = Worker {
                identity: WorkerIdentity::new(group, format!("{group}-{i}")),
                claimer: Arc::clone(&claimer),
                store: Arc::clone(&store),
                pool: pool.clone(),
                handler: Arc::clone(&handler),
                backoff,
            };
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(rx)));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

struct Worker {
    identity: WorkerIdentity,
    claimer: Arc<WorkClaimer>,
    store: Arc<TaskStore>,
    pool: PoolKey,
    handler: Arc<dyn RunHandler>,
    backoff: Duration,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let abort = CancellationToken::new();
        let watcher = {
            let abort = abort.clone();
            tokio::spawn(async move {
                while !*shutdown_rx.borrow_and_update() {
                    // a dropped sender counts as shutdown too
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                abort.cancel();
            })
        };

        while !abort.is_cancelled() {
            let claimed = match self.claimer.claim(&self.pool, &self.identity, 1, &abort).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::warn!(worker = %self.identity, error = %e, "claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = abort.cancelled() => {}
                    }
                    continue;
                }
            };
            for run in claimed {
                let resolution = self.handler.run(&run).await;
                if let Err(e) = self.store.resolve(run.task_id, run.run_id, resolution).await {
                    tracing::warn!(
                        worker = %self.identity,
                        task_id = %run.task_id,
                        run_id = run.run_id,
                        error = %e,
                        "resolve failed"
                    );
                }
            }
        }
        watcher.abort();
        tracing::debug!(worker = %self.identity, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::hint_poller::PollerConfig;
    use crate::app::task_store::tests::Harness;
    use crate::domain::RunState;
    use crate::ports::DeliveryQueue;
    use std::sync::Mutex;

    /// Fails each task once, then completes it.
    #[derive(Default)]
    struct FlakyHandler {
        seen: Mutex<Vec<(crate::domain::TaskId, u32)>>,
    }

    #[async_trait]
    impl RunHandler for FlakyHandler {
        async fn run(&self, claimed: &ClaimedRun) -> Resolution {
            self.seen
                .lock()
                .unwrap()
                .push((claimed.task_id, claimed.run_id));
            if claimed.run_id == 0 {
                Resolution::Failed
            } else {
                Resolution::Completed
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_the_pool_with_retries() {
        let h = Harness::new();
        let ids = [h.create(1).await, h.create(1).await, h.create(1).await];
        let claimer = Arc::new(WorkClaimer::new(
            h.store.clone(),
            h.queues.clone(),
            PollerConfig::default(),
        ));
        let handler = Arc::new(FlakyHandler::default());

        let group = WorkerGroup::spawn(
            2,
            "test",
            claimer,
            h.store.clone(),
            h.pool(),
            handler.clone(),
            Duration::from_millis(200),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        group.shutdown_and_join().await;

        for task_id in ids {
            let status = h.store.status(task_id).await.unwrap();
            assert_eq!(status.state, RunState::Completed);
            assert_eq!(status.runs.len(), 2);
            assert_eq!(status.runs[1].worker_group.as_deref(), Some("test"));
        }
        assert_eq!(handler.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_stop_on_shutdown() {
        let h = Harness::new();
        let claimer = Arc::new(WorkClaimer::new(
            h.store.clone(),
            h.queues.clone(),
            PollerConfig::default(),
        ));
        let group = WorkerGroup::spawn(
            3,
            "idle",
            claimer.clone(),
            h.store.clone(),
            h.pool(),
            Arc::new(FlakyHandler::default()),
            Duration::from_millis(200),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        group.shutdown_and_join().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(claimer.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_claim_waits_for_backoff_before_retrying() {
        let h = Harness::new();
        let handles = h.queues.pending_queues(&h.pool()).await.unwrap();
        h.delivery.delete_queue(&handles[0].name).await;
        let task_id = h.create(1).await;
        let claimer = Arc::new(WorkClaimer::new(
            h.store.clone(),
            h.queues.clone(),
            PollerConfig::default(),
        ));

        let group = WorkerGroup::spawn(
            1,
            "backoff",
            claimer,
            h.store.clone(),
            h.pool(),
            Arc::new(FlakyHandler::default()),
            Duration::from_secs(10),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.delivery.create_queue(&handles[0].name).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let status = h.store.status(task_id).await.unwrap();
        assert_eq!(status.state, RunState::Pending);
        assert_eq!(status.runs.len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        group.shutdown_and_join().await;
        let status = h.store.status(task_id).await.unwrap();
        assert_eq!(status.state, RunState::Completed);
    }
}
