//! WorkClaimer - worker が呼ぶ claim の入口
//!
//! # フロー
//! 1. pool の HintPoller にリクエストを登録して hint を待つ
//! 2. 受け取った hint ごとに TaskStore::claim() を並行に試す
//! 3. 成功した hint は削除。古い hint（claim 済み / run なし / task なし / 期限切れ）も削除
//! 4. それ以外のエラーは hint を release して warn ログ
//! 5. 1 件も取れなければ 1 に戻る（abort されるまで）。4 のエラーがあった回は
//!    `idle_poll_interval` だけ待ってから戻る

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{Hint, PoolKey, QuayError, WorkerIdentity};

use super::hint_poller::{PollerConfig, PollerRegistry};
use super::queue_service::QueueService;
use super::task_store::{ClaimedRun, TaskStore};

/// What became of one hint.
enum Attempt {
    Claimed(ClaimedRun),
    Stale,
    Failed,
}

pub struct WorkClaimer {
    store: Arc<TaskStore>,
    queues: Arc<QueueService>,
    registry: Arc<PollerRegistry>,
    /// Pause after a batch that only produced infrastructure errors.
    backoff: Duration,
}

impl WorkClaimer {
    pub fn new(store: Arc<TaskStore>, queues: Arc<QueueService>, config: PollerConfig) -> Self {
        let registry = PollerRegistry::new(Arc::clone(&queues), config);
        Self {
            store,
            queues,
            registry,
            backoff: config.idle_poll_interval,
        }
    }

    pub fn registry(&self) -> &Arc<PollerRegistry> {
        &self.registry
    }

    /// Claim up to `count` runs from `pool` for `worker`.
    ///
    /// Keeps waiting until at least one claim succeeds; returns empty only
    /// when `abort` fires.
    pub async fn claim(
        &self,
        pool: &PoolKey,
        worker: &WorkerIdentity,
        count: usize,
        abort: &CancellationToken,
    ) -> Result<Vec<ClaimedRun>, QuayError> {
        pool.validate()?;
        worker.validate()?;
        let count = count.max(1);

        loop {
            if abort.is_cancelled() {
                return Ok(Vec::new());
            }
            let hints = self.registry.submit(pool, count).wait(abort).await?;
            if hints.is_empty() {
                // only an abort resolves a request with nothing
                if abort.is_cancelled() {
                    return Ok(Vec::new());
                }
                continue;
            }

            let attempts = hints.into_iter().map(|hint| self.try_claim(hint, worker));
            let mut claimed = Vec::new();
            let mut failed = 0;
            for attempt in join_all(attempts).await {
                match attempt {
                    Attempt::Claimed(run) => claimed.push(run),
                    Attempt::Stale => {}
                    Attempt::Failed => failed += 1,
                }
            }
            if !claimed.is_empty() {
                tracing::debug!(%pool, %worker, claimed = claimed.len(), "claimed runs");
                return Ok(claimed);
            }
            if failed > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = abort.cancelled() => return Ok(Vec::new()),
                }
            }
        }
    }

    async fn try_claim(&self, hint: Hint, worker: &WorkerIdentity) -> Attempt {
        match self.store.claim(hint.task_id, hint.run_id, worker).await {
            Ok(claimed) => {
                self.discard(&hint).await;
                Attempt::Claimed(claimed)
            }
            Err(e) if e.is_stale_hint() => {
                tracing::debug!(task_id = %hint.task_id, run_id = hint.run_id, reason = %e, "stale hint");
                self.discard(&hint).await;
                Attempt::Stale
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %hint.task_id,
                    run_id = hint.run_id,
                    error = %e,
                    "claim failed, hint released"
                );
                if let Err(e) = self.queues.release(&hint).await {
                    tracing::warn!(task_id = %hint.task_id, error = %e, "failed to release hint");
                }
                Attempt::Failed
            }
        }
    }

    async fn discard(&self, hint: &Hint) {
        if let Err(e) = self.queues.remove(hint).await {
            // the lease runs out and the hint comes back; the next claim sees it as stale
            tracing::warn!(task_id = %hint.task_id, error = %e, "failed to delete hint");
        }
    }
}
