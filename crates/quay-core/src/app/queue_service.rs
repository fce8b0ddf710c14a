//! QueueService - pool ごとの優先度付き hint キュー
//!
//! 1 pool = 優先度ごとに 1 本のキュー（`{prefix}-{provisionerId}-{workerType}-{tier}`）。
//!
//! # 設計原則
//! - キューは hint を運ぶだけ。claim の可否は TaskStore が決める
//! - 作成済みキューの名前はプロセス内でキャッシュする（作成自体は冪等）
//! - 読めない body のメッセージは消して先へ進む

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    Hint, HintBody, MessageId, PoolKey, Priority, QuayError, QueueError, RunId, TaskId,
};
use crate::ports::{Clock, DeliveryQueue, SignedQueueUrls};

/// Most messages a single poll asks the provider for.
pub const MAX_POLL_BATCH: usize = 32;

/// One backing queue of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierUrls {
    pub priority: Priority,
    pub urls: SignedQueueUrls,
}

pub struct QueueService {
    queue: Arc<dyn DeliveryQueue>,
    clock: Arc<dyn Clock>,
    prefix: String,
    hint_lease: Duration,
    signed_url_ttl: chrono::Duration,
    ensured: Mutex<HashSet<String>>,
}

impl QueueService {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        hint_lease: Duration,
        signed_url_ttl: chrono::Duration,
    ) -> Self {
        Self {
            queue,
            clock,
            prefix: prefix.into(),
            hint_lease,
            signed_url_ttl,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue_name(&self, pool: &PoolKey, priority: Priority) -> String {
        format!(
            "{}-{}-{}-{}",
            self.prefix, pool.provisioner_id, pool.worker_type, priority
        )
    }

    fn handles(&self, pool: &PoolKey) -> Vec<QueueHandle> {
        Priority::ALL
            .iter()
            .map(|&priority| QueueHandle {
                name: self.queue_name(pool, priority),
                priority,
            })
            .collect()
    }

    fn is_ensured(&self, name: &str) -> bool {
        self.ensured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Create the pool's queues if this process has not seen them yet.
    pub async fn ensure_queue(&self, pool: &PoolKey) -> Result<(), QuayError> {
        for handle in self.handles(pool) {
            if self.is_ensured(&handle.name) {
                continue;
            }
            // Two callers may both get here; create_queue is idempotent.
            self.queue.create_queue(&handle.name).await?;
            tracing::debug!(queue = %handle.name, "queue ensured");
            self.ensured
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(handle.name);
        }
        Ok(())
    }

    /// Enqueue a hint for `run_id`. Returns `None` when the deadline has
    /// already passed and nothing was put.
    pub async fn put_task(
        &self,
        pool: &PoolKey,
        task_id: TaskId,
        run_id: RunId,
        priority: Priority,
        deadline: DateTime<Utc>,
    ) -> Result<Option<MessageId>, QuayError> {
        let ttl = match (deadline - self.clock.now()).to_std() {
            Ok(ttl) if !ttl.is_zero() => ttl,
            _ => {
                tracing::debug!(%task_id, run_id, "deadline passed, hint not enqueued");
                return Ok(None);
            }
        };
        self.ensure_queue(pool).await?;
        let body = serde_json::to_string(&HintBody { task_id, run_id })
            .map_err(|e| QueueError::OperationFailed(e.to_string()))?;
        let name = self.queue_name(pool, priority);
        let message_id = self.queue.put(&name, body, Duration::ZERO, ttl).await?;
        tracing::debug!(%task_id, run_id, queue = %name, "hint enqueued");
        Ok(Some(message_id))
    }

    /// Queues of `pool`, highest priority first.
    pub async fn pending_queues(&self, pool: &PoolKey) -> Result<Vec<QueueHandle>, QuayError> {
        self.ensure_queue(pool).await?;
        Ok(self.handles(pool))
    }

    /// Lease up to `count` hints (at most `MAX_POLL_BATCH`).
    pub async fn poll(&self, handle: &QueueHandle, count: usize) -> Result<Vec<Hint>, QuayError> {
        let count = count.min(MAX_POLL_BATCH);
        if count == 0 {
            return Ok(Vec::new());
        }
        let messages = self.queue.poll(&handle.name, count, self.hint_lease).await?;
        let mut hints = Vec::with_capacity(messages.len());
        for message in messages {
            match serde_json::from_str::<HintBody>(&message.body) {
                Ok(body) => hints.push(Hint {
                    task_id: body.task_id,
                    run_id: body.run_id,
                    queue: handle.name.clone(),
                    message_id: message.message_id,
                    receipt: message.receipt,
                }),
                Err(e) => {
                    tracing::warn!(
                        queue = %handle.name,
                        message_id = %message.message_id,
                        error = %e,
                        "undecodable hint dropped"
                    );
                    match self
                        .queue
                        .delete(&handle.name, message.message_id, message.receipt)
                        .await
                    {
                        Ok(()) | Err(QueueError::MessageNotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(hints)
    }

    /// Hand the hint back so another poll can pick it up.
    pub async fn release(&self, hint: &Hint) -> Result<(), QuayError> {
        match self
            .queue
            .release(&hint.queue, hint.message_id, hint.receipt)
            .await
        {
            // lease already lapsed; the message is visible again anyway
            Ok(()) | Err(QueueError::MessageNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a consumed hint.
    pub async fn remove(&self, hint: &Hint) -> Result<(), QuayError> {
        match self
            .queue
            .delete(&hint.queue, hint.message_id, hint.receipt)
            .await
        {
            Ok(()) | Err(QueueError::MessageNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// URLs a worker can use to poll the pool's queues directly.
    pub async fn signed_urls(&self, pool: &PoolKey) -> Result<Vec<TierUrls>, QuayError> {
        self.ensure_queue(pool).await?;
        let expires = self.clock.now() + self.signed_url_ttl;
        self.handles(pool)
            .into_iter()
            .map(|handle| -> Result<TierUrls, QuayError> {
                let urls = self.queue.signed_urls(&handle.name, expires)?;
                Ok(TierUrls {
                    priority: handle.priority,
                    urls,
                })
            })
            .collect()
    }

    /// Approximate number of hints waiting across all tiers.
    pub async fn count_pending(&self, pool: &PoolKey) -> Result<usize, QuayError> {
        let mut total = 0;
        for handle in self.pending_queues(pool).await? {
            total += self.queue.approximate_count(&handle.name).await?;
        }
        Ok(total)
    }
}
