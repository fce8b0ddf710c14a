//! HintPoller - pool ごとに 1 本だけ走る hint のポーリングループ
//!
//! # 状態
//! - Idle: 作られた直後（最初のリクエストでループを spawn する）
//! - Running: ループが動いている
//! - Destroyed: ループが終わった。registry からも外れている
//!
//! # フロー
//! 1. claim リクエストを FIFO で受け付ける（count 付き）
//! 2. 需要（count の合計）がある間、優先度の高いキューから順に poll する
//! 3. 取れた hint を登録順に配る。各リクエストは最大 count 個受け取って完了する
//! 4. 余った hint は release する
//! 5. 1 周で何も取れなければ `idle_poll_interval` だけ眠る（新しいリクエストで起きる）
//! 6. 需要が 0 になったら Destroyed
//!
//! 一時的な失敗（`ErrorKind::Transient`）は `idle_poll_interval` だけ待ってやり直す。
//! 致命的な失敗（キューが消えた等）のときだけ、待っている全リクエストをそのエラーで
//! 完了させて Destroyed になります。
//!
//! # ロック順
//! registry → poller state の順でしか取らない。登録と破棄がこの順で直列化されるので、
//! 破棄済みの poller にリクエストが載ることはない。どちらも await を跨いで保持しない。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::{ErrorKind, Hint, PoolKey, QuayError};

use super::queue_service::{MAX_POLL_BATCH, QueueService};

type Reply = Result<Vec<Hint>, QuayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub idle_poll_interval: Duration,
    pub max_polls_per_queue: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(200),
            max_polls_per_queue: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStatus {
    Idle,
    Running,
    Destroyed,
}

struct PendingRequest {
    id: u64,
    count: usize,
    reply: oneshot::Sender<Reply>,
}

struct PollerState {
    status: PollerStatus,
    requests: VecDeque<PendingRequest>,
    next_id: u64,
}

pub struct HintPoller {
    pool: PoolKey,
    queues: Arc<QueueService>,
    config: PollerConfig,
    registry: Weak<PollerRegistry>,
    state: Mutex<PollerState>,
    wake: Notify,
}

impl HintPoller {
    fn new(
        pool: PoolKey,
        queues: Arc<QueueService>,
        config: PollerConfig,
        registry: Weak<PollerRegistry>,
    ) -> Self {
        Self {
            pool,
            queues,
            config,
            registry,
            state: Mutex::new(PollerState {
                status: PollerStatus::Idle,
                requests: VecDeque::new(),
                next_id: 0,
            }),
            wake: Notify::new(),
        }
    }

    pub fn pool(&self) -> &PoolKey {
        &self.pool
    }

    pub fn status(&self) -> PollerStatus {
        self.lock_state().status
    }

    /// Hints still owed to waiting requests.
    pub fn demand(&self) -> usize {
        Self::demand_of(&self.lock_state())
    }

    /// Wait for up to `count` hints. Resolves empty when `abort` fires first,
    /// or when this poller is already destroyed.
    pub async fn request_claim(
        self: &Arc<Self>,
        count: usize,
        abort: &CancellationToken,
    ) -> Result<Vec<Hint>, QuayError> {
        match self.enqueue(count) {
            Some(request) => request.wait(abort).await,
            None => Ok(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn demand_of(state: &PollerState) -> usize {
        state.requests.iter().map(|r| r.count).sum()
    }

    /// Register a request and start the loop if this is the first one.
    fn enqueue(self: &Arc<Self>, count: usize) -> Option<ClaimRequest> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock_state();
        let start = match state.status {
            PollerStatus::Destroyed => return None,
            PollerStatus::Idle => true,
            PollerStatus::Running => false,
        };
        let id = state.next_id;
        state.next_id += 1;
        state.requests.push_back(PendingRequest {
            id,
            count,
            reply: tx,
        });
        if start {
            state.status = PollerStatus::Running;
            tokio::spawn(Arc::clone(self).run());
        } else {
            self.wake.notify_one();
        }
        Some(ClaimRequest {
            poller: Arc::clone(self),
            id,
            reply: rx,
        })
    }

    /// Remove a request that has not been answered. False if it already was.
    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.lock_state();
        let before = state.requests.len();
        state.requests.retain(|r| r.id != id);
        state.requests.len() != before
    }

    async fn run(self: Arc<Self>) {
        tracing::debug!(pool = %self.pool, "hint poller started");
        loop {
            if self.destroy_if_idle() {
                tracing::debug!(pool = %self.pool, "hint poller finished");
                return;
            }
            match self.poll_pass().await {
                Ok(0) => self.idle().await,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Fatal => {
                    self.fail(e);
                    return;
                }
                Err(e) => {
                    tracing::warn!(pool = %self.pool, error = %e, "poll failed, retrying");
                    self.idle().await;
                }
            }
        }
    }

    /// Sleep for `idle_poll_interval`, or until a new request arrives.
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// One sweep over the pool's queues, highest priority first.
    /// Returns how many hints were polled.
    async fn poll_pass(&self) -> Result<usize, QuayError> {
        let handles = self.queues.pending_queues(&self.pool).await?;
        let mut polled = 0;
        for handle in &handles {
            for _ in 0..self.config.max_polls_per_queue {
                let demand = self.demand();
                if demand == 0 {
                    return Ok(polled);
                }
                let hints = self.queues.poll(handle, demand).await?;
                let got = hints.len();
                polled += got;
                for hint in self.distribute(hints) {
                    if let Err(e) = self.queues.release(&hint).await {
                        tracing::warn!(
                            pool = %self.pool,
                            task_id = %hint.task_id,
                            error = %e,
                            "failed to release unclaimed hint"
                        );
                    }
                }
                if got < demand.min(MAX_POLL_BATCH) {
                    // queue drained for now
                    break;
                }
            }
        }
        Ok(polled)
    }

    /// Hand hints out in registration order. Returns what nobody took.
    fn distribute(&self, hints: Vec<Hint>) -> Vec<Hint> {
        let mut hints = VecDeque::from(hints);
        let mut leftovers = Vec::new();
        let mut state = self.lock_state();
        while !hints.is_empty() {
            let Some(request) = state.requests.pop_front() else {
                break;
            };
            let take = request.count.min(hints.len());
            let batch: Vec<Hint> = hints.drain(..take).collect();
            if let Err(Ok(unsent)) = request.reply.send(Ok(batch)) {
                leftovers.extend(unsent);
            }
        }
        leftovers.extend(hints);
        leftovers
    }

    fn destroy_if_idle(self: &Arc<Self>) -> bool {
        let registry = self.registry.upgrade();
        let mut pollers = registry.as_ref().map(|r| r.lock_pollers());
        let mut state = self.lock_state();
        if !state.requests.is_empty() {
            return false;
        }
        state.status = PollerStatus::Destroyed;
        if let Some(pollers) = pollers.as_mut() {
            self.unregister(pollers);
        }
        true
    }

    fn fail(self: &Arc<Self>, error: QuayError) {
        let registry = self.registry.upgrade();
        let mut pollers = registry.as_ref().map(|r| r.lock_pollers());
        let mut state = self.lock_state();
        state.status = PollerStatus::Destroyed;
        if let Some(pollers) = pollers.as_mut() {
            self.unregister(pollers);
        }
        let rejected = std::mem::take(&mut state.requests);
        tracing::error!(
            pool = %self.pool,
            error = %error,
            rejected = rejected.len(),
            "hint poller failed"
        );
        for request in rejected {
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    fn unregister(self: &Arc<Self>, pollers: &mut HashMap<PoolKey, Arc<HintPoller>>) {
        if pollers
            .get(&self.pool)
            .is_some_and(|current| Arc::ptr_eq(current, self))
        {
            pollers.remove(&self.pool);
        }
    }
}

/// A registered claim request. Dropping it withdraws the request.
pub struct ClaimRequest {
    poller: Arc<HintPoller>,
    id: u64,
    reply: oneshot::Receiver<Reply>,
}

impl ClaimRequest {
    pub async fn wait(mut self, abort: &CancellationToken) -> Result<Vec<Hint>, QuayError> {
        let answered = tokio::select! {
            biased;
            reply = &mut self.reply => Some(reply),
            _ = abort.cancelled() => None,
        };
        let reply = match answered {
            Some(reply) => reply,
            None if self.poller.withdraw(self.id) => return Ok(Vec::new()),
            // already answered under the state lock; don't drop those hints
            None => (&mut self.reply).await,
        };
        // a closed channel means the loop went away without answering
        reply.unwrap_or_else(|_| Ok(Vec::new()))
    }
}

impl Drop for ClaimRequest {
    fn drop(&mut self) {
        self.poller.withdraw(self.id);
    }
}

/// The pool → poller map. At most one live poller per pool.
pub struct PollerRegistry {
    pollers: Mutex<HashMap<PoolKey, Arc<HintPoller>>>,
    queues: Arc<QueueService>,
    config: PollerConfig,
}

impl PollerRegistry {
    pub fn new(queues: Arc<QueueService>, config: PollerConfig) -> Arc<Self> {
        Arc::new(Self {
            pollers: Mutex::new(HashMap::new()),
            queues,
            config,
        })
    }

    fn lock_pollers(&self) -> MutexGuard<'_, HashMap<PoolKey, Arc<HintPoller>>> {
        self.pollers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request for `count` hints on the pool's poller, creating
    /// the poller if there is none.
    pub fn submit(self: &Arc<Self>, pool: &PoolKey, count: usize) -> ClaimRequest {
        let mut pollers = self.lock_pollers();
        loop {
            let poller = pollers
                .entry(pool.clone())
                .or_insert_with(|| {
                    Arc::new(HintPoller::new(
                        pool.clone(),
                        Arc::clone(&self.queues),
                        self.config,
                        Arc::downgrade(self),
                    ))
                })
                .clone();
            match poller.enqueue(count) {
                Some(request) => return request,
                // destroyed pollers leave the map under this lock, so this
                // only happens if one was dropped without unregistering
                None => {
                    pollers.remove(pool);
                }
            }
        }
    }

    pub fn poller(&self, pool: &PoolKey) -> Option<Arc<HintPoller>> {
        self.lock_pollers().get(pool).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_pollers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
