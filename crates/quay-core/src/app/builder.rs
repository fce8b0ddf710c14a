//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! Settings と ports を受け取り、TaskStore / QueueService / WorkClaimer / Reaper を組み立てます。
//! 指定されなかった port は in-memory 実装で埋めます（開発用）。
//!
//! # Fail-fast 設計
//! - build() で Settings と expect_pools() の pool を検証する
//! - App::provision() で期待される pool のキューを作る。失敗したら起動しない

use std::sync::Arc;

use crate::domain::{PoolKey, QuayError};
use crate::impls::{
    InMemoryArtifactStore, InMemoryDeliveryQueue, InMemoryTaskTable, TracingEventSink,
};
use crate::ports::{ArtifactStore, Clock, DeliveryQueue, EventSink, SystemClock, TaskTable};
use crate::settings::Settings;

use super::gc_loop::ArtifactGc;
use super::hint_poller::PollerConfig;
use super::queue_service::QueueService;
use super::reaper_loop::{Reaper, ReaperLoop};
use super::task_store::TaskStore;
use super::work_claimer::WorkClaimer;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(settings)
///     .with_table(table)
///     .expect_pools(&[PoolKey::new("aws", "linux")])
///     .build()?;
/// app.provision().await?;
/// ```
pub struct AppBuilder {
    settings: Settings,
    table: Option<Arc<dyn TaskTable>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    pools: Vec<PoolKey>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid settings: {0}")]
    Settings(QuayError),

    #[error("invalid pool {pool}: {source}")]
    InvalidPool { pool: PoolKey, source: QuayError },

    #[error("failed to provision queues for {pool}: {source}")]
    Provision { pool: PoolKey, source: QuayError },
}

impl AppBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            table: None,
            queue: None,
            artifacts: None,
            clock: None,
            events: None,
            pools: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: Arc<dyn TaskTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Pools whose queues must exist before the app serves claims.
    pub fn expect_pools(mut self, pools: &[PoolKey]) -> Self {
        self.pools.extend(pools.iter().cloned());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.settings.validate().map_err(BuildError::Settings)?;
        for pool in &self.pools {
            pool.validate().map_err(|source| BuildError::InvalidPool {
                pool: pool.clone(),
                source,
            })?;
        }

        let settings = self.settings;
        let table = self
            .table
            .unwrap_or_else(|| Arc::new(InMemoryTaskTable::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryDeliveryQueue::new()));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));

        let queues = Arc::new(QueueService::new(
            queue,
            Arc::clone(&clock),
            settings.queue.prefix.clone(),
            settings.hint_lease(),
            settings.signed_url_ttl(),
        ));
        let store = Arc::new(TaskStore::new(
            Arc::clone(&table),
            Arc::clone(&queues),
            events,
            Arc::clone(&clock),
            settings.claim_timeout(),
            settings.store.max_modify_attempts,
        ));
        let claimer = Arc::new(WorkClaimer::new(
            Arc::clone(&store),
            Arc::clone(&queues),
            PollerConfig {
                idle_poll_interval: settings.idle_poll_interval(),
                max_polls_per_queue: settings.claim.max_polls_per_queue,
            },
        ));
        let reaper = Arc::new(Reaper::new(
            table,
            Arc::clone(&store),
            settings.reaper.error_limit,
        ));
        let gc = Arc::new(ArtifactGc::new(artifacts));

        Ok(App {
            settings,
            clock,
            queues,
            store,
            claimer,
            reaper,
            gc,
            pools: self.pools,
        })
    }
}

/// Wired application. Cheap to share: every component is behind an `Arc`.
pub struct App {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub queues: Arc<QueueService>,
    pub store: Arc<TaskStore>,
    pub claimer: Arc<WorkClaimer>,
    pub reaper: Arc<Reaper>,
    pub gc: Arc<ArtifactGc>,
    pools: Vec<PoolKey>,
}

impl App {
    /// Create the queues of every expected pool.
    pub async fn provision(&self) -> Result<(), BuildError> {
        for pool in &self.pools {
            self.queues
                .ensure_queue(pool)
                .await
                .map_err(|source| BuildError::Provision {
                    pool: pool.clone(),
                    source,
                })?;
            tracing::info!(%pool, "queues provisioned");
        }
        Ok(())
    }

    /// Start the periodic reaper + artifact gc.
    pub fn spawn_reaper(&self) -> ReaperLoop {
        ReaperLoop::spawn(
            Arc::clone(&self.reaper),
            Some(Arc::clone(&self.gc)),
            Arc::clone(&self.clock),
            self.settings.reaper_interval(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new(Settings::default())
            .expect_pools(&[PoolKey::new("prov", "linux")])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_invalid_settings() {
        let mut settings = Settings::default();
        settings.claim.max_polls_per_queue = 0;
        let app = AppBuilder::new(settings).build();
        assert!(matches!(app, Err(BuildError::Settings(QuayError::Config(_)))));
    }

    #[test]
    fn test_build_invalid_pool() {
        let app = AppBuilder::new(Settings::default())
            .expect_pools(&[PoolKey::new("prov", "not/valid")])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::InvalidPool { pool, .. }) if pool.worker_type == "not/valid"
        ));
    }

    #[tokio::test]
    async fn test_provision_creates_queues() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let app = AppBuilder::new(Settings::default())
            .with_queue(queue.clone())
            .expect_pools(&[PoolKey::new("prov", "linux")])
            .build()
            .unwrap();
        app.provision().await.unwrap();
        assert_eq!(queue.queue_names().await.len(), 3);
    }
}
