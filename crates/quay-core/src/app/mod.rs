//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: Settings からの構築とワイヤリング
//! - **TaskStore**: Task 行の状態機械（条件付き書き込み）
//! - **QueueService**: pool ごとの優先度付き hint キュー
//! - **HintPoller**: pool ごとに 1 本のポーリングループ
//! - **WorkClaimer**: claim の入口（hint → 条件付き claim）
//! - **Reaper / ReaperLoop**: 期限切れ run の回収
//! - **ArtifactGc**: 期限切れ artifact の回収
//! - **WorkerGroup**: claim → 実行 → resolve のワーカー群

pub mod builder;
pub mod gc_loop;
pub mod hint_poller;
pub mod queue_service;
pub mod reaper_loop;
pub mod status;
pub mod task_store;
pub mod work_claimer;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::gc_loop::{ArtifactGc, GcReport};
pub use self::hint_poller::{ClaimRequest, HintPoller, PollerConfig, PollerRegistry, PollerStatus};
pub use self::queue_service::{MAX_POLL_BATCH, QueueHandle, QueueService, TierUrls};
pub use self::reaper_loop::{Reaper, ReaperLoop, SweepReport};
pub use self::status::{RunStatus, TaskStatus};
pub use self::task_store::{ClaimedRun, TaskStore};
pub use self::work_claimer::WorkClaimer;
pub use self::worker_loop::{RunHandler, WorkerGroup};
