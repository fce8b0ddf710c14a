//! quay-core
//!
//! Task queue claim protocol: a versioned task store, priority hint queues,
//! one hint poller per worker pool, and the claim / reaper paths built on them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, pool, state, task, hint, artifact, events, errors）
//! - **ports**: 抽象化レイヤー（TaskTable, DeliveryQueue, ArtifactStore, EventSink, Clock）
//! - **app**: アプリケーションロジック（task_store, queue_service, hint_poller, work_claimer, reaper_loop など）
//! - **impls**: ports の in-memory 実装（開発・テスト用）
//! - **settings**: TOML から読む設定

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod settings;

pub use self::settings::Settings;
