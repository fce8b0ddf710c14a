//! Ports - 抽象化レイヤー
//!
//! 外部システム（テーブルストレージ、メッセージキュー、Blob storage）への
//! インターフェースです。実装は `impls`（開発・テスト用の in-memory 版）に置きます。
//!
//! # 設計原則
//! - TaskTable が source of truth（正本）
//! - DeliveryQueue は hint（task_id + run_id）だけを運ぶ
//! - ArtifactStore は期限切れの回収にだけ使う

pub mod artifact_store;
pub mod clock;
pub mod delivery_queue;
pub mod event_sink;
pub mod id_generator;
pub mod task_table;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{DeliveryQueue, QueueError, QueueMessage, SignedQueueUrls};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_table::{TaskTable, Version, Versioned};
