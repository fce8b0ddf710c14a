//! Impls - ports の in-memory 実装（開発用・テスト用）
//!
//! 本番用の実装（テーブルストレージ、クラウドのキュー、Blob）は別クレートに置く想定です。

pub mod event_sinks;
pub mod inmem_artifacts;
pub mod inmem_delivery;
pub mod inmem_task_table;

pub use self::event_sinks::{NoopEventSink, RecordingEventSink, TracingEventSink};
pub use self::inmem_artifacts::InMemoryArtifactStore;
pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_task_table::InMemoryTaskTable;
