//! DeliveryQueue port - hint を運ぶメッセージキュー（provider 抽象）
//!
//! Azure Queue Storage / SQS のような lease 型キューを想定しています。
//!
//! # 設計原則
//! - body は文字列のみ（中身の解釈は QueueService の責務）
//! - poll したメッセージは lease 期間だけ不可視になり、削除はしない
//! - 削除・解放には poll 時の receipt が必要（lease が切れて再 poll されたら古い receipt は無効）
//! - at-least-once: 重複や消失を許容する

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{MessageId, PopReceipt};

pub use crate::domain::QueueError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub receipt: PopReceipt,
    pub body: String,
    /// How many times the message has been handed out, this poll included.
    pub dequeue_count: u32,
}

/// Time-boxed URLs that let a worker poll a queue without going through us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedQueueUrls {
    pub get_message: String,
    /// Contains `{{messageId}}` and `{{popReceipt}}` placeholders.
    pub delete_message: String,
    pub expires: DateTime<Utc>,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Create the queue if it is missing. Idempotent.
    async fn create_queue(&self, name: &str) -> Result<(), QueueError>;

    /// Enqueue a message that becomes visible after `visibility_delay` and
    /// disappears after `ttl`.
    async fn put(
        &self,
        name: &str,
        body: String,
        visibility_delay: Duration,
        ttl: Duration,
    ) -> Result<MessageId, QueueError>;

    /// Lease up to `count` visible messages for `lease`.
    async fn poll(
        &self,
        name: &str,
        count: usize,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(
        &self,
        name: &str,
        message_id: MessageId,
        receipt: PopReceipt,
    ) -> Result<(), QueueError>;

    /// Make a leased message visible again right away.
    async fn release(
        &self,
        name: &str,
        message_id: MessageId,
        receipt: PopReceipt,
    ) -> Result<(), QueueError>;

    async fn approximate_count(&self, name: &str) -> Result<usize, QueueError>;

    fn signed_urls(&self, name: &str, expires: DateTime<Utc>)
    -> Result<SignedQueueUrls, QueueError>;
}
