//! InMemoryDeliveryQueue - 開発用の lease 型メッセージキュー
//!
//! # 実装詳細
//! - queue 名ごとに VecDeque<StoredMessage>（到着順）
//! - poll は可視なメッセージに lease を付けて新しい receipt を発行する
//! - 時刻は `tokio::time::Instant`（テストでは paused time で進められる）
//! - 期限切れ（TTL 超過）のメッセージは操作のたびに捨てる
//! - `fail_next_polls(n)` で次の n 回の poll を一時的な失敗にできる（テスト用）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::{MessageId, PopReceipt};
use crate::ports::{DeliveryQueue, QueueError, QueueMessage, SignedQueueUrls};

#[derive(Debug)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    visible_at: Instant,
    expires_at: Instant,
    receipt: Option<PopReceipt>,
    dequeue_count: u32,
}

type Queues = HashMap<String, VecDeque<StoredMessage>>;

pub struct InMemoryDeliveryQueue {
    queues: Mutex<Queues>,
    /// Base of the URLs handed out by `signed_urls`.
    base_url: String,
    failing_polls: AtomicUsize,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            base_url: "memory://queues".to_string(),
            failing_polls: AtomicUsize::new(0),
        }
    }

    /// Drop a queue and everything in it, as if it was deleted out from under us.
    pub async fn delete_queue(&self, name: &str) -> bool {
        self.queues.lock().await.remove(name).is_some()
    }

    /// Make the next `count` polls fail with `OperationFailed`.
    pub fn fail_next_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn queue_mut<'a>(
        queues: &'a mut Queues,
        name: &str,
    ) -> Result<&'a mut VecDeque<StoredMessage>, QueueError> {
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        let now = Instant::now();
        queue.retain(|m| m.expires_at > now);
        Ok(queue)
    }

    fn leased_position(
        queue: &VecDeque<StoredMessage>,
        name: &str,
        message_id: MessageId,
        receipt: PopReceipt,
    ) -> Result<usize, QueueError> {
        queue
            .iter()
            .position(|m| m.message_id == message_id && m.receipt == Some(receipt))
            .ok_or_else(|| QueueError::MessageNotFound(name.to_string()))
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn create_queue(&self, name: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn put(
        &self,
        name: &str,
        body: String,
        visibility_delay: Duration,
        ttl: Duration,
    ) -> Result<MessageId, QueueError> {
        let mut queues = self.queues.lock().await;
        let queue = Self::queue_mut(&mut queues, name)?;
        let now = Instant::now();
        let message_id = MessageId::generate();
        queue.push_back(StoredMessage {
            message_id,
            body,
            visible_at: now + visibility_delay,
            expires_at: now + ttl,
            receipt: None,
            dequeue_count: 0,
        });
        Ok(message_id)
    }

    async fn poll(
        &self,
        name: &str,
        count: usize,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(QueueError::OperationFailed(format!("{name}: server busy")));
        }
        let mut queues = self.queues.lock().await;
        let queue = Self::queue_mut(&mut queues, name)?;
        let now = Instant::now();
        let mut leased = Vec::new();
        for message in queue.iter_mut() {
            if leased.len() >= count {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = PopReceipt::generate();
            message.visible_at = now + lease;
            message.receipt = Some(receipt);
            message.dequeue_count += 1;
            leased.push(QueueMessage {
                message_id: message.message_id,
                receipt,
                body: message.body.clone(),
                dequeue_count: message.dequeue_count,
            });
        }
        Ok(leased)
    }

    async fn delete(
        &self,
        name: &str,
        message_id: MessageId,
        receipt: PopReceipt,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let queue = Self::queue_mut(&mut queues, name)?;
        let pos = Self::leased_position(queue, name, message_id, receipt)?;
        queue.remove(pos);
        Ok(())
    }

    async fn release(
        &self,
        name: &str,
        message_id: MessageId,
        receipt: PopReceipt,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let queue = Self::queue_mut(&mut queues, name)?;
        let pos = Self::leased_position(queue, name, message_id, receipt)?;
        let message = &mut queue[pos];
        message.visible_at = Instant::now();
        message.receipt = None;
        Ok(())
    }

    async fn approximate_count(&self, name: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(Self::queue_mut(&mut queues, name)?.len())
    }

    fn signed_urls(
        &self,
        name: &str,
        expires: DateTime<Utc>,
    ) -> Result<SignedQueueUrls, QueueError> {
        let signature: u64 = rand::random();
        let query = format!("se={}&sig={signature:016x}", expires.timestamp());
        Ok(SignedQueueUrls {
            get_message: format!(
                "{}/{name}/messages?visibilitytimeout=300&{query}",
                self.base_url
            ),
            delete_message: format!(
                "{}/{name}/messages/{{{{messageId}}}}?popreceipt={{{{popReceipt}}}}&{query}",
                self.base_url
            ),
            expires,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);
    const TTL: Duration = Duration::from_secs(600);

    async fn queue_with(name: &str) -> InMemoryDeliveryQueue {
        let queue = InMemoryDeliveryQueue::new();
        queue.create_queue(name).await.unwrap();
        queue
    }

    #[tokio::test]
    async fn create_queue_is_idempotent() {
        let queue = queue_with("q").await;
        queue.put("q", "a".into(), Duration::ZERO, TTL).await.unwrap();
        queue.create_queue("q").await.unwrap();
        assert_eq!(queue.approximate_count("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_into_missing_queue_fails() {
        let queue = InMemoryDeliveryQueue::new();
        let err = queue.put("nope", "a".into(), Duration::ZERO, TTL).await.unwrap_err();
        assert_eq!(err, QueueError::QueueNotFound("nope".into()));
    }

    #[tokio::test]
    async fn failing_polls_recover_after_count() {
        let queue = queue_with("q").await;
        queue.put("q", "a".into(), Duration::ZERO, TTL).await.unwrap();
        queue.fail_next_polls(1);

        let err = queue.poll("q", 10, LEASE).await.unwrap_err();
        assert!(matches!(err, QueueError::OperationFailed(_)));
        assert_eq!(queue.poll("q", 10, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polled_messages_stay_invisible_until_lease_ends() {
        let queue = queue_with("q").await;
        queue.put("q", "a".into(), Duration::ZERO, TTL).await.unwrap();

        let first = queue.poll("q", 10, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.poll("q", 10, LEASE).await.unwrap().is_empty());

        tokio::time::advance(LEASE + Duration::from_secs(1)).await;
        let again = queue.poll("q", 10, LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].dequeue_count, 2);

        // the first receipt went stale with the second lease
        let err = queue
            .delete("q", first[0].message_id, first[0].receipt)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound(_)));
        queue
            .delete("q", again[0].message_id, again[0].receipt)
            .await
            .unwrap();
        assert_eq!(queue.approximate_count("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_makes_message_visible_again() {
        let queue = queue_with("q").await;
        queue.put("q", "a".into(), Duration::ZERO, TTL).await.unwrap();
        let leased = queue.poll("q", 1, LEASE).await.unwrap();
        queue
            .release("q", leased[0].message_id, leased[0].receipt)
            .await
            .unwrap();
        assert_eq!(queue.poll("q", 1, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dropped() {
        let queue = queue_with("q").await;
        queue
            .put("q", "a".into(), Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(queue.poll("q", 1, LEASE).await.unwrap().is_empty());
        assert_eq!(queue.approximate_count("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poll_respects_count_and_fifo_order() {
        let queue = queue_with("q").await;
        for body in ["a", "b", "c"] {
            queue.put("q", body.into(), Duration::ZERO, TTL).await.unwrap();
        }
        let leased = queue.poll("q", 2, LEASE).await.unwrap();
        let bodies: Vec<&str> = leased.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn deleted_queue_reports_not_found() {
        let queue = queue_with("q").await;
        assert!(queue.delete_queue("q").await);
        assert!(matches!(
            queue.poll("q", 1, LEASE).await,
            Err(QueueError::QueueNotFound(_))
        ));
    }
}
