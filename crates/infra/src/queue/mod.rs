//! Durable work queues with visibility windows and dead-letter redrive.
//!
//! ## Delivery contract
//!
//! - **At-least-once**: a received message stays in the queue, invisible to
//!   other consumers for the visibility window. Unless deleted before the
//!   window elapses it becomes receivable again. This is how a crashed or hung
//!   worker's job is retried, and the window is the *only* mutual exclusion
//!   between workers.
//! - **Long polling**: `receive` waits up to `wait` for a message instead of
//!   returning empty immediately.
//! - **Redrive**: a message already received `max_receive_count` times is moved
//!   to the paired dead-letter queue instead of being delivered again.
//! - **Retention**: messages never consumed are dropped after `retention`.

mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use segq_events::{EventTarget, TargetError};

pub use in_memory::InMemoryWorkQueue;

/// Upper bound for a single long poll.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Queue-assigned message identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Handle for acknowledging one particular receive of a message.
///
/// Every receive issues a new handle; handles from earlier receives stop
/// working once the message has been delivered again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(Uuid);

impl ReceiptHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReceiptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Per-queue delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    /// Receives allowed before redrive to the dead-letter queue.
    pub max_receive_count: u32,
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 2,
            retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage<M> {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: M,
    /// How many times this message has been received, this receive included.
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
}

/// A message inspected without being received.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage<M> {
    pub message_id: MessageId,
    pub body: M,
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
}

/// Point-in-time queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Messages available for receive.
    pub visible: usize,
    /// Messages received but not yet deleted.
    pub in_flight: usize,
}

impl QueueMetrics {
    pub fn backlog(&self) -> usize {
        self.visible + self.in_flight
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The handle belongs to an older receive, or the message is gone.
    #[error("receipt handle {0} is no longer valid")]
    ReceiptExpired(ReceiptHandle),

    /// Visibility can only be changed while the message is in flight.
    #[error("message for receipt {0} is not in flight")]
    NotInFlight(ReceiptHandle),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Queue abstraction used by routers and workers.
#[async_trait]
pub trait WorkQueue<M>: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, body: M) -> Result<MessageId, QueueError>;

    /// Long-poll for at most one message, waiting up to `wait`.
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage<M>>, QueueError>;

    /// Acknowledge: remove the message for good.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Extend (or, with zero, release) the visibility window of an in-flight
    /// message.
    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn metrics(&self) -> Result<QueueMetrics, QueueError>;

    /// Inspect up to `max` visible messages, oldest first, without receiving them.
    async fn peek(&self, max: usize) -> Result<Vec<QueuedMessage<M>>, QueueError>;

    /// Whether any retained message, visible or in flight, matches `matches`.
    async fn any(&self, matches: &(dyn for<'m> Fn(&'m M) -> bool + Sync)) -> Result<bool, QueueError>;
}

#[async_trait]
impl<M, Q> WorkQueue<M> for Arc<Q>
where
    M: Send + 'static,
    Q: WorkQueue<M> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, body: M) -> Result<MessageId, QueueError> {
        (**self).send(body).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage<M>>, QueueError> {
        (**self).receive(wait).await
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt).await
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        (**self).change_visibility(receipt, timeout).await
    }

    async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        (**self).metrics().await
    }

    async fn peek(&self, max: usize) -> Result<Vec<QueuedMessage<M>>, QueueError> {
        (**self).peek(max).await
    }

    async fn any(&self, matches: &(dyn for<'m> Fn(&'m M) -> bool + Sync)) -> Result<bool, QueueError> {
        (**self).any(matches).await
    }
}

/// Bus target that enqueues each delivered event on a work queue.
pub struct QueueTarget<M> {
    queue: Arc<dyn WorkQueue<M>>,
}

impl<M> QueueTarget<M> {
    pub fn new(queue: Arc<dyn WorkQueue<M>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<M: Send + 'static> EventTarget<M> for QueueTarget<M> {
    fn name(&self) -> &str {
        self.queue.name()
    }

    async fn deliver(&self, message: M) -> Result<String, TargetError> {
        self.queue
            .send(message)
            .await
            .map(|id| id.to_string())
            .map_err(|e| TargetError::new(self.queue.name(), e.to_string()))
    }
}
