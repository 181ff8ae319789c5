//! Event publishing abstraction (mechanics only).
//!
//! The bus is a **router**, not a store: it matches each published envelope
//! against its rule set and hands the detail to the matching targets (durable
//! work queues in practice). It keeps nothing once `publish` returns.
//!
//! ## Delivery Guarantees
//!
//! Targets are at-least-once. A publish that fails half-way may already have
//! delivered to some targets; callers that retry must tolerate duplicates,
//! which is why work orders carry an idempotency token.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::envelope::EventEnvelope;

/// Receiving end of a routing rule.
#[async_trait]
pub trait EventTarget<M>: Send + Sync {
    /// Stable target name, reported back in publish receipts.
    fn name(&self) -> &str;

    /// Hand a message to the target; returns the target-assigned message id.
    async fn deliver(&self, message: M) -> Result<String, TargetError>;
}

/// A target refused or failed a delivery.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("delivery to {target} failed: {reason}")]
pub struct TargetError {
    pub target: String,
    pub reason: String,
}

impl TargetError {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// One successful hand-off to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: String,
    pub message_id: String,
}

/// Result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    /// Schema version of the published event.
    pub version: u32,
    pub deliveries: Vec<Delivery>,
}

/// Publish side of the bus.
#[async_trait]
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    async fn publish(&self, envelope: EventEnvelope<M>) -> Result<PublishReceipt, Self::Error>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, envelope: EventEnvelope<M>) -> Result<PublishReceipt, Self::Error> {
        (**self).publish(envelope).await
    }
}
