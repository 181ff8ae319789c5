//! In-process rule-based bus.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{Delivery, EventBus, EventTarget, PublishReceipt, TargetError};
use crate::envelope::EventEnvelope;
use crate::event::Routable;

/// Envelope-level half of a rule: which publisher and which event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPattern {
    pub source: String,
    pub detail_type: String,
}

impl EventPattern {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
        }
    }

    fn matches<M>(&self, envelope: &EventEnvelope<M>) -> bool {
        self.source == envelope.source() && self.detail_type == envelope.detail_type()
    }
}

struct Rule<M: Routable> {
    pattern: EventPattern,
    key: M::Key,
    target: Arc<dyn EventTarget<M>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No rule matched; the event would be dropped on the floor.
    #[error("no rule matches source={source_name} detail_type={detail_type} key={key}")]
    NoMatchingRule {
        source_name: String,
        detail_type: String,
        key: String,
    },

    #[error(transparent)]
    Delivery(#[from] TargetError),

    /// Rule table lock poisoned.
    #[error("rule table poisoned")]
    Poisoned,
}

/// Content-based router.
///
/// A rule matches on `(source, detail_type, routing_key)`; every matching
/// rule's target receives a copy. New routes are added as rules, publishers
/// never change.
pub struct InMemoryEventBus<M: Routable> {
    rules: RwLock<Vec<Rule<M>>>,
}

impl<M: Routable> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule.
    pub fn add_rule(
        &self,
        pattern: EventPattern,
        key: M::Key,
        target: Arc<dyn EventTarget<M>>,
    ) -> Result<(), BusError> {
        let mut rules = self.rules.write().map_err(|_| BusError::Poisoned)?;
        debug!(
            source = %pattern.source,
            detail_type = %pattern.detail_type,
            key = ?key,
            target = target.name(),
            "bus rule added"
        );
        rules.push(Rule {
            pattern,
            key,
            target,
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().map(|r| r.len()).unwrap_or(0)
    }

    fn matching_targets(&self, envelope: &EventEnvelope<M>) -> Result<Vec<Arc<dyn EventTarget<M>>>, BusError> {
        let key = envelope.detail().routing_key();
        let rules = self.rules.read().map_err(|_| BusError::Poisoned)?;
        Ok(rules
            .iter()
            .filter(|r| r.key == key && r.pattern.matches(envelope))
            .map(|r| r.target.clone())
            .collect())
    }
}

impl<M: Routable> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Routable + Clone + Send + Sync + 'static,
{
    type Error = BusError;

    async fn publish(&self, envelope: EventEnvelope<M>) -> Result<PublishReceipt, Self::Error> {
        let targets = self.matching_targets(&envelope)?;
        if targets.is_empty() {
            warn!(
                source = envelope.source(),
                detail_type = envelope.detail_type(),
                version = envelope.version(),
                "unroutable event"
            );
            return Err(BusError::NoMatchingRule {
                source_name: envelope.source().to_string(),
                detail_type: envelope.detail_type().to_string(),
                key: format!("{:?}", envelope.detail().routing_key()),
            });
        }

        let mut deliveries = Vec::with_capacity(targets.len());
        for target in targets {
            let message_id = target.deliver(envelope.detail().clone()).await?;
            deliveries.push(Delivery {
                target: target.name().to_string(),
                message_id,
            });
        }

        Ok(PublishReceipt {
            event_id: envelope.event_id(),
            version: envelope.version(),
            deliveries,
        })
    }
}
