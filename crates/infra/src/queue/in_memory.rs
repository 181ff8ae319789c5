//! In-memory work queue for tests/dev and single-process deployments.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    MessageId, QueueConfig, QueueError, QueueMetrics, QueuedMessage, ReceiptHandle,
    ReceivedMessage, WorkQueue,
};

#[derive(Debug, Clone)]
struct Entry<M> {
    id: MessageId,
    body: M,
    sent_at: DateTime<Utc>,
    enqueued_at: Instant,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

/// Outcome of one scan of the queue.
struct Scan<M> {
    delivered: Option<ReceivedMessage<M>>,
    redriven: Vec<Entry<M>>,
    next_visible: Option<Instant>,
}

/// In-memory queue honouring the full delivery contract (visibility windows,
/// long polling, redrive, retention).
///
/// Time is `tokio::time`, so tests can drive windows with a paused clock.
pub struct InMemoryWorkQueue<M> {
    name: String,
    config: QueueConfig,
    entries: Mutex<Vec<Entry<M>>>,
    arrivals: Notify,
    dead_letter: Option<Arc<InMemoryWorkQueue<M>>>,
}

impl<M> InMemoryWorkQueue<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// A queue without redrive (used as a dead-letter queue itself).
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            dead_letter: None,
        }
    }

    /// A queue that redrives to `dead_letter` after `config.max_receive_count`
    /// receives.
    pub fn with_dead_letter(
        name: impl Into<String>,
        config: QueueConfig,
        dead_letter: Arc<InMemoryWorkQueue<M>>,
    ) -> Self {
        Self {
            dead_letter: Some(dead_letter),
            ..Self::new(name, config)
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dead_letter(&self) -> Option<&Arc<InMemoryWorkQueue<M>>> {
        self.dead_letter.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Entry<M>>>, QueueError> {
        self.entries
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("{}: lock poisoned", self.name)))
    }

    fn purge_expired(&self, entries: &mut Vec<Entry<M>>, now: Instant) {
        let retention = self.config.retention;
        let before = entries.len();
        entries.retain(|e| e.enqueued_at + retention > now);
        let dropped = before - entries.len();
        if dropped > 0 {
            warn!(queue = %self.name, dropped, "messages expired past retention");
        }
    }

    fn scan(&self, now: Instant) -> Result<Scan<M>, QueueError> {
        let mut entries = self.lock()?;
        self.purge_expired(&mut entries, now);

        let mut redriven = Vec::new();
        let mut delivered = None;
        let mut i = 0;
        while i < entries.len() {
            if entries[i].visible_at > now {
                i += 1;
                continue;
            }
            if self.dead_letter.is_some() && entries[i].receive_count >= self.config.max_receive_count {
                redriven.push(entries.remove(i));
                continue;
            }

            let entry = &mut entries[i];
            let receipt = ReceiptHandle::new();
            entry.receive_count += 1;
            entry.receipt = Some(receipt);
            entry.visible_at = now + self.config.visibility_timeout;
            delivered = Some(ReceivedMessage {
                message_id: entry.id,
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
                sent_at: entry.sent_at,
            });
            break;
        }

        let next_visible = entries
            .iter()
            .map(|e| e.visible_at)
            .filter(|at| *at > now)
            .min();

        Ok(Scan {
            delivered,
            redriven,
            next_visible,
        })
    }

    fn accept_redriven(&self, mut entry: Entry<M>) -> Result<(), QueueError> {
        entry.receipt = None;
        entry.visible_at = Instant::now();
        self.lock()?.push(entry);
        self.arrivals.notify_waiters();
        Ok(())
    }

    fn find_in_flight<'a>(
        &self,
        entries: &'a mut [Entry<M>],
        receipt: &ReceiptHandle,
    ) -> Result<&'a mut Entry<M>, QueueError> {
        entries
            .iter_mut()
            .find(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or(QueueError::ReceiptExpired(*receipt))
    }
}

#[async_trait]
impl<M> WorkQueue<M> for InMemoryWorkQueue<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: M) -> Result<MessageId, QueueError> {
        let now = Instant::now();
        let id = MessageId::new();
        self.lock()?.push(Entry {
            id,
            body,
            sent_at: Utc::now(),
            enqueued_at: now,
            visible_at: now,
            receive_count: 0,
            receipt: None,
        });
        self.arrivals.notify_waiters();
        debug!(queue = %self.name, message_id = %id, "message sent");
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage<M>>, QueueError> {
        let deadline = Instant::now() + wait.min(super::MAX_RECEIVE_WAIT);

        loop {
            // Register for wake-ups before scanning so a send between the scan
            // and the wait is not missed.
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let now = Instant::now();
            let scan = self.scan(now)?;

            if !scan.redriven.is_empty() {
                if let Some(dlq) = &self.dead_letter {
                    for entry in scan.redriven {
                        warn!(
                            queue = %self.name,
                            dead_letter_queue = %dlq.name,
                            message_id = %entry.id,
                            receive_count = entry.receive_count,
                            "message exceeded max receive count; moved to dead-letter queue"
                        );
                        dlq.accept_redriven(entry)?;
                    }
                }
            }

            if let Some(message) = scan.delivered {
                return Ok(Some(message));
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = scan.next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut entries = self.lock()?;
        let id = self.find_in_flight(&mut entries, receipt)?.id;
        entries.retain(|e| e.id != id);
        debug!(queue = %self.name, message_id = %id, "message deleted");
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut entries = self.lock()?;
            let entry = self.find_in_flight(&mut entries, receipt)?;
            if entry.visible_at <= now {
                return Err(QueueError::NotInFlight(*receipt));
            }
            entry.visible_at = now + timeout;
        }
        if timeout.is_zero() {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        self.purge_expired(&mut entries, now);

        let in_flight = entries.iter().filter(|e| e.visible_at > now).count();
        Ok(QueueMetrics {
            visible: entries.len() - in_flight,
            in_flight,
        })
    }

    async fn peek(&self, max: usize) -> Result<Vec<QueuedMessage<M>>, QueueError> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|e| e.visible_at <= now && e.enqueued_at + self.config.retention > now)
            .take(max)
            .map(|e| QueuedMessage {
                message_id: e.id,
                body: e.body.clone(),
                receive_count: e.receive_count,
                sent_at: e.sent_at,
            })
            .collect())
    }

    async fn any(&self, matches: &(dyn for<'m> Fn(&'m M) -> bool + Sync)) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        self.purge_expired(&mut entries, now);
        Ok(entries.iter().any(|e| matches(&e.body)))
    }
}
