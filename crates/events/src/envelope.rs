use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// Envelope for a published event.
///
/// `source` names the publishing system (e.g. "job-api"). `detail_type` and
/// `version` are taken from the event itself so they can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    source: String,
    detail_type: String,
    version: u32,
    published_at: DateTime<Utc>,
    detail: E,
}

impl<E: Event> EventEnvelope<E> {
    pub fn new(source: impl Into<String>, detail: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            source: source.into(),
            detail_type: detail.detail_type().to_string(),
            version: detail.version(),
            published_at: Utc::now(),
            detail,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn detail_type(&self) -> &str {
        &self.detail_type
    }

    /// Schema version of `detail`.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn detail(&self) -> &E {
        &self.detail
    }

    pub fn into_detail(self) -> E {
        self.detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Resized {
        width: u32,
    }

    impl Event for Resized {
        fn detail_type(&self) -> &'static str {
            "Resized"
        }

        fn version(&self) -> u32 {
            3
        }
    }

    #[test]
    fn header_is_taken_from_the_event() {
        let envelope = EventEnvelope::new("studio", Resized { width: 640 });
        assert_eq!(envelope.source(), "studio");
        assert_eq!(envelope.detail_type(), "Resized");
        assert_eq!(envelope.version(), 3);
        assert_eq!(envelope.detail().width, 640);
    }

    #[test]
    fn version_survives_serialization() {
        let envelope = EventEnvelope::new("studio", Resized { width: 32 });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["detail_type"], "Resized");

        let back: EventEnvelope<Resized> = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
