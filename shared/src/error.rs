use thiserror::Error;

use crate::events::EventType;

/// Failures at the broker boundary.
///
/// `Transient` is the only retryable kind: the outbox row stays unprocessed
/// and the next relay cycle tries again. The rest describe messages that can
/// never be applied and are dropped after logging.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure on topic {topic}: {reason}")]
    Transient { topic: String, reason: String },

    #[error("no event type is bound to topic {0}")]
    UnknownTopic(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },

    #[error("message payload is missing or not UTF-8")]
    InvalidPayload,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }
}
