use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::DeliveryError;
use crate::events::{EventType, SagaEvent};
use crate::outbox::{Envelope, DEFAULT_BATCH_SIZE};
use crate::worker::PollTask;

/// A decoded broker message together with its dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event_id: String,
    pub event: SagaEvent,
}

impl Delivery {
    pub fn decode(topic: &str, event_id: String, payload: &str) -> Result<Self, DeliveryError> {
        let event_type = EventType::from_topic(topic)
            .ok_or_else(|| DeliveryError::UnknownTopic(topic.to_string()))?;
        let event = SagaEvent::decode(event_type, payload)?;
        Ok(Self { event_id, event })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DeliveryError> {
        Self::decode(
            &envelope.topic,
            envelope.event_id.clone(),
            &envelope.payload,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The event id was already in the inbox; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub id: i64,
    pub event_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn record(&self, delivery: &Delivery) -> Result<RecordOutcome>;

    /// Unprocessed rows of the given types in ascending id order.
    async fn fetch_unprocessed(
        &self,
        event_types: &[EventType],
        limit: i64,
    ) -> Result<Vec<InboxEntry>>;

    async fn mark_processed(&self, id: i64) -> Result<()>;
}

/// Applies the domain effect of one inbox event. Implementations must be
/// safe to run more than once for the same event.
#[async_trait]
pub trait InboxHandler: Send + Sync {
    async fn apply(&self, event: SagaEvent) -> Result<()>;
}

#[async_trait]
impl<H: InboxHandler + ?Sized> InboxHandler for Arc<H> {
    async fn apply(&self, event: SagaEvent) -> Result<()> {
        (**self).apply(event).await
    }
}

/// Persists broker deliveries. The caller acknowledges the broker only after
/// `receive` returns `Ok`.
#[derive(Clone)]
pub struct InboxReceiver<S> {
    store: S,
}

impl<S: InboxStore> InboxReceiver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn receive(&self, delivery: Delivery) -> Result<RecordOutcome> {
        let outcome = self.store.record(&delivery).await?;
        match outcome {
            RecordOutcome::Recorded => info!(
                "Recorded inbox event {} ({}) for {}",
                delivery.event_id,
                delivery.event.event_type(),
                delivery.event.order_id()
            ),
            RecordOutcome::Duplicate => warn!(
                "Duplicate delivery of event {} ignored",
                delivery.event_id
            ),
        }
        Ok(outcome)
    }
}

/// Drains unprocessed inbox rows of some event types into a handler.
pub struct InboxProcessor<S, H> {
    name: String,
    store: S,
    handler: H,
    event_types: Vec<EventType>,
    batch_size: i64,
}

impl<S: InboxStore, H: InboxHandler> InboxProcessor<S, H> {
    pub fn new(store: S, handler: H, event_types: Vec<EventType>) -> Self {
        let name = format!(
            "inbox-processor[{}]",
            event_types
                .iter()
                .map(EventType::as_str)
                .collect::<Vec<_>>()
                .join(",")
        );
        Self {
            name,
            store,
            handler,
            event_types,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub async fn apply_batch(&self) -> Result<usize> {
        let entries = self
            .store
            .fetch_unprocessed(&self.event_types, self.batch_size)
            .await?;
        let mut applied = 0;

        for entry in entries {
            let event = match SagaEvent::from_payload(entry.event_type, entry.payload) {
                Ok(event) => event,
                Err(e) => {
                    // Retrying can't fix the payload; keep it out of later batches.
                    error!("Dropping undecodable inbox event {}: {}", entry.id, e);
                    if let Err(e) = self.store.mark_processed(entry.id).await {
                        error!("Failed to mark inbox event {} processed: {}", entry.id, e);
                    }
                    continue;
                }
            };

            if let Err(e) = self.handler.apply(event).await {
                error!("Error applying inbox event {}: {}", entry.id, e);
                continue;
            }

            if let Err(e) = self.store.mark_processed(entry.id).await {
                error!("Failed to mark inbox event {} processed: {}", entry.id, e);
                continue;
            }

            applied += 1;
        }

        Ok(applied)
    }
}

#[async_trait]
impl<S, H> PollTask for InboxProcessor<S, H>
where
    S: InboxStore + 'static,
    H: InboxHandler + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_cycle(&self) -> Result<usize> {
        self.apply_batch().await
    }
}
