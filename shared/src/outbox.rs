use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::events::EventType;
use crate::worker::PollTask;

pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// An outbox row waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: i64,
    pub aggregate_id: Uuid,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// What actually goes over the wire for one outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub event_id: String,
    pub payload: String,
}

impl Envelope {
    /// `source` names the producing service so event ids stay unique across
    /// services whose outbox ids overlap.
    pub fn from_outbox(source: &str, message: &OutboxMessage) -> serde_json::Result<Self> {
        Ok(Self {
            topic: message.event_type.topic().to_string(),
            key: message.aggregate_id.to_string(),
            event_id: format!("{}:{}", source, message.id),
            payload: serde_json::to_string(&message.payload)?,
        })
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unprocessed rows in ascending id order, at most `limit` of them.
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>>;

    async fn mark_processed(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the broker has confirmed the send.
    async fn publish(&self, envelope: &Envelope) -> std::result::Result<(), DeliveryError>;
}

/// Publishes committed outbox rows at least once.
///
/// Each row is marked processed on its own right after its send is
/// confirmed, so a failed publish only leaves that row for the next cycle.
pub struct OutboxRelay<S, P> {
    source: String,
    store: S,
    publisher: P,
    batch_size: i64,
}

impl<S: OutboxStore, P: EventPublisher> OutboxRelay<S, P> {
    pub fn new(source: impl Into<String>, store: S, publisher: P) -> Self {
        Self {
            source: source.into(),
            store,
            publisher,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub async fn relay_batch(&self) -> Result<usize> {
        let pending = self.store.fetch_unprocessed(self.batch_size).await?;
        let mut published = 0;

        for message in pending {
            let envelope = match Envelope::from_outbox(&self.source, &message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!("Failed to serialize outbox event {}: {}", message.id, e);
                    continue;
                }
            };

            if let Err(e) = self.publisher.publish(&envelope).await {
                if e.is_transient() {
                    warn!("Outbox event {} not published, will retry: {}", message.id, e);
                } else {
                    error!("Failed to publish outbox event {}: {}", message.id, e);
                }
                continue;
            }

            // A failure here means the row is published again next cycle.
            if let Err(e) = self.store.mark_processed(message.id).await {
                error!("Failed to mark outbox event {} processed: {}", message.id, e);
                continue;
            }

            info!(
                "Published outbox event {} ({}) for {}",
                message.id, message.event_type, message.aggregate_id
            );
            published += 1;
        }

        Ok(published)
    }
}

#[async_trait]
impl<S, P> PollTask for OutboxRelay<S, P>
where
    S: OutboxStore + 'static,
    P: EventPublisher + 'static,
{
    fn name(&self) -> &str {
        "outbox-relay"
    }

    async fn run_cycle(&self) -> Result<usize> {
        self.relay_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PaymentResult, PaymentStatus, SagaEvent};
    use crate::memory::{InMemoryBroker, InMemoryOutbox};

    fn payment_result(order_id: Uuid) -> SagaEvent {
        SagaEvent::from(PaymentResult {
            order_id,
            result: PaymentStatus::Success,
        })
    }

    #[tokio::test]
    async fn test_relay_publishes_in_id_order_and_marks_processed() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        outbox.enqueue(&payment_result(first)).unwrap();
        outbox.enqueue(&payment_result(second)).unwrap();

        let relay = OutboxRelay::new("payment", outbox.clone(), broker.clone());
        assert_eq!(relay.relay_batch().await.unwrap(), 2);

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].key, first.to_string());
        assert_eq!(published[0].topic, "payment-result");
        assert_eq!(published[0].event_id, "payment:1");
        assert_eq!(published[1].key, second.to_string());
        assert_eq!(outbox.pending_count(), 0);

        // Nothing left to do on the next cycle.
        assert_eq!(relay.relay_batch().await.unwrap(), 0);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_without_blocking_the_batch() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let stuck = Uuid::new_v4();
        let id_stuck = outbox.enqueue(&payment_result(stuck)).unwrap();
        let id_next = outbox.enqueue(&payment_result(Uuid::new_v4())).unwrap();
        broker.fail_key(&stuck.to_string());

        let relay = OutboxRelay::new("payment", outbox.clone(), broker.clone());
        assert_eq!(relay.relay_batch().await.unwrap(), 1);
        assert_eq!(outbox.is_processed(id_stuck), Some(false));
        assert_eq!(outbox.is_processed(id_next), Some(true));

        broker.clear_failures();
        assert_eq!(relay.relay_batch().await.unwrap(), 1);
        assert_eq!(outbox.is_processed(id_stuck), Some(true));
        assert_eq!(outbox.is_processed(id_next), Some(true));
    }

    #[tokio::test]
    async fn test_broker_outage_leaves_everything_pending() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        for _ in 0..3 {
            outbox.enqueue(&payment_result(Uuid::new_v4())).unwrap();
        }
        broker.set_unavailable(true);

        let relay = OutboxRelay::new("payment", outbox.clone(), broker.clone());
        assert_eq!(relay.relay_batch().await.unwrap(), 0);
        assert_eq!(outbox.pending_count(), 3);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_bounds_each_cycle() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        for _ in 0..5 {
            outbox.enqueue(&payment_result(Uuid::new_v4())).unwrap();
        }

        let relay =
            OutboxRelay::new("payment", outbox.clone(), broker.clone()).with_batch_size(2);
        assert_eq!(relay.relay_batch().await.unwrap(), 2);
        assert_eq!(outbox.pending_count(), 3);
        assert_eq!(relay.relay_batch().await.unwrap(), 2);
        assert_eq!(relay.relay_batch().await.unwrap(), 1);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_processed_flag_never_reverts() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let id = outbox.enqueue(&payment_result(Uuid::new_v4())).unwrap();
        let relay = OutboxRelay::new("payment", outbox.clone(), broker.clone());

        relay.relay_batch().await.unwrap();
        assert_eq!(outbox.is_processed(id), Some(true));

        broker.set_unavailable(true);
        outbox.enqueue(&payment_result(Uuid::new_v4())).unwrap();
        relay.relay_batch().await.unwrap();
        outbox.mark_processed(id).await.unwrap();
        assert_eq!(outbox.is_processed(id), Some(true));
    }
}
