use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::DeliveryError;
use crate::events::EventType;
use crate::inbox::{Delivery, InboxReceiver, InboxStore};
use crate::outbox::{Envelope, EventPublisher};

pub const EVENT_ID_HEADER: &str = "event-id";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(200);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);

pub fn create_producer(brokers: &str) -> KafkaResult<FutureProducer> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
}

/// Offsets are committed by hand once the inbox row is durable.
pub fn create_consumer(brokers: &str, group_id: &str) -> KafkaResult<StreamConsumer> {
    ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
}

pub fn subscribe(consumer: &StreamConsumer, event_types: &[EventType]) -> KafkaResult<()> {
    let topics: Vec<&str> = event_types.iter().map(EventType::topic).collect();
    consumer.subscribe(&topics)?;
    info!("Subscribed to {}", topics.join(", "));
    Ok(())
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let headers = OwnedHeaders::new().insert(Header {
            key: EVENT_ID_HEADER,
            value: Some(envelope.event_id.as_str()),
        });
        let record = FutureRecord::to(&envelope.topic)
            .payload(&envelope.payload)
            .key(&envelope.key)
            .headers(headers);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| DeliveryError::Transient {
                topic: envelope.topic.clone(),
                reason: e.to_string(),
            })
    }
}

/// What to do with a consumed message's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Commit,
    /// The inbox write failed; the same message must be recorded again
    /// before anything after it on the partition is committed.
    Retry,
}

/// Messages that can never decode are acknowledged so they don't block the
/// partition. Everything else is acknowledged only once the inbox row is
/// durable.
pub async fn handle_delivery<S: InboxStore>(
    receiver: &InboxReceiver<S>,
    decoded: &Result<Delivery, DeliveryError>,
) -> Acknowledgement {
    match decoded {
        Ok(delivery) => match receiver.receive(delivery.clone()).await {
            Ok(_) => Acknowledgement::Commit,
            Err(e) => {
                error!("Error recording event {}: {}", delivery.event_id, e);
                Acknowledgement::Retry
            }
        },
        Err(e) => {
            warn!("Dropping undeliverable message: {}", e);
            Acknowledgement::Commit
        }
    }
}

/// Records every delivered message in the inbox and commits its offset once
/// the row is durable. A message whose write fails is retried with backoff
/// before the stream moves on, since committing a later offset on the same
/// partition would acknowledge it too.
pub async fn run_inbox_consumer<S: InboxStore>(consumer: StreamConsumer, receiver: InboxReceiver<S>) {
    let mut message_stream = consumer.stream();

    while let Some(message) = message_stream.next().await {
        match message {
            Ok(m) => {
                let decoded = decode_message(&m);
                let mut backoff = RETRY_BACKOFF_MIN;
                while handle_delivery(&receiver, &decoded).await == Acknowledgement::Retry {
                    warn!(
                        "Retrying message {}:{}:{} in {:?}",
                        m.topic(),
                        m.partition(),
                        m.offset(),
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                }

                if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                    error!("Error committing message: {}", e);
                }
            }
            Err(e) => error!("Error receiving message: {}", e),
        }
    }
}

fn decode_message(m: &BorrowedMessage<'_>) -> Result<Delivery, DeliveryError> {
    let event_id = header_event_id(m)
        .unwrap_or_else(|| format!("{}:{}:{}", m.topic(), m.partition(), m.offset()));
    let payload = match m.payload_view::<str>() {
        Some(Ok(payload)) => payload,
        _ => return Err(DeliveryError::InvalidPayload),
    };
    Delivery::decode(m.topic(), event_id, payload)
}

fn header_event_id(m: &BorrowedMessage<'_>) -> Option<String> {
    m.headers()?
        .iter()
        .find(|header| header.key == EVENT_ID_HEADER)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(str::to_owned)
}
