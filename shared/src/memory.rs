//! In-memory outbox, inbox and broker.
//!
//! These back the services' in-memory repositories and let the whole
//! choreography run inside a single test process.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DeliveryError;
use crate::events::{EventType, SagaEvent};
use crate::inbox::{Delivery, InboxEntry, InboxStore, RecordOutcome};
use crate::outbox::{Envelope, EventPublisher, OutboxMessage, OutboxStore};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct OutboxState {
    rows: Vec<(OutboxMessage, bool)>,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: &SagaEvent) -> Result<i64> {
        let payload = event.to_payload()?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.rows.push((
            OutboxMessage {
                id,
                aggregate_id: event.order_id(),
                event_type: event.event_type(),
                payload,
            },
            false,
        ));
        Ok(id)
    }

    /// Every event ever enqueued, decoded, in id order.
    pub fn events(&self) -> Vec<SagaEvent> {
        lock(&self.state)
            .rows
            .iter()
            .filter_map(|(m, _)| SagaEvent::from_payload(m.event_type, m.payload.clone()).ok())
            .collect()
    }

    pub fn is_processed(&self, id: i64) -> Option<bool> {
        lock(&self.state)
            .rows
            .iter()
            .find(|(m, _)| m.id == id)
            .map(|(_, processed)| *processed)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).rows.iter().filter(|(_, p)| !p).count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        let state = lock(&self.state);
        Ok(state
            .rows
            .iter()
            .filter(|(_, processed)| !processed)
            .take(limit.max(0) as usize)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some((_, processed)) = state.rows.iter_mut().find(|(m, _)| m.id == id) {
            *processed = true;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InboxState {
    rows: Vec<(InboxEntry, bool)>,
    seen: HashSet<String>,
    next_id: i64,
    unavailable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryInbox {
    state: Arc<Mutex<InboxState>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `record` fail, as a lost database connection would.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Stores a row as-is, bypassing decoding.
    pub fn insert_raw(&self, event_id: &str, event_type: EventType, payload: serde_json::Value) -> i64 {
        let mut state = lock(&self.state);
        state.seen.insert(event_id.to_string());
        state.next_id += 1;
        let id = state.next_id;
        state.rows.push((
            InboxEntry {
                id,
                event_id: event_id.to_string(),
                event_type,
                payload,
            },
            false,
        ));
        id
    }

    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processed(&self, id: i64) -> Option<bool> {
        lock(&self.state)
            .rows
            .iter()
            .find(|(e, _)| e.id == id)
            .map(|(_, processed)| *processed)
    }

    pub fn unprocessed_count(&self) -> usize {
        lock(&self.state).rows.iter().filter(|(_, p)| !p).count()
    }
}

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn record(&self, delivery: &Delivery) -> Result<RecordOutcome> {
        let payload = delivery.event.to_payload()?;
        let mut state = lock(&self.state);
        if state.unavailable {
            anyhow::bail!("inbox store unavailable");
        }
        if !state.seen.insert(delivery.event_id.clone()) {
            return Ok(RecordOutcome::Duplicate);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.rows.push((
            InboxEntry {
                id,
                event_id: delivery.event_id.clone(),
                event_type: delivery.event.event_type(),
                payload,
            },
            false,
        ));
        Ok(RecordOutcome::Recorded)
    }

    async fn fetch_unprocessed(
        &self,
        event_types: &[EventType],
        limit: i64,
    ) -> Result<Vec<InboxEntry>> {
        let state = lock(&self.state);
        Ok(state
            .rows
            .iter()
            .filter(|(e, processed)| !processed && event_types.contains(&e.event_type))
            .take(limit.max(0) as usize)
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some((_, processed)) = state.rows.iter_mut().find(|(e, _)| e.id == id) {
            *processed = true;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    published: Vec<Envelope>,
    unavailable: bool,
    failing_keys: HashSet<String>,
}

/// Records every confirmed publish. Can be told to reject sends, either
/// entirely or for particular message keys.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn fail_key(&self, key: &str) {
        lock(&self.state).failing_keys.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.unavailable = false;
        state.failing_keys.clear();
    }

    pub fn published(&self) -> Vec<Envelope> {
        lock(&self.state).published.clone()
    }

    /// Takes everything published so far, as a consumer would.
    pub fn drain(&self) -> Vec<Envelope> {
        std::mem::take(&mut lock(&self.state).published)
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, envelope: &Envelope) -> std::result::Result<(), DeliveryError> {
        let mut state = lock(&self.state);
        if state.unavailable || state.failing_keys.contains(&envelope.key) {
            return Err(DeliveryError::Transient {
                topic: envelope.topic.clone(),
                reason: "broker unavailable".to_string(),
            });
        }
        state.published.push(envelope.clone());
        Ok(())
    }
}
