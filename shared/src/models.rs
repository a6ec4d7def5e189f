use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::events::SagaEvent;
use crate::inbox::{Delivery, InboxEntry};
use crate::outbox::OutboxMessage;

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: i64,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn from_event(event: &SagaEvent) -> serde_json::Result<Self> {
        Ok(Self {
            aggregate_id: event.order_id(),
            event_type: event.event_type().as_str().to_string(),
            payload: event.to_payload()?,
        })
    }
}

impl TryFrom<DbOutboxEvent> for OutboxMessage {
    type Error = anyhow::Error;

    fn try_from(row: DbOutboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type.parse()?,
            payload: row.payload,
        })
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::inbox_events)]
pub struct DbInboxEvent {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inbox_events)]
pub struct NewInboxEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewInboxEvent {
    pub fn from_delivery(delivery: &Delivery) -> serde_json::Result<Self> {
        Ok(Self {
            event_id: delivery.event_id.clone(),
            event_type: delivery.event.event_type().as_str().to_string(),
            payload: delivery.event.to_payload()?,
        })
    }
}

impl TryFrom<DbInboxEvent> for InboxEntry {
    type Error = anyhow::Error;

    fn try_from(row: DbInboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            event_id: row.event_id,
            event_type: row.event_type.parse()?,
            payload: row.payload,
        })
    }
}
