//! Message contracts and the outbox/inbox relay every service builds on.
//!
//! Services never call each other. Each one commits its domain change and
//! the event announcing it in one local transaction (the outbox), a relay
//! publishes committed events, and receivers persist inbound events before
//! acknowledging them (the inbox) so the domain effect can be applied later,
//! idempotently, by a poller.

pub mod config;
pub mod error;
pub mod events;
pub mod inbox;
pub mod kafka;
pub mod memory;
pub mod models;
pub mod outbox;
pub mod postgres;
pub mod schema;
pub mod worker;

pub use error::DeliveryError;
pub use events::*;
pub use inbox::{Delivery, InboxEntry, InboxHandler, InboxProcessor, InboxReceiver, InboxStore, RecordOutcome};
pub use outbox::{Envelope, EventPublisher, OutboxMessage, OutboxRelay, OutboxStore, DEFAULT_BATCH_SIZE};
pub use postgres::DbPool;
pub use worker::{PollTask, PollingWorker, WorkerHandle};
