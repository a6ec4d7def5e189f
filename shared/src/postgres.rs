use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::events::{EventType, SagaEvent};
use crate::inbox::{Delivery, InboxEntry, InboxStore, RecordOutcome};
use crate::models::*;
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::schema::*;

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub async fn connect_pool(database_url: &str) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = bb8::Pool::builder().build(config).await?;
    Ok(pool)
}

/// Runs embedded migrations over a blocking wrapper around the async
/// connection, off the runtime's worker threads.
pub async fn run_migrations(database_url: &str, migrations: EmbeddedMigrations) -> Result<()> {
    info!("Running database migrations...");
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&url)?;
        conn.run_pending_migrations(migrations)
            .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
        Ok(())
    })
    .await??;
    info!("Migrations completed successfully");
    Ok(())
}

/// Writes an outbox row on the caller's connection, so it commits or rolls
/// back with whatever domain change the caller's transaction makes.
pub async fn enqueue(conn: &mut AsyncPgConnection, event: &SagaEvent) -> Result<i64> {
    let row = NewOutboxEvent::from_event(event)?;
    let id = diesel::insert_into(outbox_events::table)
        .values(&row)
        .returning(outbox_events::id)
        .get_result::<i64>(conn)
        .await?;
    Ok(id)
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: DbPool,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        let mut conn = self.pool.get().await?;

        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::id.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        rows.into_iter().map(OutboxMessage::try_from).collect()
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::update(
            outbox_events::table
                .filter(outbox_events::id.eq(id))
                .filter(outbox_events::processed.eq(false)),
        )
        .set(outbox_events::processed.eq(true))
        .execute(&mut conn)
        .await?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct PgInboxStore {
    pool: DbPool,
}

impl PgInboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn record(&self, delivery: &Delivery) -> Result<RecordOutcome> {
        let mut conn = self.pool.get().await?;
        let row = NewInboxEvent::from_delivery(delivery)?;

        let inserted = diesel::insert_into(inbox_events::table)
            .values(&row)
            .on_conflict(inbox_events::event_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(if inserted == 0 {
            RecordOutcome::Duplicate
        } else {
            RecordOutcome::Recorded
        })
    }

    async fn fetch_unprocessed(
        &self,
        event_types: &[EventType],
        limit: i64,
    ) -> Result<Vec<InboxEntry>> {
        let mut conn = self.pool.get().await?;
        let names: Vec<&str> = event_types.iter().map(EventType::as_str).collect();

        let rows = inbox_events::table
            .filter(inbox_events::processed.eq(false))
            .filter(inbox_events::event_type.eq_any(names))
            .order(inbox_events::id.asc())
            .limit(limit)
            .load::<DbInboxEvent>(&mut conn)
            .await?;

        rows.into_iter().map(InboxEntry::try_from).collect()
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::update(
            inbox_events::table
                .filter(inbox_events::id.eq(id))
                .filter(inbox_events::processed.eq(false)),
        )
        .set(inbox_events::processed.eq(true))
        .execute(&mut conn)
        .await?;

        Ok(())
    }
}
