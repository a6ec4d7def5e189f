use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use shared::postgres::enqueue;
use shared::{DbPool, OrderCreated, SagaEvent};
use uuid::Uuid;

use crate::models::*;
use crate::repository::OrderRepository;
use crate::schema::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct PgOrderRepository {
    pool: DbPool,
}

impl PgOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn place_order(&self, command: PlaceOrder) -> Result<Order> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let new_order = NewOrder {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            status: OrderStatus::Created.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        let new_items: Vec<NewOrderItem> = command
            .items
            .iter()
            .map(|item| NewOrderItem {
                order_id: new_order.id,
                product_id: item.product_id,
                quantity: item.quantity,
            })
            .collect();
        let event = SagaEvent::from(OrderCreated {
            order_id: new_order.id,
            user_id: new_order.user_id,
            items: command.items.clone(),
        });

        let order = Order {
            id: new_order.id,
            user_id: new_order.user_id,
            status: OrderStatus::Created,
            items: command.items,
            details: None,
            created_at: now,
            updated_at: now,
        };

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                diesel::insert_into(orders::table)
                    .values(&new_order)
                    .execute(conn)
                    .await?;

                diesel::insert_into(order_items::table)
                    .values(&new_items)
                    .execute(conn)
                    .await?;

                enqueue(conn, &event).await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await?;

        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;

        let Some(order) = orders::table
            .find(order_id)
            .first::<DbOrder>(&mut conn)
            .await
            .optional()?
        else {
            return Ok(None);
        };

        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .order(order_items::id.asc())
            .load::<DbOrderItem>(&mut conn)
            .await?;

        Ok(Some(order.into_order(items)?))
    }

    async fn transition(&self, transition: Transition) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(transition.order_id))
                        .filter(orders::status.eq(transition.from.as_str())),
                )
                .set((
                    orders::status.eq(transition.to.as_str()),
                    orders::details.eq(&transition.details),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Ok(false);
                }

                if let Some(event) = &transition.follow_up {
                    enqueue(conn, event).await?;
                }

                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }
}
