use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use shared::postgres::enqueue;
use shared::{DbPool, HeldItem, HoldFailureReason, OrderItem, ProductHoldFailed, ProductHoldSuccess, SagaEvent};
use uuid::Uuid;

use crate::models::*;
use crate::repository::InventoryRepository;
use crate::schema::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct PgInventoryRepository {
    pool: DbPool,
}

impl PgInventoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn add_product(&self, name: &str, price: BigDecimal, stock: i32) -> Result<Uuid> {
        let mut conn = self.pool.get().await?;
        let product = NewProduct {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price,
            stock,
        };
        diesel::insert_into(products::table)
            .values(&product)
            .execute(&mut conn)
            .await?;
        Ok(product.id)
    }

    pub async fn find_product(&self, product_id: Uuid) -> Result<Option<Product>> {
        let mut conn = self.pool.get().await?;
        let product = products::table
            .find(product_id)
            .first::<Product>(&mut conn)
            .await
            .optional()?;
        Ok(product)
    }

    pub async fn holds_for(&self, order_id: Uuid) -> Result<Vec<ProductHold>> {
        let mut conn = self.pool.get().await?;
        product_holds::table
            .filter(product_holds::order_id.eq(order_id))
            .order(product_holds::created_at.asc())
            .load::<DbProductHold>(&mut conn)
            .await?
            .into_iter()
            .map(ProductHold::try_from)
            .collect()
    }
}

#[async_trait]
impl InventoryRepository for PgInventoryRepository {
    async fn try_hold(&self, order_id: Uuid, item: &OrderItem) -> Result<HoldAttempt> {
        let mut conn = self.pool.get().await?;
        let item = item.clone();

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let existing = product_holds::table
                    .filter(product_holds::order_id.eq(order_id))
                    .filter(product_holds::product_id.eq(item.product_id))
                    .filter(product_holds::status.eq(HoldStatus::Holded.as_str()))
                    .first::<DbProductHold>(conn)
                    .await
                    .optional()?;
                if let Some(existing) = existing {
                    let hold = ProductHold::try_from(existing)?;
                    return Ok(HoldAttempt::Held(hold.held_item()));
                }

                let unit_price = diesel::update(
                    products::table
                        .filter(products::id.eq(item.product_id))
                        .filter(products::stock.ge(item.quantity)),
                )
                .set((
                    products::stock.eq(products::stock - item.quantity),
                    products::updated_at.eq(Utc::now()),
                ))
                .returning(products::price)
                .get_result::<BigDecimal>(conn)
                .await
                .optional()?;

                let Some(unit_price) = unit_price else {
                    let exists = diesel::select(diesel::dsl::exists(
                        products::table.filter(products::id.eq(item.product_id)),
                    ))
                    .get_result::<bool>(conn)
                    .await?;
                    let reason = if exists {
                        HoldFailureReason::NotEnoughItems
                    } else {
                        HoldFailureReason::NotFound
                    };
                    return Ok(HoldAttempt::Rejected(reason));
                };

                let held = HeldItem::new(item.product_id, item.quantity, unit_price);
                let hold = ProductHold::new(order_id, &held);
                diesel::insert_into(product_holds::table)
                    .values(&NewProductHold::from(&hold))
                    .execute(conn)
                    .await?;

                Ok(HoldAttempt::Held(held))
            }
            .scope_boxed()
        })
        .await
    }

    async fn reservation_outcome(&self, order_id: Uuid) -> Result<Option<ReservationOutcome>> {
        let mut conn = self.pool.get().await?;
        let outcome = order_reservations::table
            .find(order_id)
            .select(order_reservations::outcome)
            .first::<String>(&mut conn)
            .await
            .optional()?;
        outcome.map(|outcome| outcome.parse()).transpose()
    }

    async fn reject_order(&self, event: ProductHoldFailed) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let released = release_holds(conn, event.order_id, HoldStatus::ToReturn).await?;
                if record_outcome(conn, event.order_id, ReservationOutcome::Failed).await? {
                    enqueue(conn, &SagaEvent::from(event)).await?;
                }
                Ok(released)
            }
            .scope_boxed()
        })
        .await
    }

    async fn confirm_order(&self, event: ProductHoldSuccess) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                if record_outcome(conn, event.order_id, ReservationOutcome::Held).await? {
                    enqueue(conn, &SagaEvent::from(event)).await?;
                    return Ok(true);
                }

                let earlier = order_reservations::table
                    .find(event.order_id)
                    .select(order_reservations::outcome)
                    .first::<String>(conn)
                    .await?
                    .parse::<ReservationOutcome>()?;
                if earlier == ReservationOutcome::Failed {
                    release_holds(conn, event.order_id, HoldStatus::ToReturn).await?;
                }
                Ok(false)
            }
            .scope_boxed()
        })
        .await
    }

    async fn resolve_holds(&self, order_id: Uuid, status: HoldStatus) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        release_holds(&mut conn, order_id, status).await
    }

    async fn holds_to_return(&self, limit: i64) -> Result<Vec<ProductHold>> {
        let mut conn = self.pool.get().await?;
        product_holds::table
            .filter(product_holds::status.eq(HoldStatus::ToReturn.as_str()))
            .order(product_holds::created_at.asc())
            .limit(limit)
            .load::<DbProductHold>(&mut conn)
            .await?
            .into_iter()
            .map(ProductHold::try_from)
            .collect()
    }

    async fn return_hold(&self, hold_id: Uuid) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let now = Utc::now();
                let returned = diesel::update(
                    product_holds::table
                        .filter(product_holds::id.eq(hold_id))
                        .filter(product_holds::status.eq(HoldStatus::ToReturn.as_str())),
                )
                .set((
                    product_holds::status.eq(HoldStatus::ToRemove.as_str()),
                    product_holds::updated_at.eq(now),
                ))
                .returning((product_holds::product_id, product_holds::quantity))
                .get_result::<(Uuid, i32)>(conn)
                .await
                .optional()?;

                let Some((product_id, quantity)) = returned else {
                    return Ok(false);
                };

                diesel::update(products::table.filter(products::id.eq(product_id)))
                    .set((
                        products::stock.eq(products::stock + quantity),
                        products::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn retire_holds(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel::delete(
            product_holds::table
                .filter(product_holds::status.eq(HoldStatus::ToRemove.as_str())),
        )
        .execute(&mut conn)
        .await?;
        Ok(deleted)
    }
}

async fn release_holds(
    conn: &mut diesel_async::AsyncPgConnection,
    order_id: Uuid,
    status: HoldStatus,
) -> Result<usize> {
    let released = diesel::update(
        product_holds::table
            .filter(product_holds::order_id.eq(order_id))
            .filter(product_holds::status.eq(HoldStatus::Holded.as_str())),
    )
    .set((
        product_holds::status.eq(status.as_str()),
        product_holds::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;
    Ok(released)
}

/// Returns `false` when the order already had an outcome.
async fn record_outcome(
    conn: &mut diesel_async::AsyncPgConnection,
    order_id: Uuid,
    outcome: ReservationOutcome,
) -> Result<bool> {
    let inserted = diesel::insert_into(order_reservations::table)
        .values(&NewOrderReservation::new(order_id, outcome))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted == 1)
}
