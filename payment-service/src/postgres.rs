use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use shared::postgres::enqueue;
use shared::{DbPool, PaymentEvent, PaymentResult, PaymentStatus, SagaEvent};
use uuid::Uuid;

use crate::models::*;
use crate::repository::LedgerRepository;
use crate::schema::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: DbPool,
}

impl PgLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open_account(&self, user_id: Uuid, balance: BigDecimal) -> Result<Uuid> {
        let mut conn = self.pool.get().await?;
        let account = NewPaymentAccount {
            id: Uuid::new_v4(),
            user_id,
            balance,
            active: true,
        };
        diesel::insert_into(payment_accounts::table)
            .values(&account)
            .execute(&mut conn)
            .await?;
        Ok(account.id)
    }

    pub async fn find_account(&self, user_id: Uuid) -> Result<Option<PaymentAccount>> {
        let mut conn = self.pool.get().await?;
        let account = payment_accounts::table
            .filter(payment_accounts::user_id.eq(user_id))
            .first::<PaymentAccount>(&mut conn)
            .await
            .optional()?;
        Ok(account)
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn settle(&self, payment: &PaymentEvent) -> Result<Settlement> {
        let mut conn = self.pool.get().await?;
        let payment = payment.clone();

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let existing = payment_transactions::table
                    .find(payment.order_id)
                    .first::<PaymentTransaction>(conn)
                    .await
                    .optional()?;
                if let Some(existing) = existing {
                    return Ok(Settlement::Replayed(existing.result.parse()?));
                }

                let has_account = diesel::select(diesel::dsl::exists(
                    payment_accounts::table
                        .filter(payment_accounts::user_id.eq(payment.user_id))
                        .filter(payment_accounts::active.eq(true)),
                ))
                .get_result::<bool>(conn)
                .await?;

                let status = if !has_account {
                    PaymentStatus::NotFound
                } else {
                    let debited = diesel::update(
                        payment_accounts::table
                            .filter(payment_accounts::user_id.eq(payment.user_id))
                            .filter(payment_accounts::active.eq(true))
                            .filter(payment_accounts::balance.ge(&payment.amount)),
                    )
                    .set((
                        payment_accounts::balance.eq(payment_accounts::balance - &payment.amount),
                        payment_accounts::version.eq(payment_accounts::version + 1),
                        payment_accounts::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                    if debited == 1 {
                        PaymentStatus::Success
                    } else {
                        PaymentStatus::NotEnoughMoney
                    }
                };

                diesel::insert_into(payment_transactions::table)
                    .values(&NewPaymentTransaction {
                        order_id: payment.order_id,
                        user_id: payment.user_id,
                        amount: payment.amount.clone(),
                        result: status.as_str().to_string(),
                    })
                    .execute(conn)
                    .await?;

                enqueue(
                    conn,
                    &SagaEvent::from(PaymentResult {
                        order_id: payment.order_id,
                        result: status,
                    }),
                )
                .await?;

                Ok(Settlement::Settled(status))
            }
            .scope_boxed()
        })
        .await
    }
}
