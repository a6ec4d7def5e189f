use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::PaymentStatus;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::payment_accounts)]
pub struct PaymentAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: BigDecimal,
    pub active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payment_accounts)]
pub struct NewPaymentAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: BigDecimal,
    pub active: bool,
}

/// One row per settled order; its presence is what makes a repeated
/// PaymentEvent a replay.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::payment_transactions)]
pub struct PaymentTransaction {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payment_transactions)]
pub struct NewPaymentTransaction {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The debit attempt ran now and its result was enqueued.
    Settled(PaymentStatus),
    /// The order was already settled earlier; nothing was written.
    Replayed(PaymentStatus),
}

impl Settlement {
    pub fn status(&self) -> PaymentStatus {
        match self {
            Settlement::Settled(status) | Settlement::Replayed(status) => *status,
        }
    }
}
