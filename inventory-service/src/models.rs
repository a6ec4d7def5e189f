use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{HeldItem, HoldFailureReason, HoldRemoveDetails};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// ```text
/// HOLDED ─┬─> TO_REMOVE ──> (deleted)
///         └─> TO_RETURN ──> TO_REMOVE, stock restored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Holded,
    ToRemove,
    ToReturn,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Holded => "HOLDED",
            HoldStatus::ToRemove => "TO_REMOVE",
            HoldStatus::ToReturn => "TO_RETURN",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOLDED" => Ok(HoldStatus::Holded),
            "TO_REMOVE" => Ok(HoldStatus::ToRemove),
            "TO_RETURN" => Ok(HoldStatus::ToReturn),
            other => Err(anyhow::anyhow!("Unknown hold status: {}", other)),
        }
    }
}

impl From<HoldRemoveDetails> for HoldStatus {
    fn from(details: HoldRemoveDetails) -> Self {
        match details {
            HoldRemoveDetails::ToRemove => HoldStatus::ToRemove,
            HoldRemoveDetails::ToReturn => HoldStatus::ToReturn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProduct {
    pub id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub stock: i32,
}

/// Stock reserved for one line of one order, priced at the moment it was
/// taken.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductHold {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductHold {
    pub fn new(order_id: Uuid, item: &HeldItem) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price: item.unit_price.clone(),
            total_price: item.total_price.clone(),
            status: HoldStatus::Holded,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn held_item(&self) -> HeldItem {
        HeldItem {
            product_id: self.product_id,
            quantity: self.quantity,
            unit_price: self.unit_price.clone(),
            total_price: self.total_price.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::product_holds)]
pub struct DbProductHold {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbProductHold> for ProductHold {
    type Error = anyhow::Error;

    fn try_from(row: DbProductHold) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            quantity: row.quantity,
            unit_price: row.unit_price,
            total_price: row.total_price,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::product_holds)]
pub struct NewProductHold {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
    pub status: String,
}

impl From<&ProductHold> for NewProductHold {
    fn from(hold: &ProductHold) -> Self {
        Self {
            id: hold.id,
            order_id: hold.order_id,
            product_id: hold.product_id,
            quantity: hold.quantity,
            unit_price: hold.unit_price.clone(),
            total_price: hold.total_price.clone(),
            status: hold.status.as_str().to_string(),
        }
    }
}

/// How an order's reservation ended. Recorded once, together with the
/// event that announced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Held,
    Failed,
}

impl ReservationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationOutcome::Held => "HELD",
            ReservationOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReservationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(ReservationOutcome::Held),
            "FAILED" => Ok(ReservationOutcome::Failed),
            other => Err(anyhow::anyhow!("Unknown reservation outcome: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_reservations)]
pub struct NewOrderReservation {
    pub order_id: Uuid,
    pub outcome: String,
}

impl NewOrderReservation {
    pub fn new(order_id: Uuid, outcome: ReservationOutcome) -> Self {
        Self {
            order_id,
            outcome: outcome.as_str().to_string(),
        }
    }
}

/// Outcome of reserving a single line item.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldAttempt {
    Held(HeldItem),
    Rejected(HoldFailureReason),
}
