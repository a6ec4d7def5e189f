use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{OrderItem, SagaEvent};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of an order within the fulfillment saga.
///
/// ```text
/// CREATED ─┬─> PENDING_PAYMENT ─┬─> COMPLETED
///          │                    ├─> PAYMENT_FAILED_NOT_FOUND
///          │                    └─> PAYMENT_FAILED_NOT_ENOUGH_MONEY
///          └─> PRODUCT_RESERVATION_FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    PendingPayment,
    ProductReservationFailed,
    Completed,
    PaymentFailedNotFound,
    PaymentFailedNotEnoughMoney,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Created,
        OrderStatus::PendingPayment,
        OrderStatus::ProductReservationFailed,
        OrderStatus::Completed,
        OrderStatus::PaymentFailedNotFound,
        OrderStatus::PaymentFailedNotEnoughMoney,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::ProductReservationFailed => "PRODUCT_RESERVATION_FAILED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::PaymentFailedNotFound => "PAYMENT_FAILED_NOT_FOUND",
            OrderStatus::PaymentFailedNotEnoughMoney => "PAYMENT_FAILED_NOT_ENOUGH_MONEY",
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, PendingPayment)
                | (Created, ProductReservationFailed)
                | (PendingPayment, Completed)
                | (PendingPayment, PaymentFailedNotFound)
                | (PendingPayment, PaymentFailedNotEnoughMoney)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Created | OrderStatus::PendingPayment)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown order status: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidOrder {
    #[error("order has no items")]
    Empty,
    #[error("quantity for product {0} must be positive")]
    NonPositiveQuantity(Uuid),
}

/// Command to open a new order. Lines for the same product are merged so
/// each product appears once per order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    pub user_id: Uuid,
    pub items: Vec<OrderItem>,
}

impl PlaceOrder {
    pub fn new(user_id: Uuid, items: Vec<OrderItem>) -> Result<Self, InvalidOrder> {
        if items.is_empty() {
            return Err(InvalidOrder::Empty);
        }

        let mut merged: BTreeMap<Uuid, i32> = BTreeMap::new();
        let mut order: Vec<Uuid> = Vec::new();
        for item in items {
            if item.quantity <= 0 {
                return Err(InvalidOrder::NonPositiveQuantity(item.product_id));
            }
            let quantity = merged.entry(item.product_id).or_insert_with(|| {
                order.push(item.product_id);
                0
            });
            *quantity += item.quantity;
        }

        let items = order
            .into_iter()
            .map(|product_id| OrderItem {
                product_id,
                quantity: merged[&product_id],
            })
            .collect();

        Ok(Self { user_id, items })
    }
}

/// A guarded status change: it only applies while the order is still in
/// `from`, and `follow_up` is enqueued in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub details: Option<serde_json::Value>,
    pub follow_up: Option<SagaEvent>,
}

impl Transition {
    pub fn new(order_id: Uuid, from: OrderStatus, to: OrderStatus) -> anyhow::Result<Self> {
        if !from.can_transition_to(to) {
            anyhow::bail!("Illegal order transition {} -> {}", from, to);
        }
        Ok(Self {
            order_id,
            from,
            to,
            details: None,
            follow_up: None,
        })
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_follow_up(mut self, event: impl Into<SagaEvent>) -> Self {
        self.follow_up = Some(event.into());
        self
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct DbOrderItem {
    pub id: i64,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
}

impl DbOrder {
    pub fn into_order(self, items: Vec<DbOrderItem>) -> anyhow::Result<Order> {
        Ok(Order {
            id: self.id,
            user_id: self.user_id,
            status: self.status.parse()?,
            items: items
                .into_iter()
                .map(|item| OrderItem {
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .collect(),
            details: self.details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
