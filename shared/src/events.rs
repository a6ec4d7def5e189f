use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DeliveryError;

/// Every message kind that crosses a service boundary. Each one travels on
/// its own topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    OrderCreated,
    ProductHoldSuccess,
    ProductHoldFailed,
    PaymentRequest,
    PaymentResult,
    ProductHoldRemove,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::OrderCreated,
        EventType::ProductHoldSuccess,
        EventType::ProductHoldFailed,
        EventType::PaymentRequest,
        EventType::PaymentResult,
        EventType::ProductHoldRemove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "OrderCreated",
            EventType::ProductHoldSuccess => "ProductHoldSuccess",
            EventType::ProductHoldFailed => "ProductHoldFailed",
            EventType::PaymentRequest => "PaymentEvent",
            EventType::PaymentResult => "PaymentResult",
            EventType::ProductHoldRemove => "ProductHoldRemove",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order-created",
            EventType::ProductHoldSuccess => "product-hold-success",
            EventType::ProductHoldFailed => "product-hold-failed",
            EventType::PaymentRequest => "payment-request",
            EventType::PaymentResult => "payment-result",
            EventType::ProductHoldRemove => "product-hold-remove",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.topic() == topic)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DeliveryError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub items: Vec<OrderItem>,
}

/// A reserved line item. `total_price` is fixed when the hold is taken and
/// never recomputed from a later catalog price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
}

impl HeldItem {
    pub fn new(product_id: Uuid, quantity: i32, unit_price: BigDecimal) -> Self {
        let total_price = &unit_price * BigDecimal::from(quantity);
        Self {
            product_id,
            quantity,
            unit_price,
            total_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductHoldSuccess {
    pub order_id: Uuid,
    pub items: Vec<HeldItem>,
}

impl ProductHoldSuccess {
    pub fn amount(&self) -> BigDecimal {
        self.items
            .iter()
            .fold(BigDecimal::from(0), |acc, item| acc + &item.total_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldFailureReason {
    NotFound,
    NotEnoughItems,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub reason: HoldFailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductHoldFailed {
    pub order_id: Uuid,
    pub items: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Success,
    NotEnoughMoney,
    NotFound,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::NotEnoughMoney => "NOT_ENOUGH_MONEY",
            PaymentStatus::NotFound => "NOT_FOUND",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(PaymentStatus::Success),
            "NOT_ENOUGH_MONEY" => Ok(PaymentStatus::NotEnoughMoney),
            "NOT_FOUND" => Ok(PaymentStatus::NotFound),
            other => Err(anyhow::anyhow!("Unknown payment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub order_id: Uuid,
    pub result: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldRemoveDetails {
    ToRemove,
    ToReturn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductHoldRemove {
    pub order_id: Uuid,
    pub details: HoldRemoveDetails,
}

/// A decoded saga message. The variant is carried out of band (topic on the
/// wire, `event_type` column in the outbox/inbox tables); the payload is the
/// bare event body.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEvent {
    OrderCreated(OrderCreated),
    ProductHoldSuccess(ProductHoldSuccess),
    ProductHoldFailed(ProductHoldFailed),
    PaymentRequest(PaymentEvent),
    PaymentResult(PaymentResult),
    ProductHoldRemove(ProductHoldRemove),
}

impl SagaEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SagaEvent::OrderCreated(_) => EventType::OrderCreated,
            SagaEvent::ProductHoldSuccess(_) => EventType::ProductHoldSuccess,
            SagaEvent::ProductHoldFailed(_) => EventType::ProductHoldFailed,
            SagaEvent::PaymentRequest(_) => EventType::PaymentRequest,
            SagaEvent::PaymentResult(_) => EventType::PaymentResult,
            SagaEvent::ProductHoldRemove(_) => EventType::ProductHoldRemove,
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            SagaEvent::OrderCreated(e) => e.order_id,
            SagaEvent::ProductHoldSuccess(e) => e.order_id,
            SagaEvent::ProductHoldFailed(e) => e.order_id,
            SagaEvent::PaymentRequest(e) => e.order_id,
            SagaEvent::PaymentResult(e) => e.order_id,
            SagaEvent::ProductHoldRemove(e) => e.order_id,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            SagaEvent::OrderCreated(e) => serde_json::to_value(e),
            SagaEvent::ProductHoldSuccess(e) => serde_json::to_value(e),
            SagaEvent::ProductHoldFailed(e) => serde_json::to_value(e),
            SagaEvent::PaymentRequest(e) => serde_json::to_value(e),
            SagaEvent::PaymentResult(e) => serde_json::to_value(e),
            SagaEvent::ProductHoldRemove(e) => serde_json::to_value(e),
        }
    }

    pub fn from_payload(
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Self, DeliveryError> {
        let malformed = |source| DeliveryError::Malformed { event_type, source };
        let event = match event_type {
            EventType::OrderCreated => {
                SagaEvent::OrderCreated(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::ProductHoldSuccess => {
                SagaEvent::ProductHoldSuccess(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::ProductHoldFailed => {
                SagaEvent::ProductHoldFailed(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::PaymentRequest => {
                SagaEvent::PaymentRequest(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::PaymentResult => {
                SagaEvent::PaymentResult(serde_json::from_value(payload).map_err(malformed)?)
            }
            EventType::ProductHoldRemove => {
                SagaEvent::ProductHoldRemove(serde_json::from_value(payload).map_err(malformed)?)
            }
        };
        Ok(event)
    }

    /// Parses the text body of a broker message.
    pub fn decode(event_type: EventType, text: &str) -> Result<Self, DeliveryError> {
        let payload = serde_json::from_str(text)
            .map_err(|source| DeliveryError::Malformed { event_type, source })?;
        Self::from_payload(event_type, payload)
    }
}

macro_rules! impl_from_event {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SagaEvent {
                fn from(event: $ty) -> Self {
                    SagaEvent::$variant(event)
                }
            }
        )*
    };
}

impl_from_event! {
    OrderCreated => OrderCreated,
    ProductHoldSuccess => ProductHoldSuccess,
    ProductHoldFailed => ProductHoldFailed,
    PaymentRequest => PaymentEvent,
    PaymentResult => PaymentResult,
    ProductHoldRemove => ProductHoldRemove,
}
