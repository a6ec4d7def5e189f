use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::memory::{lock, InMemoryOutbox};
use shared::{OrderCreated, SagaEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::{Order, OrderStatus, PlaceOrder, Transition};

/// Persistence for the order aggregate. Every method is one local
/// transaction, including the outbox row it writes.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Stores a CREATED order and its OrderCreated outbox row.
    async fn place_order(&self, command: PlaceOrder) -> Result<Order>;

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// Returns `false` when the order is missing or no longer in
    /// `transition.from`; nothing is written in that case.
    async fn transition(&self, transition: Transition) -> Result<bool>;
}

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<Uuid, Order>,
    history: HashMap<Uuid, Vec<OrderStatus>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderRepository {
    state: Arc<Mutex<OrderState>>,
    outbox: InMemoryOutbox,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> InMemoryOutbox {
        self.outbox.clone()
    }

    /// Every status the order has been in, oldest first.
    pub fn status_history(&self, order_id: Uuid) -> Vec<OrderStatus> {
        lock(&self.state)
            .history
            .get(&order_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn place_order(&self, command: PlaceOrder) -> Result<Order> {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            status: OrderStatus::Created,
            items: command.items,
            details: None,
            created_at: now,
            updated_at: now,
        };
        let event = SagaEvent::from(OrderCreated {
            order_id: order.id,
            user_id: order.user_id,
            items: order.items.clone(),
        });

        let mut state = lock(&self.state);
        self.outbox.enqueue(&event)?;
        state.history.insert(order.id, vec![OrderStatus::Created]);
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(lock(&self.state).orders.get(&order_id).cloned())
    }

    async fn transition(&self, transition: Transition) -> Result<bool> {
        let mut state = lock(&self.state);
        let Some(order) = state.orders.get_mut(&transition.order_id) else {
            return Ok(false);
        };
        if order.status != transition.from {
            return Ok(false);
        }

        if let Some(event) = &transition.follow_up {
            self.outbox.enqueue(event)?;
        }
        order.status = transition.to;
        order.details = transition.details;
        order.updated_at = Utc::now();
        state
            .history
            .entry(transition.order_id)
            .or_default()
            .push(transition.to);
        Ok(true)
    }
}
