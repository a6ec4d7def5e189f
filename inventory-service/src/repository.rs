use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use shared::memory::{lock, InMemoryOutbox};
use shared::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::*;

/// Persistence for products and their holds. Each method is one local
/// transaction; the ones that announce an outcome write its outbox row in
/// that same transaction.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// Reserves one line item by decrementing stock only while enough is
    /// left. A HOLDED hold that already exists for the same order and
    /// product is reported again instead of reserving twice.
    async fn try_hold(&self, order_id: Uuid, item: &OrderItem) -> Result<HoldAttempt>;

    /// The outcome already recorded for an order, if any.
    async fn reservation_outcome(&self, order_id: Uuid) -> Result<Option<ReservationOutcome>>;

    /// Moves the order's HOLDED holds to TO_RETURN. Records the failure and
    /// enqueues it unless the order already has an outcome. Returns how many
    /// holds were released.
    async fn reject_order(&self, event: ProductHoldFailed) -> Result<usize>;

    /// Records the order as held and enqueues the success. Returns `false`
    /// if an outcome was already recorded; nothing is enqueued then, and
    /// holds left behind by an earlier failure go to TO_RETURN.
    async fn confirm_order(&self, event: ProductHoldSuccess) -> Result<bool>;

    /// Moves the order's HOLDED holds to `status`.
    async fn resolve_holds(&self, order_id: Uuid, status: HoldStatus) -> Result<usize>;

    /// TO_RETURN holds, oldest first.
    async fn holds_to_return(&self, limit: i64) -> Result<Vec<ProductHold>>;

    /// Flips one TO_RETURN hold to TO_REMOVE and puts its quantity back in
    /// stock. Returns `false` if the hold was no longer TO_RETURN.
    async fn return_hold(&self, hold_id: Uuid) -> Result<bool>;

    /// Deletes every TO_REMOVE hold.
    async fn retire_holds(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct InventoryState {
    products: HashMap<Uuid, Product>,
    holds: Vec<ProductHold>,
    reservations: HashMap<Uuid, ReservationOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryRepository {
    state: Arc<Mutex<InventoryState>>,
    outbox: InMemoryOutbox,
}

impl InMemoryInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> InMemoryOutbox {
        self.outbox.clone()
    }

    pub fn add_product(&self, name: &str, price: BigDecimal, stock: i32) -> Uuid {
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4(),
            name: name.to_string(),
            price,
            stock,
            created_at: now,
            updated_at: now,
        };
        let id = product.id;
        lock(&self.state).products.insert(id, product);
        id
    }

    pub fn set_price(&self, product_id: Uuid, price: BigDecimal) {
        if let Some(product) = lock(&self.state).products.get_mut(&product_id) {
            product.price = price;
            product.updated_at = Utc::now();
        }
    }

    pub fn stock(&self, product_id: Uuid) -> Option<i32> {
        lock(&self.state)
            .products
            .get(&product_id)
            .map(|product| product.stock)
    }

    pub fn holds_for(&self, order_id: Uuid) -> Vec<ProductHold> {
        lock(&self.state)
            .holds
            .iter()
            .filter(|hold| hold.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InventoryRepository for InMemoryInventoryRepository {
    async fn try_hold(&self, order_id: Uuid, item: &OrderItem) -> Result<HoldAttempt> {
        let mut state = lock(&self.state);

        if let Some(existing) = state.holds.iter().find(|hold| {
            hold.order_id == order_id
                && hold.product_id == item.product_id
                && hold.status == HoldStatus::Holded
        }) {
            return Ok(HoldAttempt::Held(existing.held_item()));
        }

        let Some(product) = state.products.get_mut(&item.product_id) else {
            return Ok(HoldAttempt::Rejected(HoldFailureReason::NotFound));
        };
        if product.stock < item.quantity {
            return Ok(HoldAttempt::Rejected(HoldFailureReason::NotEnoughItems));
        }
        product.stock -= item.quantity;
        product.updated_at = Utc::now();

        let held = HeldItem::new(item.product_id, item.quantity, product.price.clone());
        state.holds.push(ProductHold::new(order_id, &held));
        Ok(HoldAttempt::Held(held))
    }

    async fn reservation_outcome(&self, order_id: Uuid) -> Result<Option<ReservationOutcome>> {
        Ok(lock(&self.state).reservations.get(&order_id).copied())
    }

    async fn reject_order(&self, event: ProductHoldFailed) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.reservations.contains_key(&event.order_id) {
            self.outbox.enqueue(&SagaEvent::from(event.clone()))?;
            state
                .reservations
                .insert(event.order_id, ReservationOutcome::Failed);
        }
        Ok(transition_holds(
            &mut state.holds,
            event.order_id,
            HoldStatus::ToReturn,
        ))
    }

    async fn confirm_order(&self, event: ProductHoldSuccess) -> Result<bool> {
        let mut state = lock(&self.state);
        match state.reservations.get(&event.order_id) {
            Some(ReservationOutcome::Failed) => {
                transition_holds(&mut state.holds, event.order_id, HoldStatus::ToReturn);
                Ok(false)
            }
            Some(ReservationOutcome::Held) => Ok(false),
            None => {
                self.outbox.enqueue(&SagaEvent::from(event.clone()))?;
                state
                    .reservations
                    .insert(event.order_id, ReservationOutcome::Held);
                Ok(true)
            }
        }
    }

    async fn resolve_holds(&self, order_id: Uuid, status: HoldStatus) -> Result<usize> {
        let mut state = lock(&self.state);
        Ok(transition_holds(&mut state.holds, order_id, status))
    }

    async fn holds_to_return(&self, limit: i64) -> Result<Vec<ProductHold>> {
        let state = lock(&self.state);
        let mut holds: Vec<ProductHold> = state
            .holds
            .iter()
            .filter(|hold| hold.status == HoldStatus::ToReturn)
            .cloned()
            .collect();
        holds.sort_by_key(|hold| hold.created_at);
        holds.truncate(limit.max(0) as usize);
        Ok(holds)
    }

    async fn return_hold(&self, hold_id: Uuid) -> Result<bool> {
        let mut state = lock(&self.state);
        let InventoryState { products, holds, .. } = &mut *state;

        let Some(hold) = holds
            .iter_mut()
            .find(|hold| hold.id == hold_id && hold.status == HoldStatus::ToReturn)
        else {
            return Ok(false);
        };

        let now = Utc::now();
        hold.status = HoldStatus::ToRemove;
        hold.updated_at = now;
        if let Some(product) = products.get_mut(&hold.product_id) {
            product.stock += hold.quantity;
            product.updated_at = now;
        }
        Ok(true)
    }

    async fn retire_holds(&self) -> Result<usize> {
        let mut state = lock(&self.state);
        let before = state.holds.len();
        state.holds.retain(|hold| hold.status != HoldStatus::ToRemove);
        Ok(before - state.holds.len())
    }
}

fn transition_holds(holds: &mut [ProductHold], order_id: Uuid, status: HoldStatus) -> usize {
    let now = Utc::now();
    let mut changed = 0;
    for hold in holds
        .iter_mut()
        .filter(|hold| hold.order_id == order_id && hold.status == HoldStatus::Holded)
    {
        hold.status = status;
        hold.updated_at = now;
        changed += 1;
    }
    changed
}
