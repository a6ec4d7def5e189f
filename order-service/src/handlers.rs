use anyhow::Result;
use async_trait::async_trait;
use shared::*;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::*;
use crate::repository::OrderRepository;

/// Drives an order through the saga by reacting to inventory and payment
/// outcomes. Every reaction is a guarded transition, so stale or repeated
/// events fall through without side effects.
pub struct OrderSaga<R: ?Sized> {
    repository: Arc<R>,
}

impl<R: ?Sized> Clone for OrderSaga<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: OrderRepository + ?Sized> OrderSaga<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    pub async fn place_order(&self, command: PlaceOrder) -> Result<Order> {
        let order = self.repository.place_order(command).await?;
        info!(
            "Order {} created for user {} with {} items",
            order.id,
            order.user_id,
            order.items.len()
        );
        Ok(order)
    }

    async fn on_hold_success(&self, event: ProductHoldSuccess) -> Result<()> {
        let Some(order) = self.repository.find_order(event.order_id).await? else {
            warn!("ProductHoldSuccess for unknown order {}", event.order_id);
            return Ok(());
        };

        let payment = PaymentEvent {
            user_id: order.user_id,
            order_id: order.id,
            amount: event.amount(),
        };
        let amount = payment.amount.clone();
        let transition = Transition::new(order.id, OrderStatus::Created, OrderStatus::PendingPayment)?
            .with_follow_up(payment);

        if self.transition(transition).await? {
            info!("Order {} awaiting payment of {}", order.id, amount);
        }
        Ok(())
    }

    async fn on_hold_failed(&self, event: ProductHoldFailed) -> Result<()> {
        let transition = Transition::new(
            event.order_id,
            OrderStatus::Created,
            OrderStatus::ProductReservationFailed,
        )?
        .with_details(serde_json::to_value(&event.items)?);

        if self.transition(transition).await? {
            info!(
                "Order {} failed reservation for {} items",
                event.order_id,
                event.items.len()
            );
        }
        Ok(())
    }

    async fn on_payment_result(&self, event: PaymentResult) -> Result<()> {
        let (to, details) = match event.result {
            PaymentStatus::Success => (OrderStatus::Completed, HoldRemoveDetails::ToRemove),
            PaymentStatus::NotFound => {
                (OrderStatus::PaymentFailedNotFound, HoldRemoveDetails::ToReturn)
            }
            PaymentStatus::NotEnoughMoney => (
                OrderStatus::PaymentFailedNotEnoughMoney,
                HoldRemoveDetails::ToReturn,
            ),
        };

        let mut transition = Transition::new(event.order_id, OrderStatus::PendingPayment, to)?
            .with_follow_up(ProductHoldRemove {
                order_id: event.order_id,
                details,
            });
        if event.result != PaymentStatus::Success {
            transition = transition.with_details(serde_json::json!({
                "paymentResult": event.result.as_str(),
            }));
        }

        if self.transition(transition).await? {
            info!("Order {} is now {}", event.order_id, to);
        }
        Ok(())
    }

    async fn transition(&self, transition: Transition) -> Result<bool> {
        let (order_id, from, to) = (transition.order_id, transition.from, transition.to);
        let applied = self.repository.transition(transition).await?;
        if !applied {
            warn!(
                "Order {} is not in status {}, skipping transition to {}",
                order_id, from, to
            );
        }
        Ok(applied)
    }

    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.repository.find_order(order_id).await
    }
}

#[async_trait]
impl<R: OrderRepository + ?Sized + 'static> InboxHandler for OrderSaga<R> {
    async fn apply(&self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::ProductHoldSuccess(event) => self.on_hold_success(event).await,
            SagaEvent::ProductHoldFailed(event) => self.on_hold_failed(event).await,
            SagaEvent::PaymentResult(event) => self.on_payment_result(event).await,
            other => {
                warn!(
                    "Order saga ignoring {} for order {}",
                    other.event_type(),
                    other.order_id()
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryOrderRepository;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn order_saga() -> (OrderSaga<InMemoryOrderRepository>, Arc<InMemoryOrderRepository>) {
        let repository = Arc::new(InMemoryOrderRepository::new());
        (OrderSaga::new(repository.clone()), repository)
    }

    async fn placed_order(saga: &OrderSaga<InMemoryOrderRepository>) -> Order {
        let command = PlaceOrder::new(
            Uuid::new_v4(),
            vec![OrderItem {
                product_id: Uuid::new_v4(),
                quantity: 2,
            }],
        )
        .unwrap();
        saga.place_order(command).await.unwrap()
    }

    fn hold_success(order_id: Uuid) -> SagaEvent {
        SagaEvent::from(ProductHoldSuccess {
            order_id,
            items: vec![HeldItem::new(
                Uuid::new_v4(),
                2,
                BigDecimal::from_str("12.50").unwrap(),
            )],
        })
    }

    fn payment_result(order_id: Uuid, result: PaymentStatus) -> SagaEvent {
        SagaEvent::from(PaymentResult { order_id, result })
    }

    #[tokio::test]
    async fn test_place_order_enqueues_order_created() {
        let (saga, repository) = order_saga();
        let order = placed_order(&saga).await;

        assert_eq!(order.status, OrderStatus::Created);
        let events = repository.outbox().events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SagaEvent::OrderCreated(created) => {
                assert_eq!(created.order_id, order.id);
                assert_eq!(created.user_id, order.user_id);
                assert_eq!(created.items, order.items);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hold_success_requests_payment() {
        let (saga, repository) = order_saga();
        let order = placed_order(&saga).await;

        saga.apply(hold_success(order.id)).await.unwrap();

        let stored = saga.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::PendingPayment);
        match repository.outbox().events().last() {
            Some(SagaEvent::PaymentRequest(payment)) => {
                assert_eq!(payment.user_id, order.user_id);
                assert_eq!(payment.amount, BigDecimal::from(25));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hold_failed_stores_failed_items() {
        let (saga, repository) = order_saga();
        let order = placed_order(&saga).await;
        let failed = ProductHoldFailed {
            order_id: order.id,
            items: vec![FailedItem {
                product_id: order.items[0].product_id,
                quantity: 2,
                reason: HoldFailureReason::NotEnoughItems,
            }],
        };

        saga.apply(SagaEvent::from(failed.clone())).await.unwrap();

        let stored = saga.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::ProductReservationFailed);
        assert_eq!(stored.details, Some(serde_json::to_value(&failed.items).unwrap()));
        assert_eq!(repository.outbox().events().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_outcomes() {
        let cases = [
            (PaymentStatus::Success, OrderStatus::Completed, HoldRemoveDetails::ToRemove),
            (
                PaymentStatus::NotFound,
                OrderStatus::PaymentFailedNotFound,
                HoldRemoveDetails::ToReturn,
            ),
            (
                PaymentStatus::NotEnoughMoney,
                OrderStatus::PaymentFailedNotEnoughMoney,
                HoldRemoveDetails::ToReturn,
            ),
        ];

        for (result, status, details) in cases {
            let (saga, repository) = order_saga();
            let order = placed_order(&saga).await;
            saga.apply(hold_success(order.id)).await.unwrap();
            saga.apply(payment_result(order.id, result)).await.unwrap();

            let stored = saga.find_order(order.id).await.unwrap().unwrap();
            assert_eq!(stored.status, status);
            assert_eq!(
                repository.outbox().events().last(),
                Some(&SagaEvent::from(ProductHoldRemove {
                    order_id: order.id,
                    details,
                }))
            );
        }
    }

    #[tokio::test]
    async fn test_repeated_events_are_absorbed() {
        let (saga, repository) = order_saga();
        let order = placed_order(&saga).await;

        saga.apply(hold_success(order.id)).await.unwrap();
        saga.apply(hold_success(order.id)).await.unwrap();
        saga.apply(payment_result(order.id, PaymentStatus::Success))
            .await
            .unwrap();
        saga.apply(payment_result(order.id, PaymentStatus::NotEnoughMoney))
            .await
            .unwrap();

        // OrderCreated, PaymentEvent, ProductHoldRemove
        assert_eq!(repository.outbox().events().len(), 3);
        assert_eq!(
            repository.status_history(order.id),
            vec![
                OrderStatus::Created,
                OrderStatus::PendingPayment,
                OrderStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_payment_result_before_reservation_is_skipped() {
        let (saga, repository) = order_saga();
        let order = placed_order(&saga).await;

        saga.apply(payment_result(order.id, PaymentStatus::Success))
            .await
            .unwrap();

        let stored = saga.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Created);
        assert_eq!(repository.outbox().events().len(), 1);
    }

    #[tokio::test]
    async fn test_event_for_unknown_order_is_ignored() {
        let (saga, repository) = order_saga();

        saga.apply(hold_success(Uuid::new_v4())).await.unwrap();
        saga.apply(payment_result(Uuid::new_v4(), PaymentStatus::Success))
            .await
            .unwrap();

        assert!(repository.outbox().events().is_empty());
    }
}
