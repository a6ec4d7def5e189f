use anyhow::Result;
use async_trait::async_trait;
use shared::*;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::models::*;
use crate::repository::InventoryRepository;

/// Reserves stock for new orders and releases it when the order side
/// settles.
pub struct HoldManager<R: ?Sized> {
    repository: Arc<R>,
}

impl<R: ?Sized> Clone for HoldManager<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: InventoryRepository + ?Sized> HoldManager<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Holds every item in order. The first item that can't be held fails
    /// the whole order and releases whatever was already held for it.
    async fn hold_order(&self, event: OrderCreated) -> Result<()> {
        if let Some(outcome) = self.repository.reservation_outcome(event.order_id).await? {
            warn!(
                "Order {} already reserved as {}, ignoring repeated request",
                event.order_id, outcome
            );
            return Ok(());
        }

        let mut held = Vec::with_capacity(event.items.len());

        for item in &event.items {
            match self.repository.try_hold(event.order_id, item).await? {
                HoldAttempt::Held(item) => held.push(item),
                HoldAttempt::Rejected(reason) => {
                    let failed = ProductHoldFailed {
                        order_id: event.order_id,
                        items: vec![FailedItem {
                            product_id: item.product_id,
                            quantity: item.quantity,
                            reason,
                        }],
                    };
                    let released = self.repository.reject_order(failed).await?;
                    warn!(
                        "Order {} rejected: product {} {:?}, released {} holds",
                        event.order_id, item.product_id, reason, released
                    );
                    return Ok(());
                }
            }
        }

        let success = ProductHoldSuccess {
            order_id: event.order_id,
            items: held,
        };
        let amount = success.amount();
        if !self.repository.confirm_order(success).await? {
            warn!("Order {} was settled meanwhile, not confirming", event.order_id);
            return Ok(());
        }
        info!(
            "Held {} items for order {}, total {}",
            event.items.len(),
            event.order_id,
            amount
        );
        Ok(())
    }

    async fn release_order(&self, event: ProductHoldRemove) -> Result<()> {
        let status = HoldStatus::from(event.details);
        let changed = self.repository.resolve_holds(event.order_id, status).await?;
        if changed == 0 {
            warn!("No held stock for order {} to mark {}", event.order_id, status);
        } else {
            info!("Marked {} holds of order {} {}", changed, event.order_id, status);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: InventoryRepository + ?Sized + 'static> InboxHandler for HoldManager<R> {
    async fn apply(&self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::OrderCreated(event) => self.hold_order(event).await,
            SagaEvent::ProductHoldRemove(event) => self.release_order(event).await,
            other => {
                warn!(
                    "Hold manager ignoring {} for order {}",
                    other.event_type(),
                    other.order_id()
                );
                Ok(())
            }
        }
    }
}

/// Background cleanup of released holds: returns TO_RETURN quantities to
/// stock, then deletes holds that are TO_REMOVE.
pub struct HoldSweeper<R: ?Sized> {
    repository: Arc<R>,
    batch_size: i64,
}

impl<R: InventoryRepository + ?Sized> HoldSweeper<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub async fn sweep(&self) -> Result<usize> {
        let holds = self.repository.holds_to_return(self.batch_size).await?;
        let mut returned = 0;

        for hold in holds {
            match self.repository.return_hold(hold.id).await {
                Ok(true) => {
                    info!(
                        "Returned {} units of product {} from hold {} (order {})",
                        hold.quantity, hold.product_id, hold.id, hold.order_id
                    );
                    returned += 1;
                }
                Ok(false) => {}
                Err(e) => error!("Error returning hold {}: {}", hold.id, e),
            }
        }

        let retired = self.repository.retire_holds().await?;
        if retired > 0 {
            info!("Removed {} released holds", retired);
        }

        Ok(returned + retired)
    }
}

#[async_trait]
impl<R: InventoryRepository + ?Sized + 'static> PollTask for HoldSweeper<R> {
    fn name(&self) -> &str {
        "hold-sweeper"
    }

    async fn run_cycle(&self) -> Result<usize> {
        self.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryInventoryRepository;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use uuid::Uuid;

    fn setup() -> (
        HoldManager<InMemoryInventoryRepository>,
        HoldSweeper<InMemoryInventoryRepository>,
        Arc<InMemoryInventoryRepository>,
    ) {
        let repository = Arc::new(InMemoryInventoryRepository::new());
        (
            HoldManager::new(repository.clone()),
            HoldSweeper::new(repository.clone()),
            repository,
        )
    }

    fn order_created(order_id: Uuid, items: &[(Uuid, i32)]) -> SagaEvent {
        SagaEvent::from(OrderCreated {
            order_id,
            user_id: Uuid::new_v4(),
            items: items
                .iter()
                .map(|(product_id, quantity)| OrderItem {
                    product_id: *product_id,
                    quantity: *quantity,
                })
                .collect(),
        })
    }

    fn price(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    #[tokio::test]
    async fn test_two_items_in_stock_are_held() {
        let (manager, _, repository) = setup();
        let keyboard = repository.add_product("keyboard", price("49.90"), 10);
        let mouse = repository.add_product("mouse", price("15.00"), 3);
        let order_id = Uuid::new_v4();

        manager
            .apply(order_created(order_id, &[(keyboard, 2), (mouse, 3)]))
            .await
            .unwrap();

        assert_eq!(repository.stock(keyboard), Some(8));
        assert_eq!(repository.stock(mouse), Some(0));
        assert_eq!(repository.holds_for(order_id).len(), 2);

        match repository.outbox().events().as_slice() {
            [SagaEvent::ProductHoldSuccess(success)] => {
                assert_eq!(success.order_id, order_id);
                assert_eq!(success.items[0].total_price, price("99.80"));
                assert_eq!(success.items[1].total_price, price("45.00"));
                assert_eq!(success.amount(), price("144.80"));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_stock_item_fails_order_and_returns_siblings() {
        let (manager, sweeper, repository) = setup();
        let in_stock = repository.add_product("cable", price("5.00"), 10);
        let scarce = repository.add_product("monitor", price("199.00"), 1);
        let order_id = Uuid::new_v4();

        manager
            .apply(order_created(order_id, &[(in_stock, 4), (scarce, 2)]))
            .await
            .unwrap();

        assert_eq!(repository.stock(in_stock), Some(6));
        assert_eq!(repository.stock(scarce), Some(1));
        let holds = repository.holds_for(order_id);
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].status, HoldStatus::ToReturn);

        match repository.outbox().events().as_slice() {
            [SagaEvent::ProductHoldFailed(failed)] => {
                assert_eq!(
                    failed.items,
                    vec![FailedItem {
                        product_id: scarce,
                        quantity: 2,
                        reason: HoldFailureReason::NotEnoughItems,
                    }]
                );
            }
            other => panic!("unexpected events {:?}", other),
        }

        // returned, then retired in the same cycle
        assert_eq!(sweeper.sweep().await.unwrap(), 2);
        assert_eq!(repository.stock(in_stock), Some(10));
        assert!(repository.holds_for(order_id).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_product_is_reported_not_found() {
        let (manager, _, repository) = setup();
        let missing = Uuid::new_v4();
        let order_id = Uuid::new_v4();

        manager
            .apply(order_created(order_id, &[(missing, 1)]))
            .await
            .unwrap();

        match repository.outbox().events().as_slice() {
            [SagaEvent::ProductHoldFailed(failed)] => {
                assert_eq!(failed.items[0].reason, HoldFailureReason::NotFound);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_processing_stops_at_first_failing_item() {
        let (manager, _, repository) = setup();
        let missing = Uuid::new_v4();
        let later = repository.add_product("dock", price("80.00"), 5);
        let order_id = Uuid::new_v4();

        manager
            .apply(order_created(order_id, &[(missing, 1), (later, 1)]))
            .await
            .unwrap();

        assert_eq!(repository.stock(later), Some(5));
        assert!(repository.holds_for(order_id).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_holds_never_oversell() {
        let repository = Arc::new(InMemoryInventoryRepository::new());
        let product = repository.add_product("gpu", price("500.00"), 5);

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let repository = repository.clone();
                tokio::spawn(async move {
                    repository
                        .try_hold(
                            Uuid::new_v4(),
                            &OrderItem {
                                product_id: product,
                                quantity: 3,
                            },
                        )
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut held = 0;
        for attempt in attempts {
            if let HoldAttempt::Held(_) = attempt.await.unwrap() {
                held += 1;
            }
        }

        assert_eq!(held, 1);
        assert_eq!(repository.stock(product), Some(2));
    }

    #[tokio::test]
    async fn test_to_remove_keeps_stock_decremented() {
        let (manager, sweeper, repository) = setup();
        let product = repository.add_product("chair", price("120.00"), 4);
        let order_id = Uuid::new_v4();
        manager
            .apply(order_created(order_id, &[(product, 3)]))
            .await
            .unwrap();

        manager
            .apply(SagaEvent::from(ProductHoldRemove {
                order_id,
                details: HoldRemoveDetails::ToRemove,
            }))
            .await
            .unwrap();

        assert_eq!(repository.holds_for(order_id)[0].status, HoldStatus::ToRemove);
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(repository.stock(product), Some(1));
        assert!(repository.holds_for(order_id).is_empty());
    }

    #[tokio::test]
    async fn test_to_return_restores_stock() {
        let (manager, sweeper, repository) = setup();
        let product = repository.add_product("desk", price("300.00"), 2);
        let order_id = Uuid::new_v4();
        manager
            .apply(order_created(order_id, &[(product, 2)]))
            .await
            .unwrap();
        assert_eq!(repository.stock(product), Some(0));

        manager
            .apply(SagaEvent::from(ProductHoldRemove {
                order_id,
                details: HoldRemoveDetails::ToReturn,
            }))
            .await
            .unwrap();
        sweeper.sweep().await.unwrap();

        assert_eq!(repository.stock(product), Some(2));
        assert!(repository.holds_for(order_id).is_empty());
        // a second sweep has nothing left to return
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
        assert_eq!(repository.stock(product), Some(2));
    }

    #[tokio::test]
    async fn test_replayed_order_is_not_held_twice() {
        let (manager, _, repository) = setup();
        let product = repository.add_product("lamp", price("25.00"), 5);
        let order_id = Uuid::new_v4();
        let event = order_created(order_id, &[(product, 2)]);

        manager.apply(event.clone()).await.unwrap();
        manager.apply(event).await.unwrap();

        assert_eq!(repository.stock(product), Some(3));
        assert_eq!(repository.holds_for(order_id).len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_failed_order_stays_failed_after_stock_returns() {
        let (manager, sweeper, repository) = setup();
        let cable = repository.add_product("cable", price("5.00"), 10);
        let monitor = repository.add_product("monitor", price("199.00"), 4);
        let earlier = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let event = order_created(order_id, &[(cable, 1), (monitor, 3)]);

        manager
            .apply(order_created(earlier, &[(monitor, 2)]))
            .await
            .unwrap();
        manager.apply(event.clone()).await.unwrap();
        sweeper.sweep().await.unwrap();

        // the competing order gives its monitors back
        manager
            .apply(SagaEvent::from(ProductHoldRemove {
                order_id: earlier,
                details: HoldRemoveDetails::ToReturn,
            }))
            .await
            .unwrap();
        sweeper.sweep().await.unwrap();
        assert_eq!(repository.stock(monitor), Some(4));

        manager.apply(event).await.unwrap();

        assert_eq!(repository.stock(cable), Some(10));
        assert_eq!(repository.stock(monitor), Some(4));
        assert!(repository.holds_for(order_id).is_empty());
        assert_eq!(
            repository.reservation_outcome(order_id).await.unwrap(),
            Some(ReservationOutcome::Failed)
        );
        let outcomes: Vec<EventType> = repository
            .outbox()
            .events()
            .iter()
            .filter(|event| event.order_id() == order_id)
            .map(|event| event.event_type())
            .collect();
        assert_eq!(outcomes, vec![EventType::ProductHoldFailed]);
    }

    #[tokio::test]
    async fn test_late_confirmation_after_failure_releases_its_holds() {
        let (_, sweeper, repository) = setup();
        let product = repository.add_product("dock", price("80.00"), 5);
        let order_id = Uuid::new_v4();
        repository
            .reject_order(ProductHoldFailed {
                order_id,
                items: vec![FailedItem {
                    product_id: product,
                    quantity: 9,
                    reason: HoldFailureReason::NotEnoughItems,
                }],
            })
            .await
            .unwrap();

        let item = OrderItem {
            product_id: product,
            quantity: 2,
        };
        let HoldAttempt::Held(held) = repository.try_hold(order_id, &item).await.unwrap() else {
            panic!("expected the hold to succeed");
        };
        let confirmed = repository
            .confirm_order(ProductHoldSuccess {
                order_id,
                items: vec![held],
            })
            .await
            .unwrap();

        assert!(!confirmed);
        assert_eq!(repository.outbox().events().len(), 1);
        sweeper.sweep().await.unwrap();
        assert_eq!(repository.stock(product), Some(5));
    }

    #[tokio::test]
    async fn test_price_change_after_hold_keeps_held_total() {
        let (manager, _, repository) = setup();
        let product = repository.add_product("headset", price("60.00"), 5);
        let order_id = Uuid::new_v4();
        let event = order_created(order_id, &[(product, 2)]);

        manager.apply(event.clone()).await.unwrap();
        repository.set_price(product, price("75.00"));
        manager.apply(event).await.unwrap();

        for event in repository.outbox().events() {
            match event {
                SagaEvent::ProductHoldSuccess(success) => {
                    assert_eq!(success.items[0].unit_price, price("60.00"));
                    assert_eq!(success.amount(), price("120.00"));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_remove_for_order_without_holds_is_a_no_op() {
        let (manager, _, repository) = setup();

        manager
            .apply(SagaEvent::from(ProductHoldRemove {
                order_id: Uuid::new_v4(),
                details: HoldRemoveDetails::ToReturn,
            }))
            .await
            .unwrap();

        assert!(repository.outbox().events().is_empty());
    }
}
