use anyhow::Result;
use async_trait::async_trait;
use shared::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::Settlement;
use crate::repository::LedgerRepository;

pub struct LedgerUpdater<R: ?Sized> {
    repository: Arc<R>,
}

impl<R: ?Sized> Clone for LedgerUpdater<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: LedgerRepository + ?Sized> LedgerUpdater<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    async fn charge(&self, payment: PaymentEvent) -> Result<()> {
        match self.repository.settle(&payment).await? {
            Settlement::Settled(PaymentStatus::Success) => info!(
                "Charged {} to user {} for order {}",
                payment.amount, payment.user_id, payment.order_id
            ),
            Settlement::Settled(status) => warn!(
                "Payment of {} for order {} failed: {}",
                payment.amount,
                payment.order_id,
                status.as_str()
            ),
            Settlement::Replayed(status) => warn!(
                "Order {} already settled as {}, ignoring repeated request",
                payment.order_id,
                status.as_str()
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl<R: LedgerRepository + ?Sized + 'static> InboxHandler for LedgerUpdater<R> {
    async fn apply(&self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::PaymentRequest(payment) => self.charge(payment).await,
            other => {
                warn!(
                    "Ledger updater ignoring {} for order {}",
                    other.event_type(),
                    other.order_id()
                );
                Ok(())
            }
        }
    }
}
