use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use shared::memory::{lock, InMemoryOutbox};
use shared::{PaymentEvent, PaymentResult, PaymentStatus, SagaEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::*;

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Settles one payment request in a single transaction: the
    /// conditional debit, the transaction record and the PaymentResult
    /// outbox row commit together. An order that already has a transaction
    /// record is reported as replayed and left untouched.
    async fn settle(&self, payment: &PaymentEvent) -> Result<Settlement>;
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<Uuid, PaymentAccount>,
    transactions: HashMap<Uuid, PaymentTransaction>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerRepository {
    state: Arc<Mutex<LedgerState>>,
    outbox: InMemoryOutbox,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> InMemoryOutbox {
        self.outbox.clone()
    }

    pub fn add_account(&self, user_id: Uuid, balance: BigDecimal) {
        let now = Utc::now();
        lock(&self.state).accounts.insert(
            user_id,
            PaymentAccount {
                id: Uuid::new_v4(),
                user_id,
                balance,
                active: true,
                version: 0,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn deactivate(&self, user_id: Uuid) {
        if let Some(account) = lock(&self.state).accounts.get_mut(&user_id) {
            account.active = false;
        }
    }

    pub fn balance(&self, user_id: Uuid) -> Option<BigDecimal> {
        lock(&self.state)
            .accounts
            .get(&user_id)
            .map(|account| account.balance.clone())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn settle(&self, payment: &PaymentEvent) -> Result<Settlement> {
        let mut state = lock(&self.state);

        if let Some(existing) = state.transactions.get(&payment.order_id) {
            return Ok(Settlement::Replayed(existing.result.parse()?));
        }

        let status = match state
            .accounts
            .get_mut(&payment.user_id)
            .filter(|account| account.active)
        {
            None => PaymentStatus::NotFound,
            Some(account) if account.balance < payment.amount => PaymentStatus::NotEnoughMoney,
            Some(account) => {
                account.balance = &account.balance - &payment.amount;
                account.version += 1;
                account.updated_at = Utc::now();
                PaymentStatus::Success
            }
        };

        self.outbox.enqueue(&SagaEvent::from(PaymentResult {
            order_id: payment.order_id,
            result: status,
        }))?;
        state.transactions.insert(
            payment.order_id,
            PaymentTransaction {
                order_id: payment.order_id,
                user_id: payment.user_id,
                amount: payment.amount.clone(),
                result: status.as_str().to_string(),
                created_at: Utc::now(),
            },
        );

        Ok(Settlement::Settled(status))
    }
}
