//! Debit gate
//!
//! Check-and-consume primitive for paywalled operations plus the operator
//! override writes. Checks read through the entitlement engine. Checks and
//! writes fail closed: if the counter store is degraded, or the read or write
//! errors, the caller gets [`BillingError::CounterStoreUnavailable`].
//!
//! `check` and `commit` are two separate steps. No lock is held between
//! them, so concurrent requests may briefly push `used` past the limit.

use std::sync::Arc;

use uuid::Uuid;
use venuelens_shared::{usage_key, CounterStore};

use crate::entitlement::{EntitlementEngine, Usage};
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct DebitGate {
    engine: EntitlementEngine,
    counter: Arc<dyn CounterStore>,
}

impl DebitGate {
    pub fn new(engine: EntitlementEngine, counter: Arc<dyn CounterStore>) -> Self {
        Self { engine, counter }
    }

    /// Fails when writes cannot be recorded
    pub fn ensure_writable(&self) -> BillingResult<()> {
        if self.counter.is_durable() {
            Ok(())
        } else {
            Err(BillingError::CounterStoreUnavailable(format!(
                "{} counter store does not record writes",
                self.counter.backend()
            )))
        }
    }

    /// `remaining >= cost`. Fails when the counter cannot be read.
    pub async fn check(&self, user_id: Uuid, cost: i64) -> BillingResult<bool> {
        let usage = self.engine.checked_usage(user_id).await?;
        Ok(usage.remaining >= cost)
    }

    /// Debit `cost` after the guarded operation succeeded. Returns new `used`.
    pub async fn commit(&self, user_id: Uuid, cost: i64) -> BillingResult<i64> {
        self.ensure_writable()?;
        let used = self.counter.incr(&usage_key(user_id), cost).await?;
        tracing::debug!(user_id = %user_id, cost = cost, used = used, "Credits committed");
        Ok(used)
    }

    /// `used = 0`
    pub async fn reset(&self, user_id: Uuid) -> BillingResult<()> {
        self.ensure_writable()?;
        self.counter.set(&usage_key(user_id), 0).await?;
        tracing::info!(user_id = %user_id, "Usage counter reset");
        Ok(())
    }

    /// `used = limit - remaining`, possibly negative
    pub async fn set_remaining(&self, user_id: Uuid, remaining: i64) -> BillingResult<Usage> {
        self.ensure_writable()?;
        let allowance = self.engine.allowance(user_id).await?;
        let used = allowance.credits.checked_sub(remaining).ok_or_else(|| {
            BillingError::InvalidInput(format!("remaining {} is out of range", remaining))
        })?;
        self.counter.set(&usage_key(user_id), used).await?;
        Ok(Usage::compute(used, allowance.credits, allowance.tier))
    }

    /// Grant `delta` extra credits (negative takes credits away). Returns new `used`.
    pub async fn add(&self, user_id: Uuid, delta: i64) -> BillingResult<i64> {
        self.ensure_writable()?;
        let decrement = delta.checked_neg().ok_or_else(|| {
            BillingError::InvalidInput(format!("delta {} is out of range", delta))
        })?;
        let used = self.counter.incr(&usage_key(user_id), decrement).await?;
        Ok(used)
    }
}
