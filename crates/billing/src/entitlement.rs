//! Entitlement engine
//!
//! Central read path: `{used, limit, remaining, percentage, tier}` for a user.
//! Never writes. [`EntitlementEngine::usage`] treats a counter-store read
//! failure as zero usage (fail open) and serves display paths.
//! [`EntitlementEngine::checked_usage`] surfaces the failure and serves
//! debit decisions. Relational errors propagate from both.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use venuelens_shared::{usage_key, CounterStore, Tier};

use crate::catalog::{Allowance, PlanCatalog};
use crate::error::BillingResult;
use crate::store::BillingStore;

/// A user's entitlement at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Signed. Negative means bonus credits beyond the plan.
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percentage: i64,
    pub tier: Tier,
}

impl Usage {
    pub fn compute(used: i64, limit: i64, tier: Tier) -> Self {
        let remaining = limit.saturating_sub(used).max(0);
        let percentage = (used.max(0).saturating_mul(100) / limit.max(1)).min(100);
        Self {
            used,
            limit,
            remaining,
            percentage,
            tier,
        }
    }

    /// What an anonymous caller is shown
    pub fn free_view() -> Self {
        Self::compute(0, Tier::Free.default_allowance(), Tier::Free)
    }
}

#[derive(Clone)]
pub struct EntitlementEngine {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    counter: Arc<dyn CounterStore>,
}

impl EntitlementEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        counter: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            store,
            catalog,
            counter,
        }
    }

    /// Plan allowance from the mirror row, free when absent or inactive
    pub async fn allowance(&self, user_id: Uuid) -> BillingResult<Allowance> {
        let record = self.store.get_subscription(user_id).await?;
        match record {
            Some(record) if record.is_entitled() => match &record.current_price_external_id {
                Some(price_id) => self.catalog.lookup_allowance(price_id).await,
                None => Ok(Allowance::free()),
            },
            _ => Ok(Allowance::free()),
        }
    }

    /// Counter value, zero when missing
    pub async fn read_used(&self, user_id: Uuid) -> BillingResult<i64> {
        Ok(self.counter.get(&usage_key(user_id)).await?.unwrap_or(0))
    }

    /// Counter value, zero when missing or unreadable
    pub async fn used(&self, user_id: Uuid) -> i64 {
        match self.read_used(user_id).await {
            Ok(used) => used,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Counter read failed, treating usage as zero"
                );
                0
            }
        }
    }

    pub async fn usage(&self, user_id: Uuid) -> BillingResult<Usage> {
        let allowance = self.allowance(user_id).await?;
        let used = self.used(user_id).await;
        Ok(Usage::compute(used, allowance.credits, allowance.tier))
    }

    /// Like [`usage`](Self::usage) but an unreadable counter is an error
    pub async fn checked_usage(&self, user_id: Uuid) -> BillingResult<Usage> {
        let allowance = self.allowance(user_id).await?;
        let used = self.read_used(user_id).await?;
        Ok(Usage::compute(used, allowance.credits, allowance.tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBillingStore;
    use venuelens_shared::MemoryCounterStore;

    #[test]
    fn test_compute_basic() {
        assert_eq!(
            Usage::compute(1, 2, Tier::Free),
            Usage {
                used: 1,
                limit: 2,
                remaining: 1,
                percentage: 50,
                tier: Tier::Free
            }
        );
    }

    #[test]
    fn test_compute_over_limit_clamps_view_only() {
        let usage = Usage::compute(7, 5, Tier::Basic);
        assert_eq!(usage.used, 7);
        assert_eq!(usage.remaining, 0);
        assert_eq!(usage.percentage, 100);
    }

    #[test]
    fn test_compute_negative_used_is_bonus() {
        let usage = Usage::compute(-650, 50, Tier::Pro);
        assert_eq!(usage.remaining, 700);
        assert_eq!(usage.percentage, 0);
    }

    #[test]
    fn test_compute_zero_limit() {
        let usage = Usage::compute(0, 0, Tier::Free);
        assert_eq!(usage.remaining, 0);
        assert_eq!(usage.percentage, 0);
        assert_eq!(Usage::compute(3, 0, Tier::Free).percentage, 100);
    }

    #[test]
    fn test_percentage_floors() {
        assert_eq!(Usage::compute(1, 3, Tier::Free).percentage, 33);
        assert_eq!(Usage::compute(2, 3, Tier::Free).percentage, 66);
    }

    #[tokio::test]
    async fn test_fresh_user_gets_free_tier() {
        let store = Arc::new(MemoryBillingStore::new());
        let engine = EntitlementEngine::new(
            store.clone(),
            PlanCatalog::new(store),
            Arc::new(MemoryCounterStore::new()),
        );
        let usage = engine.usage(Uuid::new_v4()).await.unwrap();
        assert_eq!(usage, Usage::free_view());
    }

    #[tokio::test]
    async fn test_counter_outage_fails_open() {
        let store = Arc::new(MemoryBillingStore::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let engine = EntitlementEngine::new(store.clone(), PlanCatalog::new(store), counter.clone());
        let user = Uuid::new_v4();
        counter.set(&usage_key(user), 2).await.unwrap();

        counter.set_available(false);
        let usage = engine.usage(user).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, usage.limit);
    }
}
