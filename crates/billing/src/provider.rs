//! Outbound billing-provider reads
//!
//! The provider is the source of truth for subscription state. Everything
//! the metering core needs from it goes through [`BillingProvider`] so the
//! webhook ingestor and the reset scheduler can run against a scripted
//! provider in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::{BillingInterval, SubscriptionStatus};

use crate::error::BillingResult;
use crate::models::{Price, ProductUpsert};

/// Product as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProduct {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

impl ProviderProduct {
    /// Allowance carried in product metadata (`credits`, or legacy `tokens`)
    pub fn allowance_hint(&self) -> i64 {
        ["credits", "tokens"]
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .find_map(|raw| raw.trim().parse::<i64>().ok())
            .map(|v| v.max(0))
            .unwrap_or(0)
    }

    pub fn to_upsert(&self) -> ProductUpsert {
        ProductUpsert {
            external_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            active: self.active,
            initial_allowance: self.allowance_hint(),
        }
    }
}

/// Price as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPrice {
    pub id: String,
    pub product_id: String,
    pub currency: String,
    pub unit_amount: i64,
    /// None for one-off prices
    pub interval: Option<BillingInterval>,
    pub interval_count: i64,
    pub active: bool,
}

impl ProviderPrice {
    /// Catalog row, or None for non-recurring prices
    pub fn to_price(&self) -> Option<Price> {
        let interval = self.interval?;
        Some(Price {
            external_id: self.id.clone(),
            product_id: self.product_id.clone(),
            currency: self.currency.clone(),
            minor_units_amount: self.unit_amount,
            interval,
            interval_count: self.interval_count.clamp(1, i32::MAX as i64) as i32,
            active: self.active,
        })
    }
}

/// Subscription as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub created: OffsetDateTime,
    /// Price of the first subscription item
    pub price: Option<ProviderPrice>,
}

impl ProviderSubscription {
    pub fn is_yearly(&self) -> bool {
        self.price
            .as_ref()
            .and_then(|p| p.interval)
            .is_some_and(|i| i == BillingInterval::Year)
    }
}

/// Active products and recurring prices
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    pub products: Vec<ProviderProduct>,
    pub prices: Vec<ProviderPrice>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// `metadata.user_id` of a customer, if present and a valid UUID
    async fn customer_user_id(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Active subscription of a customer, else the most recently created one
    async fn latest_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;

    async fn list_catalog(&self) -> BillingResult<ProviderCatalog>;
}

/// Pick the subscription the mirror should follow
pub fn select_current_subscription(
    mut subscriptions: Vec<ProviderSubscription>,
) -> Option<ProviderSubscription> {
    subscriptions.sort_by(|a, b| b.created.cmp(&a.created));
    let active = subscriptions
        .iter()
        .position(|s| s.status.is_entitled())
        .unwrap_or(0);
    if subscriptions.is_empty() {
        None
    } else {
        Some(subscriptions.swap_remove(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn product(metadata: &[(&str, &str)]) -> ProviderProduct {
        ProviderProduct {
            id: "prod_1".into(),
            name: "Pro".into(),
            description: None,
            active: true,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn sub(id: &str, status: SubscriptionStatus, created: OffsetDateTime) -> ProviderSubscription {
        ProviderSubscription {
            id: id.into(),
            customer_id: "cus_1".into(),
            status,
            created,
            price: None,
        }
    }

    #[test]
    fn test_allowance_hint_prefers_credits() {
        assert_eq!(product(&[("credits", "40"), ("tokens", "10")]).allowance_hint(), 40);
        assert_eq!(product(&[("tokens", "10")]).allowance_hint(), 10);
        assert_eq!(product(&[("credits", "lots")]).allowance_hint(), 0);
        assert_eq!(product(&[("credits", "-3")]).allowance_hint(), 0);
        assert_eq!(product(&[]).allowance_hint(), 0);
    }

    #[test]
    fn test_one_off_price_is_not_mirrored() {
        let price = ProviderPrice {
            id: "price_once".into(),
            product_id: "prod_1".into(),
            currency: "usd".into(),
            unit_amount: 500,
            interval: None,
            interval_count: 1,
            active: true,
        };
        assert!(price.to_price().is_none());
    }

    #[test]
    fn test_select_prefers_active_subscription() {
        let picked = select_current_subscription(vec![
            sub("sub_old", SubscriptionStatus::Active, datetime!(2026-01-01 0:00 UTC)),
            sub("sub_new", SubscriptionStatus::Canceled, datetime!(2026-05-01 0:00 UTC)),
        ])
        .unwrap();
        assert_eq!(picked.id, "sub_old");
    }

    #[test]
    fn test_select_falls_back_to_most_recent() {
        let picked = select_current_subscription(vec![
            sub("sub_a", SubscriptionStatus::Canceled, datetime!(2026-01-01 0:00 UTC)),
            sub("sub_b", SubscriptionStatus::Canceled, datetime!(2026-03-01 0:00 UTC)),
        ])
        .unwrap();
        assert_eq!(picked.id, "sub_b");
        assert!(select_current_subscription(Vec::new()).is_none());
    }
}
