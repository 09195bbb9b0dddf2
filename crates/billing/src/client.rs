//! Stripe client wrapper
//!
//! Every outbound call carries a hard timeout. A timed-out call surfaces as
//! [`BillingError::ProviderTimeout`] and callers leave local state unchanged.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    Customer, CustomerId, Expandable, ListPrices, ListProducts, ListSubscriptions, Price,
    Product, ProductId, RecurringInterval, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::config::{env_or, require_env};
use venuelens_shared::{BillingInterval, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    select_current_subscription, BillingProvider, ProviderCatalog, ProviderPrice,
    ProviderProduct, ProviderSubscription,
};

/// Page size for catalog listing
const CATALOG_PAGE_LIMIT: u64 = 100;

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Hard timeout for each API call
    pub timeout: Duration,
    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: require_env("BILLING_API_KEY")?,
            webhook_secret: require_env("BILLING_WEBHOOK_SECRET")?,
            timeout: Duration::from_secs(env_or("BILLING_API_TIMEOUT_SECS", 15u64)?),
            webhook_tolerance_secs: env_or("BILLING_WEBHOOK_TOLERANCE_SECS", 300i64)?,
        })
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    async fn call<T, F>(&self, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::ProviderTimeout(self.config.timeout.as_secs()))
            }
        }
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid {} ID {}: {}", kind, raw, e)))
}

fn convert_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Paused => SubscriptionStatus::Unpaid,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::Canceled,
    }
}

fn convert_interval(interval: RecurringInterval) -> BillingInterval {
    match interval {
        RecurringInterval::Day => BillingInterval::Day,
        RecurringInterval::Week => BillingInterval::Week,
        RecurringInterval::Month => BillingInterval::Month,
        RecurringInterval::Year => BillingInterval::Year,
    }
}

fn convert_price(price: &Price) -> Option<ProviderPrice> {
    let product_id = match price.product.as_ref()? {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(product) => product.id.to_string(),
    };
    let recurring = price.recurring.as_ref();

    Some(ProviderPrice {
        id: price.id.to_string(),
        product_id,
        currency: price
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        unit_amount: price.unit_amount.unwrap_or(0),
        interval: recurring.map(|r| convert_interval(r.interval)),
        interval_count: recurring.map(|r| r.interval_count as i64).unwrap_or(1),
        active: price.active.unwrap_or(true),
    })
}

fn convert_product(product: &Product) -> ProviderProduct {
    ProviderProduct {
        id: product.id.to_string(),
        name: product.name.clone().unwrap_or_default(),
        description: product.description.clone(),
        active: product.active.unwrap_or(true),
        metadata: product.metadata.clone().unwrap_or_default(),
    }
}

fn convert_subscription(subscription: &Subscription) -> ProviderSubscription {
    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };
    let price = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .and_then(convert_price);

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id,
        status: convert_status(subscription.status),
        created: OffsetDateTime::from_unix_timestamp(subscription.created)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        price,
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn customer_user_id(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let customer = self.call(Customer::retrieve(&self.client, &id, &[])).await?;

        let raw = customer
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .cloned();

        Ok(match raw {
            Some(raw) => match Uuid::parse_str(raw.trim()) {
                Ok(user_id) => Some(user_id),
                Err(_) => {
                    tracing::warn!(
                        customer_id = %customer_id,
                        user_id = %raw,
                        "Customer metadata user_id is not a valid UUID"
                    );
                    None
                }
            },
            None => None,
        })
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        let id: ProductId = parse_id(product_id, "product")?;
        let product = self.call(Product::retrieve(&self.client, &id, &[])).await?;
        Ok(convert_product(&product))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let subscription = self
            .call(Subscription::retrieve(&self.client, &id, &[]))
            .await?;
        Ok(convert_subscription(&subscription))
    }

    async fn latest_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let params = ListSubscriptions {
            customer: Some(id),
            ..Default::default()
        };
        let list = self.call(Subscription::list(&self.client, &params)).await?;
        Ok(select_current_subscription(
            list.data.iter().map(convert_subscription).collect(),
        ))
    }

    async fn list_catalog(&self) -> BillingResult<ProviderCatalog> {
        let product_params = ListProducts {
            active: Some(true),
            limit: Some(CATALOG_PAGE_LIMIT),
            ..Default::default()
        };
        let products = self
            .call(Product::list(&self.client, &product_params))
            .await?;

        let price_params = ListPrices {
            active: Some(true),
            limit: Some(CATALOG_PAGE_LIMIT),
            ..Default::default()
        };
        let prices = self.call(Price::list(&self.client, &price_params)).await?;

        if products.has_more || prices.has_more {
            tracing::warn!(
                page_limit = CATALOG_PAGE_LIMIT,
                "Catalog listing truncated to the first page"
            );
        }

        Ok(ProviderCatalog {
            products: products.data.iter().map(convert_product).collect(),
            prices: prices.data.iter().filter_map(convert_price).collect(),
        })
    }
}
