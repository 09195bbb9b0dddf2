//! In-memory store and provider
//!
//! Used by tests and local development. The store applies each change under
//! one lock, which stands in for the Postgres transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::mirror::{decide, MirrorOutcome, MirrorWrite};
use crate::models::{CatalogUpsert, Price, Product, SubscriptionRecord};
use crate::provider::{
    select_current_subscription, BillingProvider, ProviderCatalog, ProviderPrice,
    ProviderProduct, ProviderSubscription,
};
use crate::store::BillingStore;

#[derive(Default)]
struct StoreState {
    products: HashMap<String, Product>,
    prices: HashMap<String, Price>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
}

impl StoreState {
    /// Validate then apply, so a failing upsert leaves nothing behind
    fn upsert_catalog(&mut self, catalog: &CatalogUpsert) -> BillingResult<()> {
        for price in &catalog.prices {
            let known = self.products.contains_key(&price.product_id)
                || catalog
                    .products
                    .iter()
                    .any(|p| p.external_id == price.product_id);
            if !known {
                return Err(BillingError::InvalidInput(format!(
                    "price {} references unknown product {}",
                    price.external_id, price.product_id
                )));
            }
        }

        for upsert in &catalog.products {
            match self.products.get_mut(&upsert.external_id) {
                Some(existing) => {
                    existing.name = upsert.name.clone();
                    existing.description = upsert.description.clone();
                    existing.active = upsert.active;
                }
                None => {
                    self.products
                        .insert(upsert.external_id.clone(), upsert.clone().into_new_product());
                }
            }
        }
        for price in &catalog.prices {
            self.prices.insert(price.external_id.clone(), price.clone());
        }
        Ok(())
    }
}

/// In-memory [`BillingStore`]
#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<StoreState>,
    failing: AtomicBool,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `apply_change` fail as if the transaction aborted
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seed a product (operator-owned fields included)
    pub async fn insert_product(&self, product: Product) {
        self.state
            .lock()
            .await
            .products
            .insert(product.external_id.clone(), product);
    }

    pub async fn insert_price(&self, price: Price) {
        self.state
            .lock()
            .await
            .prices
            .insert(price.external_id.clone(), price);
    }

    pub async fn insert_subscription(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(record.user_id, record);
    }

    pub async fn price_count(&self) -> usize {
        self.state.lock().await.prices.len()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn get_product(&self, product_id: &str) -> BillingResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(product_id).cloned())
    }

    async fn price_with_product(&self, price_id: &str) -> BillingResult<Option<(Price, Product)>> {
        let state = self.state.lock().await;
        Ok(state.prices.get(price_id).and_then(|price| {
            state
                .products
                .get(&price.product_id)
                .map(|product| (price.clone(), product.clone()))
        }))
    }

    async fn upsert_catalog(&self, catalog: &CatalogUpsert) -> BillingResult<()> {
        self.state.lock().await.upsert_catalog(catalog)
    }

    async fn set_product_allowance(&self, product_id: &str, credits: i64) -> BillingResult<bool> {
        if credits < 0 {
            return Err(BillingError::InvalidInput(
                "monthly_credit_allowance must be >= 0".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        Ok(match state.products.get_mut(product_id) {
            Some(product) => {
                product.monthly_credit_allowance = credits;
                true
            }
            None => false,
        })
    }

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|r| r.customer_external_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|r| r.subscription_external_id.as_deref() == Some(subscription_id))
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut state = self.state.lock().await;
        let taken = state.subscriptions.values().any(|r| {
            r.user_id != user_id && r.customer_external_id.as_deref() == Some(customer_id)
        });
        if taken {
            return Err(BillingError::InvalidInput(format!(
                "customer {} already linked to another user",
                customer_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let record = state
            .subscriptions
            .entry(user_id)
            .or_insert_with(|| SubscriptionRecord::new(user_id, now));
        record.customer_external_id = Some(customer_id.to_string());
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn apply_change(&self, write: &MirrorWrite) -> BillingResult<MirrorOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut state = self.state.lock().await;
        state.upsert_catalog(&write.catalog)?;

        let current = state.subscriptions.get(&write.user_id).cloned();
        let decision = decide(current.as_ref(), write, OffsetDateTime::now_utc());
        if let Some(next) = decision.next {
            state.subscriptions.insert(next.user_id, next);
        }
        Ok(decision.outcome)
    }

    async fn clear_reset_pending(&self, user_id: Uuid, event_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.subscriptions.get_mut(&user_id) {
            if record.last_event_id.as_deref() == Some(event_id) {
                record.reset_pending = false;
            }
        }
        Ok(())
    }

    async fn active_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.state.lock().await;
        let mut rows: Vec<SubscriptionRecord> = state
            .subscriptions
            .values()
            .filter(|r| r.active_flag && r.subscription_external_id.is_some())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.user_id);
        Ok(rows)
    }
}

#[derive(Default)]
struct ProviderState {
    customers: HashMap<String, HashMap<String, String>>,
    products: HashMap<String, ProviderProduct>,
    prices: Vec<ProviderPrice>,
    subscriptions: HashMap<String, ProviderSubscription>,
}

/// Scripted [`BillingProvider`]
#[derive(Default)]
pub struct MemoryBillingProvider {
    state: Mutex<ProviderState>,
    timing_out: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with [`BillingError::ProviderTimeout`] while set
    pub fn set_timing_out(&self, timing_out: bool) {
        self.timing_out.store(timing_out, Ordering::SeqCst);
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn add_customer(&self, customer_id: &str, user_id: Option<Uuid>) {
        let mut metadata = HashMap::new();
        if let Some(user_id) = user_id {
            metadata.insert("user_id".to_string(), user_id.to_string());
        }
        self.add_customer_metadata(customer_id, metadata).await;
    }

    pub async fn add_customer_metadata(&self, customer_id: &str, metadata: HashMap<String, String>) {
        self.state
            .lock()
            .await
            .customers
            .insert(customer_id.to_string(), metadata);
    }

    pub async fn add_product(&self, product: ProviderProduct) {
        self.state
            .lock()
            .await
            .products
            .insert(product.id.clone(), product);
    }

    pub async fn add_price(&self, price: ProviderPrice) {
        self.state.lock().await.prices.push(price);
    }

    pub async fn add_subscription(&self, subscription: ProviderSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    fn enter(&self) -> BillingResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.timing_out.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderTimeout(15));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for MemoryBillingProvider {
    async fn customer_user_id(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        self.enter()?;
        let state = self.state.lock().await;
        let metadata = state
            .customers
            .get(customer_id)
            .ok_or_else(|| BillingError::Provider(format!("No such customer: {}", customer_id)))?;
        Ok(metadata
            .get("user_id")
            .and_then(|raw| Uuid::parse_str(raw).ok()))
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        self.enter()?;
        self.state
            .lock()
            .await
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| BillingError::Provider(format!("No such product: {}", product_id)))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.enter()?;
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::Provider(format!("No such subscription: {}", subscription_id))
            })
    }

    async fn latest_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(select_current_subscription(
            state
                .subscriptions
                .values()
                .filter(|s| s.customer_id == customer_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_catalog(&self) -> BillingResult<ProviderCatalog> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(ProviderCatalog {
            products: state.products.values().cloned().collect(),
            prices: state.prices.clone(),
        })
    }
}
