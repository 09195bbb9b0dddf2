//! Plan catalog
//!
//! Maps a provider price id to a monthly credit allowance and a tier.
//!
//! Resolution order:
//! 1. Known price whose product carries an explicit allowance: that allowance.
//! 2. Known price without one: classify the tier (product name first, then
//!    monthly-equivalent amount) and use the tier default.
//! 3. Unknown price: free tier.
//!
//! Amount-only classifications and unknown prices are logged as warnings.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use venuelens_shared::Tier;

use crate::error::{BillingError, BillingResult};
use crate::models::{CatalogUpsert, Product};
use crate::provider::BillingProvider;
use crate::store::BillingStore;

/// Where an allowance came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceSource {
    /// Product-level allowance set by an operator or product metadata
    Product,
    /// Tier default, tier taken from the product name
    NamedTier,
    /// Tier default, tier taken from the price amount alone
    AmountTier,
    /// Price unknown or no subscription
    Free,
}

/// Resolved monthly allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allowance {
    pub credits: i64,
    pub tier: Tier,
    pub source: AllowanceSource,
}

impl Allowance {
    pub fn free() -> Self {
        Self {
            credits: Tier::Free.default_allowance(),
            tier: Tier::Free,
            source: AllowanceSource::Free,
        }
    }
}

/// Tier from a product name, if the name says so
pub fn tier_from_name(name: &str) -> Option<Tier> {
    let name = name.to_lowercase();
    if name.contains("basic") || name.contains("starter") {
        Some(Tier::Basic)
    } else if name.contains("pro") {
        // also matches "professional"
        Some(Tier::Pro)
    } else if name.contains("enterprise") || name.contains("business") {
        Some(Tier::Enterprise)
    } else {
        None
    }
}

/// Tier from a monthly-equivalent amount in major currency units
pub fn tier_from_amount(monthly_major_units: f64) -> Tier {
    if monthly_major_units <= 10.0 {
        Tier::Free
    } else if monthly_major_units <= 60.0 {
        Tier::Basic
    } else if monthly_major_units <= 120.0 {
        Tier::Pro
    } else {
        Tier::Enterprise
    }
}

/// Name rules first, amount buckets second. The flag is true when the name matched.
pub fn classify_tier(product_name: &str, monthly_major_units: f64) -> (Tier, bool) {
    match tier_from_name(product_name) {
        Some(tier) => (tier, true),
        None => (tier_from_amount(monthly_major_units), false),
    }
}

/// Result of a catalog sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub products: usize,
    pub prices: usize,
    pub skipped_prices: usize,
}

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Allowance and tier for a price id
    pub async fn lookup_allowance(&self, price_id: &str) -> BillingResult<Allowance> {
        let Some((price, product)) = self.store.price_with_product(price_id).await? else {
            tracing::warn!(
                price_id = %price_id,
                "Unknown price id, falling back to free tier"
            );
            return Ok(Allowance::free());
        };

        let (tier, by_name) = classify_tier(&product.name, price.monthly_major_units());

        if product.monthly_credit_allowance > 0 {
            return Ok(Allowance {
                credits: product.monthly_credit_allowance,
                tier,
                source: AllowanceSource::Product,
            });
        }

        if !by_name {
            tracing::warn!(
                price_id = %price_id,
                product_id = %product.external_id,
                product_name = %product.name,
                amount = price.minor_units_amount,
                interval = %price.interval,
                tier = %tier,
                "Price classified by amount only"
            );
        }

        Ok(Allowance {
            credits: tier.default_allowance(),
            tier,
            source: if by_name {
                AllowanceSource::NamedTier
            } else {
                AllowanceSource::AmountTier
            },
        })
    }

    pub async fn get_product(&self, product_id: &str) -> BillingResult<Option<Product>> {
        self.store.get_product(product_id).await
    }

    /// Operator override of a product's monthly allowance
    pub async fn set_allowance(&self, product_id: &str, credits: i64) -> BillingResult<()> {
        if credits < 0 {
            return Err(BillingError::InvalidInput(format!(
                "allowance must be >= 0, got {}",
                credits
            )));
        }
        if !self.store.set_product_allowance(product_id, credits).await? {
            return Err(BillingError::NotFound(format!("product {}", product_id)));
        }
        tracing::info!(product_id = %product_id, credits = credits, "Product allowance updated");
        Ok(())
    }

    /// Pull active products and recurring prices from the provider.
    ///
    /// Operator-owned product fields are preserved. One-off prices and prices
    /// of products missing from the listing are skipped.
    pub async fn sync_from_provider(
        &self,
        provider: &dyn BillingProvider,
    ) -> BillingResult<SyncSummary> {
        let listing = provider.list_catalog().await?;

        let product_ids: HashSet<&str> = listing.products.iter().map(|p| p.id.as_str()).collect();
        let mut catalog = CatalogUpsert {
            products: listing.products.iter().map(|p| p.to_upsert()).collect(),
            prices: Vec::new(),
        };

        let mut skipped = 0;
        for price in &listing.prices {
            match price.to_price() {
                Some(row) if product_ids.contains(row.product_id.as_str()) => {
                    catalog.prices.push(row)
                }
                _ => {
                    tracing::debug!(price_id = %price.id, "Skipping price during catalog sync");
                    skipped += 1;
                }
            }
        }

        self.store.upsert_catalog(&catalog).await?;

        let summary = SyncSummary {
            products: catalog.products.len(),
            prices: catalog.prices.len(),
            skipped_prices: skipped,
        };
        tracing::info!(
            products = summary.products,
            prices = summary.prices,
            skipped_prices = summary.skipped_prices,
            "Catalog sync complete"
        );
        Ok(summary)
    }
}
