//! Relational mirror records

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::{BillingInterval, SubscriptionStatus};

/// Provider product mirrored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    /// Operator-owned. Zero means "use the tier default".
    pub monthly_credit_allowance: i64,
    pub display_order: i32,
    pub highlighted: bool,
}

/// Provider-owned product fields.
///
/// Upserting never touches the operator-owned columns of an existing row;
/// `initial_allowance` only applies when the row is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductUpsert {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub initial_allowance: i64,
}

impl ProductUpsert {
    pub fn into_new_product(self) -> Product {
        Product {
            external_id: self.external_id,
            name: self.name,
            description: self.description,
            active: self.active,
            monthly_credit_allowance: self.initial_allowance.max(0),
            display_order: 0,
            highlighted: false,
        }
    }
}

/// Recurring price of a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Price {
    pub external_id: String,
    pub product_id: String,
    pub currency: String,
    pub minor_units_amount: i64,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub active: bool,
}

impl Price {
    /// Monthly-equivalent amount in major currency units
    pub fn monthly_major_units(&self) -> f64 {
        self.interval
            .monthly_equivalent(self.minor_units_amount, self.interval_count as i64)
            / 100.0
    }
}

/// Catalog rows carried by one billing event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogUpsert {
    pub products: Vec<ProductUpsert>,
    pub prices: Vec<Price>,
}

impl CatalogUpsert {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.prices.is_empty()
    }
}

/// Per-user subscription mirror row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub customer_external_id: Option<String>,
    pub subscription_external_id: Option<String>,
    pub current_price_external_id: Option<String>,
    pub status: SubscriptionStatus,
    pub active_flag: bool,
    pub last_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    pub reset_pending: bool,
    /// Last invoice whose payment reset the counter
    pub last_invoice_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_invoice_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Fresh row with no subscription
    pub fn new(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            customer_external_id: None,
            subscription_external_id: None,
            current_price_external_id: None,
            status: SubscriptionStatus::None,
            active_flag: false,
            last_event_id: None,
            last_event_at: None,
            reset_pending: false,
            last_invoice_id: None,
            last_invoice_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the plan allowance applies
    pub fn is_entitled(&self) -> bool {
        self.active_flag && self.status.is_entitled()
    }
}
