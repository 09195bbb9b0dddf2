//! Billing-provider event payloads
//!
//! Only the fields the metering core reads are modelled. Unknown fields are
//! ignored so provider API upgrades do not break parsing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::mirror::EventMeta;
use crate::provider::{ProviderPrice, ProviderProduct};
use venuelens_shared::BillingInterval;

/// Signed event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.type_)
    }

    pub fn meta(&self) -> EventMeta {
        EventMeta {
            id: self.id.clone(),
            created: OffsetDateTime::from_unix_timestamp(self.created)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Deserialize `data.object`
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookMalformed(format!("{} object: {}", self.type_, e))
        })
    }
}

/// Event types the core reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    Other,
}

impl EventKind {
    pub fn from_type(type_: &str) -> Self {
        match type_ {
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            // `invoice.payment_succeeded` announces the same payment again
            "invoice.paid" => EventKind::InvoicePaid,
            _ => EventKind::Other,
        }
    }
}

/// Either a bare id or the expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

/// Anything carrying an `id`
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRef {
    pub id: String,
}

impl Expandable<ObjectRef> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => &obj.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub customer: Option<Expandable<ObjectRef>>,
    pub subscription: Option<Expandable<ObjectRef>>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    /// User id carried by the session itself
    pub fn user_hint(&self) -> Option<uuid::Uuid> {
        self.metadata
            .get("user_id")
            .or(self.client_reference_id.as_ref())
            .and_then(|raw| uuid::Uuid::parse_str(raw.trim()).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Expandable<ObjectRef>,
    pub status: String,
    #[serde(default)]
    pub items: ItemList,
}

impl SubscriptionObject {
    /// Price of the first item
    pub fn price(&self) -> Option<&PriceObject> {
        self.items.data.first().and_then(|item| item.price.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItemObject {
    pub price: Option<PriceObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    pub id: String,
    pub product: Expandable<ProductObject>,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub recurring: Option<RecurringObject>,
    pub active: Option<bool>,
}

impl PriceObject {
    pub fn product_id(&self) -> &str {
        match &self.product {
            Expandable::Id(id) => id,
            Expandable::Object(product) => &product.id,
        }
    }

    /// Expanded product, if the payload carried one
    pub fn product_object(&self) -> Option<&ProductObject> {
        match &self.product {
            Expandable::Id(_) => None,
            Expandable::Object(product) => Some(product),
        }
    }

    pub fn to_provider_price(&self) -> ProviderPrice {
        ProviderPrice {
            id: self.id.clone(),
            product_id: self.product_id().to_string(),
            currency: self.currency.clone().unwrap_or_else(|| "usd".to_string()),
            unit_amount: self.unit_amount.unwrap_or(0),
            interval: self
                .recurring
                .as_ref()
                .and_then(|r| r.interval.parse::<BillingInterval>().ok()),
            interval_count: self
                .recurring
                .as_ref()
                .and_then(|r| r.interval_count)
                .unwrap_or(1),
            active: self.active.unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringObject {
    pub interval: String,
    pub interval_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductObject {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProductObject {
    pub fn to_provider_product(&self) -> ProviderProduct {
        ProviderProduct {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_default(),
            description: self.description.clone(),
            active: self.active.unwrap_or(true),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: Option<String>,
    pub customer: Option<Expandable<ObjectRef>>,
    pub subscription: Option<Expandable<ObjectRef>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EventKind::from_type("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::InvoicePaid);
        assert_eq!(
            EventKind::from_type("invoice.payment_succeeded"),
            EventKind::Other
        );
        assert_eq!(EventKind::from_type("charge.refunded"), EventKind::Other);
    }

    #[test]
    fn test_subscription_with_expanded_product() {
        let object: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": {"data": [{"price": {
                "id": "price_pro_01",
                "product": {"id": "prod_pro", "name": "Pro", "metadata": {"credits": "50"}},
                "unit_amount": 4900,
                "currency": "usd",
                "recurring": {"interval": "month", "interval_count": 1}
            }}]}
        }))
        .unwrap();

        let price = object.price().unwrap();
        assert_eq!(price.product_id(), "prod_pro");
        assert_eq!(
            price.product_object().unwrap().to_provider_product().allowance_hint(),
            50
        );
        let provider_price = price.to_provider_price();
        assert_eq!(provider_price.interval, Some(BillingInterval::Month));
        assert_eq!(provider_price.unit_amount, 4900);
    }

    #[test]
    fn test_expanded_customer_object() {
        let object: InvoiceObject = serde_json::from_value(json!({
            "customer": {"id": "cus_9", "email": "a@b.c"},
            "subscription": null
        }))
        .unwrap();
        assert_eq!(object.customer.unwrap().id(), "cus_9");
        assert!(object.subscription.is_none());
    }

    #[test]
    fn test_checkout_user_hint() {
        let user = uuid::Uuid::new_v4();
        let session: CheckoutSessionObject = serde_json::from_value(json!({
            "customer": "cus_1",
            "subscription": "sub_1",
            "client_reference_id": user.to_string()
        }))
        .unwrap();
        assert_eq!(session.user_hint(), Some(user));
    }

    #[test]
    fn test_subscription_without_items_parses() {
        let object: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "canceled"
        }))
        .unwrap();
        assert!(object.price().is_none());
    }
}
