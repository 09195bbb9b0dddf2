//! Billing webhook handling
//!
//! Verifies the provider signature, then applies subscription, checkout and
//! invoice events to the subscription mirror. Processing never fails the
//! request: once the signature checks out the event is acknowledged and any
//! problem is logged, so a deterministic bug cannot trigger a retry storm.
//!
//! Counter resets run strictly after the mirror transaction commits. When a
//! reset fails the row keeps `reset_pending` and a redelivery repairs it.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::SubscriptionStatus;

use crate::catalog::PlanCatalog;
use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventEnvelope, EventKind, InvoiceObject, PriceObject,
    SubscriptionObject,
};
use crate::gate::DebitGate;
use crate::mirror::{
    IgnoreReason, MirrorChange, MirrorOutcome, MirrorWrite, SubscriptionEventKind,
    SubscriptionMirror,
};
use crate::models::CatalogUpsert;
use crate::provider::BillingProvider;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_secs: i64,
}

impl WebhookConfig {
    pub fn from_stripe(config: &StripeConfig) -> Self {
        Self {
            secret: config.webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
        }
    }
}

fn compute_signature(payload: &str, secret: &str, timestamp: i64) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a `t=...,v1=...` header for a payload
pub fn signature_header(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let signature = compute_signature(payload, secret, timestamp)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

/// Check a `t=<unix>,v1=<hex>[,v1=<hex>...]` header against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => candidates.push(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let skew = now_unix.abs_diff(timestamp);
    if skew > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            diff = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(payload, secret, timestamp)?;
    let matched = candidates.iter().any(|candidate| match hex::decode(candidate) {
        Ok(bytes) => bool::from(expected.as_slice().ct_eq(bytes.as_slice())),
        Err(_) => false,
    });

    if !matched {
        tracing::warn!(candidates = candidates.len(), "Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// What happened to a verified event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Mirror changed. `reset` is true when the counter reset landed.
    Applied { user_id: Uuid, reset: bool },
    /// Seen before; `reset` is true when a lost reset was repaired
    Redelivered { user_id: Uuid, reset: bool },
    Unchanged,
    Stale,
    Ignored(IgnoreReason),
    /// Customer could not be resolved to a user
    Dropped(String),
    /// Processing error, mirror left as it was
    Failed(String),
    /// Event type the core does not react to
    Unhandled(String),
}

impl EventDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            EventDisposition::Applied { .. } => "applied",
            EventDisposition::Redelivered { .. } => "redelivered",
            EventDisposition::Unchanged => "unchanged",
            EventDisposition::Stale => "stale",
            EventDisposition::Ignored(_) => "ignored",
            EventDisposition::Dropped(_) => "dropped",
            EventDisposition::Failed(_) => "failed",
            EventDisposition::Unhandled(_) => "unhandled",
        }
    }
}

/// Webhook handler for billing-provider events
#[derive(Clone)]
pub struct WebhookHandler {
    config: WebhookConfig,
    mirror: SubscriptionMirror,
    catalog: PlanCatalog,
    gate: DebitGate,
    provider: Arc<dyn BillingProvider>,
}

impl WebhookHandler {
    pub fn new(
        config: WebhookConfig,
        mirror: SubscriptionMirror,
        catalog: PlanCatalog,
        gate: DebitGate,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            config,
            mirror,
            catalog,
            gate,
            provider,
        }
    }

    /// Verify the signature and parse the envelope
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
        verify_signature(
            payload,
            signature,
            &self.config.secret,
            self.config.tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook envelope");
            BillingError::WebhookMalformed(e.to_string())
        })
    }

    /// Process a verified event. Never fails; the outcome is logged.
    pub async fn handle_event(&self, event: &EventEnvelope) -> EventDisposition {
        let kind = event.kind();
        tracing::info!(event_id = %event.id, event_type = %event.type_, "Processing webhook event");

        let result = match kind {
            EventKind::CheckoutCompleted => self.handle_checkout_completed(event).await,
            EventKind::SubscriptionCreated => {
                self.handle_subscription_change(event, SubscriptionEventKind::Created)
                    .await
            }
            EventKind::SubscriptionUpdated => {
                self.handle_subscription_change(event, SubscriptionEventKind::Updated)
                    .await
            }
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventKind::InvoicePaid => self.handle_invoice_paid(event).await,
            EventKind::Other => {
                tracing::info!(event_type = %event.type_, "Unhandled webhook event type");
                return EventDisposition::Unhandled(event.type_.clone());
            }
        };

        let disposition = match result {
            Ok(disposition) => disposition,
            Err(BillingError::UnknownCustomer(customer_id)) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    customer_id = %customer_id,
                    "Customer has no user, dropping event"
                );
                EventDisposition::Dropped(customer_id)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook processing failed"
                );
                EventDisposition::Failed(e.to_string())
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            disposition = disposition.label(),
            "Webhook event processed"
        );
        disposition
    }

    /// Mirror row first, then `metadata.user_id` on the provider customer
    async fn resolve_user(&self, customer_id: &str) -> BillingResult<Uuid> {
        if let Some(record) = self.mirror.find_by_customer(customer_id).await? {
            return Ok(record.user_id);
        }
        match self.provider.customer_user_id(customer_id).await? {
            Some(user_id) => Ok(user_id),
            None => Err(BillingError::UnknownCustomer(customer_id.to_string())),
        }
    }

    /// Catalog rows to upsert alongside a subscription change
    async fn catalog_for(&self, price: &PriceObject) -> CatalogUpsert {
        let Some(row) = price.to_provider_price().to_price() else {
            tracing::debug!(price_id = %price.id, "Non-recurring price, not mirrored");
            return CatalogUpsert::default();
        };

        let product_id = price.product_id().to_string();
        let product = match price.product_object() {
            Some(product) => Some(product.to_provider_product().to_upsert()),
            None => match self.catalog.get_product(&product_id).await {
                Ok(Some(_)) => None,
                Ok(None) | Err(_) => match self.provider.retrieve_product(&product_id).await {
                    Ok(product) => Some(product.to_upsert()),
                    Err(e) => {
                        tracing::warn!(
                            price_id = %price.id,
                            product_id = %product_id,
                            error = %e,
                            "Could not fetch product, price not mirrored"
                        );
                        return CatalogUpsert::default();
                    }
                },
            },
        };

        CatalogUpsert {
            products: product.into_iter().collect(),
            prices: vec![row],
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &EventEnvelope,
    ) -> BillingResult<EventDisposition> {
        let session: CheckoutSessionObject = event.object()?;
        let customer_id = session.customer.as_ref().map(|c| c.id().to_string());

        let user_id = match (session.user_hint(), customer_id.as_deref()) {
            (Some(user_id), _) => user_id,
            (None, Some(customer_id)) => self.resolve_user(customer_id).await?,
            (None, None) => {
                return Err(BillingError::WebhookMalformed(
                    "checkout session without customer or user reference".to_string(),
                ))
            }
        };

        let outcome = self
            .mirror
            .apply_subscription_event(MirrorWrite {
                user_id,
                customer_id,
                change: MirrorChange::LinkCheckout {
                    subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
                },
                event: Some(event.meta()),
                catalog: CatalogUpsert::default(),
            })
            .await?;

        Ok(self.settle(event, user_id, outcome).await)
    }

    async fn handle_subscription_change(
        &self,
        event: &EventEnvelope,
        kind: SubscriptionEventKind,
    ) -> BillingResult<EventDisposition> {
        let subscription: SubscriptionObject = event.object()?;
        let customer_id = subscription.customer.id().to_string();
        let user_id = self.resolve_user(&customer_id).await?;

        let (price_id, catalog) = match subscription.price() {
            Some(price) => (Some(price.id.clone()), self.catalog_for(price).await),
            None => (None, CatalogUpsert::default()),
        };

        let outcome = self
            .mirror
            .apply_subscription_event(MirrorWrite {
                user_id,
                customer_id: Some(customer_id),
                change: MirrorChange::Subscription {
                    kind,
                    subscription_id: subscription.id.clone(),
                    status: SubscriptionStatus::from_provider(&subscription.status),
                    price_id,
                },
                event: Some(event.meta()),
                catalog,
            })
            .await?;

        Ok(self.settle(event, user_id, outcome).await)
    }

    async fn handle_subscription_deleted(
        &self,
        event: &EventEnvelope,
    ) -> BillingResult<EventDisposition> {
        let subscription: SubscriptionObject = event.object()?;
        let user_id = self.resolve_user(subscription.customer.id()).await?;

        let outcome = self
            .mirror
            .mark_inactive(
                &subscription.id,
                SubscriptionStatus::from_provider(&subscription.status),
                Some(event.meta()),
            )
            .await?;

        Ok(self.settle(event, user_id, outcome).await)
    }

    async fn handle_invoice_paid(&self, event: &EventEnvelope) -> BillingResult<EventDisposition> {
        let invoice: InvoiceObject = event.object()?;
        let Some(customer) = invoice.customer.as_ref() else {
            return Err(BillingError::WebhookMalformed(
                "invoice without customer".to_string(),
            ));
        };
        let customer_id = customer.id().to_string();
        let user_id = self.resolve_user(&customer_id).await?;

        let outcome = self
            .mirror
            .apply_subscription_event(MirrorWrite {
                user_id,
                customer_id: Some(customer_id),
                change: MirrorChange::InvoicePaid {
                    subscription_id: invoice.subscription.as_ref().map(|s| s.id().to_string()),
                    invoice_id: invoice.id.clone(),
                },
                event: Some(event.meta()),
                catalog: CatalogUpsert::default(),
            })
            .await?;

        Ok(self.settle(event, user_id, outcome).await)
    }

    /// Post-commit side effects
    async fn settle(
        &self,
        event: &EventEnvelope,
        user_id: Uuid,
        outcome: MirrorOutcome,
    ) -> EventDisposition {
        let mut reset = false;
        if outcome.needs_reset() {
            match self.gate.reset(user_id).await {
                Ok(()) => {
                    reset = true;
                    if let Err(e) = self.mirror.clear_reset_pending(user_id, &event.id).await {
                        tracing::warn!(
                            user_id = %user_id,
                            event_id = %event.id,
                            error = %e,
                            "Failed to clear pending reset flag"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        event_id = %event.id,
                        error = %e,
                        "Counter reset failed, left pending for redelivery"
                    );
                }
            }
        }

        match outcome {
            MirrorOutcome::Applied { .. } => EventDisposition::Applied { user_id, reset },
            MirrorOutcome::Redelivered { .. } => {
                tracing::info!(event_id = %event.id, "Duplicate webhook event");
                EventDisposition::Redelivered { user_id, reset }
            }
            MirrorOutcome::Unchanged => EventDisposition::Unchanged,
            MirrorOutcome::Stale => {
                tracing::info!(event_id = %event.id, "Stale webhook event ignored");
                EventDisposition::Stale
            }
            MirrorOutcome::Ignored(reason) => {
                tracing::info!(event_id = %event.id, reason = ?reason, "Webhook event ignored");
                EventDisposition::Ignored(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_780_000_000;

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = signature_header(payload, SECRET, NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = signature_header(r#"{"id":"evt_1"}"#, SECRET, NOW).unwrap();
        assert!(matches!(
            verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, 300, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = signature_header(payload, "whsec_other", NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn test_timestamp_tolerance() {
        let payload = "{}";
        let header = signature_header(payload, SECRET, NOW - 300).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_ok());

        let header = signature_header(payload, SECRET, NOW - 301).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_err());

        let header = signature_header(payload, SECRET, NOW + 301).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let payload = "{}";
        for timestamp in [i64::MIN, i64::MAX, 0] {
            let header = signature_header(payload, SECRET, timestamp).unwrap();
            assert!(matches!(
                verify_signature(payload, &header, SECRET, 300, NOW),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let payload = "{}";
        let good = signature_header(payload, SECRET, NOW).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={},v0=ignored", NOW, "ab".repeat(32), good_sig);
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let no_sig = format!("t={}", NOW);
        let bad_hex = format!("t={},v1=zz", NOW);
        for header in ["", "v1=abcd", no_sig.as_str(), "t=abc,v1=00", bad_hex.as_str()] {
            assert!(
                verify_signature("{}", header, SECRET, 300, NOW).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_disposition_labels() {
        assert_eq!(EventDisposition::Stale.label(), "stale");
        assert_eq!(
            EventDisposition::Unhandled("charge.refunded".into()).label(),
            "unhandled"
        );
    }
}
