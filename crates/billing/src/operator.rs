//! Operator console
//!
//! Administrative overrides behind the `venuelens-admin` binary. Every
//! mutating command writes an audit record on the `audit` tracing target
//! with the actor and the before/after usage. Counter writes fail closed.
//!
//! Counter commands (`set-remaining`, `add`, `reset`) work for any user,
//! including free users with no mirror row. Commands about a subscription
//! require the row and report [`OperatorError::UserNotFound`] without it.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use venuelens_shared::SubscriptionStatus;

use crate::catalog::{PlanCatalog, SyncSummary};
use crate::entitlement::{EntitlementEngine, Usage};
use crate::error::BillingError;
use crate::gate::DebitGate;
use crate::mirror::{MirrorChange, MirrorOutcome, MirrorWrite, SubscriptionMirror};
use crate::models::{CatalogUpsert, SubscriptionRecord};
use crate::provider::{BillingProvider, ProviderPrice};
use crate::scheduler::YearlyResetScheduler;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Failed(BillingError),
}

impl OperatorError {
    /// Process exit code for the admin binary
    pub fn exit_code(&self) -> i32 {
        match self {
            OperatorError::UserNotFound(_) | OperatorError::ProductNotFound(_) => 1,
            OperatorError::StoreUnavailable(_) => 2,
            OperatorError::Failed(_) => 3,
        }
    }
}

impl From<BillingError> for OperatorError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::CounterStoreUnavailable(msg) => OperatorError::StoreUnavailable(msg),
            other => OperatorError::Failed(other),
        }
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;

/// Usage before and after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageChange {
    pub before: Usage,
    pub after: Usage,
}

/// Result of `force-yearly-reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForcedReset {
    pub usage: UsageChange,
    /// Ledger period recorded, for yearly subscriptions past their first period
    pub ledger_period: Option<u32>,
}

/// Result of `show`
#[derive(Debug, Clone, Serialize)]
pub struct UserReport {
    pub subscription: SubscriptionRecord,
    pub usage: Usage,
}

/// Result of `sync-subscription`
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSync {
    pub outcome: &'static str,
    pub reset: bool,
    pub subscription: Option<SubscriptionRecord>,
}

#[derive(Clone)]
pub struct OperatorConsole {
    actor: String,
    mirror: SubscriptionMirror,
    catalog: PlanCatalog,
    engine: EntitlementEngine,
    gate: DebitGate,
    scheduler: YearlyResetScheduler,
    provider: Arc<dyn BillingProvider>,
}

impl OperatorConsole {
    pub fn new(
        mirror: SubscriptionMirror,
        catalog: PlanCatalog,
        engine: EntitlementEngine,
        gate: DebitGate,
        scheduler: YearlyResetScheduler,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            actor: "system".to_string(),
            mirror,
            catalog,
            engine,
            gate,
            scheduler,
            provider,
        }
    }

    /// Same console, audit records attributed to `actor`
    pub fn as_actor(&self, actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..self.clone()
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Mirror row for subscription commands
    async fn require_user(&self, user_id: Uuid) -> OperatorResult<SubscriptionRecord> {
        self.mirror
            .get(user_id)
            .await?
            .ok_or(OperatorError::UserNotFound(user_id))
    }

    fn audit(&self, command: &str, user_id: Uuid, change: &UsageChange) {
        tracing::info!(
            target: "audit",
            actor = %self.actor,
            command = command,
            user_id = %user_id,
            before_used = change.before.used,
            before_remaining = change.before.remaining,
            after_used = change.after.used,
            after_remaining = change.after.remaining,
            "Operator command applied"
        );
    }

    /// Remaining credits become exactly `remaining`
    pub async fn set_remaining(&self, user_id: Uuid, remaining: i64) -> OperatorResult<UsageChange> {
        let before = self.engine.usage(user_id).await?;
        let after = self.gate.set_remaining(user_id, remaining).await?;
        let change = UsageChange { before, after };
        self.audit("set-remaining", user_id, &change);
        Ok(change)
    }

    /// Grant `delta` credits (negative takes them away)
    pub async fn add(&self, user_id: Uuid, delta: i64) -> OperatorResult<UsageChange> {
        let before = self.engine.usage(user_id).await?;
        self.gate.add(user_id, delta).await?;
        let after = self.engine.usage(user_id).await?;
        let change = UsageChange { before, after };
        self.audit("add", user_id, &change);
        Ok(change)
    }

    /// Back to the full plan limit
    pub async fn reset_to_limit(&self, user_id: Uuid) -> OperatorResult<UsageChange> {
        let before = self.engine.usage(user_id).await?;
        self.gate.reset(user_id).await?;
        let after = self.engine.usage(user_id).await?;
        let change = UsageChange { before, after };
        self.audit("reset", user_id, &change);
        Ok(change)
    }

    pub async fn force_yearly_reset(&self, user_id: Uuid) -> OperatorResult<ForcedReset> {
        self.require_user(user_id).await?;
        let before = self.engine.usage(user_id).await?;
        let ledger_period = self.scheduler.force_reset(user_id).await?;
        let after = self.engine.usage(user_id).await?;
        let usage = UsageChange { before, after };
        self.audit("force-yearly-reset", user_id, &usage);
        if let Some(period) = ledger_period {
            tracing::info!(target: "audit", actor = %self.actor, user_id = %user_id, period = period, "Yearly reset ledger written");
        }
        Ok(ForcedReset {
            usage,
            ledger_period,
        })
    }

    pub async fn show(&self, user_id: Uuid) -> OperatorResult<UserReport> {
        let subscription = self.require_user(user_id).await?;
        let usage = self.engine.usage(user_id).await?;
        Ok(UserReport {
            subscription,
            usage,
        })
    }

    pub async fn set_allowance(&self, product_id: &str, credits: i64) -> OperatorResult<()> {
        let before = self
            .catalog
            .get_product(product_id)
            .await?
            .ok_or_else(|| OperatorError::ProductNotFound(product_id.to_string()))?
            .monthly_credit_allowance;

        self.catalog
            .set_allowance(product_id, credits)
            .await
            .map_err(|e| match e {
                BillingError::NotFound(_) => OperatorError::ProductNotFound(product_id.to_string()),
                other => other.into(),
            })?;

        tracing::info!(
            target: "audit",
            actor = %self.actor,
            command = "set-allowance",
            product_id = %product_id,
            before = before,
            after = credits,
            "Operator command applied"
        );
        Ok(())
    }

    pub async fn sync_catalog(&self) -> OperatorResult<SyncSummary> {
        let summary = self.catalog.sync_from_provider(self.provider.as_ref()).await?;
        tracing::info!(
            target: "audit",
            actor = %self.actor,
            command = "sync-catalog",
            products = summary.products,
            prices = summary.prices,
            "Operator command applied"
        );
        Ok(summary)
    }

    /// Attach a provider customer to a user
    pub async fn link_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> OperatorResult<SubscriptionRecord> {
        let record = self.mirror.upsert_customer(user_id, customer_id).await?;
        tracing::info!(
            target: "audit",
            actor = %self.actor,
            command = "link-customer",
            user_id = %user_id,
            customer_id = %customer_id,
            "Operator command applied"
        );
        Ok(record)
    }

    /// Price plus its product, fetching the product when unknown locally
    async fn catalog_for(&self, price: &ProviderPrice) -> CatalogUpsert {
        let Some(row) = price.to_price() else {
            return CatalogUpsert::default();
        };
        let product = match self.catalog.get_product(&price.product_id).await {
            Ok(Some(_)) => None,
            _ => match self.provider.retrieve_product(&price.product_id).await {
                Ok(product) => Some(product.to_upsert()),
                Err(e) => {
                    tracing::warn!(
                        price_id = %price.id,
                        error = %e,
                        "Could not fetch product, price not mirrored"
                    );
                    return CatalogUpsert::default();
                }
            },
        };
        CatalogUpsert {
            products: product.into_iter().collect(),
            prices: vec![row],
        }
    }

    /// Refresh a user's mirror row from the provider. Never resets usage
    /// except to complete a reset an earlier event left pending.
    pub async fn sync_subscription(&self, user_id: Uuid) -> OperatorResult<SubscriptionSync> {
        let record = self.require_user(user_id).await?;
        let Some(customer_id) = record.customer_external_id.clone() else {
            return Err(OperatorError::Failed(BillingError::InvalidInput(format!(
                "user {} has no linked customer",
                user_id
            ))));
        };

        let latest = self
            .provider
            .latest_subscription_for_customer(&customer_id)
            .await?;

        let (change, catalog) = match &latest {
            Some(subscription) => {
                let catalog = match &subscription.price {
                    Some(price) => self.catalog_for(price).await,
                    None => CatalogUpsert::default(),
                };
                (
                    MirrorChange::Sync {
                        subscription_id: Some(subscription.id.clone()),
                        status: subscription.status,
                        price_id: subscription.price.as_ref().map(|p| p.id.clone()),
                    },
                    catalog,
                )
            }
            None => (
                MirrorChange::Sync {
                    subscription_id: record.subscription_external_id.clone(),
                    status: SubscriptionStatus::None,
                    price_id: record.current_price_external_id.clone(),
                },
                CatalogUpsert::default(),
            ),
        };

        let outcome = self
            .mirror
            .apply_subscription_event(MirrorWrite {
                user_id,
                customer_id: Some(customer_id),
                change,
                event: None,
                catalog,
            })
            .await?;

        let mut reset = false;
        if outcome.needs_reset() {
            self.gate.reset(user_id).await?;
            reset = true;
            if let Some(event_id) = record.last_event_id.as_deref() {
                self.mirror.clear_reset_pending(user_id, event_id).await?;
            }
        }

        tracing::info!(
            target: "audit",
            actor = %self.actor,
            command = "sync-subscription",
            user_id = %user_id,
            outcome = outcome.label(),
            reset = reset,
            "Operator command applied"
        );

        let label = outcome.label();
        let subscription = match outcome {
            MirrorOutcome::Applied { record, .. } => Some(record),
            _ => self.mirror.get(user_id).await?,
        };
        Ok(SubscriptionSync {
            outcome: label,
            reset,
            subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(OperatorError::UserNotFound(Uuid::nil()).exit_code(), 1);
        assert_eq!(OperatorError::ProductNotFound("prod".into()).exit_code(), 1);
        assert_eq!(OperatorError::StoreUnavailable("down".into()).exit_code(), 2);
        assert_eq!(
            OperatorError::Failed(BillingError::Provider("boom".into())).exit_code(),
            3
        );
    }

    #[test]
    fn test_counter_errors_map_to_store_unavailable() {
        let err: OperatorError = BillingError::CounterStoreUnavailable("refused".into()).into();
        assert!(matches!(err, OperatorError::StoreUnavailable(_)));
    }
}
