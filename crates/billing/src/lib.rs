// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider and database errors
#![allow(clippy::too_many_arguments)] // Service constructors wire every collaborator
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! VenueLens Billing Module
//!
//! Metered credits for paywalled image transformations.
//!
//! ## Components
//!
//! - **Plan Catalog**: price id to monthly allowance and tier
//! - **Subscription Mirror**: per-user copy of the provider's subscription state
//! - **Entitlement Engine**: `{used, limit, remaining, percentage, tier}`
//! - **Debit Gate**: check before, commit after the paid operation
//! - **Webhooks**: signed provider events drive the mirror and counter resets
//! - **Yearly Reset Scheduler**: monthly replenishment for yearly plans
//! - **Paywall**: guard wrapped around paywalled handlers
//! - **Operator Console**: audited overrides

pub mod catalog;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gate;
pub mod memory;
pub mod mirror;
pub mod models;
pub mod operator;
pub mod paywall;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;
use venuelens_shared::config::env_or;
use venuelens_shared::{CounterStore, ResetConfig};

// Catalog
pub use catalog::{classify_tier, Allowance, AllowanceSource, PlanCatalog, SyncSummary};

// Client
pub use client::{StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{EntitlementEngine, Usage};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventEnvelope, EventKind};

// Gate
pub use gate::DebitGate;

// Memory
pub use memory::{MemoryBillingProvider, MemoryBillingStore};

// Mirror
pub use mirror::{EventMeta, MirrorChange, MirrorOutcome, MirrorWrite, SubscriptionMirror};

// Models
pub use models::{CatalogUpsert, Price, Product, SubscriptionRecord};

// Operator
pub use operator::{OperatorConsole, OperatorError, OperatorResult, UsageChange};

// Paywall
pub use paywall::{Paywall, PaywallError, DEFAULT_UPGRADE_URL};

// Provider
pub use provider::{BillingProvider, ProviderPrice, ProviderProduct, ProviderSubscription};

// Scheduler
pub use scheduler::{
    LedgerSweepSummary, ResetResult, ResetRun, ResetSummary, YearlyPhase, YearlyResetScheduler,
};

// Store
pub use store::{BillingStore, PgBillingStore};

// Webhooks
pub use webhooks::{EventDisposition, WebhookConfig, WebhookHandler};

/// Settings for [`MeteringService`]
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub webhook: WebhookConfig,
    pub reset: ResetConfig,
    pub upgrade_url: String,
}

/// Combined metering service
#[derive(Clone)]
pub struct MeteringService {
    pub catalog: PlanCatalog,
    pub mirror: SubscriptionMirror,
    pub entitlements: EntitlementEngine,
    pub gate: DebitGate,
    pub paywall: Paywall,
    pub webhooks: WebhookHandler,
    pub scheduler: YearlyResetScheduler,
    pub operator: OperatorConsole,
}

impl MeteringService {
    /// Wire every component over one store, counter and provider
    pub fn new(
        store: Arc<dyn BillingStore>,
        counter: Arc<dyn CounterStore>,
        provider: Arc<dyn BillingProvider>,
        config: MeteringConfig,
    ) -> Self {
        let catalog = PlanCatalog::new(store.clone());
        let mirror = SubscriptionMirror::new(store.clone());
        let entitlements = EntitlementEngine::new(store.clone(), catalog.clone(), counter.clone());
        let gate = DebitGate::new(entitlements.clone(), counter.clone());
        let paywall = Paywall::new(entitlements.clone(), gate.clone(), config.upgrade_url);
        let webhooks = WebhookHandler::new(
            config.webhook,
            mirror.clone(),
            catalog.clone(),
            gate.clone(),
            provider.clone(),
        );
        let scheduler = YearlyResetScheduler::new(
            store,
            provider.clone(),
            counter,
            gate.clone(),
            config.reset,
        );
        let operator = OperatorConsole::new(
            mirror.clone(),
            catalog.clone(),
            entitlements.clone(),
            gate.clone(),
            scheduler.clone(),
            provider,
        );

        Self {
            catalog,
            mirror,
            entitlements,
            gate,
            paywall,
            webhooks,
            scheduler,
            operator,
        }
    }

    /// Postgres mirror plus the Stripe client, configured from the environment
    pub fn from_env(pool: PgPool, counter: Arc<dyn CounterStore>) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = MeteringConfig {
            webhook: WebhookConfig::from_stripe(stripe.config()),
            reset: ResetConfig::from_env()?,
            upgrade_url: env_or("UPGRADE_URL", DEFAULT_UPGRADE_URL.to_string())?,
        };
        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            counter,
            Arc::new(stripe),
            config,
        ))
    }
}
