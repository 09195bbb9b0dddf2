//! Paywall guard
//!
//! Wraps a paywalled operation:
//!
//! ```text
//! anonymous          -> AuthenticationRequired (free view, counter untouched)
//! store unreadable   -> Unavailable (nothing runs)
//! store degraded     -> Unavailable (nothing runs)
//! remaining < cost   -> LimitReached (usage snapshot + upgrade url)
//! otherwise          -> run op; on success commit(cost)
//! ```
//!
//! A failed or cancelled operation is never debited. A commit that fails
//! after the operation succeeded is logged and the result still returned.

use std::future::Future;

use uuid::Uuid;

use crate::entitlement::{EntitlementEngine, Usage};
use crate::error::BillingError;
use crate::gate::DebitGate;

/// Default upgrade suggestion
pub const DEFAULT_UPGRADE_URL: &str = "/pricing";

#[derive(Debug, thiserror::Error)]
pub enum PaywallError<E> {
    #[error("Authentication required")]
    AuthenticationRequired { free_view: Usage },

    #[error("Credit limit reached")]
    LimitReached { usage: Usage, upgrade_url: String },

    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Billing(BillingError),

    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E> From<BillingError> for PaywallError<E> {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::CounterStoreUnavailable(msg) => PaywallError::Unavailable(msg),
            other => PaywallError::Billing(other),
        }
    }
}

#[derive(Clone)]
pub struct Paywall {
    engine: EntitlementEngine,
    gate: DebitGate,
    upgrade_url: String,
}

impl Paywall {
    pub fn new(engine: EntitlementEngine, gate: DebitGate, upgrade_url: impl Into<String>) -> Self {
        Self {
            engine,
            gate,
            upgrade_url: upgrade_url.into(),
        }
    }

    pub fn upgrade_url(&self) -> &str {
        &self.upgrade_url
    }

    /// Gate `op` behind `cost` credits. `op` receives the pre-debit usage.
    pub async fn run<T, E, F, Fut>(
        &self,
        user_id: Option<Uuid>,
        cost: i64,
        op: F,
    ) -> Result<T, PaywallError<E>>
    where
        F: FnOnce(Usage) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(user_id) = user_id else {
            return Err(PaywallError::AuthenticationRequired {
                free_view: Usage::free_view(),
            });
        };

        // An unknown balance is never treated as zero here
        let usage = self.engine.checked_usage(user_id).await?;

        // Debits could not be recorded, so the operation must not run
        self.gate.ensure_writable()?;

        if usage.remaining < cost {
            tracing::info!(
                user_id = %user_id,
                cost = cost,
                remaining = usage.remaining,
                tier = %usage.tier,
                "Paywalled operation rejected: limit reached"
            );
            return Err(PaywallError::LimitReached {
                usage,
                upgrade_url: self.upgrade_url.clone(),
            });
        }

        let value = op(usage).await.map_err(PaywallError::Operation)?;

        if let Err(e) = self.gate.commit(user_id, cost).await {
            tracing::error!(
                user_id = %user_id,
                cost = cost,
                error = %e,
                "Commit failed after successful operation; credits not debited"
            );
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;
    use crate::memory::MemoryBillingStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use venuelens_shared::{CounterStore, DegradedCounterStore, MemoryCounterStore};

    fn paywall_with(counter: Arc<dyn CounterStore>) -> (Paywall, EntitlementEngine) {
        let store = Arc::new(MemoryBillingStore::new());
        let engine = EntitlementEngine::new(store.clone(), PlanCatalog::new(store), counter.clone());
        let gate = DebitGate::new(engine.clone(), counter);
        (Paywall::new(engine.clone(), gate, DEFAULT_UPGRADE_URL), engine)
    }

    #[tokio::test]
    async fn test_success_debits_cost() {
        let (paywall, engine) = paywall_with(Arc::new(MemoryCounterStore::new()));
        let user = Uuid::new_v4();

        let out: Result<&str, PaywallError<String>> =
            paywall.run(Some(user), 1, |_| async { Ok("done") }).await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(engine.usage(user).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_failed_operation_is_free() {
        let (paywall, engine) = paywall_with(Arc::new(MemoryCounterStore::new()));
        let user = Uuid::new_v4();

        let out: Result<(), PaywallError<String>> = paywall
            .run(Some(user), 1, |_| async { Err("remote failed".to_string()) })
            .await;
        assert!(matches!(out, Err(PaywallError::Operation(_))));
        assert_eq!(engine.usage(user).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_anonymous_never_touches_counter() {
        let counter = Arc::new(MemoryCounterStore::new());
        counter.set_available(false);
        let (paywall, _) = paywall_with(counter);
        let ran = AtomicBool::new(false);

        let out: Result<(), PaywallError<String>> = paywall
            .run(None, 1, |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        match out {
            Err(PaywallError::AuthenticationRequired { free_view }) => {
                assert_eq!(free_view, Usage::free_view())
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_limit_reached_carries_snapshot() {
        let (paywall, _) = paywall_with(Arc::new(MemoryCounterStore::new()));
        let user = Uuid::new_v4();

        let out: Result<(), PaywallError<String>> =
            paywall.run(Some(user), 3, |_| async { Ok(()) }).await;
        match out {
            Err(PaywallError::LimitReached { usage, upgrade_url }) => {
                assert_eq!(usage.remaining, 2);
                assert_eq!(upgrade_url, "/pricing");
            }
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_degraded_store_rejects_before_running() {
        let (paywall, _) = paywall_with(Arc::new(DegradedCounterStore));
        let ran = AtomicBool::new(false);

        let out: Result<(), PaywallError<String>> = paywall
            .run(Some(Uuid::new_v4()), 1, |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(PaywallError::Unavailable(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_counter_outage_rejects_before_running() {
        let counter = Arc::new(MemoryCounterStore::new());
        let (paywall, engine) = paywall_with(counter.clone());
        let user = Uuid::new_v4();
        counter.incr(&venuelens_shared::usage_key(user), 2).await.unwrap();

        counter.set_available(false);
        let ran = AtomicBool::new(false);
        for _ in 0..3 {
            let out: Result<(), PaywallError<String>> = paywall
                .run(Some(user), 1, |_| async {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(matches!(out, Err(PaywallError::Unavailable(_))));
        }
        assert!(!ran.load(Ordering::SeqCst), "operation must not run");

        // display reads still fail open
        assert_eq!(engine.usage(user).await.unwrap().used, 0);

        counter.set_available(true);
        assert_eq!(engine.usage(user).await.unwrap().used, 2);
    }

    #[tokio::test]
    async fn test_commit_failure_after_success_is_tolerated() {
        let counter = Arc::new(MemoryCounterStore::new());
        let (paywall, _) = paywall_with(counter.clone());
        let user = Uuid::new_v4();

        let out: Result<u32, PaywallError<String>> = paywall
            .run(Some(user), 1, |_| {
                let counter = counter.clone();
                async move {
                    // store drops while the remote call is in flight
                    counter.set_available(false);
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        counter.set_available(true);
        assert_eq!(counter.get(&venuelens_shared::usage_key(user)).await.unwrap(), None);
    }
}
