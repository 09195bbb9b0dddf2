//! Yearly reset scheduler
//!
//! Yearly subscribers get their monthly allowance every 30 days, but the
//! provider only invoices them once a year. Each sweep walks the active
//! mirror rows, asks the provider whether the subscription is yearly, and
//! resets the counter when a new 30-day period has started.
//!
//! The ledger key `yearly_reset:{user_id}:{period}` is written after the
//! reset, so a crash in between replays the reset on the next sweep. Two
//! schedulers racing on one user both reset (same target value) and only one
//! ledger write lands.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::{
    yearly_reset_key, yearly_reset_pattern, CounterStore, KeyTtl, ResetConfig,
};

use crate::error::{BillingError, BillingResult};
use crate::gate::DebitGate;
use crate::models::SubscriptionRecord;
use crate::provider::BillingProvider;
use crate::store::BillingStore;

/// Length of one allowance period
pub const PERIOD_DAYS: i64 = 30;

/// Last period a yearly subscription is replenished in
pub const LAST_PERIOD: u32 = 11;

/// Where a yearly subscription stands relative to its 30-day periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum YearlyPhase {
    /// First period, covered by the purchase itself
    Fresh,
    /// Inside the eligibility window of `period`
    Due { period: u32 },
    /// Past the window of `period`
    Waiting { period: u32 },
    /// Year is over; renewal comes from the provider
    Stale,
}

/// Replenishment period for a subscription age, if one applies
pub fn replenish_period(days_since_start: i64) -> Option<u32> {
    if days_since_start < 0 {
        return None;
    }
    let period = days_since_start / PERIOD_DAYS;
    if (1..=LAST_PERIOD as i64).contains(&period) {
        Some(period as u32)
    } else {
        None
    }
}

pub fn yearly_phase(days_since_start: i64, eligibility_window_days: u32) -> YearlyPhase {
    if days_since_start < 0 {
        return YearlyPhase::Fresh;
    }
    if days_since_start / PERIOD_DAYS > LAST_PERIOD as i64 {
        return YearlyPhase::Stale;
    }
    match replenish_period(days_since_start) {
        None => YearlyPhase::Fresh,
        Some(period) if days_since_start % PERIOD_DAYS < eligibility_window_days as i64 => {
            YearlyPhase::Due { period }
        }
        Some(period) => YearlyPhase::Waiting { period },
    }
}

/// Per-user outcome of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetResult {
    Reset { user_id: Uuid, period: u32 },
    AlreadyDone { user_id: Uuid, period: u32 },
    NotEligible { user_id: Uuid, phase: YearlyPhase },
    NotYearly { user_id: Uuid },
    Error { user_id: Uuid, error: String },
}

/// Counts for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub checked: usize,
    pub resets: usize,
    pub already_done: usize,
    pub not_eligible: usize,
    pub not_yearly: usize,
    pub errors: usize,
}

impl ResetSummary {
    pub fn from_results(results: &[ResetResult]) -> Self {
        let mut summary = Self {
            checked: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                ResetResult::Reset { .. } => summary.resets += 1,
                ResetResult::AlreadyDone { .. } => summary.already_done += 1,
                ResetResult::NotEligible { .. } => summary.not_eligible += 1,
                ResetResult::NotYearly { .. } => summary.not_yearly += 1,
                ResetResult::Error { .. } => summary.errors += 1,
            }
        }
        summary
    }
}

/// Summary plus per-user results
#[derive(Debug, Clone)]
pub struct ResetRun {
    pub summary: ResetSummary,
    pub results: Vec<ResetResult>,
}

/// Counts for a ledger TTL sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSweepSummary {
    pub scanned: usize,
    pub fixed_missing_expiry: usize,
    pub clamped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct YearlyResetScheduler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    counter: Arc<dyn CounterStore>,
    gate: DebitGate,
    config: ResetConfig,
}

impl YearlyResetScheduler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        counter: Arc<dyn CounterStore>,
        gate: DebitGate,
        config: ResetConfig,
    ) -> Self {
        Self {
            store,
            provider,
            counter,
            gate,
            config,
        }
    }

    pub fn config(&self) -> &ResetConfig {
        &self.config
    }

    pub async fn run_once(&self) -> BillingResult<ResetRun> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Sweep every active subscription as of `now`
    pub async fn run_at(&self, now: OffsetDateTime) -> BillingResult<ResetRun> {
        let subscriptions = self.store.active_subscriptions().await?;

        let results: Vec<ResetResult> = stream::iter(subscriptions)
            .map(|record| self.process(record, now))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let summary = ResetSummary::from_results(&results);
        tracing::info!(
            checked = summary.checked,
            resets = summary.resets,
            already_done = summary.already_done,
            not_eligible = summary.not_eligible,
            not_yearly = summary.not_yearly,
            errors = summary.errors,
            "Yearly reset sweep complete"
        );
        Ok(ResetRun { summary, results })
    }

    async fn process(&self, record: SubscriptionRecord, now: OffsetDateTime) -> ResetResult {
        let user_id = record.user_id;
        let Some(subscription_id) = record.subscription_external_id.as_deref() else {
            return ResetResult::NotYearly { user_id };
        };

        // Interval comes from the provider; the local catalog may be stale
        let subscription = match self.provider.retrieve_subscription(subscription_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                return ResetResult::Error {
                    user_id,
                    error: e.to_string(),
                }
            }
        };
        if !subscription.is_yearly() {
            return ResetResult::NotYearly { user_id };
        }

        let days = (now - subscription.created).whole_days();
        match yearly_phase(days, self.config.eligibility_window_days) {
            YearlyPhase::Due { period } => self.replenish(user_id, period).await,
            phase => ResetResult::NotEligible { user_id, phase },
        }
    }

    async fn replenish(&self, user_id: Uuid, period: u32) -> ResetResult {
        let key = yearly_reset_key(user_id, period);
        let error = |e: BillingError| ResetResult::Error {
            user_id,
            error: e.to_string(),
        };

        match self.counter.get(&key).await {
            Ok(Some(_)) => return ResetResult::AlreadyDone { user_id, period },
            Ok(None) => {}
            Err(e) => return error(e.into()),
        }

        if let Err(e) = self.gate.reset(user_id).await {
            return error(e);
        }

        match self
            .counter
            .set_if_absent(&key, 1, self.config.ledger_ttl_seconds)
            .await
        {
            Ok(written) => {
                if !written {
                    tracing::debug!(user_id = %user_id, period = period, "Ledger already written by a concurrent sweep");
                }
                tracing::info!(user_id = %user_id, period = period, "Yearly subscription replenished");
                ResetResult::Reset { user_id, period }
            }
            Err(e) => error(e.into()),
        }
    }

    /// Operator path: reset now and record the current period when yearly.
    /// Returns the period written to the ledger, if any.
    pub async fn force_reset(&self, user_id: Uuid) -> BillingResult<Option<u32>> {
        let record = self
            .store
            .get_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        self.gate.reset(user_id).await?;

        let Some(subscription_id) = record.subscription_external_id.as_deref() else {
            return Ok(None);
        };
        let subscription = self.provider.retrieve_subscription(subscription_id).await?;
        if !subscription.is_yearly() {
            return Ok(None);
        }

        let days = (OffsetDateTime::now_utc() - subscription.created).whole_days();
        let Some(period) = replenish_period(days) else {
            return Ok(None);
        };
        self.counter
            .set_if_absent(
                &yearly_reset_key(user_id, period),
                1,
                self.config.ledger_ttl_seconds,
            )
            .await?;
        Ok(Some(period))
    }

    /// Give every ledger key a bounded lifetime
    pub async fn sweep_ledger_ttls(&self) -> BillingResult<LedgerSweepSummary> {
        let keys = self.counter.keys(&yearly_reset_pattern()).await?;
        let ttl = self.config.ledger_ttl_seconds;
        let mut summary = LedgerSweepSummary {
            scanned: keys.len(),
            ..LedgerSweepSummary::default()
        };

        for key in &keys {
            let fix = match self.counter.ttl(key).await {
                Ok(KeyTtl::Missing) => continue,
                Ok(KeyTtl::Persistent) => {
                    summary.fixed_missing_expiry += 1;
                    true
                }
                Ok(KeyTtl::Expires(remaining)) if remaining > ttl => {
                    summary.clamped += 1;
                    true
                }
                Ok(KeyTtl::Expires(_)) => false,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Ledger TTL lookup failed");
                    summary.errors += 1;
                    false
                }
            };
            if fix {
                if let Err(e) = self.counter.expire(key, ttl).await {
                    tracing::warn!(key = %key, error = %e, "Ledger TTL update failed");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            fixed_missing_expiry = summary.fixed_missing_expiry,
            clamped = summary.clamped,
            errors = summary.errors,
            "Ledger TTL sweep complete"
        );
        Ok(summary)
    }
}
