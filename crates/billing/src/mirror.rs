//! Subscription mirror
//!
//! One row per user recording what the billing provider last told us about
//! the user's subscription. Every mutation goes through
//! [`BillingStore::apply_change`], which runs [`decide`] against the locked
//! row inside a single transaction. `decide` is pure so the ordering and
//! idempotence rules can be tested without a database.
//!
//! ## Rules
//!
//! - An event whose id equals `last_event_id` is a redelivery. It writes
//!   nothing and re-issues the counter reset only if `reset_pending` is set.
//! - Status/price overwrites older than `last_event_at` are stale and ignored.
//!   Equal timestamps apply.
//! - Reapplying an identical (subscription, status, price) triple is a no-op.
//! - An invoice resets the counter once. A payment for the invoice recorded in
//!   `last_invoice_id` is a no-op whatever its event id, and an invoice event
//!   older than `last_invoice_at` is stale.
//! - Whenever an applied change decides on a counter reset, `reset_pending`
//!   is stored with it and cleared after the reset lands. A pending reset
//!   left behind by an earlier event is carried into the next applied change.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::SubscriptionStatus;

use crate::error::BillingResult;
use crate::models::{CatalogUpsert, SubscriptionRecord};
use crate::store::BillingStore;

/// Identity of the billing event behind a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub id: String,
    /// Provider-side creation time
    pub created: OffsetDateTime,
}

/// Which subscription event produced a [`MirrorChange::Subscription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    Created,
    Updated,
}

/// Requested change to a mirror row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChange {
    /// Checkout finished: link the subscription id if the session carried one
    LinkCheckout { subscription_id: Option<String> },
    /// Subscription created or updated at the provider
    Subscription {
        kind: SubscriptionEventKind,
        subscription_id: String,
        status: SubscriptionStatus,
        price_id: Option<String>,
    },
    /// Subscription ended at the provider
    Terminate {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    /// Invoice paid: a new period starts
    InvoicePaid {
        subscription_id: Option<String>,
        invoice_id: Option<String>,
    },
    /// Operator-triggered refresh from provider state (never resets usage)
    Sync {
        subscription_id: Option<String>,
        status: SubscriptionStatus,
        price_id: Option<String>,
    },
}

/// A change plus everything needed to apply it in one transaction
#[derive(Debug, Clone)]
pub struct MirrorWrite {
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub change: MirrorChange,
    /// None for operator-initiated writes
    pub event: Option<EventMeta>,
    /// Products and prices upserted in the same transaction
    pub catalog: CatalogUpsert,
}

/// Why a change was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Refers to a subscription other than the mirrored one
    OtherSubscription,
    /// No mirror row exists to change
    NoRecord,
}

/// Result of applying a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Applied {
        record: SubscriptionRecord,
        reset: bool,
    },
    /// Same event id as the last applied one
    Redelivered { reset: bool },
    /// Identical to current state
    Unchanged,
    /// Older than the last applied event
    Stale,
    Ignored(IgnoreReason),
}

impl MirrorOutcome {
    /// Whether the caller must reset the usage counter after commit
    pub fn needs_reset(&self) -> bool {
        matches!(
            self,
            MirrorOutcome::Applied { reset: true, .. } | MirrorOutcome::Redelivered { reset: true }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            MirrorOutcome::Applied { .. } => "applied",
            MirrorOutcome::Redelivered { .. } => "redelivered",
            MirrorOutcome::Unchanged => "unchanged",
            MirrorOutcome::Stale => "stale",
            MirrorOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Outcome plus the row to persist, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: MirrorOutcome,
    pub next: Option<SubscriptionRecord>,
}

impl Decision {
    fn noop(outcome: MirrorOutcome) -> Self {
        Self {
            outcome,
            next: None,
        }
    }
}

fn is_stale(current: Option<&SubscriptionRecord>, event: Option<&EventMeta>) -> bool {
    match (current.and_then(|c| c.last_event_at), event) {
        (Some(last), Some(event)) => event.created < last,
        _ => false,
    }
}

/// Decide what a change does to the current row
pub fn decide(
    current: Option<&SubscriptionRecord>,
    write: &MirrorWrite,
    now: OffsetDateTime,
) -> Decision {
    if let (Some(cur), Some(event)) = (current, write.event.as_ref()) {
        if cur.last_event_id.as_deref() == Some(event.id.as_str()) {
            return Decision::noop(MirrorOutcome::Redelivered {
                reset: cur.reset_pending,
            });
        }
    }

    let mut next = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecord::new(write.user_id, now));
    if let Some(customer_id) = &write.customer_id {
        next.customer_external_id = Some(customer_id.clone());
    }

    let mut reset = false;
    let mut touches_status = false;

    match &write.change {
        MirrorChange::LinkCheckout { subscription_id } => {
            if let Some(sub_id) = subscription_id {
                next.subscription_external_id = Some(sub_id.clone());
            }
        }

        MirrorChange::Subscription {
            kind,
            subscription_id,
            status,
            price_id,
        } => {
            if is_stale(current, write.event.as_ref()) {
                return Decision::noop(MirrorOutcome::Stale);
            }
            let price_id = price_id
                .clone()
                .or_else(|| next.current_price_external_id.clone());

            if let Some(cur) = current {
                if cur.subscription_external_id.as_deref() == Some(subscription_id.as_str())
                    && cur.status == *status
                    && cur.current_price_external_id == price_id
                {
                    return Decision::noop(MirrorOutcome::Unchanged);
                }
            }

            let was_entitled = current.is_some_and(|c| c.is_entitled());
            let plan_changed = current
                .and_then(|c| c.current_price_external_id.as_ref())
                .is_some_and(|old| price_id.as_ref() != Some(old));

            reset = match kind {
                SubscriptionEventKind::Created => true,
                SubscriptionEventKind::Updated => {
                    (!was_entitled && status.is_entitled()) || plan_changed
                }
            };

            next.subscription_external_id = Some(subscription_id.clone());
            next.status = *status;
            next.active_flag = status.is_entitled();
            next.current_price_external_id = price_id;
            touches_status = true;
        }

        MirrorChange::Terminate {
            subscription_id,
            status,
        } => {
            let Some(cur) = current else {
                return Decision::noop(MirrorOutcome::Ignored(IgnoreReason::NoRecord));
            };
            if cur.subscription_external_id.as_deref() != Some(subscription_id.as_str()) {
                return Decision::noop(MirrorOutcome::Ignored(IgnoreReason::OtherSubscription));
            }
            if is_stale(current, write.event.as_ref()) {
                return Decision::noop(MirrorOutcome::Stale);
            }

            let terminal = if status.is_entitled() || *status == SubscriptionStatus::None {
                SubscriptionStatus::Canceled
            } else {
                *status
            };
            if cur.status == terminal && !cur.active_flag {
                return Decision::noop(MirrorOutcome::Unchanged);
            }

            next.status = terminal;
            next.active_flag = false;
            touches_status = true;
        }

        MirrorChange::InvoicePaid {
            subscription_id,
            invoice_id,
        } => {
            if let (Some(invoice_sub), Some(cur)) = (
                subscription_id.as_deref(),
                current.and_then(|c| c.subscription_external_id.as_deref()),
            ) {
                if invoice_sub != cur {
                    return Decision::noop(MirrorOutcome::Ignored(
                        IgnoreReason::OtherSubscription,
                    ));
                }
            }

            let already_paid = invoice_id.is_some()
                && current.and_then(|c| c.last_invoice_id.as_deref()) == invoice_id.as_deref();
            if already_paid {
                // Only a reset still pending from that payment is performed
                if !current.is_some_and(|c| c.reset_pending) {
                    return Decision::noop(MirrorOutcome::Unchanged);
                }
            } else {
                if let (Some(last), Some(event)) = (
                    current.and_then(|c| c.last_invoice_at),
                    write.event.as_ref(),
                ) {
                    if event.created < last {
                        return Decision::noop(MirrorOutcome::Stale);
                    }
                }
                if next.status.is_recoverable() {
                    next.status = SubscriptionStatus::Active;
                    next.active_flag = true;
                    touches_status = true;
                }
                if invoice_id.is_some() {
                    next.last_invoice_id = invoice_id.clone();
                }
                if let Some(event) = &write.event {
                    next.last_invoice_at = Some(event.created);
                }
                reset = true;
            }
        }

        MirrorChange::Sync {
            subscription_id,
            status,
            price_id,
        } => {
            if let Some(cur) = current {
                if cur.subscription_external_id == *subscription_id
                    && cur.status == *status
                    && cur.current_price_external_id == *price_id
                    && cur.customer_external_id == next.customer_external_id
                {
                    return Decision::noop(MirrorOutcome::Unchanged);
                }
            }
            next.subscription_external_id = subscription_id.clone();
            next.status = *status;
            next.active_flag = status.is_entitled();
            next.current_price_external_id = price_id.clone();
        }
    }

    // A reset that never landed for an earlier event is performed now
    let carried = current.is_some_and(|c| c.reset_pending);
    reset = reset || carried;

    if let Some(event) = &write.event {
        next.last_event_id = Some(event.id.clone());
        if touches_status {
            next.last_event_at = Some(match next.last_event_at {
                Some(last) if last > event.created => last,
                _ => event.created,
            });
        }
    }
    next.reset_pending = reset;
    next.updated_at = now;

    Decision {
        outcome: MirrorOutcome::Applied {
            record: next.clone(),
            reset,
        },
        next: Some(next),
    }
}

/// Read and write access to the subscription mirror
#[derive(Clone)]
pub struct SubscriptionMirror {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionMirror {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.get_subscription(user_id).await
    }

    pub async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_by_customer(customer_id).await
    }

    /// Attach a provider customer to a user, creating the row if missing
    pub async fn upsert_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self.store.upsert_customer(user_id, customer_id).await?;
        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            "Customer linked to user"
        );
        Ok(record)
    }

    /// Apply a provider-driven change in one transaction
    pub async fn apply_subscription_event(&self, write: MirrorWrite) -> BillingResult<MirrorOutcome> {
        let outcome = self.store.apply_change(&write).await?;
        tracing::debug!(
            user_id = %write.user_id,
            event_id = ?write.event.as_ref().map(|e| e.id.as_str()),
            outcome = outcome.label(),
            "Subscription mirror change processed"
        );
        Ok(outcome)
    }

    /// Deactivate the row mirroring `subscription_id`. Rows following a
    /// different subscription are left alone.
    pub async fn mark_inactive(
        &self,
        subscription_id: &str,
        terminal_status: SubscriptionStatus,
        event: Option<EventMeta>,
    ) -> BillingResult<MirrorOutcome> {
        let Some(record) = self.store.find_by_subscription(subscription_id).await? else {
            return Ok(MirrorOutcome::Ignored(IgnoreReason::NoRecord));
        };

        self.apply_subscription_event(MirrorWrite {
            user_id: record.user_id,
            customer_id: None,
            change: MirrorChange::Terminate {
                subscription_id: subscription_id.to_string(),
                status: terminal_status,
            },
            event,
            catalog: CatalogUpsert::default(),
        })
        .await
    }

    /// Confirm that the counter reset decided by `event_id` landed
    pub async fn clear_reset_pending(&self, user_id: Uuid, event_id: &str) -> BillingResult<()> {
        self.store.clear_reset_pending(user_id, event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    fn event(id: &str, created: OffsetDateTime) -> Option<EventMeta> {
        Some(EventMeta {
            id: id.to_string(),
            created,
        })
    }

    fn write(user_id: Uuid, change: MirrorChange, event: Option<EventMeta>) -> MirrorWrite {
        MirrorWrite {
            user_id,
            customer_id: Some("cus_1".to_string()),
            change,
            event,
            catalog: CatalogUpsert::default(),
        }
    }

    fn sub_change(
        kind: SubscriptionEventKind,
        status: SubscriptionStatus,
        price: &str,
    ) -> MirrorChange {
        MirrorChange::Subscription {
            kind,
            subscription_id: "sub_1".to_string(),
            status,
            price_id: Some(price.to_string()),
        }
    }

    /// Apply a write and return the stored row
    fn apply(current: Option<&SubscriptionRecord>, w: &MirrorWrite) -> (Decision, SubscriptionRecord) {
        let decision = decide(current, w, T0);
        let record = decision
            .next
            .clone()
            .or_else(|| current.cloned())
            .expect("row");
        (decision, record)
    }

    fn active_row(user: Uuid) -> SubscriptionRecord {
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Created, SubscriptionStatus::Active, "price_pro"),
            event("evt_0", T0),
        );
        let (_, mut row) = apply(None, &w);
        row.reset_pending = false;
        row
    }

    #[test]
    fn test_created_sets_fields_and_resets() {
        let user = Uuid::new_v4();
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Created, SubscriptionStatus::Active, "price_pro"),
            event("evt_1", T0),
        );
        let (decision, row) = apply(None, &w);
        assert!(decision.outcome.needs_reset());
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert!(row.active_flag);
        assert_eq!(row.current_price_external_id.as_deref(), Some("price_pro"));
        assert_eq!(row.customer_external_id.as_deref(), Some("cus_1"));
        assert_eq!(row.last_event_id.as_deref(), Some("evt_1"));
        assert!(row.reset_pending);
    }

    #[test]
    fn test_redelivery_writes_nothing() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.last_event_id = Some("evt_2".into());

        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::PastDue, "price_pro"),
            event("evt_2", T0),
        );
        let decision = decide(Some(&row), &w, T0);
        assert_eq!(decision.outcome, MirrorOutcome::Redelivered { reset: false });
        assert!(decision.next.is_none());

        row.reset_pending = true;
        let decision = decide(Some(&row), &w, T0);
        assert_eq!(decision.outcome, MirrorOutcome::Redelivered { reset: true });
    }

    #[test]
    fn test_identical_update_is_unchanged() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::Active, "price_pro"),
            event("evt_9", T0),
        );
        assert_eq!(decide(Some(&row), &w, T0).outcome, MirrorOutcome::Unchanged);
    }

    #[test]
    fn test_older_event_is_stale() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::PastDue, "price_pro"),
            event("evt_old", datetime!(2026-05-31 12:00 UTC)),
        );
        assert_eq!(decide(Some(&row), &w, T0).outcome, MirrorOutcome::Stale);
    }

    #[test]
    fn test_equal_timestamp_applies() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::PastDue, "price_pro"),
            event("evt_same_second", T0),
        );
        let (decision, next) = apply(Some(&row), &w);
        assert!(matches!(decision.outcome, MirrorOutcome::Applied { reset: false, .. }));
        assert_eq!(next.status, SubscriptionStatus::PastDue);
        assert!(!next.active_flag);
    }

    #[test]
    fn test_transition_into_entitled_resets() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.status = SubscriptionStatus::PastDue;
        row.active_flag = false;

        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::Active, "price_pro"),
            event("evt_3", T0),
        );
        assert!(decide(Some(&row), &w, T0).outcome.needs_reset());
    }

    #[test]
    fn test_plan_change_resets() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::Active, "price_ent"),
            event("evt_4", T0),
        );
        let (decision, next) = apply(Some(&row), &w);
        assert!(decision.outcome.needs_reset());
        assert_eq!(next.current_price_external_id.as_deref(), Some("price_ent"));
    }

    #[test]
    fn test_entitled_to_entitled_status_change_does_not_reset() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.status = SubscriptionStatus::Trialing;

        let w = write(
            user,
            sub_change(SubscriptionEventKind::Updated, SubscriptionStatus::Active, "price_pro"),
            event("evt_5", T0),
        );
        assert!(!decide(Some(&row), &w, T0).outcome.needs_reset());
    }

    #[test]
    fn test_terminate_keeps_price_and_deactivates() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            MirrorChange::Terminate {
                subscription_id: "sub_1".into(),
                status: SubscriptionStatus::Active,
            },
            event("evt_6", T0),
        );
        let (decision, next) = apply(Some(&row), &w);
        assert!(!decision.outcome.needs_reset());
        assert!(!next.active_flag);
        assert_eq!(next.status, SubscriptionStatus::Canceled);
        assert_eq!(next.current_price_external_id.as_deref(), Some("price_pro"));
    }

    #[test]
    fn test_terminate_other_subscription_is_ignored() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let w = write(
            user,
            MirrorChange::Terminate {
                subscription_id: "sub_superseded".into(),
                status: SubscriptionStatus::Canceled,
            },
            event("evt_7", T0),
        );
        assert_eq!(
            decide(Some(&row), &w, T0).outcome,
            MirrorOutcome::Ignored(IgnoreReason::OtherSubscription)
        );
    }

    #[test]
    fn test_invoice_paid_recovers_past_due() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.status = SubscriptionStatus::PastDue;
        row.active_flag = false;

        let w = write(
            user,
            MirrorChange::InvoicePaid {
                subscription_id: Some("sub_1".into()),
                invoice_id: Some("in_1".into()),
            },
            event("evt_8", T0),
        );
        let (decision, next) = apply(Some(&row), &w);
        assert!(decision.outcome.needs_reset());
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert!(next.active_flag);
    }

    #[test]
    fn test_invoice_paid_leaves_canceled_alone_but_resets() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.status = SubscriptionStatus::Canceled;
        row.active_flag = false;

        let w = write(
            user,
            MirrorChange::InvoicePaid {
                subscription_id: None,
                invoice_id: Some("in_2".into()),
            },
            event("evt_10", T0),
        );
        let (decision, next) = apply(Some(&row), &w);
        assert!(decision.outcome.needs_reset());
        assert_eq!(next.status, SubscriptionStatus::Canceled);
    }

    fn invoice(invoice_id: &str) -> MirrorChange {
        MirrorChange::InvoicePaid {
            subscription_id: Some("sub_1".into()),
            invoice_id: Some(invoice_id.into()),
        }
    }

    #[test]
    fn test_same_invoice_under_new_event_id_is_unchanged() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let (decision, row) = apply(Some(&row), &write(user, invoice("in_1"), event("evt_a", T0)));
        assert!(decision.outcome.needs_reset());
        assert_eq!(row.last_invoice_id.as_deref(), Some("in_1"));

        let mut row = row;
        row.reset_pending = false;
        let later = datetime!(2026-06-01 12:00:05 UTC);
        let w = write(user, invoice("in_1"), event("evt_b", later));
        assert_eq!(decide(Some(&row), &w, T0).outcome, MirrorOutcome::Unchanged);
    }

    #[test]
    fn test_same_invoice_completes_pending_reset() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let (_, row) = apply(Some(&row), &write(user, invoice("in_1"), event("evt_a", T0)));
        assert!(row.reset_pending);

        let (decision, next) = apply(Some(&row), &write(user, invoice("in_1"), event("evt_b", T0)));
        assert!(decision.outcome.needs_reset());
        assert_eq!(next.last_event_id.as_deref(), Some("evt_b"));
    }

    #[test]
    fn test_older_invoice_after_newer_is_stale() {
        let user = Uuid::new_v4();
        let row = active_row(user);
        let next_month = datetime!(2026-07-01 12:00 UTC);
        let (_, mut row) =
            apply(Some(&row), &write(user, invoice("in_2"), event("evt_july", next_month)));
        row.reset_pending = false;

        let w = write(user, invoice("in_1"), event("evt_june", T0));
        assert_eq!(decide(Some(&row), &w, T0).outcome, MirrorOutcome::Stale);
    }

    #[test]
    fn test_checkout_creates_row_without_entitlement() {
        let user = Uuid::new_v4();
        let w = write(
            user,
            MirrorChange::LinkCheckout {
                subscription_id: Some("sub_9".into()),
            },
            event("evt_11", T0),
        );
        let (decision, row) = apply(None, &w);
        assert!(!decision.outcome.needs_reset());
        assert_eq!(row.subscription_external_id.as_deref(), Some("sub_9"));
        assert!(!row.active_flag);
    }

    #[test]
    fn test_pending_reset_is_carried_forward() {
        let user = Uuid::new_v4();
        let mut row = active_row(user);
        row.reset_pending = true;

        let w = write(
            user,
            MirrorChange::LinkCheckout {
                subscription_id: None,
            },
            event("evt_12", T0),
        );
        assert!(decide(Some(&row), &w, T0).outcome.needs_reset());
    }

    #[test]
    fn test_sync_never_resets() {
        let user = Uuid::new_v4();
        let w = MirrorWrite {
            user_id: user,
            customer_id: Some("cus_1".into()),
            change: MirrorChange::Sync {
                subscription_id: Some("sub_1".into()),
                status: SubscriptionStatus::Active,
                price_id: Some("price_pro".into()),
            },
            event: None,
            catalog: CatalogUpsert::default(),
        };
        let (decision, row) = apply(None, &w);
        assert!(!decision.outcome.needs_reset());
        assert!(row.active_flag);
        assert!(row.last_event_id.is_none());
    }

    #[test]
    fn test_active_flag_tracks_status_after_every_change() {
        let user = Uuid::new_v4();
        let mut row: Option<SubscriptionRecord> = None;
        let statuses = [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Active,
        ];
        for (i, status) in statuses.iter().enumerate() {
            let w = write(
                user,
                sub_change(SubscriptionEventKind::Updated, *status, "price_pro"),
                event(&format!("evt_{}", i), T0),
            );
            let (_, next) = apply(row.as_ref(), &w);
            assert_eq!(next.active_flag, next.status.is_entitled());
            row = Some(next);
        }
    }
}
