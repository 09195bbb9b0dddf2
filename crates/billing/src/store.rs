//! Relational store for the plan catalog and subscription mirror

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;
use venuelens_shared::{BillingInterval, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::mirror::{decide, MirrorOutcome, MirrorWrite};
use crate::models::{CatalogUpsert, Price, Product, SubscriptionRecord};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_product(&self, product_id: &str) -> BillingResult<Option<Product>>;

    /// Price joined with its product
    async fn price_with_product(&self, price_id: &str) -> BillingResult<Option<(Price, Product)>>;

    /// Upsert provider-owned catalog fields in one transaction
    async fn upsert_catalog(&self, catalog: &CatalogUpsert) -> BillingResult<()>;

    /// Returns false if the product does not exist
    async fn set_product_allowance(&self, product_id: &str, credits: i64) -> BillingResult<bool>;

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<SubscriptionRecord>;

    /// Upsert the write's catalog rows, lock the user's row, run
    /// [`decide`](crate::mirror::decide) and persist the result, all in one
    /// transaction.
    async fn apply_change(&self, write: &MirrorWrite) -> BillingResult<MirrorOutcome>;

    /// Clear `reset_pending` if `event_id` is still the last applied event
    async fn clear_reset_pending(&self, user_id: Uuid, event_id: &str) -> BillingResult<()>;

    /// Rows with `active_flag` and a subscription id
    async fn active_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>>;
}

pub type SharedStore = Arc<dyn BillingStore>;

const SUBSCRIPTION_COLUMNS: &str = "user_id, customer_external_id, subscription_external_id, \
     current_price_external_id, status, active_flag, last_event_id, last_event_at, \
     reset_pending, last_invoice_id, last_invoice_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    customer_external_id: Option<String>,
    subscription_external_id: Option<String>,
    current_price_external_id: Option<String>,
    status: String,
    active_flag: bool,
    last_event_id: Option<String>,
    last_event_at: Option<OffsetDateTime>,
    reset_pending: bool,
    last_invoice_id: Option<String>,
    last_invoice_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        let status = row.status.parse().unwrap_or_else(|e| {
            tracing::warn!(user_id = %row.user_id, error = %e, "Unrecognised stored status");
            SubscriptionStatus::None
        });
        Self {
            user_id: row.user_id,
            customer_external_id: row.customer_external_id,
            subscription_external_id: row.subscription_external_id,
            current_price_external_id: row.current_price_external_id,
            status,
            active_flag: row.active_flag,
            last_event_id: row.last_event_id,
            last_event_at: row.last_event_at,
            reset_pending: row.reset_pending,
            last_invoice_id: row.last_invoice_id,
            last_invoice_at: row.last_invoice_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProductRow {
    external_id: String,
    name: String,
    description: Option<String>,
    active: bool,
    monthly_credit_allowance: i64,
    display_order: i32,
    highlighted: bool,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Self {
            external_id: row.external_id,
            name: row.name,
            description: row.description,
            active: row.active,
            monthly_credit_allowance: row.monthly_credit_allowance,
            display_order: row.display_order,
            highlighted: row.highlighted,
        }
    }
}

#[derive(Debug, FromRow)]
struct PriceProductRow {
    price_external_id: String,
    product_id: String,
    currency: String,
    minor_units_amount: i64,
    interval: String,
    interval_count: i32,
    price_active: bool,
    product_name: String,
    product_description: Option<String>,
    product_active: bool,
    monthly_credit_allowance: i64,
    display_order: i32,
    highlighted: bool,
}

impl PriceProductRow {
    fn into_parts(row: Self) -> BillingResult<(Price, Product)> {
        let interval: BillingInterval = row.interval.parse().map_err(BillingError::InvalidInput)?;
        Ok((
            Price {
                external_id: row.price_external_id,
                product_id: row.product_id.clone(),
                currency: row.currency,
                minor_units_amount: row.minor_units_amount,
                interval,
                interval_count: row.interval_count,
                active: row.price_active,
            },
            Product {
                external_id: row.product_id,
                name: row.product_name,
                description: row.product_description,
                active: row.product_active,
                monthly_credit_allowance: row.monthly_credit_allowance,
                display_order: row.display_order,
                highlighted: row.highlighted,
            },
        ))
    }
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn upsert_catalog_in(conn: &mut PgConnection, catalog: &CatalogUpsert) -> BillingResult<()> {
    for product in &catalog.products {
        // Operator-owned columns are only written on insert
        sqlx::query(
            r#"
            INSERT INTO products (external_id, name, description, active, monthly_credit_allowance)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(&product.external_id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.active)
        .bind(product.initial_allowance.max(0))
        .execute(&mut *conn)
        .await?;
    }

    for price in &catalog.prices {
        sqlx::query(
            r#"
            INSERT INTO prices
                (external_id, product_id, currency, minor_units_amount, interval, interval_count, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                currency = EXCLUDED.currency,
                minor_units_amount = EXCLUDED.minor_units_amount,
                interval = EXCLUDED.interval,
                interval_count = EXCLUDED.interval_count,
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(&price.external_id)
        .bind(&price.product_id)
        .bind(&price.currency)
        .bind(price.minor_units_amount)
        .bind(price.interval.as_str())
        .bind(price.interval_count)
        .bind(price.active)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn write_record(conn: &mut PgConnection, record: &SubscriptionRecord) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (user_id, customer_external_id, subscription_external_id, current_price_external_id,
             status, active_flag, last_event_id, last_event_at, reset_pending,
             last_invoice_id, last_invoice_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (user_id) DO UPDATE SET
            customer_external_id = EXCLUDED.customer_external_id,
            subscription_external_id = EXCLUDED.subscription_external_id,
            current_price_external_id = EXCLUDED.current_price_external_id,
            status = EXCLUDED.status,
            active_flag = EXCLUDED.active_flag,
            last_event_id = EXCLUDED.last_event_id,
            last_event_at = EXCLUDED.last_event_at,
            reset_pending = EXCLUDED.reset_pending,
            last_invoice_id = EXCLUDED.last_invoice_id,
            last_invoice_at = EXCLUDED.last_invoice_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(record.user_id)
    .bind(&record.customer_external_id)
    .bind(&record.subscription_external_id)
    .bind(&record.current_price_external_id)
    .bind(record.status.as_str())
    .bind(record.active_flag)
    .bind(&record.last_event_id)
    .bind(record.last_event_at)
    .bind(record.reset_pending)
    .bind(&record.last_invoice_id)
    .bind(record.last_invoice_at)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_product(&self, product_id: &str) -> BillingResult<Option<Product>> {
        let row: Option<ProductRow> = sqlx::query_as(
            r#"
            SELECT external_id, name, description, active, monthly_credit_allowance,
                   display_order, highlighted
            FROM products
            WHERE external_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn price_with_product(&self, price_id: &str) -> BillingResult<Option<(Price, Product)>> {
        let row: Option<PriceProductRow> = sqlx::query_as(
            r#"
            SELECT pr.external_id AS price_external_id,
                   pr.product_id,
                   pr.currency,
                   pr.minor_units_amount,
                   pr.interval,
                   pr.interval_count,
                   pr.active AS price_active,
                   p.name AS product_name,
                   p.description AS product_description,
                   p.active AS product_active,
                   p.monthly_credit_allowance,
                   p.display_order,
                   p.highlighted
            FROM prices pr
            JOIN products p ON p.external_id = pr.product_id
            WHERE pr.external_id = $1
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PriceProductRow::into_parts).transpose()
    }

    async fn upsert_catalog(&self, catalog: &CatalogUpsert) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_catalog_in(&mut *tx, catalog).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_product_allowance(&self, product_id: &str, credits: i64) -> BillingResult<bool> {
        if credits < 0 {
            return Err(BillingError::InvalidInput(
                "monthly_credit_allowance must be >= 0".to_string(),
            ));
        }
        let result = sqlx::query(
            "UPDATE products SET monthly_credit_allowance = $2, updated_at = NOW() WHERE external_id = $1",
        )
        .bind(product_id)
        .bind(credits)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRecord::from))
    }

    async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE customer_external_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRecord::from))
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_external_id = $1 \
             ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRecord::from))
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (user_id, customer_external_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                customer_external_id = EXCLUDED.customer_external_id,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn apply_change(&self, write: &MirrorWrite) -> BillingResult<MirrorOutcome> {
        let mut tx = self.pool.begin().await?;

        upsert_catalog_in(&mut *tx, &write.catalog).await?;

        // Serialises writers for this user even when no row exists yet
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(write.user_id.to_string())
            .execute(&mut *tx)
            .await?;

        let current: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(write.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.map(SubscriptionRecord::from);

        let decision = decide(current.as_ref(), write, OffsetDateTime::now_utc());
        if let Some(next) = &decision.next {
            write_record(&mut *tx, next).await?;
        }

        tx.commit().await?;
        Ok(decision.outcome)
    }

    async fn clear_reset_pending(&self, user_id: Uuid, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET reset_pending = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND last_event_id = $2 AND reset_pending
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE active_flag AND subscription_external_id IS NOT NULL \
             ORDER BY user_id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionRecord::from).collect())
    }
}
