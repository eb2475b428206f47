//! PostgreSQL billing store
//!
//! Plan changes for one user are serialized across processes with a
//! transaction-scoped advisory lock. The ledger row also carries a `version`
//! column that every write checks.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::customer::{CustomerDirectory, CustomerProfile};
use crate::error::{BillingError, BillingResult};
use crate::gateway::CustomerRef;
use crate::ledger::{LedgerStatus, LedgerWrite, SubscriptionLedger, SubscriptionLedgerEntry};
use crate::locks::UserLocks;
use crate::money::Money;
use crate::payments::{NewPaymentRecord, PaymentRecord, PaymentRecordLog};
use crate::store::{BillingStore, UserLease};

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price_minor: i64,
    provider_product_id: String,
    provider_price_id: String,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            price: Money::from_minor(row.price_minor),
            provider_product_id: row.provider_product_id,
            provider_price_id: row.provider_price_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    user_id: Uuid,
    plan_id: Uuid,
    provider_ref: String,
    status: String,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<LedgerRow> for SubscriptionLedgerEntry {
    type Error = BillingError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionLedgerEntry {
            user_id: row.user_id,
            plan_id: row.plan_id,
            provider_ref: row.provider_ref,
            status: row.status.parse()?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    kind: String,
    transaction_ref: String,
    source_transaction_ref: Option<String>,
    amount_minor: i64,
    raw_response: serde_json::Value,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            kind: row.kind.parse()?,
            transaction_ref: row.transaction_ref,
            source_transaction_ref: row.source_transaction_ref,
            amount: Money::from_minor(row.amount_minor),
            raw_response: row.raw_response,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

const PLAN_COLUMNS: &str = "id, name, price_minor, provider_product_id, provider_price_id";
const LEDGER_COLUMNS: &str = "user_id, plan_id, provider_ref, status, version, created_at, updated_at";
/// Prefix hashed with the user id into the advisory lock key
const USER_LOCK_NAMESPACE: &str = "subledger:plan_change:";

const PAYMENT_COLUMNS: &str = "id, user_id, plan_id, kind, transaction_ref, source_transaction_ref, \
     amount_minor, raw_response, status, created_at";

/// Billing store backed by PostgreSQL
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
    locks: Arc<UserLocks>,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(UserLocks::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the billing schema migrations
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(format!("Migration failed: {}", e)))
    }

    async fn write_entry(
        tx: &mut Transaction<'_, Postgres>,
        write: &LedgerWrite,
    ) -> BillingResult<SubscriptionLedgerEntry> {
        let row: Option<LedgerRow> = match write.expected_version {
            Some(version) => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE subscription_ledger SET
                        plan_id = $1,
                        provider_ref = $2,
                        status = $3,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE user_id = $4 AND version = $5
                    RETURNING {}
                    "#,
                    LEDGER_COLUMNS
                ))
                .bind(write.plan_id)
                .bind(&write.provider_ref)
                .bind(write.status.as_str())
                .bind(write.user_id)
                .bind(version)
                .fetch_optional(&mut **tx)
                .await?
            }
            None => {
                // The primary key rejects a second first-subscription for the user
                sqlx::query_as(&format!(
                    r#"
                    INSERT INTO subscription_ledger (user_id, plan_id, provider_ref, status, version)
                    VALUES ($1, $2, $3, $4, 1)
                    ON CONFLICT (user_id) DO NOTHING
                    RETURNING {}
                    "#,
                    LEDGER_COLUMNS
                ))
                .bind(write.user_id)
                .bind(write.plan_id)
                .bind(&write.provider_ref)
                .bind(write.status.as_str())
                .fetch_optional(&mut **tx)
                .await?
            }
        };

        match row {
            Some(row) => row.try_into(),
            None => Err(BillingError::ConcurrentModification(format!(
                "Subscription of user {} was modified by another process. Please retry.",
                write.user_id
            ))),
        }
    }

    async fn insert_record<'e, E>(executor: E, record: NewPaymentRecord) -> BillingResult<PaymentRecord>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_records
                (id, user_id, plan_id, kind, transaction_ref, source_transaction_ref,
                 amount_minor, raw_response, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(record.user_id)
        .bind(record.plan_id)
        .bind(record.kind.as_str())
        .bind(&record.transaction_ref)
        .bind(&record.source_transaction_ref)
        .bind(record.amount.minor_units())
        .bind(&record.raw_response)
        .bind(record.status.as_str())
        .fetch_one(executor)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl PlanCatalog for PgBillingStore {
    async fn find_plan_by_provider_product_id(
        &self,
        product_id: &str,
    ) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans WHERE provider_product_id = $1",
            PLAN_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Plan::from))
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans ORDER BY price_minor, name",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Plan::from).collect())
    }
}

#[async_trait]
impl SubscriptionLedger for PgBillingStore {
    async fn get_active_entry(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionLedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_ledger WHERE user_id = $1 AND status = $2",
            LEDGER_COLUMNS
        ))
        .bind(user_id)
        .bind(LedgerStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionLedgerEntry::try_from).transpose()
    }

    async fn get_entry(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionLedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_ledger WHERE user_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionLedgerEntry::try_from).transpose()
    }

    async fn upsert_entry(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider_ref: &str,
        status: LedgerStatus,
    ) -> BillingResult<SubscriptionLedgerEntry> {
        let row: LedgerRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscription_ledger (user_id, plan_id, provider_ref, status, version)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                provider_ref = EXCLUDED.provider_ref,
                status = EXCLUDED.status,
                version = subscription_ledger.version + 1,
                updated_at = NOW()
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(user_id)
        .bind(plan_id)
        .bind(provider_ref)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl PaymentRecordLog for PgBillingStore {
    async fn append(&self, record: NewPaymentRecord) -> BillingResult<PaymentRecord> {
        Self::insert_record(&self.pool, record).await
    }

    async fn latest_charge(&self, user_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payment_records
            WHERE user_id = $1 AND kind = 'charge' AND status = 'success'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn charge_recorded(&self, transaction_ref: &str) -> BillingResult<bool> {
        let recorded: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payment_records WHERE kind = 'charge' AND transaction_ref = $1)",
        )
        .bind(transaction_ref)
        .fetch_one(&self.pool)
        .await?;

        Ok(recorded)
    }

    async fn refunded_total(&self, charge_ref: &str) -> BillingResult<Money> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0)::BIGINT
            FROM payment_records
            WHERE kind = 'refund' AND status = 'success' AND source_transaction_ref = $1
            "#,
        )
        .bind(charge_ref)
        .fetch_one(&self.pool)
        .await?;

        Ok(Money::from_minor(total))
    }

    async fn history_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_records WHERE user_id = $1 ORDER BY created_at DESC",
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentRecord::try_from).collect()
    }
}

#[async_trait]
impl CustomerDirectory for PgBillingStore {
    async fn get_customer_ref(&self, user_id: Uuid) -> BillingResult<Option<CustomerRef>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT provider_customer_id FROM billing_customers WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(id.map(CustomerRef::new))
    }

    async fn save_customer_ref(
        &self,
        user_id: Uuid,
        customer: &CustomerRef,
        profile: &CustomerProfile,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (user_id, provider_customer_id, email, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                provider_customer_id = EXCLUDED.provider_customer_id,
                email = EXCLUDED.email,
                name = EXCLUDED.name,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer.as_str())
        .bind(&profile.email)
        .bind(&profile.name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn lock_user(&self, user_id: Uuid) -> BillingResult<UserLease> {
        // Local waiters queue here without holding a pooled connection
        let local = self.locks.acquire(user_id).await;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}{}", USER_LOCK_NAMESPACE, user_id))
            .execute(&mut *tx)
            .await?;

        tracing::debug!(user_id = %user_id, "Acquired plan change lock");

        // Dropping the lease rolls the transaction back, releasing the lock
        Ok(UserLease::new((local, tx)))
    }

    async fn commit_plan_change(
        &self,
        ledger: LedgerWrite,
        record: NewPaymentRecord,
    ) -> BillingResult<(SubscriptionLedgerEntry, PaymentRecord)> {
        let mut tx = self.pool.begin().await?;

        let entry = Self::write_entry(&mut tx, &ledger).await?;
        let record = Self::insert_record(&mut *tx, record).await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %entry.user_id,
            plan_id = %entry.plan_id,
            version = entry.version,
            kind = record.kind.as_str(),
            "Committed plan change"
        );

        Ok((entry, record))
    }
}
