//! Billing Invariants Module
//!
//! Runnable consistency checks between the subscription ledger, the payment
//! log, and the customer directory. The worker runs them on a schedule; they
//! can also be run by hand after a manual repair.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::money::Money;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money moved that the books cannot account for
    Critical,
    /// High - ledger and log disagree
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity among the violations
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations
            .iter()
            .map(|v| v.severity)
            .min_by_key(|s| match s {
                ViolationSeverity::Critical => 0,
                ViolationSeverity::High => 1,
                ViolationSeverity::Medium => 2,
                ViolationSeverity::Low => 3,
            })
    }
}

/// Row type for over-refunded charge violation
#[derive(Debug, sqlx::FromRow)]
struct OverRefundRow {
    user_id: Uuid,
    transaction_ref: String,
    charged_minor: i64,
    refunded_minor: i64,
}

/// Row type for ledger reference without a matching payment record
#[derive(Debug, sqlx::FromRow)]
struct UnrecordedRefRow {
    user_id: Uuid,
    plan_id: Uuid,
    provider_ref: String,
}

/// Row type for paid subscription without any successful charge
#[derive(Debug, sqlx::FromRow)]
struct UnpaidEntryRow {
    user_id: Uuid,
    plan_name: String,
    price_minor: i64,
}

/// Row type for missing gateway customer violation
#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: Uuid,
    plan_name: String,
}

/// Row type for a no-charge record that carries an amount
#[derive(Debug, sqlx::FromRow)]
struct NoChargeAmountRow {
    id: Uuid,
    user_id: Uuid,
    amount_minor: i64,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_refunds_within_charges().await?);
        violations.extend(self.check_ledger_ref_recorded().await?);
        violations.extend(self.check_paid_entry_has_charge().await?);
        violations.extend(self.check_gateway_customer_exists().await?);
        violations.extend(self.check_no_charge_has_zero_amount().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: Refunds never exceed the charge they were issued against
    async fn check_refunds_within_charges(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRefundRow> = sqlx::query_as(
            r#"
            SELECT
                c.user_id,
                c.transaction_ref,
                c.amount_minor AS charged_minor,
                SUM(r.amount_minor)::BIGINT AS refunded_minor
            FROM payment_records c
            JOIN payment_records r
              ON r.source_transaction_ref = c.transaction_ref
             AND r.kind = 'refund'
             AND r.status = 'success'
            WHERE c.kind = 'charge' AND c.status = 'success'
            GROUP BY c.id, c.user_id, c.transaction_ref, c.amount_minor
            HAVING SUM(r.amount_minor) > c.amount_minor
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_within_charges".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Charge {} of {} has {} refunded against it",
                    row.transaction_ref,
                    Money::from_minor(row.charged_minor),
                    Money::from_minor(row.refunded_minor)
                ),
                context: serde_json::json!({
                    "transaction_ref": row.transaction_ref,
                    "charged_minor": row.charged_minor,
                    "refunded_minor": row.refunded_minor,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: The ledger's provider reference appears in the user's log
    ///
    /// Ledger and log are written together, so a reference the log has never
    /// seen means one of the writes was lost or made by hand.
    async fn check_ledger_ref_recorded(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnrecordedRefRow> = sqlx::query_as(
            r#"
            SELECT l.user_id, l.plan_id, l.provider_ref
            FROM subscription_ledger l
            WHERE l.status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM payment_records p
                  WHERE p.user_id = l.user_id
                    AND p.transaction_ref = l.provider_ref
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_ref_recorded".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription references '{}' but no payment record has it",
                    row.provider_ref
                ),
                context: serde_json::json!({
                    "plan_id": row.plan_id,
                    "provider_ref": row.provider_ref,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Users on a paid plan were charged or subscribed at least once
    async fn check_paid_entry_has_charge(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpaidEntryRow> = sqlx::query_as(
            r#"
            SELECT l.user_id, p.name AS plan_name, p.price_minor
            FROM subscription_ledger l
            JOIN plans p ON p.id = l.plan_id
            WHERE l.status = 'active'
              AND p.price_minor > 0
              AND NOT EXISTS (
                  SELECT 1 FROM payment_records r
                  WHERE r.user_id = l.user_id
                    AND r.kind IN ('charge', 'subscription')
                    AND r.status = 'success'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_entry_has_charge".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User is on paid plan '{}' ({}) without any successful charge or subscription",
                    row.plan_name,
                    Money::from_minor(row.price_minor)
                ),
                context: serde_json::json!({
                    "plan_name": row.plan_name,
                    "price_minor": row.price_minor,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Users on a paid plan have a gateway customer
    async fn check_gateway_customer_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT l.user_id, p.name AS plan_name
            FROM subscription_ledger l
            JOIN plans p ON p.id = l.plan_id
            LEFT JOIN billing_customers c ON c.user_id = l.user_id
            WHERE l.status = 'active'
              AND p.price_minor > 0
              AND c.user_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "gateway_customer_exists".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User on plan '{}' has no gateway customer",
                    row.plan_name
                ),
                context: serde_json::json!({
                    "plan_name": row.plan_name,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: No-charge records move no money
    async fn check_no_charge_has_zero_amount(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NoChargeAmountRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount_minor
            FROM payment_records
            WHERE kind = 'no_charge' AND amount_minor <> 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_charge_has_zero_amount".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "No-charge record {} carries an amount of {}",
                    row.id,
                    Money::from_minor(row.amount_minor)
                ),
                context: serde_json::json!({
                    "record_id": row.id,
                    "amount_minor": row.amount_minor,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "refunds_within_charges" => self.check_refunds_within_charges().await,
            "ledger_ref_recorded" => self.check_ledger_ref_recorded().await,
            "paid_entry_has_charge" => self.check_paid_entry_has_charge().await,
            "gateway_customer_exists" => self.check_gateway_customer_exists().await,
            "no_charge_has_zero_amount" => self.check_no_charge_has_zero_amount().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "refunds_within_charges",
            "ledger_ref_recorded",
            "paid_entry_has_charge",
            "gateway_customer_exists",
            "no_charge_has_zero_amount",
        ]
    }
}
