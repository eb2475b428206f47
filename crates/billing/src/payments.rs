//! Payment record log
//!
//! Append-only history of money movement. Every committed plan change writes
//! exactly one record: a charge, a refund, a zero-amount no-charge entry, or
//! a subscription change whose money moves through the provider's invoices.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Charge,
    Refund,
    NoCharge,
    Subscription,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Charge => "charge",
            PaymentKind::Refund => "refund",
            PaymentKind::NoCharge => "no_charge",
            PaymentKind::Subscription => "subscription",
        }
    }
}

impl std::str::FromStr for PaymentKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(PaymentKind::Charge),
            "refund" => Ok(PaymentKind::Refund),
            "no_charge" => Ok(PaymentKind::NoCharge),
            "subscription" => Ok(PaymentKind::Subscription),
            other => Err(BillingError::Database(format!(
                "Unknown payment kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(BillingError::Database(format!(
                "Unknown payment status '{}'",
                other
            ))),
        }
    }
}

/// A persisted payment record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub kind: PaymentKind,
    /// Gateway object that moved the money (payment intent, refund, setup
    /// intent, subscription)
    pub transaction_ref: String,
    /// For refunds: the charge the refund was issued against
    pub source_transaction_ref: Option<String>,
    pub amount: Money,
    /// Gateway response, stored verbatim
    pub raw_response: serde_json::Value,
    pub status: PaymentStatus,
    pub created_at: OffsetDateTime,
}

impl PaymentRecord {
    /// Whole days elapsed between this record and `now`
    pub fn age_in_days(&self, now: OffsetDateTime) -> i64 {
        (now - self.created_at).whole_days()
    }
}

/// A record about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentRecord {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub kind: PaymentKind,
    pub transaction_ref: String,
    pub source_transaction_ref: Option<String>,
    pub amount: Money,
    pub raw_response: serde_json::Value,
    pub status: PaymentStatus,
}

impl NewPaymentRecord {
    pub fn charge(
        user_id: Uuid,
        plan_id: Uuid,
        transaction_ref: &str,
        amount: Money,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            plan_id,
            kind: PaymentKind::Charge,
            transaction_ref: transaction_ref.to_string(),
            source_transaction_ref: None,
            amount,
            raw_response,
            status: PaymentStatus::Success,
        }
    }

    pub fn refund(
        user_id: Uuid,
        plan_id: Uuid,
        transaction_ref: &str,
        refunded_charge_ref: &str,
        amount: Money,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            plan_id,
            kind: PaymentKind::Refund,
            transaction_ref: transaction_ref.to_string(),
            source_transaction_ref: Some(refunded_charge_ref.to_string()),
            amount,
            raw_response,
            status: PaymentStatus::Success,
        }
    }

    pub fn no_charge(
        user_id: Uuid,
        plan_id: Uuid,
        transaction_ref: &str,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            plan_id,
            kind: PaymentKind::NoCharge,
            transaction_ref: transaction_ref.to_string(),
            source_transaction_ref: None,
            amount: Money::ZERO,
            raw_response,
            status: PaymentStatus::Success,
        }
    }

    /// Subscription created or moved to another price; the provider invoices it
    pub fn subscription(
        user_id: Uuid,
        plan_id: Uuid,
        subscription_ref: &str,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            plan_id,
            kind: PaymentKind::Subscription,
            transaction_ref: subscription_ref.to_string(),
            source_transaction_ref: None,
            amount: Money::ZERO,
            raw_response,
            status: PaymentStatus::Success,
        }
    }
}

#[async_trait]
pub trait PaymentRecordLog: Send + Sync {
    async fn append(&self, record: NewPaymentRecord) -> BillingResult<PaymentRecord>;

    /// Most recent successful charge for the user
    async fn latest_charge(&self, user_id: Uuid) -> BillingResult<Option<PaymentRecord>>;

    /// Whether a charge with this gateway reference is already in the log
    async fn charge_recorded(&self, transaction_ref: &str) -> BillingResult<bool>;

    /// Sum of successful refunds recorded against a charge
    async fn refunded_total(&self, charge_ref: &str) -> BillingResult<Money>;

    /// Full history for the user, newest first
    async fn history_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>>;
}
