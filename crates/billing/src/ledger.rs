//! Subscription ledger: the current plan of each user
//!
//! One row per user. A plan change overwrites the row rather than adding a new
//! one, so plan history has to be read from the payment record log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Active,
    Pending,
    Canceled,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Active => "active",
            LedgerStatus::Pending => "pending",
            LedgerStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LedgerStatus::Active),
            "pending" => Ok(LedgerStatus::Pending),
            "canceled" => Ok(LedgerStatus::Canceled),
            other => Err(BillingError::Database(format!(
                "Unknown ledger status '{}'",
                other
            ))),
        }
    }
}

/// A user's current subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionLedgerEntry {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    /// Last gateway object that moved money or established billing
    /// (payment intent or setup intent ID)
    pub provider_ref: String,
    pub status: LedgerStatus,
    /// Bumped on every write; used for optimistic locking
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Desired ledger state after a plan change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub provider_ref: String,
    pub status: LedgerStatus,
    /// Version observed when the change was decided. `None` means no row
    /// existed and one must be inserted.
    pub expected_version: Option<i64>,
}

#[async_trait]
pub trait SubscriptionLedger: Send + Sync {
    async fn get_active_entry(&self, user_id: Uuid)
        -> BillingResult<Option<SubscriptionLedgerEntry>>;

    /// The user's row whatever its status
    async fn get_entry(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionLedgerEntry>>;

    /// Create the user's row or overwrite plan/ref/status on the existing one.
    ///
    /// Only call after the gateway has confirmed the corresponding money
    /// movement (or a deliberate no-charge transition).
    async fn upsert_entry(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider_ref: &str,
        status: LedgerStatus,
    ) -> BillingResult<SubscriptionLedgerEntry>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            LedgerStatus::Active,
            LedgerStatus::Pending,
            LedgerStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<LedgerStatus>().unwrap(), status);
        }
        assert!("trialing".parse::<LedgerStatus>().is_err());
    }
}
