//! Persistence port combining catalog, ledger, log and customer directory

use async_trait::async_trait;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::customer::CustomerDirectory;
use crate::error::BillingResult;
use crate::ledger::{LedgerWrite, SubscriptionLedger, SubscriptionLedgerEntry};
use crate::payments::{NewPaymentRecord, PaymentRecord, PaymentRecordLog};

/// Exclusive hold on one user's billing state, released when dropped
pub struct UserLease {
    _held: Box<dyn Send>,
}

impl UserLease {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for UserLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UserLease")
    }
}

/// Everything the reconciliation engine reads and writes
#[async_trait]
pub trait BillingStore:
    PlanCatalog + SubscriptionLedger + PaymentRecordLog + CustomerDirectory
{
    /// Wait until no other plan change for the user is in flight, on any
    /// process sharing this store, and hold that until the lease is dropped.
    async fn lock_user(&self, user_id: Uuid) -> BillingResult<UserLease>;

    /// Apply the ledger write and append the record as one unit: either both
    /// are visible afterwards or neither is.
    ///
    /// Fails with `ConcurrentModification` when the ledger row no longer has
    /// `ledger.expected_version`.
    async fn commit_plan_change(
        &self,
        ledger: LedgerWrite,
        record: NewPaymentRecord,
    ) -> BillingResult<(SubscriptionLedgerEntry, PaymentRecord)>;
}
