// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::RequiresAction carries the client secret
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger Billing Module
//!
//! Reconciles subscription plan changes against Stripe.
//!
//! ## Features
//!
//! - **Plan Changes**: Charge the price difference on upgrades, refund it on downgrades
//! - **Refund Policy**: Refunds capped at the last charge and limited to a fixed window
//! - **Idempotent Refunds**: A charge Stripe already refunded converges to the same local state
//! - **Minimum Charge**: Sub-minimum amounts are rejected before Stripe is contacted
//! - **Atomic Bookkeeping**: Ledger and payment log are written together, after the gateway confirms
//! - **Serialized Per User**: One plan change per user at a time, across every replica
//! - **3-D Secure Resumption**: An authenticated intent is recorded instead of charged twice
//! - **Recurring Mode**: Optionally keep a Stripe subscription on the plan's price with proration
//! - **Invariants**: Scheduled consistency checks over ledger, log and customers

pub mod catalog;
pub mod client;
pub mod customer;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod locks;
pub mod memory;
pub mod money;
pub mod payments;
pub mod postgres;
pub mod reconcile;
pub mod store;
pub mod stripe_gateway;

#[cfg(test)]
mod testing;

// Catalog
pub use catalog::{Plan, PlanCatalog};

// Client
pub use client::{BillingMode, StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerDirectory, CustomerProfile, CustomerService};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ChargeOutcome, ChargeRequest, ChargeStatus, CustomerRef, GatewayError, PaymentGateway,
    PaymentMethodRef, RefundOutcome, SetupOutcome, SetupStatus, SubscriptionOutcome,
    SubscriptionStatus,
};
pub use stripe_gateway::StripeGateway;

// Ledger
pub use ledger::{LedgerStatus, LedgerWrite, SubscriptionLedger, SubscriptionLedgerEntry};

// Money
pub use money::Money;

// Payments
pub use payments::{NewPaymentRecord, PaymentKind, PaymentRecord, PaymentRecordLog, PaymentStatus};

// Reconciliation
pub use reconcile::{
    PlanChangeKind, PlanChangeOutcome, PlanChangeRequest, PlanChangeResponse,
    ReconciliationEngine, ReconciliationPolicy, RefundSkipReason, ResponseOutcome, Transition,
};

// Store
pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;
pub use store::{BillingStore, UserLease};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub reconciliation: Arc<ReconciliationEngine>,
    pub customers: CustomerService,
    pub invariants: InvariantChecker,
    pub store: Arc<PgBillingStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let policy = ReconciliationPolicy::from(&config);
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(StripeGateway::new(StripeClient::new(config)));
        let store = Arc::new(PgBillingStore::new(pool.clone()));

        Self {
            reconciliation: Arc::new(ReconciliationEngine::new(
                store.clone(),
                Arc::clone(&gateway),
                policy,
            )),
            customers: CustomerService::new(store.clone(), gateway),
            invariants: InvariantChecker::new(pool),
            store,
        }
    }

    /// Change the user's plan and shape the result for the HTTP boundary
    pub async fn change_plan(&self, request: PlanChangeRequest) -> PlanChangeResponse {
        let user_id = request.user_id;
        let result = self.reconciliation.change_plan(request).await;
        if let Err(e) = &result {
            if !e.is_operational_alert() {
                tracing::warn!(user_id = %user_id, error = %e, "Plan change rejected");
            }
        }
        result.into()
    }

    /// Payment history for a user, newest first
    pub async fn payment_history(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        self.reconciliation.payment_history(user_id).await
    }

    /// Published plans, cheapest first
    pub async fn plans(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans().await
    }
}
