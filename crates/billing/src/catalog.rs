//! Plan catalog lookups
//!
//! Plans are published by the admin workflow together with their Stripe
//! product/price identifiers. Billing only ever reads them.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::money::Money;

/// A published subscription plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price: Money,
    /// Stripe product ID; the key callers use to select a plan
    pub provider_product_id: String,
    /// Stripe price ID
    pub provider_price_id: String,
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    /// Resolve a plan from the gateway-side product identifier
    async fn find_plan_by_provider_product_id(&self, product_id: &str)
        -> BillingResult<Option<Plan>>;

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    /// All published plans, cheapest first
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;
}
