//! Gateway customer management

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::{CustomerRef, PaymentGateway};
use crate::store::BillingStore;

/// Contact details of the authenticated user, used when the gateway customer
/// is created for the first time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerProfile {
    pub email: String,
    pub name: String,
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn get_customer_ref(&self, user_id: Uuid) -> BillingResult<Option<CustomerRef>>;

    async fn save_customer_ref(
        &self,
        user_id: Uuid,
        customer: &CustomerRef,
        profile: &CustomerProfile,
    ) -> BillingResult<()>;
}

/// Customer service for resolving gateway customers
#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Return the user's gateway customer, creating it on first use.
    ///
    /// Callers must hold the user's reconciliation lock so two requests cannot
    /// both create a customer.
    pub async fn ensure_customer(
        &self,
        user_id: Uuid,
        profile: &CustomerProfile,
    ) -> BillingResult<CustomerRef> {
        if let Some(existing) = self.store.get_customer_ref(user_id).await? {
            return Ok(existing);
        }

        let customer = self
            .gateway
            .create_customer(&profile.email, &profile.name)
            .await?;

        self.store
            .save_customer_ref(user_id, &customer, profile)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer,
            "Created gateway customer"
        );

        Ok(customer)
    }
}
