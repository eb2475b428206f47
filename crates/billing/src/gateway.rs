//! Payment gateway port
//!
//! Provider-agnostic view of the operations plan changes need. The Stripe
//! adapter lives in `stripe_gateway`; tests use scripted fakes.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::BillingError;
use crate::money::Money;

/// Gateway customer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CustomerRef(pub String);

impl CustomerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gateway payment method identifier supplied by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PaymentMethodRef(pub String);

impl PaymentMethodRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaymentMethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Succeeded,
    RequiresAction,
    Processing,
    Failed,
}

/// A synchronous, confirmed charge
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer: CustomerRef,
    pub payment_method: PaymentMethodRef,
    pub amount: Money,
    pub currency: String,
    pub description: String,
    /// Forwarded to the provider so a resubmitted request cannot charge twice
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub transaction_ref: String,
    pub status: ChargeStatus,
    pub amount: Money,
    /// Customer the provider holds the charge against
    pub customer: Option<CustomerRef>,
    /// Present when the client must complete an extra step (3-D Secure)
    pub client_secret: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub transaction_ref: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    Succeeded,
    RequiresAction,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub setup_ref: String,
    pub status: SetupStatus,
    pub customer: Option<CustomerRef>,
    pub client_secret: Option<String>,
    pub raw: serde_json::Value,
}

/// Provider-side state of a recurring subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Billing normally (including trials)
    Active,
    /// Created or changed, but the first or latest invoice is not paid yet
    Pending,
    /// Expired, canceled or unpaid
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    pub subscription_ref: String,
    pub status: SubscriptionStatus,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The charge has no refundable balance left on the provider side
    #[error("charge {0} has already been refunded")]
    AlreadyRefunded(String),

    /// Declined card, invalid request, and similar caller-facing failures
    #[error("{0}")]
    Validation(String),

    /// Transport or provider-side failure
    #[error("{0}")]
    Api(String),
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::AlreadyRefunded(charge) => BillingError::AlreadyRefunded(charge),
            GatewayError::Validation(msg) => BillingError::GatewayValidation(msg),
            GatewayError::Api(msg) => BillingError::StripeApi(msg),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, email: &str, name: &str) -> GatewayResult<CustomerRef>;

    /// Attach the method to the customer and make it the invoice default
    async fn attach_payment_method(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
    ) -> GatewayResult<()>;

    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<ChargeOutcome>;

    /// Current state of an earlier charge, e.g. after the client finished 3-D Secure
    async fn retrieve_charge(&self, transaction_ref: &str) -> GatewayResult<ChargeOutcome>;

    /// Refund part of a previous charge. Fails with `AlreadyRefunded` when the
    /// charge has nothing left to refund.
    async fn refund(&self, transaction_ref: &str, amount: Money) -> GatewayResult<RefundOutcome>;

    /// Register the method for future use without charging
    async fn create_setup_intent(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
    ) -> GatewayResult<SetupOutcome>;

    async fn retrieve_setup_intent(&self, setup_ref: &str) -> GatewayResult<SetupOutcome>;

    /// Start recurring billing for the customer on a provider price
    async fn create_subscription(
        &self,
        customer: &CustomerRef,
        price_id: &str,
        idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome>;

    /// Move an existing subscription to another price, prorating the difference
    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome>;
}
