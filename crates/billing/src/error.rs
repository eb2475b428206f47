//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Payment was declined or rejected: {0}")]
    GatewayValidation(String),

    /// Raised by gateways when the underlying charge has no refundable balance left.
    /// The reconciliation engine absorbs it; callers never see it from `change_plan`.
    #[error("Charge {0} has already been refunded")]
    AlreadyRefunded(String),

    #[error("Amount {amount_minor} is below the minimum chargeable amount {minimum_minor}")]
    AmountBelowMinimum {
        amount_minor: i64,
        minimum_minor: i64,
    },

    #[error("Payment {transaction_ref} requires additional action")]
    RequiresAction {
        transaction_ref: String,
        client_secret: Option<String>,
    },

    #[error("Payment {0} is still processing")]
    PaymentPending(String),

    #[error("Charge failed with status '{status}'")]
    ChargeFailed {
        transaction_ref: String,
        status: String,
    },

    #[error(
        "Charge {transaction_ref} of {amount_minor} for user {user_id} succeeded but could not be recorded: {detail}"
    )]
    InconsistentWriteAfterCharge {
        user_id: Uuid,
        transaction_ref: String,
        amount_minor: i64,
        detail: String,
    },

    #[error(
        "Refund {transaction_ref} of {amount_minor} for user {user_id} succeeded but could not be recorded: {detail}"
    )]
    InconsistentWriteAfterRefund {
        user_id: Uuid,
        transaction_ref: String,
        amount_minor: i64,
        detail: String,
    },

    /// The intent the client authenticated cannot settle this plan change
    #[error("Confirmed intent does not match the plan change: {0}")]
    IntentMismatch(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    /// Money moved at the gateway but the local ledger/log does not reflect it.
    /// These need manual reconciliation, not a retry.
    pub fn is_operational_alert(&self) -> bool {
        matches!(
            self,
            BillingError::InconsistentWriteAfterCharge { .. }
                | BillingError::InconsistentWriteAfterRefund { .. }
        )
    }

    /// Message safe to show to the end user
    pub fn user_message(&self) -> String {
        match self {
            BillingError::PlanNotFound(_) => "Invalid plan selected.".to_string(),
            BillingError::GatewayValidation(msg) => format!("Payment error: {}", msg),
            BillingError::AmountBelowMinimum { .. } => {
                "The payment amount is too small to process.".to_string()
            }
            BillingError::RequiresAction { .. } => {
                "Additional authentication is required to complete this payment.".to_string()
            }
            BillingError::PaymentPending(_) => {
                "Your payment is still processing. Please check back shortly.".to_string()
            }
            BillingError::ChargeFailed { .. } => "Your payment could not be completed.".to_string(),
            BillingError::InconsistentWriteAfterCharge { .. }
            | BillingError::InconsistentWriteAfterRefund { .. } => {
                "Your payment was processed but your plan could not be updated. Our team has been notified."
                    .to_string()
            }
            BillingError::IntentMismatch(_) => {
                "The confirmed payment does not match this plan change. Please start again."
                    .to_string()
            }
            BillingError::ConcurrentModification(_) => {
                "Another plan change is in progress. Please retry.".to_string()
            }
            BillingError::AlreadyRefunded(_)
            | BillingError::InvalidInput(_)
            | BillingError::StripeApi(_)
            | BillingError::Database(_)
            | BillingError::Config(_) => "Error updating subscription. Please try again.".to_string(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}
