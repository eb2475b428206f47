//! Stripe implementation of the payment gateway port

use async_trait::async_trait;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePaymentIntent, CreateRefund, CreateSetupIntent,
    CreateSubscription, CreateSubscriptionItems, Currency, Customer, CustomerId,
    CustomerInvoiceSettings, Expandable, PaymentIntent, PaymentIntentId, PaymentIntentStatus,
    PaymentMethod, PaymentMethodId, Refund, RequestStrategy, SetupIntent, SetupIntentId,
    SetupIntentStatus, StripeError, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateCustomer, UpdateSubscription,
    UpdateSubscriptionItems,
};

use crate::client::StripeClient;
use crate::gateway::{
    ChargeOutcome, ChargeRequest, ChargeStatus, CustomerRef, GatewayError, GatewayResult,
    PaymentGateway, PaymentMethodRef, RefundOutcome, SetupOutcome, SetupStatus,
    SubscriptionOutcome, SubscriptionStatus,
};
use crate::money::Money;

const ALREADY_REFUNDED_MESSAGE: &str = "has already been refunded";

/// Payment gateway backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn currency(code: &str) -> GatewayResult<Currency> {
        serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
            .map_err(|e| GatewayError::Validation(format!("Unsupported currency '{}': {}", code, e)))
    }

    fn customer_id(customer: &CustomerRef) -> GatewayResult<CustomerId> {
        Self::parse_id(customer.as_str(), "customer")
    }

    fn payment_method_id(method: &PaymentMethodRef) -> GatewayResult<PaymentMethodId> {
        Self::parse_id(method.as_str(), "payment method")
    }

    fn parse_id<T>(value: &str, what: &str) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        value
            .parse()
            .map_err(|e| GatewayError::Validation(format!("Invalid {} ID: {}", what, e)))
    }

    /// Client whose requests carry the caller's idempotency key. No retries:
    /// the key only protects against a caller resubmitting.
    fn idempotent_client(&self, key: &str) -> stripe::Client {
        self.stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }

    fn customer_ref(customer: Option<&Expandable<Customer>>) -> Option<CustomerRef> {
        customer.map(|c| CustomerRef::new(c.id().to_string()))
    }

    fn charge_outcome(intent: &PaymentIntent) -> ChargeOutcome {
        let status = match intent.status {
            PaymentIntentStatus::Succeeded => ChargeStatus::Succeeded,
            PaymentIntentStatus::RequiresAction | PaymentIntentStatus::RequiresConfirmation => {
                ChargeStatus::RequiresAction
            }
            PaymentIntentStatus::Processing | PaymentIntentStatus::RequiresCapture => {
                ChargeStatus::Processing
            }
            _ => ChargeStatus::Failed,
        };

        ChargeOutcome {
            transaction_ref: intent.id.to_string(),
            status,
            amount: Money::from_minor(intent.amount),
            customer: Self::customer_ref(intent.customer.as_ref()),
            client_secret: intent.client_secret.clone(),
            raw: Self::to_raw(intent),
        }
    }

    fn setup_outcome(intent: &SetupIntent) -> SetupOutcome {
        let status = match intent.status {
            SetupIntentStatus::Succeeded | SetupIntentStatus::Processing => SetupStatus::Succeeded,
            SetupIntentStatus::RequiresAction | SetupIntentStatus::RequiresConfirmation => {
                SetupStatus::RequiresAction
            }
            _ => SetupStatus::Failed,
        };

        SetupOutcome {
            setup_ref: intent.id.to_string(),
            status,
            customer: Self::customer_ref(intent.customer.as_ref()),
            client_secret: intent.client_secret.clone(),
            raw: Self::to_raw(intent),
        }
    }

    fn subscription_outcome(subscription: &Subscription) -> SubscriptionOutcome {
        let status = match subscription.status {
            StripeSubStatus::Active | StripeSubStatus::Trialing => SubscriptionStatus::Active,
            StripeSubStatus::Incomplete | StripeSubStatus::PastDue => SubscriptionStatus::Pending,
            _ => SubscriptionStatus::Failed,
        };

        SubscriptionOutcome {
            subscription_ref: subscription.id.to_string(),
            status,
            raw: Self::to_raw(subscription),
        }
    }

    fn to_raw<T: serde::Serialize>(value: &T) -> serde_json::Value {
        serde_json::to_value(value).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to serialize Stripe response");
            serde_json::Value::Null
        })
    }

    /// Translate a Stripe error into the gateway taxonomy
    fn map_error(err: StripeError, charge_ref: Option<&str>) -> GatewayError {
        match err {
            StripeError::Stripe(request_error) => {
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Stripe rejected the request".to_string());

                let already_refunded = matches!(
                    request_error.code,
                    Some(stripe::ErrorCode::ChargeAlreadyRefunded)
                ) || message.contains(ALREADY_REFUNDED_MESSAGE);

                if already_refunded {
                    return GatewayError::AlreadyRefunded(
                        charge_ref.unwrap_or_default().to_string(),
                    );
                }

                match request_error.http_status {
                    400 | 402 | 404 => GatewayError::Validation(message),
                    _ => GatewayError::Api(message),
                }
            }
            other => GatewayError::Api(other.to_string()),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, email: &str, name: &str) -> GatewayResult<CustomerRef> {
        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = Some(name);

        let customer = Customer::create(self.stripe.inner(), params)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(CustomerRef::new(customer.id.to_string()))
    }

    async fn attach_payment_method(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
    ) -> GatewayResult<()> {
        let customer_id = Self::customer_id(customer)?;
        let method_id = Self::payment_method_id(method)?;

        PaymentMethod::attach(
            self.stripe.inner(),
            &method_id,
            AttachPaymentMethod {
                customer: customer_id.clone(),
            },
        )
        .await
        .map_err(|e| Self::map_error(e, None))?;

        let mut update = UpdateCustomer::new();
        update.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(method_id.to_string()),
            ..Default::default()
        });
        Customer::update(self.stripe.inner(), &customer_id, update)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(())
    }

    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<ChargeOutcome> {
        let currency = Self::currency(&request.currency)?;
        let mut params = CreatePaymentIntent::new(request.amount.minor_units(), currency);
        params.customer = Some(Self::customer_id(&request.customer)?);
        params.payment_method = Some(Self::payment_method_id(&request.payment_method)?);
        params.confirm = Some(true);
        params.description = Some(request.description.as_str());
        params.return_url = self.stripe.config().return_url.as_deref();

        let client = self.idempotent_client(&request.idempotency_key);
        let intent = PaymentIntent::create(&client, params)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::charge_outcome(&intent))
    }

    async fn retrieve_charge(&self, transaction_ref: &str) -> GatewayResult<ChargeOutcome> {
        let intent_id: PaymentIntentId = Self::parse_id(transaction_ref, "payment intent")?;

        let intent = PaymentIntent::retrieve(self.stripe.inner(), &intent_id, &[])
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::charge_outcome(&intent))
    }

    async fn refund(&self, transaction_ref: &str, amount: Money) -> GatewayResult<RefundOutcome> {
        let intent_id: PaymentIntentId = Self::parse_id(transaction_ref, "payment intent")?;

        let mut params = CreateRefund::new();
        params.payment_intent = Some(intent_id);
        params.amount = Some(amount.minor_units());

        let refund = Refund::create(self.stripe.inner(), params)
            .await
            .map_err(|e| Self::map_error(e, Some(transaction_ref)))?;

        let raw = Self::to_raw(&refund);
        let status = raw
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("pending");

        if status == "failed" || status == "canceled" {
            return Err(GatewayError::Validation(format!(
                "Refund {} ended with status '{}'",
                refund.id, status
            )));
        }

        Ok(RefundOutcome {
            transaction_ref: refund.id.to_string(),
            raw,
        })
    }

    async fn create_setup_intent(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
    ) -> GatewayResult<SetupOutcome> {
        let mut params = CreateSetupIntent::new();
        params.customer = Some(Self::customer_id(customer)?);
        params.payment_method = Some(Self::payment_method_id(method)?);
        params.confirm = Some(true);
        params.return_url = self.stripe.config().return_url.as_deref();

        let intent = SetupIntent::create(self.stripe.inner(), params)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::setup_outcome(&intent))
    }

    async fn retrieve_setup_intent(&self, setup_ref: &str) -> GatewayResult<SetupOutcome> {
        let intent_id: SetupIntentId = Self::parse_id(setup_ref, "setup intent")?;

        let intent = SetupIntent::retrieve(self.stripe.inner(), &intent_id, &[])
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::setup_outcome(&intent))
    }

    async fn create_subscription(
        &self,
        customer: &CustomerRef,
        price_id: &str,
        idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome> {
        let mut params = CreateSubscription::new(Self::customer_id(customer)?);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let client = self.idempotent_client(idempotency_key);
        let subscription = Subscription::create(&client, params)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::subscription_outcome(&subscription))
    }

    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome> {
        let sub_id: SubscriptionId = Self::parse_id(subscription_ref, "subscription")?;

        // The item ID is needed to swap its price in place
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[])
            .await
            .map_err(|e| Self::map_error(e, None))?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                GatewayError::Validation(format!("Subscription {} has no items", sub_id))
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let client = self.idempotent_client(idempotency_key);
        let subscription = Subscription::update(&client, &sub_id, params)
            .await
            .map_err(|e| Self::map_error(e, None))?;

        Ok(Self::subscription_outcome(&subscription))
    }
}
