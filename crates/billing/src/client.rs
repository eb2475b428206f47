//! Stripe client wrapper and billing configuration

use std::env;

use crate::error::{BillingError, BillingResult};
use crate::money::{Money, DEFAULT_MINIMUM_CHARGE_MINOR};

/// Default refund eligibility horizon for the last charge
pub const DEFAULT_REFUND_WINDOW_DAYS: i64 = 30;

/// Default ISO currency code for charges
pub const DEFAULT_CURRENCY: &str = "pkr";

/// How plan prices are collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingMode {
    /// Charge or refund the price difference immediately on each change
    #[default]
    OneTime,
    /// Keep a provider subscription on the plan's price; the provider prorates
    Recurring,
}

impl std::str::FromStr for BillingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "one_time" | "onetime" => Ok(BillingMode::OneTime),
            "recurring" | "subscription" => Ok(BillingMode::Recurring),
            other => Err(BillingError::Config(format!(
                "BILLING_MODE must be 'one_time' or 'recurring', got '{}'",
                other
            ))),
        }
    }
}

/// Billing configuration, loaded once and passed explicitly to services
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Lowercase 3-letter ISO code, fixed per deployment
    pub currency: String,
    /// Smallest positive amount the gateway will charge
    pub minimum_charge: Money,
    /// Charges older than this many days are not refunded on downgrade
    pub refund_window_days: i64,
    /// Where the gateway sends the customer after an extra authentication step
    pub return_url: Option<String>,
    pub mode: BillingMode,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            currency: DEFAULT_CURRENCY.to_string(),
            minimum_charge: Money::from_minor(DEFAULT_MINIMUM_CHARGE_MINOR),
            refund_window_days: DEFAULT_REFUND_WINDOW_DAYS,
            return_url: None,
            mode: BillingMode::OneTime,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();

        let secret_key = env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let currency = env::var("BILLING_CURRENCY")
            .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string())
            .to_lowercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::Config(format!(
                "BILLING_CURRENCY must be a 3-letter ISO code, got '{}'",
                currency
            )));
        }

        let minimum_charge_minor = parse_env_i64(
            "BILLING_MINIMUM_CHARGE_MINOR",
            DEFAULT_MINIMUM_CHARGE_MINOR,
        )?;
        let refund_window_days =
            parse_env_i64("BILLING_REFUND_WINDOW_DAYS", DEFAULT_REFUND_WINDOW_DAYS)?;

        let mode = match env::var("BILLING_MODE") {
            Ok(raw) => raw.parse()?,
            Err(_) => BillingMode::default(),
        };

        Ok(Self {
            secret_key,
            currency,
            minimum_charge: Money::from_minor(minimum_charge_minor),
            refund_window_days,
            return_url: env::var("BILLING_RETURN_URL").ok(),
            mode,
        })
    }
}

fn parse_env_i64(name: &str, default: i64) -> BillingResult<i64> {
    match env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<i64>()
                .map_err(|e| BillingError::Config(format!("{} is not a number: {}", name, e)))?;
            if value < 0 {
                return Err(BillingError::Config(format!(
                    "{} must not be negative",
                    name
                )));
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}

/// Stripe API client with its configuration
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
