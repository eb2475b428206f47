//! Test doubles shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Plan;
use crate::customer::CustomerProfile;
use crate::client::BillingMode;
use crate::gateway::{
    ChargeOutcome, ChargeRequest, ChargeStatus, CustomerRef, GatewayError, GatewayResult,
    PaymentGateway, PaymentMethodRef, RefundOutcome, SetupOutcome, SetupStatus,
    SubscriptionOutcome, SubscriptionStatus,
};
use crate::ledger::{LedgerStatus, SubscriptionLedger};
use crate::memory::MemoryBillingStore;
use crate::money::Money;
use crate::payments::{PaymentKind, PaymentRecord, PaymentStatus};
use crate::reconcile::{PlanChangeRequest, ReconciliationEngine, ReconciliationPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateCustomer { email: String },
    Attach { customer: String, method: String },
    Charge { amount_minor: i64, idempotency_key: String },
    Refund { transaction_ref: String, amount_minor: i64 },
    Setup { customer: String },
    RetrieveCharge { transaction_ref: String },
    RetrieveSetup { setup_ref: String },
    CreateSubscription { customer: String, price_id: String },
    ChangeSubscription { subscription_ref: String, price_id: String },
}

#[derive(Debug, Clone)]
pub enum RefundBehavior {
    Succeed,
    AlreadyRefunded,
    Fail(String),
}

struct Script {
    charge_status: ChargeStatus,
    charge_delay: Option<Duration>,
    next_charge_error: Option<GatewayError>,
    refund: RefundBehavior,
    setup_status: SetupStatus,
    subscription_status: SubscriptionStatus,
    charges: HashMap<String, ChargeOutcome>,
    setups: HashMap<String, SetupOutcome>,
    calls: Vec<GatewayCall>,
}

/// Scripted gateway that records every call
pub struct FakeGateway {
    script: Mutex<Script>,
    counter: AtomicU64,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                charge_status: ChargeStatus::Succeeded,
                charge_delay: None,
                next_charge_error: None,
                refund: RefundBehavior::Succeed,
                setup_status: SetupStatus::Succeeded,
                subscription_status: SubscriptionStatus::Active,
                charges: HashMap::new(),
                setups: HashMap::new(),
                calls: Vec::new(),
            }),
            counter: AtomicU64::new(1),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn record(&self, call: GatewayCall) {
        self.script.lock().unwrap().calls.push(call);
    }

    pub fn set_charge_status(&self, status: ChargeStatus) {
        self.script.lock().unwrap().charge_status = status;
    }

    /// Hold every charge call this long before answering
    pub fn set_charge_delay(&self, delay: Duration) {
        self.script.lock().unwrap().charge_delay = Some(delay);
    }

    pub fn set_subscription_status(&self, status: SubscriptionStatus) {
        self.script.lock().unwrap().subscription_status = status;
    }

    /// The customer finished 3-D Secure for this payment or setup intent
    pub fn complete_intent(&self, intent_ref: &str) {
        let mut script = self.script.lock().unwrap();
        if let Some(charge) = script.charges.get_mut(intent_ref) {
            charge.status = ChargeStatus::Succeeded;
        }
        if let Some(setup) = script.setups.get_mut(intent_ref) {
            setup.status = SetupStatus::Succeeded;
        }
    }

    pub fn fail_next_charge(&self, err: GatewayError) {
        self.script.lock().unwrap().next_charge_error = Some(err);
    }

    pub fn set_refund_behavior(&self, behavior: RefundBehavior) {
        self.script.lock().unwrap().refund = behavior;
    }

    pub fn set_setup_status(&self, status: SetupStatus) {
        self.script.lock().unwrap().setup_status = status;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn charged_amounts(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Charge { amount_minor, .. } => Some(amount_minor),
                _ => None,
            })
            .collect()
    }

    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Refund {
                    transaction_ref,
                    amount_minor,
                } => Some((transaction_ref, amount_minor)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, email: &str, _name: &str) -> GatewayResult<CustomerRef> {
        self.record(GatewayCall::CreateCustomer {
            email: email.to_string(),
        });
        Ok(CustomerRef::new(self.next_id("cus")))
    }

    async fn attach_payment_method(
        &self,
        customer: &CustomerRef,
        method: &PaymentMethodRef,
    ) -> GatewayResult<()> {
        self.record(GatewayCall::Attach {
            customer: customer.to_string(),
            method: method.to_string(),
        });
        Ok(())
    }

    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<ChargeOutcome> {
        self.record(GatewayCall::Charge {
            amount_minor: request.amount.minor_units(),
            idempotency_key: request.idempotency_key.clone(),
        });

        let (status, delay, error) = {
            let mut script = self.script.lock().unwrap();
            (
                script.charge_status,
                script.charge_delay,
                script.next_charge_error.take(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }

        let id = self.next_id("pi");
        let outcome = ChargeOutcome {
            client_secret: Some(format!("{}_secret", id)),
            raw: serde_json::json!({ "id": id, "amount": request.amount.minor_units() }),
            transaction_ref: id.clone(),
            status,
            amount: request.amount,
            customer: Some(request.customer.clone()),
        };
        self.script
            .lock()
            .unwrap()
            .charges
            .insert(id, outcome.clone());
        Ok(outcome)
    }

    async fn retrieve_charge(&self, transaction_ref: &str) -> GatewayResult<ChargeOutcome> {
        self.record(GatewayCall::RetrieveCharge {
            transaction_ref: transaction_ref.to_string(),
        });
        self.script
            .lock()
            .unwrap()
            .charges
            .get(transaction_ref)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Validation(format!("No such payment_intent: '{}'", transaction_ref))
            })
    }

    async fn refund(&self, transaction_ref: &str, amount: Money) -> GatewayResult<RefundOutcome> {
        self.record(GatewayCall::Refund {
            transaction_ref: transaction_ref.to_string(),
            amount_minor: amount.minor_units(),
        });

        let behavior = self.script.lock().unwrap().refund.clone();
        match behavior {
            RefundBehavior::Succeed => {
                let id = self.next_id("re");
                Ok(RefundOutcome {
                    raw: serde_json::json!({ "id": id, "status": "succeeded" }),
                    transaction_ref: id,
                })
            }
            RefundBehavior::AlreadyRefunded => {
                Err(GatewayError::AlreadyRefunded(transaction_ref.to_string()))
            }
            RefundBehavior::Fail(msg) => Err(GatewayError::Validation(msg)),
        }
    }

    async fn create_setup_intent(
        &self,
        customer: &CustomerRef,
        _method: &PaymentMethodRef,
    ) -> GatewayResult<SetupOutcome> {
        self.record(GatewayCall::Setup {
            customer: customer.to_string(),
        });
        let status = self.script.lock().unwrap().setup_status;
        let id = self.next_id("seti");
        let outcome = SetupOutcome {
            client_secret: Some(format!("{}_secret", id)),
            raw: serde_json::json!({ "id": id }),
            setup_ref: id.clone(),
            status,
            customer: Some(customer.clone()),
        };
        self.script
            .lock()
            .unwrap()
            .setups
            .insert(id, outcome.clone());
        Ok(outcome)
    }

    async fn retrieve_setup_intent(&self, setup_ref: &str) -> GatewayResult<SetupOutcome> {
        self.record(GatewayCall::RetrieveSetup {
            setup_ref: setup_ref.to_string(),
        });
        self.script
            .lock()
            .unwrap()
            .setups
            .get(setup_ref)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Validation(format!("No such setup_intent: '{}'", setup_ref))
            })
    }

    async fn create_subscription(
        &self,
        customer: &CustomerRef,
        price_id: &str,
        _idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome> {
        self.record(GatewayCall::CreateSubscription {
            customer: customer.to_string(),
            price_id: price_id.to_string(),
        });
        let status = self.script.lock().unwrap().subscription_status;
        let id = self.next_id("sub");
        Ok(SubscriptionOutcome {
            raw: serde_json::json!({ "id": id, "price": price_id }),
            subscription_ref: id,
            status,
        })
    }

    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        _idempotency_key: &str,
    ) -> GatewayResult<SubscriptionOutcome> {
        self.record(GatewayCall::ChangeSubscription {
            subscription_ref: subscription_ref.to_string(),
            price_id: price_id.to_string(),
        });
        let status = self.script.lock().unwrap().subscription_status;
        Ok(SubscriptionOutcome {
            raw: serde_json::json!({
                "id": subscription_ref,
                "price": price_id,
                "proration_behavior": "create_prorations",
            }),
            subscription_ref: subscription_ref.to_string(),
            status,
        })
    }
}

pub fn plan(name: &str, price_minor: i64) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: name.to_string(),
        price: Money::from_minor(price_minor),
        provider_product_id: format!("prod_{}", name),
        provider_price_id: format!("price_{}", name),
    }
}

/// A successful charge created `minutes` ago
pub fn minutes_ago_charge(
    user_id: Uuid,
    plan_id: Uuid,
    transaction_ref: &str,
    amount_major: i64,
    minutes: i64,
) -> PaymentRecord {
    PaymentRecord {
        id: Uuid::new_v4(),
        user_id,
        plan_id,
        kind: PaymentKind::Charge,
        transaction_ref: transaction_ref.to_string(),
        source_transaction_ref: None,
        amount: Money::from_major(amount_major),
        raw_response: serde_json::json!({ "id": transaction_ref }),
        status: PaymentStatus::Success,
        created_at: OffsetDateTime::now_utc() - time::Duration::minutes(minutes),
    }
}

/// Engine wired to an in-memory store and a scripted gateway.
///
/// Catalog: free 0, basic 500.00, basic-plus 500.40, pro 800.00, pro-plus 800.00
pub struct Fixture {
    pub engine: Arc<ReconciliationEngine>,
    pub policy: ReconciliationPolicy,
    pub store: Arc<MemoryBillingStore>,
    pub gateway: Arc<FakeGateway>,
    pub user_id: Uuid,
    pub free: Plan,
    pub basic: Plan,
    pub basic_plus: Plan,
    pub pro: Plan,
    pub pro_plus: Plan,
}

impl Fixture {
    pub fn request(&self, plan_name: &str) -> PlanChangeRequest {
        self.request_for(self.user_id, plan_name)
    }

    pub fn request_for(&self, user_id: Uuid, plan_name: &str) -> PlanChangeRequest {
        PlanChangeRequest {
            user_id,
            customer: CustomerProfile {
                email: "ayesha@example.com".to_string(),
                name: "Ayesha".to_string(),
            },
            target_product_id: format!("prod_{}", plan_name),
            payment_method: PaymentMethodRef::new("pm_card_visa"),
            idempotency_key: None,
            confirmed_intent_ref: None,
        }
    }

    /// Another engine over the same store and gateway, as a second replica
    /// of the service would have
    pub fn replica_engine(&self) -> Arc<ReconciliationEngine> {
        Arc::new(ReconciliationEngine::new(
            self.store.clone(),
            self.gateway.clone(),
            self.policy.clone(),
        ))
    }

    /// Put the user on `plan` as if they had paid `amount_major` for it
    /// `minutes_ago`, without going through the gateway
    pub async fn seed_subscription(
        &self,
        plan: &Plan,
        charge_ref: &str,
        amount_major: i64,
        minutes_ago: i64,
    ) {
        self.store
            .seed_payment(minutes_ago_charge(
                self.user_id,
                plan.id,
                charge_ref,
                amount_major,
                minutes_ago,
            ))
            .await;
        self.store
            .upsert_entry(self.user_id, plan.id, charge_ref, LedgerStatus::Active)
            .await
            .unwrap();
    }
}

pub fn default_policy() -> ReconciliationPolicy {
    ReconciliationPolicy {
        currency: "pkr".to_string(),
        minimum_charge: Money::from_minor(100),
        refund_window_days: 30,
        mode: BillingMode::OneTime,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with_policy(default_policy()).await
}

pub async fn recurring_fixture() -> Fixture {
    fixture_with_policy(ReconciliationPolicy {
        mode: BillingMode::Recurring,
        ..default_policy()
    })
    .await
}

pub async fn fixture_with_policy(policy: ReconciliationPolicy) -> Fixture {
    let free = plan("free", 0);
    let basic = plan("basic", 50_000);
    let basic_plus = plan("basic-plus", 50_040);
    let pro = plan("pro", 80_000);
    let pro_plus = plan("pro-plus", 80_000);

    let store = Arc::new(MemoryBillingStore::with_plans(vec![
        free.clone(),
        basic.clone(),
        basic_plus.clone(),
        pro.clone(),
        pro_plus.clone(),
    ]));
    let gateway = Arc::new(FakeGateway::new());
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        gateway.clone(),
        policy.clone(),
    ));

    Fixture {
        engine,
        policy,
        store,
        gateway,
        user_id: Uuid::new_v4(),
        free,
        basic,
        basic_plus,
        pro,
        pro_plus,
    }
}
