//! Plan-change billing reconciliation
//!
//! Decides whether moving a user to another plan charges, refunds, or moves no
//! money, performs the gateway call, and records the result in the ledger and
//! payment log.
//!
//! ## Flow
//!
//! 1. Take the user's lease from the store (one plan change per user at a
//!    time, across every process sharing the store)
//! 2. Resolve the target plan and the current ledger entry
//! 3. Decide the transition: every rejection (unknown plan, sub-minimum
//!    amount) happens here, before the gateway is contacted
//! 4. Resolve the gateway customer, then charge / refund / set up, or create
//!    or reprice the provider subscription in recurring mode
//! 5. Commit ledger + log together, only after the gateway confirmed
//!
//! The gateway is called at most once per money-moving decision and never
//! retried here. A charge or setup intent that needed 3-D Secure is settled by
//! resubmitting with `confirmed_intent_ref`, which reads the intent back
//! instead of creating another.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Plan;
use crate::client::{BillingMode, StripeConfig};
use crate::customer::{CustomerProfile, CustomerService};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeOutcome, ChargeRequest, ChargeStatus, CustomerRef, GatewayError, PaymentGateway,
    PaymentMethodRef, SetupOutcome, SetupStatus, SubscriptionStatus,
};
use crate::ledger::{LedgerStatus, LedgerWrite, SubscriptionLedgerEntry};
use crate::money::Money;
use crate::payments::{NewPaymentRecord, PaymentRecord};
use crate::store::BillingStore;

/// Money rules applied to every plan change
#[derive(Debug, Clone)]
pub struct ReconciliationPolicy {
    pub currency: String,
    pub minimum_charge: Money,
    pub refund_window_days: i64,
    pub mode: BillingMode,
}

impl From<&StripeConfig> for ReconciliationPolicy {
    fn from(config: &StripeConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            minimum_charge: config.minimum_charge,
            refund_window_days: config.refund_window_days,
            mode: config.mode,
        }
    }
}

/// A request to move a user onto a plan
#[derive(Debug, Clone)]
pub struct PlanChangeRequest {
    pub user_id: Uuid,
    pub customer: CustomerProfile,
    /// Stripe product ID of the plan the user selected
    pub target_product_id: String,
    pub payment_method: PaymentMethodRef,
    /// Provider idempotency key for the charge or subscription call. A fresh
    /// key is generated when absent.
    pub idempotency_key: Option<String>,
    /// Payment or setup intent the client authenticated after a
    /// `RequiresAction` response. The engine reads it back and records it
    /// rather than creating a new one.
    pub confirmed_intent_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    NewSubscription,
    Upgrade,
    Lateral,
    Downgrade,
}

impl PlanChangeKind {
    /// Classify a move from `current` (if any) to `target` by price
    pub fn between(current: Option<&Plan>, target: &Plan) -> Self {
        let Some(current) = current else {
            return PlanChangeKind::NewSubscription;
        };
        match current.price.cmp(&target.price) {
            Ordering::Less => PlanChangeKind::Upgrade,
            Ordering::Equal => PlanChangeKind::Lateral,
            Ordering::Greater => PlanChangeKind::Downgrade,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeKind::NewSubscription => "new_subscription",
            PlanChangeKind::Upgrade => "upgrade",
            PlanChangeKind::Lateral => "lateral",
            PlanChangeKind::Downgrade => "downgrade",
        }
    }
}

impl std::fmt::Display for PlanChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a downgrade moved no money back to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RefundSkipReason {
    NoPriorCharge,
    OutsideRefundWindow { days_since_charge: i64 },
    NothingRefundable,
}

/// Refund eligibility for a downgrade
#[derive(Debug, Clone, PartialEq)]
pub enum RefundDecision {
    Issue { charge: PaymentRecord, amount: Money },
    Skip(RefundSkipReason),
}

impl RefundDecision {
    /// Decide how much of `requested` can be refunded against the last charge.
    ///
    /// The refund never exceeds what is left of the charge after earlier
    /// refunds, and only charges at most `window_days` old are eligible.
    pub fn evaluate(
        last_charge: Option<PaymentRecord>,
        already_refunded: Money,
        requested: Money,
        window_days: i64,
        now: OffsetDateTime,
    ) -> Self {
        let Some(charge) = last_charge else {
            return RefundDecision::Skip(RefundSkipReason::NoPriorCharge);
        };

        let days_since_charge = charge.age_in_days(now);
        if days_since_charge > window_days {
            return RefundDecision::Skip(RefundSkipReason::OutsideRefundWindow {
                days_since_charge,
            });
        }

        let refundable = charge.amount.saturating_sub(already_refunded);
        let amount = requested.min(refundable);
        if !amount.is_positive() {
            return RefundDecision::Skip(RefundSkipReason::NothingRefundable);
        }

        RefundDecision::Issue { charge, amount }
    }
}

/// What a plan change will do, decided before any gateway call
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Charge {
        kind: PlanChangeKind,
        amount: Money,
    },
    Refund {
        charge: PaymentRecord,
        amount: Money,
    },
    /// Ledger moves, no money moves
    Swap {
        kind: PlanChangeKind,
        /// Confirm the payment method with a setup intent first
        register_payment_method: bool,
        refund_skipped: Option<RefundSkipReason>,
    },
    /// Recurring mode: create the provider subscription or move it to the
    /// target price; the provider prorates and invoices
    Subscription { kind: PlanChangeKind },
}

impl Transition {
    /// Whether resuming with an authenticated intent can settle this transition
    fn accepts_confirmed_intent(&self) -> bool {
        matches!(
            self,
            Transition::Charge { .. }
                | Transition::Swap {
                    register_payment_method: true,
                    ..
                }
        )
    }
}

/// The ledger entry a user currently has, with its plan
#[derive(Debug, Clone)]
pub struct CurrentSubscription {
    pub entry: SubscriptionLedgerEntry,
    pub plan: Plan,
}

/// Result of a completed plan change
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub kind: PlanChangeKind,
    pub plan: Plan,
    pub previous_plan: Option<Plan>,
    pub amount_charged: Money,
    pub amount_refunded: Money,
    /// Provider reference now held by the ledger
    pub transaction_ref: String,
    pub refund_skipped: Option<RefundSkipReason>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Success,
    Error,
}

/// Shape handed back across the HTTP boundary
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeResponse {
    pub outcome: ResponseOutcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Set when the client must complete a 3-D Secure step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Intent to pass back as `confirmed_intent_ref` once the step is done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_intent_ref: Option<String>,
}

impl From<BillingResult<PlanChangeOutcome>> for PlanChangeResponse {
    fn from(result: BillingResult<PlanChangeOutcome>) -> Self {
        match result {
            Ok(outcome) => PlanChangeResponse {
                outcome: ResponseOutcome::Success,
                message: outcome.message,
                plan: Some(outcome.plan),
                client_secret: None,
                pending_intent_ref: None,
            },
            Err(err) => {
                let (client_secret, pending_intent_ref) = match &err {
                    BillingError::RequiresAction {
                        transaction_ref,
                        client_secret,
                    } => (client_secret.clone(), Some(transaction_ref.clone())),
                    _ => (None, None),
                };
                PlanChangeResponse {
                    outcome: ResponseOutcome::Error,
                    message: err.user_message(),
                    plan: None,
                    client_secret,
                    pending_intent_ref,
                }
            }
        }
    }
}

/// Decide a charge for `amount`, or a no-money swap when it is zero
fn charge_or_swap(
    kind: PlanChangeKind,
    amount: Money,
    policy: &ReconciliationPolicy,
) -> BillingResult<Transition> {
    if amount.is_zero() {
        return Ok(Transition::Swap {
            kind,
            register_payment_method: true,
            refund_skipped: None,
        });
    }
    if amount.is_below_minimum(policy.minimum_charge) {
        return Err(BillingError::AmountBelowMinimum {
            amount_minor: amount.minor_units(),
            minimum_minor: policy.minimum_charge.minor_units(),
        });
    }
    Ok(Transition::Charge { kind, amount })
}

/// Everything an executing transition needs about the request
struct PlanChange<'a> {
    request: &'a PlanChangeRequest,
    current: Option<CurrentSubscription>,
    target: Plan,
    /// The user's ledger row in any status; its version guards the write
    ledger: Option<SubscriptionLedgerEntry>,
}

impl PlanChange<'_> {
    fn expected_version(&self) -> Option<i64> {
        self.ledger.as_ref().map(|e| e.version)
    }

    fn idempotency_key(&self) -> String {
        self.request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Reconciliation engine for plan changes
pub struct ReconciliationEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    customers: CustomerService,
    policy: ReconciliationPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: ReconciliationPolicy,
    ) -> Self {
        let customers = CustomerService::new(Arc::clone(&store), Arc::clone(&gateway));
        Self {
            store,
            gateway,
            customers,
            policy,
        }
    }

    /// Move the user onto the requested plan, charging or refunding the price
    /// difference.
    pub async fn change_plan(&self, request: PlanChangeRequest) -> BillingResult<PlanChangeOutcome> {
        let user_id = request.user_id;
        let _lease = self.store.lock_user(user_id).await?;

        let target = self
            .store
            .find_plan_by_provider_product_id(&request.target_product_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(request.target_product_id.clone()))?;

        let ledger = self.store.get_entry(user_id).await?;
        let current = self.current_subscription(user_id).await?;
        let now = OffsetDateTime::now_utc();
        let transition = self
            .decide(user_id, current.as_ref(), &target, now)
            .await?;

        if let Some(intent_ref) = &request.confirmed_intent_ref {
            if !transition.accepts_confirmed_intent() {
                tracing::warn!(
                    user_id = %user_id,
                    intent_ref = %intent_ref,
                    transition = ?transition,
                    "Confirmed intent does not fit the plan change"
                );
                return Err(BillingError::IntentMismatch(format!(
                    "intent {} cannot settle this plan change",
                    intent_ref
                )));
            }
        }

        tracing::info!(
            user_id = %user_id,
            target_plan = %target.id,
            current_plan = ?current.as_ref().map(|c| c.plan.id),
            transition = ?transition,
            resumed = request.confirmed_intent_ref.is_some(),
            "Reconciling plan change"
        );

        let change = PlanChange {
            request: &request,
            current,
            target,
            ledger,
        };

        match transition {
            Transition::Charge { kind, amount } => self.execute_charge(change, kind, amount).await,
            Transition::Refund { charge, amount } => {
                self.execute_refund(change, charge, amount).await
            }
            Transition::Swap {
                kind,
                register_payment_method,
                refund_skipped,
            } => {
                self.execute_swap(change, kind, register_payment_method, refund_skipped)
                    .await
            }
            Transition::Subscription { kind } => self.execute_subscription(change, kind).await,
        }
    }

    /// Payment history for a user, newest first
    pub async fn payment_history(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        self.store.history_for_user(user_id).await
    }

    /// The user's active subscription and its plan
    pub async fn current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<CurrentSubscription>> {
        let Some(entry) = self.store.get_active_entry(user_id).await? else {
            return Ok(None);
        };

        let plan = self.store.get_plan(entry.plan_id).await?.ok_or_else(|| {
            BillingError::PlanNotFound(format!(
                "Current plan {} of user {} no longer exists",
                entry.plan_id, user_id
            ))
        })?;

        Ok(Some(CurrentSubscription { entry, plan }))
    }

    /// Work out the transition without touching the gateway
    pub async fn decide(
        &self,
        user_id: Uuid,
        current: Option<&CurrentSubscription>,
        target: &Plan,
        now: OffsetDateTime,
    ) -> BillingResult<Transition> {
        let kind = PlanChangeKind::between(current.map(|c| &c.plan), target);
        if self.policy.mode == BillingMode::Recurring {
            return Ok(Transition::Subscription { kind });
        }

        let current_price = current.map(|c| c.plan.price).unwrap_or(Money::ZERO);
        match kind {
            PlanChangeKind::NewSubscription => charge_or_swap(kind, target.price, &self.policy),
            PlanChangeKind::Upgrade => charge_or_swap(
                kind,
                target.price.saturating_sub(current_price),
                &self.policy,
            ),
            PlanChangeKind::Lateral => Ok(Transition::Swap {
                kind,
                register_payment_method: true,
                refund_skipped: None,
            }),
            PlanChangeKind::Downgrade => {
                let requested = current_price.saturating_sub(target.price);
                let last_charge = self.store.latest_charge(user_id).await?;
                let already_refunded = match &last_charge {
                    Some(charge) => self.store.refunded_total(&charge.transaction_ref).await?,
                    None => Money::ZERO,
                };

                match RefundDecision::evaluate(
                    last_charge,
                    already_refunded,
                    requested,
                    self.policy.refund_window_days,
                    now,
                ) {
                    RefundDecision::Issue { charge, amount } => {
                        Ok(Transition::Refund { charge, amount })
                    }
                    RefundDecision::Skip(reason) => Ok(Transition::Swap {
                        kind,
                        register_payment_method: false,
                        refund_skipped: Some(reason),
                    }),
                }
            }
        }
    }

    /// Read back a payment intent the client authenticated and check it pays
    /// for exactly this change
    async fn confirmed_charge(
        &self,
        customer: &CustomerRef,
        intent_ref: &str,
        amount: Money,
    ) -> BillingResult<ChargeOutcome> {
        if self.store.charge_recorded(intent_ref).await? {
            return Err(BillingError::IntentMismatch(format!(
                "charge {} is already recorded",
                intent_ref
            )));
        }

        let outcome = self.gateway.retrieve_charge(intent_ref).await?;
        if outcome.amount != amount || outcome.customer.as_ref() != Some(customer) {
            return Err(BillingError::IntentMismatch(format!(
                "charge {} is {} for {:?}, plan change needs {} for {}",
                intent_ref, outcome.amount, outcome.customer, amount, customer
            )));
        }

        Ok(outcome)
    }

    async fn confirmed_setup(
        &self,
        customer: &CustomerRef,
        intent_ref: &str,
    ) -> BillingResult<SetupOutcome> {
        let setup = self.gateway.retrieve_setup_intent(intent_ref).await?;
        if setup.customer.as_ref() != Some(customer) {
            return Err(BillingError::IntentMismatch(format!(
                "setup intent {} belongs to {:?}, not {}",
                intent_ref, setup.customer, customer
            )));
        }
        Ok(setup)
    }

    async fn execute_charge(
        &self,
        change: PlanChange<'_>,
        kind: PlanChangeKind,
        amount: Money,
    ) -> BillingResult<PlanChangeOutcome> {
        let expected_version = change.expected_version();
        let idempotency_key = change.idempotency_key();
        let PlanChange {
            request,
            current,
            target,
            ..
        } = change;
        let user_id = request.user_id;
        let customer = self
            .customers
            .ensure_customer(user_id, &request.customer)
            .await?;

        let outcome = match request.confirmed_intent_ref.as_deref() {
            Some(intent_ref) => self.confirmed_charge(&customer, intent_ref, amount).await?,
            None => {
                self.gateway
                    .attach_payment_method(&customer, &request.payment_method)
                    .await?;

                let charge = ChargeRequest {
                    customer,
                    payment_method: request.payment_method.clone(),
                    amount,
                    currency: self.policy.currency.clone(),
                    description: format!("Payment for plan: {}", target.name),
                    idempotency_key,
                };
                self.gateway.charge(&charge).await?
            }
        };

        match outcome.status {
            ChargeStatus::Succeeded => {}
            ChargeStatus::RequiresAction => {
                tracing::info!(
                    user_id = %user_id,
                    transaction_ref = %outcome.transaction_ref,
                    "Charge requires customer action; nothing recorded until it is confirmed"
                );
                return Err(BillingError::RequiresAction {
                    transaction_ref: outcome.transaction_ref,
                    client_secret: outcome.client_secret,
                });
            }
            ChargeStatus::Processing => {
                return Err(BillingError::PaymentPending(outcome.transaction_ref));
            }
            ChargeStatus::Failed => {
                tracing::warn!(
                    user_id = %user_id,
                    transaction_ref = %outcome.transaction_ref,
                    "Charge failed"
                );
                return Err(BillingError::ChargeFailed {
                    transaction_ref: outcome.transaction_ref,
                    status: "failed".to_string(),
                });
            }
        }

        let ledger = LedgerWrite {
            user_id,
            plan_id: target.id,
            provider_ref: outcome.transaction_ref.clone(),
            status: LedgerStatus::Active,
            expected_version,
        };
        let record = NewPaymentRecord::charge(
            user_id,
            target.id,
            &outcome.transaction_ref,
            amount,
            outcome.raw,
        );

        if let Err(e) = self.store.commit_plan_change(ledger, record).await {
            tracing::error!(
                alert = "inconsistent_write_after_charge",
                user_id = %user_id,
                plan_id = %target.id,
                transaction_ref = %outcome.transaction_ref,
                amount_minor = amount.minor_units(),
                error = %e,
                "Charge succeeded but ledger/log could not be written; manual reconciliation required"
            );
            return Err(BillingError::InconsistentWriteAfterCharge {
                user_id,
                transaction_ref: outcome.transaction_ref,
                amount_minor: amount.minor_units(),
                detail: e.to_string(),
            });
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %target.id,
            kind = %kind,
            transaction_ref = %outcome.transaction_ref,
            amount_minor = amount.minor_units(),
            "Charged for plan change"
        );

        Ok(PlanChangeOutcome {
            kind,
            plan: target,
            previous_plan: current.map(|c| c.plan),
            amount_charged: amount,
            amount_refunded: Money::ZERO,
            transaction_ref: outcome.transaction_ref,
            refund_skipped: None,
            message: "Purchase successful!".to_string(),
        })
    }

    async fn execute_refund(
        &self,
        change: PlanChange<'_>,
        charge: PaymentRecord,
        amount: Money,
    ) -> BillingResult<PlanChangeOutcome> {
        let expected_version = change.expected_version();
        let PlanChange {
            request,
            current,
            target,
            ..
        } = change;
        let user_id = request.user_id;
        let Some(current) = current else {
            return Err(BillingError::InvalidInput(
                "Refund requested without a current subscription".to_string(),
            ));
        };

        self.customers
            .ensure_customer(user_id, &request.customer)
            .await?;

        let (refund_ref, raw) = match self.gateway.refund(&charge.transaction_ref, amount).await {
            Ok(refund) => (refund.transaction_ref, refund.raw),
            Err(GatewayError::AlreadyRefunded(_)) => {
                // The provider already gave this money back; record it so the
                // log agrees with the provider instead of refunding again
                tracing::warn!(
                    user_id = %user_id,
                    charge_ref = %charge.transaction_ref,
                    amount_minor = amount.minor_units(),
                    "Charge already refunded at gateway; recording refund locally"
                );
                (
                    charge.transaction_ref.clone(),
                    serde_json::json!({ "error": "Already refunded" }),
                )
            }
            Err(e) => return Err(e.into()),
        };

        let ledger = LedgerWrite {
            user_id,
            plan_id: target.id,
            provider_ref: charge.transaction_ref.clone(),
            status: LedgerStatus::Active,
            expected_version,
        };
        let record = NewPaymentRecord::refund(
            user_id,
            current.plan.id,
            &refund_ref,
            &charge.transaction_ref,
            amount,
            raw,
        );

        if let Err(e) = self.store.commit_plan_change(ledger, record).await {
            tracing::error!(
                alert = "inconsistent_write_after_refund",
                user_id = %user_id,
                plan_id = %target.id,
                transaction_ref = %refund_ref,
                charge_ref = %charge.transaction_ref,
                amount_minor = amount.minor_units(),
                error = %e,
                "Refund succeeded but ledger/log could not be written; manual reconciliation required"
            );
            return Err(BillingError::InconsistentWriteAfterRefund {
                user_id,
                transaction_ref: refund_ref,
                amount_minor: amount.minor_units(),
                detail: e.to_string(),
            });
        }

        tracing::info!(
            user_id = %user_id,
            from_plan = %current.plan.id,
            to_plan = %target.id,
            refund_ref = %refund_ref,
            amount_minor = amount.minor_units(),
            "Plan downgraded with refund"
        );

        Ok(PlanChangeOutcome {
            kind: PlanChangeKind::Downgrade,
            plan: target,
            previous_plan: Some(current.plan),
            amount_charged: Money::ZERO,
            amount_refunded: amount,
            transaction_ref: charge.transaction_ref,
            refund_skipped: None,
            message: "Plan downgraded, refund processed!".to_string(),
        })
    }

    async fn execute_swap(
        &self,
        change: PlanChange<'_>,
        kind: PlanChangeKind,
        register_payment_method: bool,
        refund_skipped: Option<RefundSkipReason>,
    ) -> BillingResult<PlanChangeOutcome> {
        let expected_version = change.expected_version();
        let PlanChange {
            request,
            current,
            target,
            ..
        } = change;
        let user_id = request.user_id;
        let existing_ref = current.as_ref().map(|c| c.entry.provider_ref.clone());

        let (ledger_ref, record_ref, raw) = if register_payment_method {
            let customer = self
                .customers
                .ensure_customer(user_id, &request.customer)
                .await?;
            let setup = match request.confirmed_intent_ref.as_deref() {
                Some(intent_ref) => self.confirmed_setup(&customer, intent_ref).await?,
                None => {
                    self.gateway
                        .attach_payment_method(&customer, &request.payment_method)
                        .await?;
                    self.gateway
                        .create_setup_intent(&customer, &request.payment_method)
                        .await?
                }
            };

            match setup.status {
                SetupStatus::Succeeded => {}
                SetupStatus::RequiresAction => {
                    return Err(BillingError::RequiresAction {
                        transaction_ref: setup.setup_ref,
                        client_secret: setup.client_secret,
                    });
                }
                SetupStatus::Failed => {
                    return Err(BillingError::GatewayValidation(
                        "The payment method could not be set up.".to_string(),
                    ));
                }
            }

            let ledger_ref = existing_ref.unwrap_or_else(|| setup.setup_ref.clone());
            (ledger_ref, setup.setup_ref, setup.raw)
        } else {
            let existing_ref = existing_ref.ok_or_else(|| {
                BillingError::InvalidInput(
                    "Plan swap without payment method requires a current subscription".to_string(),
                )
            })?;
            let raw = serde_json::json!({ "refund_skipped": refund_skipped });
            (existing_ref.clone(), existing_ref, raw)
        };

        let ledger = LedgerWrite {
            user_id,
            plan_id: target.id,
            provider_ref: ledger_ref.clone(),
            status: LedgerStatus::Active,
            expected_version,
        };
        let record = NewPaymentRecord::no_charge(user_id, target.id, &record_ref, raw);

        // No money moved, so a failed commit is an ordinary error
        self.store.commit_plan_change(ledger, record).await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %target.id,
            kind = %kind,
            refund_skipped = ?refund_skipped,
            "Plan changed with no money movement"
        );

        let message = match refund_skipped {
            Some(_) => "Plan downgraded. No refund was due.".to_string(),
            None => "Plan updated successfully with no additional charge.".to_string(),
        };

        Ok(PlanChangeOutcome {
            kind,
            plan: target,
            previous_plan: current.map(|c| c.plan),
            amount_charged: Money::ZERO,
            amount_refunded: Money::ZERO,
            transaction_ref: ledger_ref,
            refund_skipped,
            message,
        })
    }

    /// Recurring mode: the provider subscription follows the plan's price
    async fn execute_subscription(
        &self,
        change: PlanChange<'_>,
        kind: PlanChangeKind,
    ) -> BillingResult<PlanChangeOutcome> {
        let expected_version = change.expected_version();
        let idempotency_key = change.idempotency_key();
        let PlanChange {
            request,
            current,
            target,
            ledger,
        } = change;
        let user_id = request.user_id;

        // A subscription still waiting on its first invoice is repriced, not duplicated
        let existing_ref = match &current {
            Some(c) => Some(c.entry.provider_ref.clone()),
            None => ledger
                .filter(|e| e.status == LedgerStatus::Pending)
                .map(|e| e.provider_ref),
        };

        let customer = self
            .customers
            .ensure_customer(user_id, &request.customer)
            .await?;
        self.gateway
            .attach_payment_method(&customer, &request.payment_method)
            .await?;

        let outcome = match &existing_ref {
            Some(subscription_ref) => {
                self.gateway
                    .change_subscription_price(
                        subscription_ref,
                        &target.provider_price_id,
                        &idempotency_key,
                    )
                    .await?
            }
            None => {
                self.gateway
                    .create_subscription(&customer, &target.provider_price_id, &idempotency_key)
                    .await?
            }
        };

        // The ledger mirrors the provider's state even when billing failed there
        let status = match outcome.status {
            SubscriptionStatus::Active => LedgerStatus::Active,
            SubscriptionStatus::Pending => LedgerStatus::Pending,
            SubscriptionStatus::Failed => LedgerStatus::Canceled,
        };

        let ledger = LedgerWrite {
            user_id,
            plan_id: target.id,
            provider_ref: outcome.subscription_ref.clone(),
            status,
            expected_version,
        };
        let record = NewPaymentRecord::subscription(
            user_id,
            target.id,
            &outcome.subscription_ref,
            outcome.raw,
        );

        if let Err(e) = self.store.commit_plan_change(ledger, record).await {
            tracing::error!(
                alert = "inconsistent_write_after_subscription",
                user_id = %user_id,
                plan_id = %target.id,
                transaction_ref = %outcome.subscription_ref,
                amount_minor = target.price.minor_units(),
                error = %e,
                "Subscription changed at gateway but ledger/log could not be written; manual reconciliation required"
            );
            return Err(BillingError::InconsistentWriteAfterCharge {
                user_id,
                transaction_ref: outcome.subscription_ref,
                amount_minor: target.price.minor_units(),
                detail: e.to_string(),
            });
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %target.id,
            kind = %kind,
            subscription_ref = %outcome.subscription_ref,
            status = %status,
            "Subscription moved to plan price"
        );

        let message = match status {
            LedgerStatus::Active => "Subscription created/updated successfully!",
            LedgerStatus::Pending => {
                "Subscription updated. Your first payment is still being confirmed."
            }
            LedgerStatus::Canceled => {
                return Err(BillingError::ChargeFailed {
                    transaction_ref: outcome.subscription_ref,
                    status: "subscription_inactive".to_string(),
                });
            }
        };

        Ok(PlanChangeOutcome {
            kind,
            plan: target,
            previous_plan: current.map(|c| c.plan),
            amount_charged: Money::ZERO,
            amount_refunded: Money::ZERO,
            transaction_ref: outcome.subscription_ref,
            refund_skipped: None,
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SubscriptionLedger;
    use crate::payments::{PaymentKind, PaymentStatus};
    use crate::testing::{
        fixture, minutes_ago_charge, plan, recurring_fixture, GatewayCall, RefundBehavior,
    };

    // =========================================================================
    // Refund decision
    // =========================================================================

    #[test]
    fn test_refund_capped_at_last_charge() {
        let now = OffsetDateTime::now_utc();
        let charge = minutes_ago_charge(Uuid::new_v4(), Uuid::new_v4(), "pi_1", 300, 60);

        let decision = RefundDecision::evaluate(
            Some(charge),
            Money::ZERO,
            Money::from_major(500),
            30,
            now,
        );
        match decision {
            RefundDecision::Issue { amount, .. } => assert_eq!(amount, Money::from_major(300)),
            other => panic!("expected refund, got {:?}", other),
        }
    }

    #[test]
    fn test_refund_window_is_inclusive_of_day_30() {
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let plan = Uuid::new_v4();

        let day_30 = minutes_ago_charge(user, plan, "pi_1", 300, 30 * 24 * 60 + 1);
        assert!(matches!(
            RefundDecision::evaluate(Some(day_30), Money::ZERO, Money::from_major(100), 30, now),
            RefundDecision::Issue { .. }
        ));

        let day_31 = minutes_ago_charge(user, plan, "pi_1", 300, 31 * 24 * 60 + 1);
        assert_eq!(
            RefundDecision::evaluate(Some(day_31), Money::ZERO, Money::from_major(100), 30, now),
            RefundDecision::Skip(RefundSkipReason::OutsideRefundWindow {
                days_since_charge: 31
            })
        );
    }

    #[test]
    fn test_refund_accounts_for_earlier_refunds() {
        let now = OffsetDateTime::now_utc();
        let charge = minutes_ago_charge(Uuid::new_v4(), Uuid::new_v4(), "pi_1", 300, 10);

        match RefundDecision::evaluate(
            Some(charge.clone()),
            Money::from_major(250),
            Money::from_major(100),
            30,
            now,
        ) {
            RefundDecision::Issue { amount, .. } => assert_eq!(amount, Money::from_major(50)),
            other => panic!("expected partial refund, got {:?}", other),
        }

        assert_eq!(
            RefundDecision::evaluate(
                Some(charge),
                Money::from_major(300),
                Money::from_major(100),
                30,
                now
            ),
            RefundDecision::Skip(RefundSkipReason::NothingRefundable)
        );
    }

    #[test]
    fn test_refund_without_prior_charge() {
        assert_eq!(
            RefundDecision::evaluate(
                None,
                Money::ZERO,
                Money::from_major(100),
                30,
                OffsetDateTime::now_utc()
            ),
            RefundDecision::Skip(RefundSkipReason::NoPriorCharge)
        );
    }

    #[test]
    fn test_kind_classified_by_price() {
        let basic = plan("basic", 50_000);
        let pro = plan("pro", 80_000);
        let pro_plus = plan("pro-plus", 80_000);

        assert_eq!(PlanChangeKind::between(None, &pro), PlanChangeKind::NewSubscription);
        assert_eq!(PlanChangeKind::between(Some(&basic), &pro), PlanChangeKind::Upgrade);
        assert_eq!(PlanChangeKind::between(Some(&pro), &pro_plus), PlanChangeKind::Lateral);
        assert_eq!(PlanChangeKind::between(Some(&pro), &basic), PlanChangeKind::Downgrade);
    }

    // =========================================================================
    // New subscriptions
    // =========================================================================

    #[tokio::test]
    async fn test_new_subscription_charges_full_price() {
        let fx = fixture().await;

        let outcome = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::NewSubscription);
        assert_eq!(outcome.amount_charged, Money::from_major(500));
        assert_eq!(fx.gateway.charged_amounts(), vec![50_000]);

        let entries = fx.store.all_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].plan_id, fx.basic.id);
        assert_eq!(entries[0].status, LedgerStatus::Active);
        assert_eq!(entries[0].provider_ref, outcome.transaction_ref);

        let records = fx.store.all_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, PaymentKind::Charge);
        assert_eq!(records[0].status, PaymentStatus::Success);
        assert_eq!(records[0].amount, Money::from_major(500));
    }

    #[tokio::test]
    async fn test_customer_created_once_and_reused() {
        let fx = fixture().await;

        fx.engine.change_plan(fx.request("basic")).await.unwrap();
        fx.engine.change_plan(fx.request("pro")).await.unwrap();

        let created = fx
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::CreateCustomer { .. }))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_unknown_plan_aborts_before_gateway() {
        let fx = fixture().await;

        let result = fx.engine.change_plan(fx.request("does-not-exist")).await;

        assert!(matches!(result, Err(BillingError::PlanNotFound(_))));
        assert!(fx.gateway.calls().is_empty());
        assert!(fx.store.all_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_free_plan_registers_method_without_charge() {
        let fx = fixture().await;

        let outcome = fx.engine.change_plan(fx.request("free")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::NewSubscription);
        assert_eq!(outcome.amount_charged, Money::ZERO);
        assert!(fx.gateway.charged_amounts().is_empty());
        assert!(fx
            .gateway
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::Setup { .. })));

        let records = fx.store.all_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, PaymentKind::NoCharge);
        assert_eq!(records[0].amount, Money::ZERO);
        // The setup intent becomes the billing handle for a first subscription
        assert_eq!(fx.store.all_entries().await[0].provider_ref, records[0].transaction_ref);
    }

    // =========================================================================
    // Upgrades
    // =========================================================================

    #[tokio::test]
    async fn test_upgrade_charges_price_difference() {
        let fx = fixture().await;
        fx.engine.change_plan(fx.request("basic")).await.unwrap();

        let outcome = fx.engine.change_plan(fx.request("pro")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::Upgrade);
        assert_eq!(outcome.amount_charged, Money::from_major(300));
        assert_eq!(fx.gateway.charged_amounts(), vec![50_000, 30_000]);

        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.pro.id);
        assert_eq!(entry.provider_ref, outcome.transaction_ref);

        let history = fx.engine.payment_history(fx.user_id).await.unwrap();
        assert_eq!(history[0].amount, Money::from_major(300));
        assert_eq!(history[0].status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn test_requires_action_leaves_no_trace() {
        let fx = fixture().await;
        fx.gateway.set_charge_status(ChargeStatus::RequiresAction);

        let result = fx.engine.change_plan(fx.request("basic")).await;

        match result {
            Err(BillingError::RequiresAction { client_secret, .. }) => {
                assert!(client_secret.is_some())
            }
            other => panic!("expected RequiresAction, got {:?}", other),
        }
        assert!(fx.store.all_entries().await.is_empty());
        assert!(fx.store.all_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_declined_card_surfaces_validation_error() {
        let fx = fixture().await;
        fx.gateway
            .fail_next_charge(GatewayError::Validation("Your card was declined.".into()));

        let result = fx.engine.change_plan(fx.request("basic")).await;

        assert!(matches!(result, Err(BillingError::GatewayValidation(ref m)) if m.contains("declined")));
        assert!(fx.store.all_entries().await.is_empty());
        assert!(fx.store.all_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_after_charge_is_an_alert() {
        let fx = fixture().await;
        fx.store.set_commit_failure(true);

        let err = fx.engine.change_plan(fx.request("basic")).await.unwrap_err();

        assert!(err.is_operational_alert());
        match err {
            BillingError::InconsistentWriteAfterCharge {
                user_id,
                amount_minor,
                transaction_ref,
                ..
            } => {
                assert_eq!(user_id, fx.user_id);
                assert_eq!(amount_minor, 50_000);
                assert!(transaction_ref.starts_with("pi_"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idempotency_key_forwarded_to_gateway() {
        let fx = fixture().await;
        let mut request = fx.request("basic");
        request.idempotency_key = Some("checkout-42".to_string());

        fx.engine.change_plan(request).await.unwrap();

        assert!(fx.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::Charge { idempotency_key, .. } if idempotency_key == "checkout-42"
        )));
    }

    // =========================================================================
    // Downgrades
    // =========================================================================

    #[tokio::test]
    async fn test_downgrade_refunds_upgrade_delta() {
        let fx = fixture().await;
        fx.engine.change_plan(fx.request("basic")).await.unwrap();
        let upgrade = fx.engine.change_plan(fx.request("pro")).await.unwrap();

        let outcome = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::Downgrade);
        assert_eq!(outcome.amount_refunded, Money::from_major(300));
        assert_eq!(
            fx.gateway.refunds(),
            vec![(upgrade.transaction_ref.clone(), 30_000)]
        );

        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.basic.id);
        // The refund does not replace the billing handle
        assert_eq!(entry.provider_ref, upgrade.transaction_ref);

        let latest = &fx.engine.payment_history(fx.user_id).await.unwrap()[0];
        assert_eq!(latest.kind, PaymentKind::Refund);
        assert_eq!(latest.amount, Money::from_major(300));
        assert_eq!(
            latest.source_transaction_ref.as_deref(),
            Some(upgrade.transaction_ref.as_str())
        );
        assert_ne!(latest.transaction_ref, upgrade.transaction_ref);
    }

    #[tokio::test]
    async fn test_downgrade_outside_window_swaps_without_refund() {
        let fx = fixture().await;
        fx.seed_subscription(&fx.pro, "pi_old", 800, 45 * 24 * 60).await;

        let outcome = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::Downgrade);
        assert_eq!(outcome.amount_refunded, Money::ZERO);
        assert_eq!(
            outcome.refund_skipped,
            Some(RefundSkipReason::OutsideRefundWindow {
                days_since_charge: 45
            })
        );
        assert!(fx.gateway.refunds().is_empty());
        assert!(fx.gateway.charged_amounts().is_empty());

        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.basic.id);
        assert_eq!(entry.provider_ref, "pi_old");
    }

    #[tokio::test]
    async fn test_downgrade_absorbs_already_refunded() {
        let fx = fixture().await;
        fx.seed_subscription(&fx.pro, "pi_prev", 300, 5 * 24 * 60).await;
        fx.gateway.set_refund_behavior(RefundBehavior::AlreadyRefunded);

        let outcome = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(outcome.amount_refunded, Money::from_major(300));
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.basic.id);
        assert_eq!(entry.provider_ref, "pi_prev");

        let latest = &fx.engine.payment_history(fx.user_id).await.unwrap()[0];
        assert_eq!(latest.kind, PaymentKind::Refund);
        assert_eq!(latest.status, PaymentStatus::Success);
        assert_eq!(latest.transaction_ref, "pi_prev");
        assert_eq!(latest.amount, Money::from_major(300));
    }

    #[tokio::test]
    async fn test_refund_gateway_error_changes_nothing() {
        let fx = fixture().await;
        fx.seed_subscription(&fx.pro, "pi_prev", 300, 60).await;
        fx.gateway
            .set_refund_behavior(RefundBehavior::Fail("charge is disputed".to_string()));
        let records_before = fx.store.all_records().await.len();

        let result = fx.engine.change_plan(fx.request("basic")).await;

        assert!(matches!(result, Err(BillingError::GatewayValidation(_))));
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.pro.id);
        assert_eq!(fx.store.all_records().await.len(), records_before);
    }

    // =========================================================================
    // Lateral moves and the minimum floor
    // =========================================================================

    #[tokio::test]
    async fn test_same_price_switch_moves_no_money() {
        let fx = fixture().await;
        fx.engine.change_plan(fx.request("pro")).await.unwrap();
        let calls_before = fx.gateway.charged_amounts().len();

        let outcome = fx.engine.change_plan(fx.request("pro-plus")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::Lateral);
        assert_eq!(fx.gateway.charged_amounts().len(), calls_before);
        assert!(fx.gateway.refunds().is_empty());
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.pro_plus.id);
    }

    #[tokio::test]
    async fn test_reselecting_current_plan_is_harmless() {
        let fx = fixture().await;
        let first = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        let again = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(again.kind, PlanChangeKind::Lateral);
        assert_eq!(fx.gateway.charged_amounts(), vec![50_000]);
        assert!(fx.gateway.refunds().is_empty());
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.provider_ref, first.transaction_ref);
    }

    #[tokio::test]
    async fn test_sub_minimum_upgrade_aborts_without_gateway_call() {
        let fx = fixture().await;
        fx.seed_subscription(&fx.basic, "pi_basic", 500, 60).await;
        let records_before = fx.store.all_records().await;

        // basic-plus costs 0.40 more than basic
        let result = fx.engine.change_plan(fx.request("basic-plus")).await;

        assert!(matches!(
            result,
            Err(BillingError::AmountBelowMinimum {
                amount_minor: 40,
                minimum_minor: 100
            })
        ));
        assert!(fx.gateway.calls().is_empty());
        assert_eq!(fx.store.all_records().await, records_before);
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.basic.id);
    }

    #[tokio::test]
    async fn test_confirmed_intent_cannot_settle_a_refund() {
        let fx = fixture().await;
        fx.seed_subscription(&fx.pro, "pi_prev", 800, 60).await;
        let mut request = fx.request("basic");
        request.confirmed_intent_ref = Some("pi_prev".to_string());

        let result = fx.engine.change_plan(request).await;

        assert!(matches!(result, Err(BillingError::IntentMismatch(_))));
        assert!(fx.gateway.calls().is_empty());
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.pro.id);
    }

    // =========================================================================
    // Recurring subscriptions
    // =========================================================================

    #[tokio::test]
    async fn test_recurring_new_subscriber_gets_provider_subscription() {
        let fx = recurring_fixture().await;

        let outcome = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(outcome.kind, PlanChangeKind::NewSubscription);
        assert_eq!(outcome.message, "Subscription created/updated successfully!");
        assert!(outcome.transaction_ref.starts_with("sub_"));
        assert!(fx.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::CreateSubscription { price_id, .. } if price_id == "price_basic"
        )));
        assert!(fx.gateway.charged_amounts().is_empty());

        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.basic.id);
        assert_eq!(entry.provider_ref, outcome.transaction_ref);

        let records = fx.store.all_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, PaymentKind::Subscription);
        assert_eq!(records[0].amount, Money::ZERO);
    }

    #[tokio::test]
    async fn test_recurring_plan_changes_reprice_the_same_subscription() {
        let fx = recurring_fixture().await;
        let first = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        let upgrade = fx.engine.change_plan(fx.request("pro")).await.unwrap();
        let downgrade = fx.engine.change_plan(fx.request("basic")).await.unwrap();

        assert_eq!(upgrade.kind, PlanChangeKind::Upgrade);
        assert_eq!(downgrade.kind, PlanChangeKind::Downgrade);
        assert_eq!(upgrade.transaction_ref, first.transaction_ref);

        let changes: Vec<_> = fx
            .gateway
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::ChangeSubscription {
                    subscription_ref,
                    price_id,
                } => Some((subscription_ref, price_id)),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (first.transaction_ref.clone(), "price_pro".to_string()),
                (first.transaction_ref.clone(), "price_basic".to_string()),
            ]
        );
        let creates = fx
            .gateway
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::CreateSubscription { .. }))
            .count();
        assert_eq!(creates, 1);
        assert!(fx.gateway.refunds().is_empty());
        assert_eq!(fx.store.all_records().await.len(), 3);
    }

    #[tokio::test]
    async fn test_recurring_pending_subscription_is_repriced_not_duplicated() {
        let fx = recurring_fixture().await;
        fx.gateway.set_subscription_status(SubscriptionStatus::Pending);

        let pending = fx.engine.change_plan(fx.request("basic")).await.unwrap();
        assert!(fx.store.get_active_entry(fx.user_id).await.unwrap().is_none());
        let entry = fx.store.get_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);

        fx.gateway.set_subscription_status(SubscriptionStatus::Active);
        let active = fx.engine.change_plan(fx.request("pro")).await.unwrap();

        assert_eq!(active.transaction_ref, pending.transaction_ref);
        assert!(fx.gateway.calls().contains(&GatewayCall::ChangeSubscription {
            subscription_ref: pending.transaction_ref.clone(),
            price_id: "price_pro".to_string(),
        }));
        let entry = fx.store.get_active_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.plan_id, fx.pro.id);
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_recurring_failed_subscription_is_mirrored_and_reported() {
        let fx = recurring_fixture().await;
        fx.gateway.set_subscription_status(SubscriptionStatus::Failed);

        let result = fx.engine.change_plan(fx.request("basic")).await;

        assert!(matches!(result, Err(BillingError::ChargeFailed { .. })));
        let entry = fx.store.get_entry(fx.user_id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Canceled);
        assert_eq!(fx.store.all_records().await.len(), 1);
    }

    // =========================================================================
    // Caller boundary
    // =========================================================================

    #[tokio::test]
    async fn test_response_shape() {
        let fx = fixture().await;

        let ok: PlanChangeResponse = fx.engine.change_plan(fx.request("basic")).await.into();
        assert_eq!(ok.outcome, ResponseOutcome::Success);
        assert_eq!(ok.plan.as_ref().map(|p| p.id), Some(fx.basic.id));

        let err: PlanChangeResponse = fx.engine.change_plan(fx.request("nope")).await.into();
        assert_eq!(err.outcome, ResponseOutcome::Error);
        assert!(err.plan.is_none());

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["outcome"], "error");
        assert!(json.get("plan").is_none());
    }
}
