//! In-memory billing store for tests and local development

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::customer::{CustomerDirectory, CustomerProfile};
use crate::error::{BillingError, BillingResult};
use crate::gateway::CustomerRef;
use crate::ledger::{LedgerStatus, LedgerWrite, SubscriptionLedger, SubscriptionLedgerEntry};
use crate::locks::UserLocks;
use crate::money::Money;
use crate::payments::{NewPaymentRecord, PaymentKind, PaymentRecord, PaymentRecordLog, PaymentStatus};
use crate::store::{BillingStore, UserLease};

#[derive(Default)]
struct State {
    plans: Vec<Plan>,
    customers: HashMap<Uuid, CustomerRef>,
    ledger: HashMap<Uuid, SubscriptionLedgerEntry>,
    records: Vec<PaymentRecord>,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<State>,
    locks: UserLocks,
    fail_commits: AtomicBool,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: Vec<Plan>) -> Self {
        Self {
            state: Mutex::new(State {
                plans,
                ..Default::default()
            }),
            locks: UserLocks::new(),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Insert a record with an explicit timestamp (e.g. an old charge)
    pub async fn seed_payment(&self, record: PaymentRecord) {
        self.state.lock().await.records.push(record);
    }

    /// Make subsequent `commit_plan_change` calls fail, as a lost database would
    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub async fn all_records(&self) -> Vec<PaymentRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn all_entries(&self) -> Vec<SubscriptionLedgerEntry> {
        self.state.lock().await.ledger.values().cloned().collect()
    }

    fn write_entry(state: &mut State, write: &LedgerWrite) -> BillingResult<SubscriptionLedgerEntry> {
        let now = OffsetDateTime::now_utc();
        let current_version = state.ledger.get(&write.user_id).map(|e| e.version);
        if current_version != write.expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "Ledger entry for user {} changed (expected version {:?}, found {:?})",
                write.user_id, write.expected_version, current_version
            )));
        }

        let entry = match state.ledger.get(&write.user_id) {
            Some(existing) => SubscriptionLedgerEntry {
                plan_id: write.plan_id,
                provider_ref: write.provider_ref.clone(),
                status: write.status,
                version: existing.version + 1,
                updated_at: now,
                ..existing.clone()
            },
            None => SubscriptionLedgerEntry {
                user_id: write.user_id,
                plan_id: write.plan_id,
                provider_ref: write.provider_ref.clone(),
                status: write.status,
                version: 1,
                created_at: now,
                updated_at: now,
            },
        };
        state.ledger.insert(write.user_id, entry.clone());
        Ok(entry)
    }

    fn build_record(record: NewPaymentRecord) -> PaymentRecord {
        PaymentRecord {
            id: Uuid::new_v4(),
            user_id: record.user_id,
            plan_id: record.plan_id,
            kind: record.kind,
            transaction_ref: record.transaction_ref,
            source_transaction_ref: record.source_transaction_ref,
            amount: record.amount,
            raw_response: record.raw_response,
            status: record.status,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[async_trait]
impl PlanCatalog for MemoryBillingStore {
    async fn find_plan_by_provider_product_id(
        &self,
        product_id: &str,
    ) -> BillingResult<Option<Plan>> {
        Ok(self
            .state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.provider_product_id == product_id)
            .cloned())
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self
            .state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans = self.state.lock().await.plans.clone();
        plans.sort_by_key(|p| p.price);
        Ok(plans)
    }
}

#[async_trait]
impl SubscriptionLedger for MemoryBillingStore {
    async fn get_active_entry(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionLedgerEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .ledger
            .get(&user_id)
            .filter(|e| e.status == LedgerStatus::Active)
            .cloned())
    }

    async fn get_entry(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionLedgerEntry>> {
        Ok(self.state.lock().await.ledger.get(&user_id).cloned())
    }

    async fn upsert_entry(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider_ref: &str,
        status: LedgerStatus,
    ) -> BillingResult<SubscriptionLedgerEntry> {
        let mut state = self.state.lock().await;
        let expected_version = state.ledger.get(&user_id).map(|e| e.version);
        let write = LedgerWrite {
            user_id,
            plan_id,
            provider_ref: provider_ref.to_string(),
            status,
            expected_version,
        };
        Self::write_entry(&mut state, &write)
    }
}

#[async_trait]
impl PaymentRecordLog for MemoryBillingStore {
    async fn append(&self, record: NewPaymentRecord) -> BillingResult<PaymentRecord> {
        let record = Self::build_record(record);
        self.state.lock().await.records.push(record.clone());
        Ok(record)
    }

    async fn latest_charge(&self, user_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.kind == PaymentKind::Charge
                    && r.status == PaymentStatus::Success
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn charge_recorded(&self, transaction_ref: &str) -> BillingResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .iter()
            .any(|r| r.kind == PaymentKind::Charge && r.transaction_ref == transaction_ref))
    }

    async fn refunded_total(&self, charge_ref: &str) -> BillingResult<Money> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| {
                r.kind == PaymentKind::Refund
                    && r.status == PaymentStatus::Success
                    && r.source_transaction_ref.as_deref() == Some(charge_ref)
            })
            .map(|r| r.amount)
            .sum())
    }

    async fn history_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let mut records: Vec<PaymentRecord> = self
            .state
            .lock()
            .await
            .records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        // Stable sort keeps later inserts first when timestamps tie
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[async_trait]
impl CustomerDirectory for MemoryBillingStore {
    async fn get_customer_ref(&self, user_id: Uuid) -> BillingResult<Option<CustomerRef>> {
        Ok(self.state.lock().await.customers.get(&user_id).cloned())
    }

    async fn save_customer_ref(
        &self,
        user_id: Uuid,
        customer: &CustomerRef,
        _profile: &CustomerProfile,
    ) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .customers
            .insert(user_id, customer.clone());
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn lock_user(&self, user_id: Uuid) -> BillingResult<UserLease> {
        Ok(UserLease::new(self.locks.acquire(user_id).await))
    }

    async fn commit_plan_change(
        &self,
        ledger: LedgerWrite,
        record: NewPaymentRecord,
    ) -> BillingResult<(SubscriptionLedgerEntry, PaymentRecord)> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "commit rejected: store unavailable".to_string(),
            ));
        }

        // Both writes happen under one lock, so readers never see half of them
        let mut state = self.state.lock().await;
        let entry = Self::write_entry(&mut state, &ledger)?;
        let record = Self::build_record(record);
        state.records.push(record.clone());
        Ok((entry, record))
    }
}
