//! Persisted recovery plans and the failed-operation log

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::meta::{FAILED_OPERATIONS, RECOVERY_PLANS};
use crate::store::StoreTxn;
use crate::sync::queue::PendingOperation;

use super::policy::{ErrorRecord, ErrorType, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Operator-supplied correction applied on requeue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub operation_id: String,
    pub error_type: ErrorType,
    pub strategy: Strategy,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub status: PlanStatus,
    #[serde(default)]
    pub modifications: Option<Modifications>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
}

impl RecoveryPlan {
    /// Due for the background tick at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.status == PlanStatus::Pending
            && self.strategy.is_automatic()
            && self.next_attempt_at <= now
    }
}

/// Every failure an operation has gone through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: PendingOperation,
    pub errors: Vec<ErrorRecord>,
}

pub type Plans = BTreeMap<String, RecoveryPlan>;
pub type FailedLog = BTreeMap<String, FailedOperation>;

pub(crate) fn load_plans(txn: &StoreTxn<'_>) -> Result<Plans, StoreError> {
    Ok(txn.get_meta(RECOVERY_PLANS)?.unwrap_or_default())
}

pub(crate) fn save_plans(txn: &StoreTxn<'_>, plans: &Plans) -> Result<(), StoreError> {
    txn.put_meta(RECOVERY_PLANS, plans)
}

/// Create or refresh the plan for a failed operation. Operator modifications survive.
pub(crate) fn upsert_plan_in(
    txn: &StoreTxn<'_>,
    error: &ErrorRecord,
    strategy: Strategy,
    attempts: u32,
    next_attempt_at: i64,
) -> Result<RecoveryPlan, StoreError> {
    let mut plans = load_plans(txn)?;
    let now = error.timestamp;
    let plan = plans
        .entry(error.operation_id.clone())
        .or_insert_with(|| RecoveryPlan {
            operation_id: error.operation_id.clone(),
            error_type: error.error_type,
            strategy,
            attempts,
            next_attempt_at,
            status: PlanStatus::Pending,
            modifications: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        });
    plan.error_type = error.error_type;
    plan.strategy = strategy;
    plan.attempts = attempts;
    plan.next_attempt_at = next_attempt_at;
    plan.status = PlanStatus::Pending;
    plan.updated_at = now;
    plan.last_error = Some(error.clone());
    let plan = plan.clone();
    save_plans(txn, &plans)?;
    Ok(plan)
}

/// Set a plan's status if the plan exists. Returns whether it did.
pub(crate) fn set_plan_status_in(
    txn: &StoreTxn<'_>,
    operation_id: &str,
    status: PlanStatus,
    now: i64,
) -> Result<bool, StoreError> {
    let mut plans = load_plans(txn)?;
    match plans.get_mut(operation_id) {
        Some(plan) => {
            plan.status = status;
            plan.updated_at = now;
            save_plans(txn, &plans)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn append_failure_in(
    txn: &StoreTxn<'_>,
    op: &PendingOperation,
    error: &ErrorRecord,
) -> Result<(), StoreError> {
    let mut log: FailedLog = txn.get_meta(FAILED_OPERATIONS)?.unwrap_or_default();
    let entry = log.entry(op.id.clone()).or_insert_with(|| FailedOperation {
        operation: op.clone(),
        errors: Vec::new(),
    });
    entry.operation = op.clone();
    entry.errors.push(error.clone());
    txn.put_meta(FAILED_OPERATIONS, &log)
}
