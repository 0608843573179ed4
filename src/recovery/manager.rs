//! Recovery manager: turns replay failures into persisted plans and runs them
//!
//! Automatic strategies (retry, requeue) are executed by [`RecoveryManager::tick`];
//! everything else holds its operation until an operator acts.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connectivity::Connectivity;
use crate::error::{Result, StoreError, SyncError};
use crate::events::{ConflictReport, StatusTracker};
use crate::store::meta::{FAILED_OPERATIONS, RECOVERY_PLANS};
use crate::store::LocalStore;
use crate::sync::queue::{self, OperationQueue, PendingOperation};
use crate::sync::replay::Replayer;
use crate::transport::TransportError;

use super::plan::{
    append_failure_in, load_plans, save_plans, set_plan_status_in, upsert_plan_in, FailedLog,
    Modifications, PlanStatus, Plans, RecoveryPlan,
};
use super::policy::{ErrorRecord, ErrorType, RetryPolicy, Strategy};

/// Result of recording one failure
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub error: ErrorRecord,
    pub strategy: Strategy,
    pub attempts: u32,
    pub requires_action: bool,
}

/// Result of executing one recovery plan
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The operation (possibly under a requeued id) was confirmed
    Recovered { operation_id: String },
    Failed(FailureOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
}

pub struct RecoveryManager {
    store: Arc<LocalStore>,
    queue: OperationQueue,
    replayer: Replayer,
    policy: RetryPolicy,
    status: Arc<StatusTracker>,
    connectivity: Connectivity,
    /// Replay guard shared with the sync engine
    guard: Arc<Mutex<()>>,
    clock: Clock,
}

impl RecoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStore>,
        queue: OperationQueue,
        replayer: Replayer,
        policy: RetryPolicy,
        status: Arc<StatusTracker>,
        connectivity: Connectivity,
        guard: Arc<Mutex<()>>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            queue,
            replayer,
            policy,
            status,
            connectivity,
            guard,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed replay: bump the operation's retry state, upsert its plan
    /// and append to the failure log in one transaction, then report it.
    pub fn handle_failure(
        &self,
        op: &PendingOperation,
        err: &TransportError,
    ) -> std::result::Result<FailureOutcome, StoreError> {
        let now = (self.clock)();
        let error = ErrorRecord::from_failure(op, err, now);
        let attempts = op.retry_count + 1;
        let strategy = self.policy.strategy_for(error.error_type, attempts);
        let requires_action = !strategy.is_automatic();
        let next_attempt_at = now + self.policy.delay_ms(attempts);

        self.store.atomically(|txn| {
            // Cancelled while in flight (its unsynced record was deleted): only log it
            let mut updated = match queue::get_in(txn, &op.id)? {
                Some(queued) => queued,
                None => {
                    debug!(operation_id = %op.id, "Failed operation already left the queue");
                    return append_failure_in(txn, op, &error);
                }
            };
            updated.retry_count = attempts;
            updated.last_attempt_at = Some(now);
            updated.last_error = Some(error.clone());
            updated.on_hold = requires_action;
            queue::put_in(txn, &updated)?;
            upsert_plan_in(txn, &error, strategy, attempts, next_attempt_at)?;
            append_failure_in(txn, &updated, &error)
        })?;

        warn!(
            operation_id = %op.id,
            operation_type = %op.operation_type,
            error_type = %error.error_type,
            %strategy,
            attempts,
            error = %error.message,
            "Operation failed"
        );

        self.status.item_failed(error.clone(), strategy, requires_action);
        if error.error_type == ErrorType::Conflict {
            self.status.conflict_detected(
                Some(op.id.clone()),
                ConflictReport::Replay {
                    status: error.status,
                    message: error.message.clone(),
                },
            );
        }

        Ok(FailureOutcome {
            error,
            strategy,
            attempts,
            requires_action,
        })
    }

    pub fn plans(&self) -> Result<Vec<RecoveryPlan>> {
        let plans: Plans = self.store.get_meta(RECOVERY_PLANS)?.unwrap_or_default();
        Ok(plans.into_values().collect())
    }

    pub fn plan(&self, operation_id: &str) -> Result<Option<RecoveryPlan>> {
        let plans: Plans = self.store.get_meta(RECOVERY_PLANS)?.unwrap_or_default();
        Ok(plans.get(operation_id).cloned())
    }

    pub fn failed_operations(&self) -> Result<FailedLog> {
        Ok(self.store.get_meta(FAILED_OPERATIONS)?.unwrap_or_default())
    }

    pub fn mark_recovered(&self, operation_id: &str) -> Result<()> {
        let now = (self.clock)();
        let found = self
            .store
            .atomically(|txn| set_plan_status_in(txn, operation_id, PlanStatus::Completed, now))?;
        if !found && self.store.is_attached() {
            return Err(SyncError::PlanNotFound(operation_id.to_string()));
        }
        Ok(())
    }

    /// Apply `f` to an existing plan and persist it.
    fn update_plan<F>(&self, operation_id: &str, f: F) -> Result<RecoveryPlan>
    where
        F: FnOnce(&mut RecoveryPlan),
    {
        let updated = self.store.atomically(|txn| {
            let mut plans = load_plans(txn)?;
            let plan = match plans.get_mut(operation_id) {
                Some(plan) => plan,
                None => return Ok(None),
            };
            f(plan);
            let plan = plan.clone();
            save_plans(txn, &plans)?;
            Ok(Some(plan))
        })?;
        updated.ok_or_else(|| SyncError::PlanNotFound(operation_id.to_string()))
    }

    /// Attach corrected data to a plan and schedule it for requeue now.
    pub fn set_modifications(
        &self,
        operation_id: &str,
        modifications: Modifications,
    ) -> Result<RecoveryPlan> {
        let now = (self.clock)();
        let plan = self.update_plan(operation_id, |plan| {
            plan.modifications = Some(modifications);
            plan.strategy = Strategy::Requeue;
            plan.status = PlanStatus::Pending;
            plan.next_attempt_at = now;
            plan.updated_at = now;
        })?;
        info!(operation_id, "Modifications recorded, operation scheduled for requeue");
        Ok(plan)
    }

    /// Override a plan's strategy. Automatic strategies release the operation's hold.
    pub fn set_strategy(&self, operation_id: &str, strategy: Strategy) -> Result<RecoveryPlan> {
        let now = (self.clock)();
        let plan = self.update_plan(operation_id, |plan| {
            plan.strategy = strategy;
            plan.status = PlanStatus::Pending;
            plan.next_attempt_at = now;
            plan.updated_at = now;
        })?;
        if let Some(mut op) = self.queue.get(operation_id)? {
            let hold = !strategy.is_automatic();
            if op.on_hold != hold {
                op.on_hold = hold;
                self.queue.update(&op)?;
            }
        }
        info!(operation_id, %strategy, "Recovery strategy set");
        Ok(plan)
    }

    /// Execute a plan now, waiting for any running drain to finish.
    pub async fn execute_recovery(&self, operation_id: &str) -> Result<RecoveryOutcome> {
        let _guard = self.guard.lock().await;
        self.execute_locked(operation_id).await
    }

    async fn execute_locked(&self, operation_id: &str) -> Result<RecoveryOutcome> {
        let plan = self
            .plan(operation_id)?
            .ok_or_else(|| SyncError::PlanNotFound(operation_id.to_string()))?;
        let original = self
            .queue
            .get(operation_id)?
            .ok_or_else(|| SyncError::OperationNotFound(operation_id.to_string()))?;

        let now = (self.clock)();
        self.store
            .atomically(|txn| set_plan_status_in(txn, operation_id, PlanStatus::InProgress, now))?;

        let op = if plan.strategy == Strategy::Requeue {
            let data = plan.modifications.as_ref().and_then(|m| m.data.clone());
            let fresh = original.requeued(data, now);
            self.store.atomically(|txn| {
                queue::remove_in(txn, &original.id)?;
                queue::put_in(txn, &fresh)?;
                set_plan_status_in(txn, &original.id, PlanStatus::Failed, now)?;
                Ok(())
            })?;
            info!(from = %original.id, to = %fresh.id, "Operation requeued");
            fresh
        } else {
            original
        };

        match self.replayer.dispatch(&op).await {
            Ok(response) => {
                self.replayer.reconcile(&op, &response)?;
                let done = (self.clock)();
                self.store.atomically(|txn| {
                    set_plan_status_in(txn, operation_id, PlanStatus::Completed, done)
                })?;
                self.status.item_processed(&op.id);
                info!(operation_id = %op.id, "Recovery succeeded");
                Ok(RecoveryOutcome::Recovered {
                    operation_id: op.id,
                })
            }
            Err(err) => {
                let outcome = self.handle_failure(&op, &err)?;
                let status = if outcome.strategy.is_automatic() {
                    PlanStatus::Pending
                } else {
                    PlanStatus::Failed
                };
                let at = (self.clock)();
                self.store
                    .atomically(|txn| set_plan_status_in(txn, &op.id, status, at))?;
                Ok(RecoveryOutcome::Failed(outcome))
            }
        }
    }

    /// Run every due automatic plan. Skipped while a drain holds the replay guard or offline.
    pub async fn tick(&self) -> Result<TickReport> {
        let _guard = match self.guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Replay in progress, skipping recovery tick");
                return Ok(TickReport::default());
            }
        };
        if !self.connectivity.is_online() {
            debug!("Offline, skipping recovery tick");
            return Ok(TickReport::default());
        }

        let now = (self.clock)();
        let due: Vec<String> = self
            .plans()?
            .into_iter()
            .filter(|plan| plan.is_due(now))
            .map(|plan| plan.operation_id)
            .collect();

        let mut report = TickReport::default();
        for operation_id in due {
            let op = match self.queue.get(&operation_id)? {
                Some(op) => op,
                None => {
                    debug!(%operation_id, "Planned operation no longer queued");
                    continue;
                }
            };
            if !op.unresolved_temp_ids().is_empty() {
                debug!(%operation_id, "Waiting on unresolved temp ids");
                continue;
            }

            report.attempted += 1;
            match self.execute_locked(&operation_id).await {
                Ok(RecoveryOutcome::Recovered { .. }) => report.recovered += 1,
                Ok(RecoveryOutcome::Failed(outcome)) => {
                    report.failed += 1;
                    if outcome.error.error_type == ErrorType::Network {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%operation_id, error = %e, "Recovery attempt errored");
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                recovered = report.recovered,
                failed = report.failed,
                "Recovery tick finished"
            );
        }
        Ok(report)
    }
}
