//! Queue drain: replays pending operations in order

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::events::{StatusTracker, SyncHistoryEntry};
use crate::recovery::{ErrorType, RecoveryManager, RetryPolicy};

use super::queue::{OperationQueue, PendingOperation};
use super::replay::Replayer;

/// Counts from one drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Confirmed by the server and removed from the queue
    pub processed: usize,
    /// Failed and now waiting for an operator
    pub failed: usize,
    /// Failed and scheduled for an automatic retry
    pub retrying: usize,
    /// Not attempted (held, backing off, blocked on a temp id, or cut short)
    pub deferred: usize,
    pub duration_ms: u64,
}

/// Why an operation was skipped this round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    OnHold,
    BackingOff,
    AwaitingCreate,
}

pub struct SyncEngine {
    queue: OperationQueue,
    replayer: Replayer,
    recovery: Arc<RecoveryManager>,
    status: Arc<StatusTracker>,
    policy: RetryPolicy,
    guard: Arc<Mutex<()>>,
    stop: AtomicBool,
    clock: Clock,
}

impl SyncEngine {
    pub fn new(
        queue: OperationQueue,
        replayer: Replayer,
        recovery: Arc<RecoveryManager>,
        status: Arc<StatusTracker>,
        guard: Arc<Mutex<()>>,
        clock: Clock,
    ) -> Self {
        let policy = recovery.policy().clone();
        Self {
            queue,
            replayer,
            recovery,
            status,
            policy,
            guard,
            stop: AtomicBool::new(false),
            clock,
        }
    }

    /// Stop after the operation in flight. Nothing is cancelled mid-call.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn skip_reason(&self, op: &PendingOperation, now: i64) -> Option<Skip> {
        if op.on_hold {
            Some(Skip::OnHold)
        } else if !self.policy.backoff_elapsed(op, now) {
            Some(Skip::BackingOff)
        } else if !op.unresolved_temp_ids().is_empty() {
            Some(Skip::AwaitingCreate)
        } else {
            None
        }
    }

    /// Replay every eligible queued operation once.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| SyncError::DrainInProgress)?;
        self.stop.store(false, Ordering::SeqCst);

        let started_at = (self.clock)();
        let ops = self.queue.list()?;
        info!(total = ops.len(), "Drain started");
        self.status.begin(ops.len())?;

        let mut report = DrainReport::default();
        let result = self.replay_all(&ops, &mut report).await;

        let entry = SyncHistoryEntry {
            started_at,
            finished_at: (self.clock)(),
            processed: report.processed,
            failed: report.failed,
            retrying: report.retrying,
            deferred: report.deferred,
        };
        report.duration_ms = entry.duration_ms();
        self.status.finish(entry)?;
        result?;
        Ok(report)
    }

    async fn replay_all(&self, ops: &[PendingOperation], report: &mut DrainReport) -> Result<()> {
        let mut awaiting = Vec::new();
        for (index, listed) in ops.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                report.deferred += ops.len() - index;
                debug!("Drain stop requested");
                return Ok(());
            }

            // An earlier reconciliation may have rewritten or removed it
            let op = match self.queue.get(&listed.id)? {
                Some(op) => op,
                None => continue,
            };

            let now = (self.clock)();
            if let Some(reason) = self.skip_reason(&op, now) {
                debug!(operation_id = %op.id, ?reason, "Operation deferred");
                if reason == Skip::AwaitingCreate {
                    awaiting.push(op.id.clone());
                }
                report.deferred += 1;
                continue;
            }

            if !self.replay_one(&op, report).await? {
                report.deferred += ops.len() - index - 1;
                info!("Server unreachable, ending drain early");
                return Ok(());
            }
        }

        // Parents confirmed later in the pass (e.g. a CREATE being retried)
        for id in awaiting {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let op = match self.queue.get(&id)? {
                Some(op) => op,
                None => continue,
            };
            if self.skip_reason(&op, (self.clock)()).is_some() {
                continue;
            }
            report.deferred -= 1;
            if !self.replay_one(&op, report).await? {
                info!("Server unreachable, ending drain early");
                break;
            }
        }
        Ok(())
    }

    /// Replay one operation and count the outcome. Returns false when the
    /// server could not be reached and the drain should stop.
    async fn replay_one(&self, op: &PendingOperation, report: &mut DrainReport) -> Result<bool> {
        match self.replayer.dispatch(op).await {
            Ok(response) => {
                self.replayer.reconcile(op, &response)?;
                self.status.item_processed(&op.id);
                report.processed += 1;
                Ok(true)
            }
            Err(err) => {
                let outcome = self.recovery.handle_failure(op, &err)?;
                if outcome.requires_action {
                    report.failed += 1;
                } else {
                    report.retrying += 1;
                }
                Ok(outcome.error.error_type != ErrorType::Network)
            }
        }
    }
}
