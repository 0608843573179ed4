//! Sync events and the status tracker
//!
//! Progress is reported two ways: a `broadcast` stream of [`SyncEvent`]s for
//! anything that wants the individual steps, and a `watch` channel holding the
//! latest [`SyncStatus`] for anything that only wants the current picture.
//! The tracker is the only writer of the persisted status and history.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::conflict::Conflict;
use crate::error::StoreError;
use crate::recovery::{ErrorRecord, Strategy};
use crate::store::meta::{SYNC_HISTORY, SYNC_STATUS};
use crate::store::LocalStore;

/// Where a reported conflict came from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ConflictReport {
    /// Found while comparing a refresh against the local replica
    Refresh(Conflict),
    /// The server rejected a replayed operation with 409
    Replay {
        status: Option<u16>,
        message: String,
    },
}

/// Event published on the sync bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    SyncStarted {
        total: usize,
    },
    SyncProgress {
        completed: usize,
        failed: usize,
        progress: u8,
    },
    SyncCompleted {
        completed: usize,
        failed: usize,
        duration_ms: u64,
    },
    SyncFailed {
        completed: usize,
        failed: usize,
        errors: Vec<ErrorRecord>,
    },
    SyncItemProcessed {
        operation_id: String,
    },
    SyncItemFailed {
        operation_id: String,
        error: ErrorRecord,
        strategy: Strategy,
        requires_action: bool,
    },
    SyncConflictDetected {
        operation_id: Option<String>,
        conflict: ConflictReport,
    },
}

/// Broadcast bus for sync events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        debug!(?event, "Sync event");
        let _ = self.tx.send(event);
    }
}

/// Current sync status, persisted in meta `syncStatus`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub in_progress: bool,
    /// 0-100
    pub progress: u8,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(default)]
    pub last_sync: Option<i64>,
    /// Most recent failures, newest last
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

impl SyncStatus {
    fn recompute_progress(&mut self) {
        self.progress = if self.total == 0 {
            100
        } else {
            let done = (self.completed + self.failed).min(self.total);
            ((done * 100) / self.total) as u8
        };
    }
}

/// One finished drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub started_at: i64,
    pub finished_at: i64,
    pub processed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub deferred: usize,
}

impl SyncHistoryEntry {
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.finished_at - self.started_at).unwrap_or(0)
    }
}

/// Owns the sync status on behalf of the engine.
pub struct StatusTracker {
    store: Arc<LocalStore>,
    events: EventBus,
    tx: watch::Sender<SyncStatus>,
    /// Guards read-modify-write of status + history
    history: Mutex<Vec<SyncHistoryEntry>>,
    error_limit: usize,
    history_limit: usize,
}

impl StatusTracker {
    /// Load persisted status. A drain interrupted by a crash is no longer in progress.
    pub fn new(
        store: Arc<LocalStore>,
        events: EventBus,
        error_limit: usize,
        history_limit: usize,
    ) -> Result<Self, StoreError> {
        let mut status: SyncStatus = store.get_meta(SYNC_STATUS)?.unwrap_or_default();
        status.in_progress = false;
        let history: Vec<SyncHistoryEntry> = store.get_meta(SYNC_HISTORY)?.unwrap_or_default();
        let (tx, _) = watch::channel(status);
        Ok(Self {
            store,
            events,
            tx,
            history: Mutex::new(history),
            error_limit,
            history_limit,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn history(&self) -> Vec<SyncHistoryEntry> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let status = self.current();
        self.store.put_meta(SYNC_STATUS, &status)
    }

    fn push_error(&self, status: &mut SyncStatus, error: ErrorRecord) {
        status.errors.push(error);
        let excess = status.errors.len().saturating_sub(self.error_limit);
        if excess > 0 {
            status.errors.drain(..excess);
        }
    }

    /// A drain is starting over `total` operations.
    pub fn begin(&self, total: usize) -> Result<(), StoreError> {
        self.tx.send_modify(|s| {
            s.in_progress = true;
            s.total = total;
            s.completed = 0;
            s.failed = 0;
            s.recompute_progress();
            if total > 0 {
                s.progress = 0;
            }
        });
        self.persist()?;
        self.events.publish(SyncEvent::SyncStarted { total });
        Ok(())
    }

    pub fn item_processed(&self, operation_id: &str) {
        let mut snapshot = SyncStatus::default();
        self.tx.send_modify(|s| {
            s.completed += 1;
            s.recompute_progress();
            snapshot = s.clone();
        });
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist sync status");
        }
        self.events.publish(SyncEvent::SyncItemProcessed {
            operation_id: operation_id.to_string(),
        });
        self.publish_progress(&snapshot);
    }

    pub fn item_failed(&self, error: ErrorRecord, strategy: Strategy, requires_action: bool) {
        let mut snapshot = SyncStatus::default();
        self.tx.send_modify(|s| {
            s.failed += 1;
            self.push_error(s, error.clone());
            s.recompute_progress();
            snapshot = s.clone();
        });
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist sync status");
        }
        self.events.publish(SyncEvent::SyncItemFailed {
            operation_id: error.operation_id.clone(),
            error,
            strategy,
            requires_action,
        });
        if snapshot.in_progress {
            self.publish_progress(&snapshot);
        }
    }

    fn publish_progress(&self, status: &SyncStatus) {
        self.events.publish(SyncEvent::SyncProgress {
            completed: status.completed,
            failed: status.failed,
            progress: status.progress,
        });
    }

    /// A drain finished. Persists status and a history entry, then reports the outcome.
    pub fn finish(&self, entry: SyncHistoryEntry) -> Result<(), StoreError> {
        let mut snapshot = SyncStatus::default();
        self.tx.send_modify(|s| {
            s.in_progress = false;
            s.progress = 100;
            s.last_sync = Some(entry.finished_at);
            snapshot = s.clone();
        });
        self.persist()?;

        {
            let mut history = self.history.lock().map_err(|_| StoreError::Poisoned)?;
            history.push(entry.clone());
            let excess = history.len().saturating_sub(self.history_limit);
            if excess > 0 {
                history.drain(..excess);
            }
            self.store.put_meta(SYNC_HISTORY, &*history)?;
        }

        let failed = entry.failed + entry.retrying;
        info!(
            processed = entry.processed,
            failed = entry.failed,
            retrying = entry.retrying,
            deferred = entry.deferred,
            duration_ms = entry.duration_ms(),
            "Drain finished"
        );
        if failed == 0 {
            self.events.publish(SyncEvent::SyncCompleted {
                completed: entry.processed,
                failed: 0,
                duration_ms: entry.duration_ms(),
            });
        } else {
            let recent = snapshot
                .errors
                .iter()
                .rev()
                .take(failed)
                .rev()
                .cloned()
                .collect();
            self.events.publish(SyncEvent::SyncFailed {
                completed: entry.processed,
                failed,
                errors: recent,
            });
        }
        Ok(())
    }

    pub fn conflict_detected(&self, operation_id: Option<String>, conflict: ConflictReport) {
        self.events.publish(SyncEvent::SyncConflictDetected {
            operation_id,
            conflict,
        });
    }
}
