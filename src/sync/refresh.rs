//! Full refresh of entity collections from the server
//!
//! The server snapshot replaces each collection, except where local work has
//! not been confirmed yet: temp records, records with a queued write, and
//! records in an unresolved update conflict keep their local version, and
//! records with a queued delete stay gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::conflict::{Conflict, ConflictDetector, ConflictKind, Resolution};
use crate::connectivity::Connectivity;
use crate::entity::{is_temp, is_temp_id, set_field, shallow_merge, EntityType, FIELD_ID, FIELD_IS_TEMP};
use crate::error::{Result, StoreError, SyncError};
use crate::events::{ConflictReport, StatusTracker};
use crate::recovery::plan::{set_plan_status_in, PlanStatus};
use crate::routes::RouteRegistry;
use crate::store::meta::CONFLICTS;
use crate::store::{LocalStore, StoreTxn};
use crate::transport::{ApiRequest, HttpMethod, Transport};

use super::queue::{self, OperationAction, OperationType, PendingOperation};
use super::replay::{rewrite_references, send_with_timeout};

type StoredConflicts = BTreeMap<String, Conflict>;

/// Outcome of refreshing one collection
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRefresh {
    pub entity: EntityType,
    pub records: usize,
    pub conflicts: Vec<Conflict>,
}

/// Records in a list response: a bare array or `{items: [...]}`.
pub fn records_from(data: &Value) -> Option<Vec<Value>> {
    match data {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => map.get("items").and_then(Value::as_array).cloned(),
        _ => None,
    }
}

/// Merge a server snapshot into one collection and record new conflicts.
pub fn reconcile_collection(
    txn: &StoreTxn<'_>,
    entity: EntityType,
    server: &[Value],
    now: i64,
) -> std::result::Result<Vec<Conflict>, StoreError> {
    let d = entity.descriptor();
    let local = txn.get_all(d.collection)?;
    let last_sync: Option<i64> = txn.get_meta(d.sync_key)?;

    let mut pending_delete = HashSet::new();
    let mut pending_write = HashSet::new();
    for op in queue::load_all(txn)?.into_iter().filter(|op| op.entity() == entity) {
        let id = op.target_id.clone().or_else(|| op.temp_id.clone());
        if let Some(id) = id {
            if op.action() == OperationAction::Delete {
                pending_delete.insert(id);
            } else {
                pending_write.insert(id);
            }
        }
    }

    let conflicts = ConflictDetector::for_entity(entity).detect(&local, server, last_sync, now);

    let mut stored: StoredConflicts = txn.get_meta(CONFLICTS)?.unwrap_or_default();
    for conflict in &conflicts {
        stored.insert(conflict.id.clone(), conflict.clone());
    }
    let held_by_conflict: HashSet<String> = stored
        .values()
        .filter(|c| c.entity == entity && c.kind == ConflictKind::Update)
        .map(|c| c.local_id.clone())
        .collect();

    let local_by_id: HashMap<&str, &Value> = local
        .iter()
        .filter_map(|r| d.id_of(r).map(|id| (id, r)))
        .collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(server.len());
    for record in server {
        let id = match d.id_of(record) {
            Some(id) => id,
            None => continue,
        };
        if pending_delete.contains(id) || !seen.insert(id.to_string()) {
            continue;
        }
        let keep_local = pending_write.contains(id) || held_by_conflict.contains(id);
        match local_by_id.get(id) {
            Some(local) if keep_local => merged.push((*local).clone()),
            _ => {
                let mut record = record.clone();
                set_field(&mut record, FIELD_IS_TEMP, Value::Bool(false));
                merged.push(record);
            }
        }
    }
    for record in &local {
        let id = match d.id_of(record) {
            Some(id) => id,
            None => continue,
        };
        let unconfirmed = is_temp(record) || is_temp_id(id) || pending_write.contains(id);
        if unconfirmed && !pending_delete.contains(id) && seen.insert(id.to_string()) {
            merged.push(record.clone());
        }
    }

    txn.replace_all(d.collection, &merged, now)?;
    if !conflicts.is_empty() {
        txn.put_meta(CONFLICTS, &stored)?;
    }
    debug!(collection = d.collection, records = merged.len(), conflicts = conflicts.len(), "Collection refreshed");
    Ok(conflicts)
}

/// Queue a PUT of `record` for entity `id`.
fn queue_update(
    txn: &StoreTxn<'_>,
    entity: EntityType,
    id: &str,
    record: &Value,
    now: i64,
) -> std::result::Result<PendingOperation, StoreError> {
    let mut payload = record.clone();
    if let Value::Object(map) = &mut payload {
        map.remove(FIELD_IS_TEMP);
    }
    let request = ApiRequest::new(
        HttpMethod::Put,
        RouteRegistry::item_endpoint(entity, id),
        Some(payload),
    );
    let mut op = PendingOperation::new(OperationType::new(OperationAction::Update, entity), &request, now);
    op.target_id = Some(id.to_string());
    queue::put_in(txn, &op)?;
    Ok(op)
}

/// Remove queued operations of `entity` matching `pred`, closing their plans.
fn drop_ops<F>(
    txn: &StoreTxn<'_>,
    entity: EntityType,
    now: i64,
    pred: F,
) -> std::result::Result<usize, StoreError>
where
    F: Fn(&PendingOperation) -> bool,
{
    let mut dropped = 0;
    for op in queue::load_all(txn)? {
        if op.entity() == entity && pred(&op) {
            queue::remove_in(txn, &op.id)?;
            set_plan_status_in(txn, &op.id, PlanStatus::Completed, now)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

fn is_update(op: &PendingOperation) -> bool {
    matches!(op.action(), OperationAction::Update | OperationAction::UpdateStock)
}

/// Replace a temp record by the server's copy and point everything at the server id.
fn adopt_server_record(txn: &StoreTxn<'_>, conflict: &Conflict, now: i64) -> std::result::Result<(), StoreError> {
    let collection = conflict.entity.collection();
    let temp = conflict.local_id.as_str();
    drop_ops(txn, conflict.entity, now, |op| {
        op.action() == OperationAction::Create && op.temp_id.as_deref() == Some(temp)
    })?;
    txn.delete(collection, temp)?;
    let mut server = conflict.server.clone();
    set_field(&mut server, FIELD_IS_TEMP, Value::Bool(false));
    txn.put(collection, &server)?;
    rewrite_references(txn, conflict.entity, temp, &conflict.server_id)?;
    Ok(())
}

fn apply_resolution(
    txn: &StoreTxn<'_>,
    conflict: &Conflict,
    resolution: &Resolution,
    now: i64,
) -> std::result::Result<(), StoreError> {
    let entity = conflict.entity;
    let collection = entity.collection();
    let server_id = conflict.server_id.as_str();

    match (conflict.kind, resolution) {
        (ConflictKind::Update, Resolution::KeepServer) => {
            let mut server = conflict.server.clone();
            set_field(&mut server, FIELD_IS_TEMP, Value::Bool(false));
            txn.put(collection, &server)?;
            drop_ops(txn, entity, now, |op| is_update(op) && op.target_id.as_deref() == Some(server_id))?;
        }
        (ConflictKind::Update, Resolution::KeepLocal) => {
            let queued = queue::load_all(txn)?
                .iter()
                .any(|op| op.entity() == entity && is_update(op) && op.target_id.as_deref() == Some(server_id));
            if !queued {
                let local = txn
                    .get(collection, &conflict.local_id)?
                    .unwrap_or_else(|| conflict.local.clone());
                queue_update(txn, entity, server_id, &local, now)?;
            }
        }
        (ConflictKind::Create, Resolution::KeepServer) => {
            adopt_server_record(txn, conflict, now)?;
        }
        (ConflictKind::Create, Resolution::KeepLocal) => {}
        (kind, Resolution::Merge(fields)) => {
            if kind == ConflictKind::Create {
                adopt_server_record(txn, conflict, now)?;
            } else {
                drop_ops(txn, entity, now, |op| is_update(op) && op.target_id.as_deref() == Some(server_id))?;
            }
            let mut merged = shallow_merge(&conflict.server, Some(fields));
            set_field(&mut merged, FIELD_ID, Value::String(server_id.to_string()));
            set_field(&mut merged, FIELD_IS_TEMP, Value::Bool(false));
            txn.put(collection, &merged)?;
            queue_update(txn, entity, server_id, &merged, now)?;
        }
    }

    let mut stored: StoredConflicts = txn.get_meta(CONFLICTS)?.unwrap_or_default();
    stored.remove(&conflict.id);
    txn.put_meta(CONFLICTS, &stored)
}

/// Pulls server snapshots and settles conflicts
pub struct Refresher {
    store: Arc<LocalStore>,
    transport: Arc<dyn Transport>,
    status: Arc<StatusTracker>,
    connectivity: Connectivity,
    timeout: Duration,
    clock: Clock,
}

impl Refresher {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn Transport>,
        status: Arc<StatusTracker>,
        connectivity: Connectivity,
        timeout: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            transport,
            status,
            connectivity,
            timeout,
            clock,
        }
    }

    /// Refresh every collection, parents first. Stops at the first no-response failure.
    pub async fn refresh_all(&self) -> Result<Vec<EntityRefresh>> {
        let mut results = Vec::with_capacity(EntityType::ALL.len());
        for entity in EntityType::ALL {
            match self.refresh_entity(entity).await {
                Ok(refresh) => results.push(refresh),
                Err(SyncError::Transport(err)) if err.is_no_response() => {
                    return Err(SyncError::Transport(err));
                }
                Err(e) => {
                    warn!(collection = entity.collection(), error = %e, "Refresh failed");
                }
            }
        }
        let conflicts: usize = results.iter().map(|r| r.conflicts.len()).sum();
        info!(collections = results.len(), conflicts, "Refresh finished");
        Ok(results)
    }

    pub async fn refresh_entity(&self, entity: EntityType) -> Result<EntityRefresh> {
        let d = entity.descriptor();
        let request = ApiRequest::get(d.endpoint);
        let response = match send_with_timeout(self.transport.as_ref(), &request, self.timeout).await {
            Ok(response) => response,
            Err(err) => {
                self.connectivity.set_online(!err.is_no_response());
                return Err(err.into());
            }
        };
        self.connectivity.set_online(true);

        let server = records_from(&response.data).ok_or_else(|| {
            SyncError::InvalidResponse(format!("expected a list from GET {}", d.endpoint))
        })?;

        let now = (self.clock)();
        let conflicts = self
            .store
            .atomically(|txn| reconcile_collection(txn, entity, &server, now))?;

        for conflict in &conflicts {
            warn!(conflict_id = %conflict.id, kind = ?conflict.kind, "Conflict detected");
            self.status
                .conflict_detected(None, ConflictReport::Refresh(conflict.clone()));
        }
        Ok(EntityRefresh {
            entity,
            records: server.len(),
            conflicts,
        })
    }

    /// Unresolved conflicts, keyed by conflict id.
    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        let stored: StoredConflicts = self.store.get_meta(CONFLICTS)?.unwrap_or_default();
        Ok(stored.into_values().collect())
    }

    pub fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> Result<()> {
        let stored: StoredConflicts = self.store.get_meta(CONFLICTS)?.unwrap_or_default();
        let conflict = stored
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let now = (self.clock)();
        self.store
            .atomically(|txn| apply_resolution(txn, &conflict, &resolution, now))?;
        info!(conflict_id, ?resolution, "Conflict resolved");
        Ok(())
    }
}
