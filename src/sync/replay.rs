//! Replay of queued operations and reconciliation of confirmed results
//!
//! A successful replay is applied in one store transaction: the operation
//! leaves the queue, the server's record replaces the optimistic one, and any
//! temp id the server just resolved is rewritten everywhere it is referenced.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connectivity::Connectivity;
use crate::entity::{
    is_temp_id, set_field, shallow_merge, EntityType, FIELD_ID, FIELD_IS_TEMP, FIELD_STOCK,
};
use crate::error::StoreError;
use crate::recovery::plan::{set_plan_status_in, PlanStatus};
use crate::store::{LocalStore, StoreTxn};
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};

use super::queue::{self, OperationAction, OperationType, PendingOperation};

/// Send a request, bounding it by `timeout`.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    request: &ApiRequest,
    timeout: Duration,
) -> Result<ApiResponse, TransportError> {
    match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

/// Server record from a response body, marked as confirmed.
fn confirmed_record(entity: EntityType, data: &Value) -> Option<Value> {
    let descriptor = entity.descriptor();
    descriptor.id_of(data)?;
    let mut record = data.clone();
    set_field(&mut record, FIELD_IS_TEMP, Value::Bool(false));
    Some(record)
}

/// Write a server-confirmed mutation result into the cache.
///
/// Returns the id the record is stored under, when there is one.
pub(crate) fn write_confirmed(
    txn: &StoreTxn<'_>,
    operation_type: OperationType,
    target_id: Option<&str>,
    data: &Value,
) -> Result<Option<String>, StoreError> {
    let entity = operation_type.entity;
    let descriptor = entity.descriptor();
    match operation_type.action {
        OperationAction::Create => match confirmed_record(entity, data) {
            Some(record) => {
                txn.put(descriptor.collection, &record)?;
                Ok(descriptor.id_of(&record).map(str::to_string))
            }
            None => Ok(None),
        },
        OperationAction::Update | OperationAction::UpdateStock => {
            let id = match descriptor.id_of(data).or(target_id) {
                Some(id) => id.to_string(),
                None => return Ok(None),
            };
            if !data.is_object() {
                return Ok(Some(id));
            }
            let base = txn
                .get(descriptor.collection, &id)?
                .unwrap_or_else(|| serde_json::json!({ FIELD_ID: id.clone() }));
            let stock_only = operation_type.action == OperationAction::UpdateStock
                && descriptor.id_of(data).is_none();
            let mut record = if stock_only {
                // Bare stock object, or `{stock: {...}}`, nests like the offline path
                let patch = data.get(FIELD_STOCK).unwrap_or(data);
                let current = base.get(FIELD_STOCK).cloned().unwrap_or_else(|| serde_json::json!({}));
                let mut record = base.clone();
                set_field(&mut record, FIELD_STOCK, shallow_merge(&current, Some(patch)));
                record
            } else {
                shallow_merge(&base, Some(data))
            };
            set_field(&mut record, FIELD_ID, Value::String(id.clone()));
            set_field(&mut record, FIELD_IS_TEMP, Value::Bool(is_temp_id(&id)));
            txn.put(descriptor.collection, &record)?;
            Ok(Some(id))
        }
        OperationAction::Delete => {
            if let Some(id) = target_id {
                txn.delete(descriptor.collection, id)?;
            }
            Ok(target_id.map(str::to_string))
        }
    }
}

/// Rewrite references to id `from` as `to` in dependent records and queued operations.
pub(crate) fn rewrite_references(
    txn: &StoreTxn<'_>,
    entity: EntityType,
    from: &str,
    to: &str,
) -> Result<usize, StoreError> {
    let mut rewritten = 0;
    for (dependent, field) in entity.dependents() {
        for mut record in txn.get_all(dependent.collection())? {
            if record.get(field).and_then(Value::as_str) == Some(from) {
                set_field(&mut record, field, Value::String(to.to_string()));
                txn.put(dependent.collection(), &record)?;
                rewritten += 1;
            }
        }
    }
    for mut op in queue::load_all(txn)? {
        if op.rewrite_id(from, to) {
            queue::put_in(txn, &op)?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// What a reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub operation_id: String,
    /// Server id of a confirmed CREATE
    pub resolved_id: Option<String>,
    pub references_rewritten: usize,
}

/// Dispatches queued operations and reconciles their results
#[derive(Clone)]
pub struct Replayer {
    store: Arc<LocalStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    timeout: Duration,
    clock: Clock,
}

impl Replayer {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        timeout: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            transport,
            connectivity,
            timeout,
            clock,
        }
    }

    /// Replay the original request verbatim. Any answer marks the server reachable.
    pub async fn dispatch(&self, op: &PendingOperation) -> Result<ApiResponse, TransportError> {
        debug!(
            operation_id = %op.id,
            operation_type = %op.operation_type,
            endpoint = %op.target_endpoint,
            "Replaying operation"
        );
        let result = send_with_timeout(self.transport.as_ref(), &op.request(), self.timeout).await;
        let reachable = match &result {
            Ok(_) => true,
            Err(err) => !err.is_no_response(),
        };
        self.connectivity.set_online(reachable);
        result
    }

    /// Apply a confirmed operation atomically.
    pub fn reconcile(
        &self,
        op: &PendingOperation,
        response: &ApiResponse,
    ) -> Result<Reconciled, StoreError> {
        let now = (self.clock)();
        let reconciled = self.store.atomically(|txn| {
            queue::remove_in(txn, &op.id)?;
            set_plan_status_in(txn, &op.id, PlanStatus::Completed, now)?;

            let resolved =
                write_confirmed(txn, op.operation_type, op.target_id.as_deref(), &response.data)?;

            let mut out = Reconciled {
                operation_id: op.id.clone(),
                ..Default::default()
            };
            if op.action() != OperationAction::Create {
                return Ok(out);
            }

            let collection = op.entity().collection();
            match (op.temp_id.as_deref(), resolved) {
                (Some(temp), Some(real)) if temp != real => {
                    txn.delete(collection, temp)?;
                    out.references_rewritten = rewrite_references(txn, op.entity(), temp, &real)?;
                    out.resolved_id = Some(real);
                }
                (Some(temp), None) => {
                    // Accepted without an id in the response: keep the record, drop the temp flag
                    warn!(operation_id = %op.id, temp_id = temp, "Create confirmed without a server id");
                    if let Some(mut record) = txn.get(collection, temp)? {
                        set_field(&mut record, FIELD_IS_TEMP, Value::Bool(false));
                        txn.put(collection, &record)?;
                    }
                }
                (_, resolved) => out.resolved_id = resolved,
            }
            Ok(out)
        })?;

        info!(
            operation_id = %op.id,
            operation_type = %op.operation_type,
            resolved_id = ?reconciled.resolved_id,
            rewritten = reconciled.references_rewritten,
            "Operation reconciled"
        );
        Ok(reconciled)
    }
}
