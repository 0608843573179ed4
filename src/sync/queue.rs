//! Durable queue of mutations the server has not confirmed yet
//!
//! The queue is the single source of truth for work not yet done: an
//! operation leaves it only after the server accepted it (or an operator
//! explicitly replaced it).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entity::{is_temp_id, EntityType};
use crate::error::StoreError;
use crate::recovery::ErrorRecord;
use crate::store::{LocalStore, StoreTxn, PENDING_OPERATIONS};
use crate::transport::{ApiRequest, HttpMethod};

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationAction {
    Create,
    Update,
    /// Stock-status update (`/<entity>/{id}/stock`)
    UpdateStock,
    Delete,
}

impl OperationAction {
    /// Replay priority class, lower first.
    pub fn priority(self) -> u8 {
        match self {
            OperationAction::Create => 0,
            OperationAction::Update | OperationAction::UpdateStock => 1,
            OperationAction::Delete => 2,
        }
    }
}

/// Entity-qualified operation type, e.g. `CREATE_DISH` or `UPDATE_DISH_STOCK`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct OperationType {
    pub action: OperationAction,
    pub entity: EntityType,
}

impl OperationType {
    pub fn new(action: OperationAction, entity: EntityType) -> Self {
        Self { action, entity }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.entity.descriptor().op_name;
        match self.action {
            OperationAction::Create => write!(f, "CREATE_{}", name),
            OperationAction::Update => write!(f, "UPDATE_{}", name),
            OperationAction::UpdateStock => write!(f, "UPDATE_{}_STOCK", name),
            OperationAction::Delete => write!(f, "DELETE_{}", name),
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, rest) = if let Some(rest) = s.strip_prefix("CREATE_") {
            (OperationAction::Create, rest)
        } else if let Some(rest) = s.strip_prefix("DELETE_") {
            (OperationAction::Delete, rest)
        } else if let Some(rest) = s.strip_prefix("UPDATE_") {
            match rest.strip_suffix("_STOCK") {
                Some(entity) => (OperationAction::UpdateStock, entity),
                None => (OperationAction::Update, rest),
            }
        } else {
            return Err(format!("unknown operation type: {}", s));
        };
        let entity =
            EntityType::from_op_name(rest).ok_or_else(|| format!("unknown operation type: {}", s))?;
        Ok(Self { action, entity })
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.to_string()
    }
}

impl TryFrom<String> for OperationType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A mutation waiting for server confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub operation_type: OperationType,
    pub target_endpoint: String,
    pub http_method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Locally minted id (CREATE only)
    #[serde(default)]
    pub temp_id: Option<String>,
    /// Entity addressed by UPDATE/DELETE
    #[serde(default)]
    pub target_id: Option<String>,
    pub enqueued_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
    /// Waiting for an operator decision; drain skips it
    #[serde(default)]
    pub on_hold: bool,
}

pub fn new_operation_id() -> String {
    format!("op_{}", uuid::Uuid::new_v4().simple())
}

/// Id for a requeued copy: `<base>_retry_<n+1>`.
pub fn requeue_id(id: &str) -> String {
    if let Some((base, n)) = id.rsplit_once("_retry_") {
        if let Ok(n) = n.parse::<u32>() {
            return format!("{}_retry_{}", base, n + 1);
        }
    }
    format!("{}_retry_1", id)
}

impl PendingOperation {
    pub fn new(operation_type: OperationType, request: &ApiRequest, now: i64) -> Self {
        Self {
            id: new_operation_id(),
            operation_type,
            target_endpoint: request.endpoint.clone(),
            http_method: request.method,
            payload: request.payload.clone(),
            temp_id: None,
            target_id: None,
            enqueued_at: now,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            on_hold: false,
        }
    }

    /// The original request, replayed verbatim.
    pub fn request(&self) -> ApiRequest {
        ApiRequest::new(self.http_method, self.target_endpoint.clone(), self.payload.clone())
    }

    pub fn entity(&self) -> EntityType {
        self.operation_type.entity
    }

    pub fn action(&self) -> OperationAction {
        self.operation_type.action
    }

    pub fn is_scheduled_retry(&self) -> bool {
        self.retry_count > 0
    }

    /// Temp ids this operation depends on that the server has never seen.
    ///
    /// A CREATE's own temp id is not a dependency.
    pub fn unresolved_temp_ids(&self) -> Vec<String> {
        temp_dependencies(
            self.entity(),
            &self.target_endpoint,
            self.target_id.as_deref(),
            self.payload.as_ref(),
        )
    }

    /// Replace every occurrence of id `from` with `to`. Returns whether anything changed.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;

        let endpoint = self
            .target_endpoint
            .split('/')
            .map(|seg| if seg == from { to } else { seg })
            .collect::<Vec<_>>()
            .join("/");
        if endpoint != self.target_endpoint {
            self.target_endpoint = endpoint;
            changed = true;
        }

        if self.target_id.as_deref() == Some(from) {
            self.target_id = Some(to.to_string());
            changed = true;
        }

        if let Some(Value::Object(map)) = &mut self.payload {
            for value in map.values_mut() {
                if value.as_str() == Some(from) {
                    *value = Value::String(to.to_string());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Fresh copy for a requeue: new id, retry state reset, optional payload override.
    pub fn requeued(&self, payload: Option<Value>, now: i64) -> Self {
        Self {
            id: requeue_id(&self.id),
            payload: payload.or_else(|| self.payload.clone()),
            enqueued_at: now,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            on_hold: false,
            ..self.clone()
        }
    }

    /// Whether this operation targets `id` (as temp id or target id).
    pub fn addresses(&self, id: &str) -> bool {
        self.temp_id.as_deref() == Some(id) || self.target_id.as_deref() == Some(id)
    }
}

/// Temp ids found in an endpoint's path segments, an explicit target id and
/// the payload's reference fields, without duplicates.
pub fn temp_dependencies(
    entity: EntityType,
    endpoint: &str,
    target_id: Option<&str>,
    payload: Option<&Value>,
) -> Vec<String> {
    let mut ids: Vec<String> = endpoint
        .split('/')
        .filter(|seg| is_temp_id(seg))
        .map(str::to_string)
        .collect();
    let referenced = payload
        .map(|p| entity.descriptor().temp_references(p))
        .unwrap_or_default();
    for id in target_id
        .filter(|t| is_temp_id(t))
        .map(str::to_string)
        .into_iter()
        .chain(referenced)
    {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Replay order: priority class, then fresh before scheduled retries, then oldest first.
pub fn replay_cmp(a: &PendingOperation, b: &PendingOperation) -> Ordering {
    a.action()
        .priority()
        .cmp(&b.action().priority())
        .then(a.is_scheduled_retry().cmp(&b.is_scheduled_retry()))
        .then(a.enqueued_at.cmp(&b.enqueued_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_for_replay(ops: &mut [PendingOperation]) {
    ops.sort_by(replay_cmp);
}

/// Load every queued operation inside a transaction, in replay order.
pub fn load_all(txn: &StoreTxn<'_>) -> Result<Vec<PendingOperation>, StoreError> {
    let mut ops = txn
        .get_all(PENDING_OPERATIONS)?
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<PendingOperation>, _>>()?;
    sort_for_replay(&mut ops);
    Ok(ops)
}

pub fn put_in(txn: &StoreTxn<'_>, op: &PendingOperation) -> Result<(), StoreError> {
    txn.put(PENDING_OPERATIONS, &serde_json::to_value(op)?)
}

pub fn get_in(txn: &StoreTxn<'_>, id: &str) -> Result<Option<PendingOperation>, StoreError> {
    match txn.get(PENDING_OPERATIONS, id)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn remove_in(txn: &StoreTxn<'_>, id: &str) -> Result<(), StoreError> {
    txn.delete(PENDING_OPERATIONS, id)
}

/// Persistent operation queue over the local store
#[derive(Clone)]
pub struct OperationQueue {
    store: Arc<LocalStore>,
}

impl OperationQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, op: &PendingOperation) -> Result<(), StoreError> {
        self.store.put(PENDING_OPERATIONS, &serde_json::to_value(op)?)?;
        debug!(
            operation_id = %op.id,
            operation_type = %op.operation_type,
            endpoint = %op.target_endpoint,
            "Operation enqueued"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingOperation>, StoreError> {
        match self.store.get(PENDING_OPERATIONS, id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All queued operations in replay order.
    pub fn list(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let mut ops = self
            .store
            .get_all(PENDING_OPERATIONS)?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<PendingOperation>, _>>()?;
        sort_for_replay(&mut ops);
        Ok(ops)
    }

    pub fn update(&self, op: &PendingOperation) -> Result<(), StoreError> {
        self.store.put(PENDING_OPERATIONS, &serde_json::to_value(op)?)
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(PENDING_OPERATIONS, id)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.store.get_all(PENDING_OPERATIONS)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(action: OperationAction, enqueued_at: i64, retry_count: u32) -> PendingOperation {
        let request = ApiRequest::new(HttpMethod::Post, "/dishes", Some(json!({"name": "x"})));
        let mut op = PendingOperation::new(OperationType::new(action, EntityType::Dish), &request, enqueued_at);
        op.retry_count = retry_count;
        op
    }

    #[test]
    fn test_operation_type_names() {
        let cases = [
            ("CREATE_CATEGORY", OperationAction::Create, EntityType::Category),
            ("UPDATE_TABLE_TYPE", OperationAction::Update, EntityType::TableType),
            ("UPDATE_DISH_STOCK", OperationAction::UpdateStock, EntityType::Dish),
            ("DELETE_VARIANT", OperationAction::Delete, EntityType::Variant),
        ];
        for (name, action, entity) in cases {
            let parsed: OperationType = name.parse().unwrap();
            assert_eq!(parsed, OperationType::new(action, entity));
            assert_eq!(parsed.to_string(), name);
        }
        assert!("MERGE_DISH".parse::<OperationType>().is_err());
        assert!("CREATE_ORDER".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_replay_order() {
        let delete_old = op(OperationAction::Delete, 1, 0);
        let update_retry = op(OperationAction::Update, 2, 1);
        let update_new = op(OperationAction::Update, 5, 0);
        let create_late = op(OperationAction::Create, 9, 0);
        let create_early = op(OperationAction::Create, 3, 0);

        let mut ops = vec![
            delete_old.clone(),
            update_retry.clone(),
            update_new.clone(),
            create_late.clone(),
            create_early.clone(),
        ];
        sort_for_replay(&mut ops);

        let order: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(
            order,
            vec![
                create_early.id.as_str(),
                create_late.id.as_str(),
                update_new.id.as_str(),
                update_retry.id.as_str(),
                delete_old.id.as_str(),
            ]
        );
    }

    #[test]
    fn test_requeue_id_suffix() {
        assert_eq!(requeue_id("op_abc"), "op_abc_retry_1");
        assert_eq!(requeue_id("op_abc_retry_1"), "op_abc_retry_2");
        assert_eq!(requeue_id("op_abc_retry_x"), "op_abc_retry_x_retry_1");
    }

    #[test]
    fn test_rewrite_temp_id() {
        let request = ApiRequest::new(
            HttpMethod::Put,
            "/variants/temp_v1",
            Some(json!({"dishId": "temp_d1", "name": "Large"})),
        );
        let mut op = PendingOperation::new(
            OperationType::new(OperationAction::Update, EntityType::Variant),
            &request,
            0,
        );
        op.target_id = Some("temp_v1".into());
        assert_eq!(op.unresolved_temp_ids(), vec!["temp_v1".to_string(), "temp_d1".to_string()]);

        assert!(op.rewrite_id("temp_d1", "dish-7"));
        assert_eq!(op.payload.as_ref().unwrap()["dishId"], "dish-7");
        assert!(op.rewrite_id("temp_v1", "variant-2"));
        assert_eq!(op.target_endpoint, "/variants/variant-2");
        assert_eq!(op.target_id.as_deref(), Some("variant-2"));
        assert!(op.unresolved_temp_ids().is_empty());
        assert!(!op.rewrite_id("temp_zz", "nothing"));
    }

    #[test]
    fn test_queue_persistence() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let queue = OperationQueue::new(store);
        let first = op(OperationAction::Delete, 1, 0);
        let second = op(OperationAction::Create, 2, 0);
        queue.enqueue(&first).unwrap();
        queue.enqueue(&second).unwrap();

        assert_eq!(queue.len().unwrap(), 2);
        let listed = queue.list().unwrap();
        assert_eq!(listed[0].id, second.id);

        let mut stored = queue.get(&first.id).unwrap().unwrap();
        assert_eq!(stored, first);
        stored.retry_count = 3;
        queue.update(&stored).unwrap();
        assert_eq!(queue.get(&first.id).unwrap().unwrap().retry_count, 3);

        queue.remove(&first.id).unwrap();
        queue.remove(&second.id).unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(op(OperationAction::UpdateStock, 7, 0)).unwrap();
        assert_eq!(value["operationType"], "UPDATE_DISH_STOCK");
        assert_eq!(value["httpMethod"], "POST");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["enqueuedAt"], 7);
    }
}
