//! Optimistic application of mutations that got no response
//!
//! The local replica is updated as if the server had accepted the mutation,
//! and the mutation is queued for replay. Both happen in one transaction.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::entity::{
    as_object, is_temp, is_temp_id, mint_temp_id, record_id, set_field, shallow_merge, stamp,
    EntityType, FIELD_ID, FIELD_IS_TEMP, FIELD_STOCK,
};
use crate::error::StoreError;
use crate::recovery::plan::{set_plan_status_in, PlanStatus};
use crate::routes::RouteMatch;
use crate::store::{LocalStore, StoreTxn};
use crate::sync::queue::{self, OperationAction, PendingOperation};
use crate::transport::{ApiRequest, ApiResponse};

pub const QUEUED_MESSAGE: &str = "Saved offline, will sync when the server is reachable";

pub struct OptimisticApplier {
    store: Arc<LocalStore>,
    clock: Clock,
}

/// What the local write produced
#[derive(Debug, Default)]
struct Applied {
    record: Value,
    operation_id: Option<String>,
}

impl OptimisticApplier {
    pub fn new(store: Arc<LocalStore>, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Apply `request` locally and queue it. Returns a response shaped like a server success.
    pub fn apply(&self, request: &ApiRequest, route: &RouteMatch) -> Result<ApiResponse, StoreError> {
        let now = (self.clock)();
        let applied = self.store.atomically(|txn| match route.operation_type.action {
            OperationAction::Create => apply_create(txn, request, route, now),
            OperationAction::Update | OperationAction::UpdateStock => {
                apply_update(txn, request, route, now)
            }
            OperationAction::Delete => apply_delete(txn, request, route, now),
        })?;

        info!(
            operation_type = %route.operation_type,
            endpoint = %request.endpoint,
            operation_id = ?applied.operation_id,
            "Mutation applied offline"
        );
        Ok(ApiResponse {
            success: true,
            data: applied.record,
            message: Some(QUEUED_MESSAGE.to_string()),
            is_offline_operation: true,
            operation_id: applied.operation_id,
            ..Default::default()
        })
    }
}

fn target_id(route: &RouteMatch) -> Result<&str, StoreError> {
    route
        .entity_id
        .as_deref()
        .ok_or_else(|| StoreError::MissingId {
            collection: route.operation_type.entity.collection().to_string(),
        })
}

fn apply_create(
    txn: &StoreTxn<'_>,
    request: &ApiRequest,
    route: &RouteMatch,
    now: i64,
) -> Result<Applied, StoreError> {
    let collection = route.operation_type.entity.collection();
    let temp_id = mint_temp_id();

    let mut record = Value::Object(as_object(request.payload.as_ref()));
    set_field(&mut record, FIELD_ID, Value::String(temp_id.clone()));
    set_field(&mut record, FIELD_IS_TEMP, Value::Bool(true));
    stamp(&mut record, now, true);
    txn.put(collection, &record)?;

    let mut op = PendingOperation::new(route.operation_type, request, now);
    op.temp_id = Some(temp_id);
    queue::put_in(txn, &op)?;

    Ok(Applied {
        record,
        operation_id: Some(op.id),
    })
}

fn apply_update(
    txn: &StoreTxn<'_>,
    request: &ApiRequest,
    route: &RouteMatch,
    now: i64,
) -> Result<Applied, StoreError> {
    let collection = route.operation_type.entity.collection();
    let id = target_id(route)?;

    let existing = txn.get(collection, id)?;
    let base = existing.unwrap_or_else(|| json!({ FIELD_ID: id }));

    let mut record = if route.operation_type.action == OperationAction::UpdateStock {
        // `{stock: {...}}` and a bare stock object are both accepted
        let patch = request
            .payload
            .as_ref()
            .and_then(|p| p.get(FIELD_STOCK))
            .or(request.payload.as_ref());
        let current = base.get(FIELD_STOCK).cloned().unwrap_or_else(|| json!({}));
        let mut stock = shallow_merge(&current, patch);
        stamp(&mut stock, now, false);
        let mut record = base.clone();
        set_field(&mut record, FIELD_STOCK, stock);
        record
    } else {
        shallow_merge(&base, request.payload.as_ref())
    };
    set_field(&mut record, FIELD_ID, Value::String(id.to_string()));
    set_field(&mut record, FIELD_IS_TEMP, Value::Bool(is_temp_id(id)));
    stamp(&mut record, now, false);
    txn.put(collection, &record)?;

    let mut op = PendingOperation::new(route.operation_type, request, now);
    op.target_id = Some(id.to_string());
    queue::put_in(txn, &op)?;

    Ok(Applied {
        record,
        operation_id: Some(op.id),
    })
}

fn apply_delete(
    txn: &StoreTxn<'_>,
    request: &ApiRequest,
    route: &RouteMatch,
    now: i64,
) -> Result<Applied, StoreError> {
    let collection = route.operation_type.entity.collection();
    let id = target_id(route)?;
    txn.delete(collection, id)?;
    let record = json!({ FIELD_ID: id });

    if is_temp_id(id) {
        // The server never saw it: cancel the create and everything queued against it
        let cancelled = cancel_unsynced(txn, route.operation_type.entity, id, now)?;
        info!(temp_id = id, cancelled, "Deleted unsynced record");
        return Ok(Applied {
            record,
            operation_id: None,
        });
    }

    let mut op = PendingOperation::new(route.operation_type, request, now);
    op.target_id = Some(id.to_string());
    queue::put_in(txn, &op)?;

    Ok(Applied {
        record,
        operation_id: Some(op.id),
    })
}

/// Cancel every queued operation that creates, targets or references `temp_id`,
/// then do the same for unsynced dependents that pointed at it.
/// Returns the number of operations cancelled.
fn cancel_unsynced(
    txn: &StoreTxn<'_>,
    entity: EntityType,
    temp_id: &str,
    now: i64,
) -> Result<usize, StoreError> {
    let mut cancelled = 0;
    let mut pending = vec![(entity, temp_id.to_string())];
    while let Some((entity, id)) = pending.pop() {
        for op in queue::load_all(txn)? {
            let owned = op.entity() == entity && op.addresses(&id);
            if owned || op.unresolved_temp_ids().contains(&id) {
                queue::remove_in(txn, &op.id)?;
                set_plan_status_in(txn, &op.id, PlanStatus::Completed, now)?;
                cancelled += 1;
            }
        }
        for (dependent, field) in entity.dependents() {
            let collection = dependent.collection();
            for record in txn.get_all(collection)? {
                if !is_temp(&record) || record.get(field).and_then(Value::as_str) != Some(id.as_str()) {
                    continue;
                }
                if let Some(child) = record_id(&record) {
                    debug!(collection, id = child, parent = %id, "Dropping unsynced dependent");
                    txn.delete(collection, child)?;
                    pending.push((dependent, child.to_string()));
                }
            }
        }
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::routes::RouteRegistry;
    use crate::sync::queue::OperationQueue;
    use crate::transport::HttpMethod;

    fn setup() -> (Arc<LocalStore>, OptimisticApplier, RouteRegistry) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let applier = OptimisticApplier::new(store.clone(), ManualClock::new(1_700_000_000_000).clock());
        (store, applier, RouteRegistry::standard().unwrap())
    }

    fn apply(applier: &OptimisticApplier, routes: &RouteRegistry, request: ApiRequest) -> ApiResponse {
        let route = routes.classify(request.method, &request.endpoint).unwrap();
        applier.apply(&request, &route).unwrap()
    }

    #[test]
    fn test_create_mints_temp_record_and_queues() {
        let (store, applier, routes) = setup();
        let resp = apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Post, "/dishes", Some(json!({"name": "Paneer Tikka", "price": 240}))),
        );

        assert!(resp.success);
        assert!(resp.is_offline_operation);
        let temp_id = resp.data["id"].as_str().unwrap().to_string();
        assert!(is_temp_id(&temp_id));
        assert_eq!(resp.data["isTemp"], true);
        assert_eq!(resp.data["createdAt"], "2023-11-14T22:13:20.000Z");

        let ops = OperationQueue::new(store.clone()).list().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].temp_id.as_deref(), Some(temp_id.as_str()));
        assert_eq!(Some(ops[0].id.clone()), resp.operation_id);
        // Replayed verbatim: the temp id never reaches the server
        assert!(ops[0].payload.as_ref().unwrap().get("id").is_none());
        assert!(store.get("dishes", &temp_id).unwrap().is_some());
    }

    #[test]
    fn test_update_merges_and_stock_nests() {
        let (store, applier, routes) = setup();
        store
            .put("dishes", &json!({"id": "d1", "name": "Dal", "price": 120, "stock": {"inStock": true, "quantity": 4}}))
            .unwrap();

        apply(&applier, &routes, ApiRequest::new(HttpMethod::Put, "/dishes/d1", Some(json!({"price": 130}))));
        let dish = store.get("dishes", "d1").unwrap().unwrap();
        assert_eq!(dish["name"], "Dal");
        assert_eq!(dish["price"], 130);

        apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Patch, "/dishes/d1/stock", Some(json!({"inStock": false}))),
        );
        let dish = store.get("dishes", "d1").unwrap().unwrap();
        assert_eq!(dish["stock"]["inStock"], false);
        assert_eq!(dish["stock"]["quantity"], 4);
        assert!(dish.get("inStock").is_none());

        assert_eq!(OperationQueue::new(store).len().unwrap(), 2);
    }

    #[test]
    fn test_update_without_local_record_stores_payload() {
        let (store, applier, routes) = setup();
        apply(&applier, &routes, ApiRequest::new(HttpMethod::Put, "/categories/c9", Some(json!({"name": "Soups"}))));
        let category = store.get("categories", "c9").unwrap().unwrap();
        assert_eq!(category["name"], "Soups");
        assert_eq!(category["isTemp"], false);
    }

    #[test]
    fn test_delete_of_temp_record_cancels_its_create() {
        let (store, applier, routes) = setup();
        let created = apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Post, "/variants", Some(json!({"name": "Half", "dishId": "d1"}))),
        );
        let temp_id = created.data["id"].as_str().unwrap().to_string();
        apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Put, format!("/variants/{}", temp_id), Some(json!({"name": "Quarter"}))),
        );
        assert_eq!(OperationQueue::new(store.clone()).len().unwrap(), 2);

        let deleted = apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Delete, format!("/variants/{}", temp_id), None),
        );
        assert!(deleted.operation_id.is_none());
        assert!(store.get("variants", &temp_id).unwrap().is_none());
        assert!(OperationQueue::new(store).is_empty().unwrap());
    }

    #[test]
    fn test_delete_of_temp_parent_cancels_unsynced_children() {
        let (store, applier, routes) = setup();
        store.put("variants", &json!({"id": "v1", "dishId": "d1", "name": "Full"})).unwrap();
        let dish = apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Post, "/dishes", Some(json!({"name": "Malai Kofta"}))),
        );
        let dish_id = dish.data["id"].as_str().unwrap().to_string();
        let half = apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Post, "/variants", Some(json!({"name": "Half", "dishId": dish_id}))),
        );
        let half_id = half.data["id"].as_str().unwrap().to_string();
        apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Patch, format!("/variants/{}/stock", half_id), Some(json!({"inStock": false}))),
        );
        // A synced variant moved under the new dish
        apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Put, "/variants/v1", Some(json!({"dishId": dish_id}))),
        );
        // Unrelated work stays queued
        apply(
            &applier,
            &routes,
            ApiRequest::new(HttpMethod::Post, "/tables", Some(json!({"number": 7}))),
        );
        assert_eq!(OperationQueue::new(store.clone()).len().unwrap(), 5);

        apply(&applier, &routes, ApiRequest::new(HttpMethod::Delete, format!("/dishes/{}", dish_id), None));

        let ops = OperationQueue::new(store.clone()).list().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_type.to_string(), "CREATE_TABLE");
        assert!(store.get("dishes", &dish_id).unwrap().is_none());
        assert!(store.get("variants", &half_id).unwrap().is_none());
        assert!(store.get("variants", "v1").unwrap().is_some());
    }

    #[test]
    fn test_delete_of_synced_record_queues() {
        let (store, applier, routes) = setup();
        store.put("tables", &json!({"id": "t1", "number": 1})).unwrap();
        let resp = apply(&applier, &routes, ApiRequest::new(HttpMethod::Delete, "/tables/t1", None));
        assert!(resp.operation_id.is_some());
        assert!(store.get("tables", "t1").unwrap().is_none());
        let ops = OperationQueue::new(store).list().unwrap();
        assert_eq!(ops[0].target_id.as_deref(), Some("t1"));
    }
}
