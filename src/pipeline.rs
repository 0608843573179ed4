//! Request pipeline used by callers instead of talking to the transport directly
//!
//! Stages: classify (route registry), dispatch (transport, which attaches
//! auth), then either cache-write on success or classify-and-queue on failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::connectivity::Connectivity;
use crate::entity::EntityType;
use crate::error::{Result, StoreError, SyncError};
use crate::optimistic::OptimisticApplier;
use crate::routes::{RouteMatch, RouteRegistry};
use crate::store::LocalStore;
use crate::sync::queue::{self, OperationAction};
use crate::sync::replay::{send_with_timeout, write_confirmed};
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};

pub struct SyncClient {
    transport: Arc<dyn Transport>,
    routes: Arc<RouteRegistry>,
    store: Arc<LocalStore>,
    applier: OptimisticApplier,
    connectivity: Connectivity,
    timeout: Duration,
}

impl SyncClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        routes: Arc<RouteRegistry>,
        store: Arc<LocalStore>,
        connectivity: Connectivity,
        timeout: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            applier: OptimisticApplier::new(store.clone(), clock),
            transport,
            routes,
            store,
            connectivity,
            timeout,
        }
    }

    /// Issue a mutation. Unmapped endpoints fail before anything is sent.
    pub async fn mutate(&self, request: ApiRequest) -> Result<ApiResponse> {
        let route = self.routes.classify(request.method, &request.endpoint)?;
        if self.awaits_queued_create(&request, &route)? {
            debug!(endpoint = %request.endpoint, "Refers to an unsynced record, queueing behind its create");
            return Ok(self.applier.apply(&request, &route)?);
        }
        match self.dispatch(&request).await {
            Ok(response) => {
                self.cache_write(&route, &response)?;
                Ok(response)
            }
            Err(err) => self.classify_and_queue(&request, &route, err),
        }
    }

    /// Whether the request refers to a temp id whose CREATE is still queued.
    /// The server has never seen such an id, so the request must wait behind it.
    pub fn awaits_queued_create(
        &self,
        request: &ApiRequest,
        route: &RouteMatch,
    ) -> std::result::Result<bool, StoreError> {
        let temp_ids = queue::temp_dependencies(
            route.operation_type.entity,
            &request.endpoint,
            route.entity_id.as_deref(),
            request.payload.as_ref(),
        );
        if temp_ids.is_empty() {
            return Ok(false);
        }
        self.store.atomically(|txn| {
            Ok(queue::load_all(txn)?.iter().any(|op| {
                op.action() == OperationAction::Create
                    && op.temp_id.as_ref().map_or(false, |id| temp_ids.contains(id))
            }))
        })
    }

    /// Dispatch stage. Any answer from the server counts as being online.
    pub async fn dispatch(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        let result = send_with_timeout(self.transport.as_ref(), request, self.timeout).await;
        match &result {
            Ok(_) => {
                self.connectivity.set_online(true);
            }
            Err(err) => {
                self.connectivity.set_online(!err.is_no_response());
            }
        }
        result
    }

    /// On-success stage: mirror the server's answer into the local store.
    pub fn cache_write(&self, route: &RouteMatch, response: &ApiResponse) -> std::result::Result<(), StoreError> {
        let id = self.store.atomically(|txn| {
            write_confirmed(
                txn,
                route.operation_type,
                route.entity_id.as_deref(),
                &response.data,
            )
        })?;
        debug!(operation_type = %route.operation_type, id = ?id, "Cached server result");
        Ok(())
    }

    /// On-failure stage: no response means apply optimistically and queue;
    /// anything the server actually said is returned to the caller.
    pub fn classify_and_queue(
        &self,
        request: &ApiRequest,
        route: &RouteMatch,
        err: TransportError,
    ) -> Result<ApiResponse> {
        if !err.is_no_response() {
            warn!(endpoint = %request.endpoint, error = %err, "Mutation rejected by server");
            return Err(err.into());
        }
        if !self.store.is_attached() {
            return Err(err.into());
        }
        debug!(endpoint = %request.endpoint, error = %err, "No response, applying offline");
        Ok(self.applier.apply(request, route)?)
    }

    /// Bulk read of one collection, served from the local store when the server is unreachable.
    pub async fn fetch(&self, entity: EntityType) -> Result<ApiResponse> {
        let request = ApiRequest::get(entity.descriptor().endpoint);
        match self.dispatch(&request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_no_response() => self.cached(entity),
            Err(err) => Err(SyncError::from(err)),
        }
    }

    fn cached(&self, entity: EntityType) -> Result<ApiResponse> {
        let records = self.store.get_all(entity.collection())?;
        Ok(ApiResponse {
            success: true,
            data: Value::Array(records),
            is_offline_data: true,
            last_sync_time: self.store.last_sync(entity)?,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RouteError;
    use crate::sync::queue::OperationQueue;
    use crate::transport::HttpMethod;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers requests from a script, recording what it was sent
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<ApiResponse, TransportError>>>,
        sent: Mutex<Vec<ApiRequest>>,
    }

    impl Scripted {
        fn reply(self, reply: std::result::Result<ApiResponse, TransportError>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Unreachable("script exhausted".into())))
        }
    }

    fn client(transport: Arc<Scripted>, store: Arc<LocalStore>) -> (SyncClient, Connectivity) {
        let connectivity = Connectivity::new(true);
        let client = SyncClient::new(
            transport,
            Arc::new(RouteRegistry::standard().unwrap()),
            store,
            connectivity.clone(),
            Duration::from_secs(1),
            ManualClock::new(1_000).clock(),
        );
        (client, connectivity)
    }

    #[tokio::test]
    async fn test_success_writes_server_record() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default().reply(Ok(ApiResponse::ok(json!({"id": "c1", "name": "Starters"})))));
        let (client, _) = client(transport, store.clone());

        let resp = client
            .mutate(ApiRequest::new(HttpMethod::Post, "/categories", Some(json!({"name": "Starters"}))))
            .await
            .unwrap();
        assert!(!resp.is_offline_operation);
        assert_eq!(store.get("categories", "c1").unwrap().unwrap()["name"], "Starters");
        assert!(OperationQueue::new(store).is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_no_response_applies_offline() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default());
        let (client, connectivity) = client(transport, store.clone());

        let resp = client
            .mutate(ApiRequest::new(HttpMethod::Post, "/tables", Some(json!({"number": 4}))))
            .await
            .unwrap();
        assert!(resp.is_offline_operation);
        assert!(!connectivity.is_online());
        assert_eq!(OperationQueue::new(store).len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_rejection_is_returned_not_queued() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default().reply(Err(TransportError::Status {
            status: 422,
            message: "price must be positive".into(),
            body: None,
        })));
        let (client, connectivity) = client(transport, store.clone());

        let err = client
            .mutate(ApiRequest::new(HttpMethod::Put, "/dishes/d1", Some(json!({"price": -1}))))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Status { status: 422, .. })));
        assert!(connectivity.is_online());
        assert!(OperationQueue::new(store).is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_edit_of_unsynced_record_queues_behind_its_create() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default());
        let (client, _) = client(transport.clone(), store.clone());

        let created = client
            .mutate(ApiRequest::new(HttpMethod::Post, "/dishes", Some(json!({"name": "Dal", "price": 200}))))
            .await
            .unwrap();
        let temp_id = created.data["id"].as_str().unwrap().to_string();

        // Server reachable again, but it has never seen the temp id
        transport
            .replies
            .lock()
            .unwrap()
            .push_back(Err(TransportError::Status { status: 404, message: "not found".into(), body: None }));
        let resp = client
            .mutate(ApiRequest::new(HttpMethod::Put, format!("/dishes/{}", temp_id), Some(json!({"price": 250}))))
            .await
            .unwrap();
        assert!(resp.is_offline_operation);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(store.get("dishes", &temp_id).unwrap().unwrap()["price"], 250);

        let ops = OperationQueue::new(store).list().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].target_id.as_deref(), Some(temp_id.as_str()));
    }

    #[tokio::test]
    async fn test_orphan_temp_id_is_sent_to_the_server() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default().reply(Err(TransportError::Status {
            status: 404,
            message: "not found".into(),
            body: None,
        })));
        let (client, _) = client(transport.clone(), store.clone());

        let err = client
            .mutate(ApiRequest::new(HttpMethod::Put, "/dishes/temp_gone", Some(json!({"price": 1}))))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Status { status: 404, .. })));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(OperationQueue::new(store).is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_unmapped_route_never_dispatches() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = Arc::new(Scripted::default());
        let (client, _) = client(transport.clone(), store.clone());

        let err = client
            .mutate(ApiRequest::new(HttpMethod::Post, "/orders", Some(json!({}))))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Route(RouteError::Unmapped { .. })));
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(OperationQueue::new(store).is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_cache() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        store
            .replace_all("categories", &[json!({"id": "c1", "name": "Mains"})], 777)
            .unwrap();
        let transport = Arc::new(Scripted::default());
        let (client, _) = client(transport, store);

        let resp = client.fetch(EntityType::Category).await.unwrap();
        assert!(resp.is_offline_data);
        assert_eq!(resp.last_sync_time, Some(777));
        assert_eq!(resp.data[0]["name"], "Mains");
    }

    #[tokio::test]
    async fn test_detached_store_surfaces_the_failure() {
        let store = Arc::new(LocalStore::detached());
        let transport = Arc::new(Scripted::default());
        let (client, _) = client(transport, store);

        let err = client
            .mutate(ApiRequest::new(HttpMethod::Post, "/dishes", Some(json!({"name": "x"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Unreachable(_))));
    }
}
