//! Shared fixtures: an in-memory server and a runtime wired to it.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use menu_sync::clock::{to_rfc3339, ManualClock};
use menu_sync::entity::{shallow_merge, EntityType};
use menu_sync::routes::RouteRegistry;
use menu_sync::sync::OperationAction;
use menu_sync::transport::status_error;
use menu_sync::{
    ApiRequest, ApiResponse, Config, HttpMethod, LocalStore, SyncRuntime, Transport,
    TransportError,
};

/// Wall time the fake server stamps on every record it writes.
pub const SERVER_TIME: i64 = 1_700_000_000_000;

/// Where test clocks start.
pub const START: i64 = 1_700_000_500_000;

#[derive(Default)]
struct ServerState {
    online: bool,
    collections: HashMap<EntityType, BTreeMap<String, Value>>,
    counters: HashMap<EntityType, u64>,
    failures: VecDeque<TransportError>,
    reject_duplicates: bool,
    latency: Option<Duration>,
    requests: Vec<ApiRequest>,
}

/// REST server over in-memory collections.
///
/// Ids are `<collection>-<n>` per collection, timestamps are always
/// [`SERVER_TIME`], so two servers fed the same writes end up identical.
pub struct FakeServer {
    routes: RouteRegistry,
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: RouteRegistry::standard().expect("standard routes"),
            state: Mutex::new(ServerState {
                online: true,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("server state")
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Fail the next request that reaches the server with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.state().failures.push_back(err);
    }

    pub fn fail_next_with_status(&self, status: u16) {
        self.fail_next(status_error(
            status,
            Some(json!({ "message": format!("rejected with {}", status) })),
        ));
    }

    /// Answer CREATEs whose name already exists (in scope) with 409.
    pub fn reject_duplicates(&self) {
        self.state().reject_duplicates = true;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Insert a record as if it had always been on the server.
    pub fn seed(&self, entity: EntityType, record: Value) {
        let id = record["id"].as_str().expect("seeded record needs an id").to_string();
        self.state()
            .collections
            .entry(entity)
            .or_default()
            .insert(id, record);
    }

    pub fn records(&self, entity: EntityType) -> Vec<Value> {
        self.state()
            .collections
            .get(&entity)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, entity: EntityType, id: &str) -> Option<Value> {
        self.state()
            .collections
            .get(&entity)
            .and_then(|c| c.get(id).cloned())
    }

    /// Requests that reached the server (offline attempts are not recorded).
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state().requests.clone()
    }

    pub fn mutations(&self) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != HttpMethod::Get)
            .collect()
    }

    fn handle(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut state = self.state();
        if !state.online {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        state.requests.push(request.clone());
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        if request.method == HttpMethod::Get {
            let entity = EntityType::ALL
                .into_iter()
                .find(|e| e.descriptor().endpoint == request.endpoint)
                .ok_or_else(|| status_error(404, None))?;
            let records = state
                .collections
                .get(&entity)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default();
            return Ok(ApiResponse::ok(Value::Array(records)));
        }

        let route = self
            .routes
            .classify(request.method, &request.endpoint)
            .map_err(|_| status_error(404, None))?;
        let entity = route.operation_type.entity;
        let descriptor = entity.descriptor();
        let stamp = Value::String(to_rfc3339(SERVER_TIME));

        match route.operation_type.action {
            OperationAction::Create => {
                let mut record = request.payload.clone().unwrap_or_else(|| json!({}));
                if state.reject_duplicates {
                    let key = descriptor.match_key(&record);
                    let duplicate = key.is_some()
                        && state.collections.get(&entity).map_or(false, |c| {
                            c.values().any(|r| {
                                descriptor.match_key(r) == key
                                    && descriptor.scope_of(r) == descriptor.scope_of(&record)
                            })
                        });
                    if duplicate {
                        return Err(status_error(
                            409,
                            Some(json!({ "message": "A record with this name already exists" })),
                        ));
                    }
                }
                let n = state.counters.entry(entity).or_insert(0);
                *n += 1;
                let id = format!("{}-{}", descriptor.collection, n);
                record["id"] = Value::String(id.clone());
                record["createdAt"] = stamp.clone();
                record["updatedAt"] = stamp;
                state
                    .collections
                    .entry(entity)
                    .or_default()
                    .insert(id, record.clone());
                Ok(ApiResponse::ok(record))
            }
            OperationAction::Update | OperationAction::UpdateStock => {
                let id = route.entity_id.ok_or_else(|| status_error(400, None))?;
                let existing = state
                    .collections
                    .get(&entity)
                    .and_then(|c| c.get(&id).cloned())
                    .ok_or_else(|| status_error(404, None))?;
                let mut record = if route.operation_type.action == OperationAction::UpdateStock {
                    let current = existing.get("stock").cloned().unwrap_or_else(|| json!({}));
                    let mut record = existing.clone();
                    record["stock"] = shallow_merge(&current, request.payload.as_ref());
                    record
                } else {
                    shallow_merge(&existing, request.payload.as_ref())
                };
                record["id"] = Value::String(id.clone());
                record["updatedAt"] = stamp;
                state
                    .collections
                    .entry(entity)
                    .or_default()
                    .insert(id, record.clone());
                Ok(ApiResponse::ok(record))
            }
            OperationAction::Delete => {
                let id = route.entity_id.ok_or_else(|| status_error(400, None))?;
                state
                    .collections
                    .get_mut(&entity)
                    .and_then(|c| c.remove(&id))
                    .ok_or_else(|| status_error(404, None))?;
                Ok(ApiResponse::ok(json!({ "id": id })))
            }
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.handle(request)
    }
}

pub struct Harness {
    pub runtime: SyncRuntime,
    pub server: Arc<FakeServer>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let server = FakeServer::new();
        let clock = ManualClock::new(START);
        let store = Arc::new(LocalStore::open_in_memory().expect("in-memory store"));
        let runtime = SyncRuntime::with_store(config, store, server.clone(), clock.clock())
            .expect("runtime");
        Self {
            runtime,
            server,
            clock,
        }
    }

    pub fn local(&self, entity: EntityType) -> Vec<Value> {
        self.runtime
            .store
            .get_all(entity.collection())
            .expect("local records")
    }

    pub fn local_record(&self, entity: EntityType, id: &str) -> Option<Value> {
        self.runtime
            .store
            .get(entity.collection(), id)
            .expect("local record")
    }

    pub async fn post(&self, endpoint: &str, payload: Value) -> ApiResponse {
        self.runtime
            .client
            .mutate(ApiRequest::new(HttpMethod::Post, endpoint, Some(payload)))
            .await
            .expect("POST")
    }

    pub async fn put(&self, endpoint: &str, payload: Value) -> ApiResponse {
        self.runtime
            .client
            .mutate(ApiRequest::new(HttpMethod::Put, endpoint, Some(payload)))
            .await
            .expect("PUT")
    }

    pub async fn patch(&self, endpoint: &str, payload: Value) -> ApiResponse {
        self.runtime
            .client
            .mutate(ApiRequest::new(HttpMethod::Patch, endpoint, Some(payload)))
            .await
            .expect("PATCH")
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResponse {
        self.runtime
            .client
            .mutate(ApiRequest::new(HttpMethod::Delete, endpoint, None))
            .await
            .expect("DELETE")
    }
}

/// Id of the record carried in a mutation response.
pub fn id_of(response: &ApiResponse) -> String {
    response.data["id"]
        .as_str()
        .expect("response record id")
        .to_string()
}

pub fn category(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "createdAt": to_rfc3339(SERVER_TIME),
        "updatedAt": to_rfc3339(SERVER_TIME),
    })
}
