//! Background coordinator and drain stop behaviour.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, Notify};

use common::{FakeServer, Harness, START};
use menu_sync::clock::ManualClock;
use menu_sync::entity::EntityType;
use menu_sync::{
    ApiRequest, ApiResponse, Config, HttpMethod, LocalStore, SyncRuntime, Transport,
    TransportError,
};

/// Poll `check` until it holds or `limit` elapses.
async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn test_coordinator_drains_when_server_returns() {
    let mut config = Config::default();
    config.sync.refresh_interval_secs = 1;
    config.recovery.tick_interval_secs = 3_600;
    let h = Harness::with_config(config);

    h.server.set_online(false);
    h.post("/dishes", json!({ "name": "Pav Bhaji", "price": 150 }))
        .await;
    assert!(!h.runtime.connectivity.is_online());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.runtime.coordinator().run(shutdown_rx));

    h.server.set_online(true);
    let queue = h.runtime.queue.clone();
    assert!(
        eventually(Duration::from_secs(5), || queue.is_empty().unwrap()).await,
        "queue never drained"
    );

    // The refresh run while offline is what noticed the server
    assert_eq!(h.server.requests()[0].method, HttpMethod::Get);
    assert!(h.runtime.connectivity.is_online());
    assert_eq!(h.server.records(EntityType::Dish).len(), 1);
    let dish = h.local_record(EntityType::Dish, "dishes-1").unwrap();
    assert_eq!(dish["isTemp"], false);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("coordinator did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_coordinator_stops_when_shutdown_sender_drops() {
    let h = Harness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.runtime.coordinator().run(shutdown_rx));

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("coordinator did not stop")
        .unwrap();
}

/// Holds the first request after [`Gate::arm`] until released.
struct Gate {
    inner: Arc<FakeServer>,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn new(inner: Arc<FakeServer>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for Gate {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.send(request).await
    }
}

#[tokio::test]
async fn test_stop_request_defers_the_rest_of_the_drain() {
    let server = FakeServer::new();
    let gate = Arc::new(Gate::new(server.clone()));
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let runtime = SyncRuntime::with_store(
        Config::default(),
        store,
        gate.clone(),
        ManualClock::new(START).clock(),
    )
    .unwrap();

    server.set_online(false);
    for number in 1..=3 {
        runtime
            .client
            .mutate(ApiRequest::new(
                HttpMethod::Post,
                "/tables",
                Some(json!({ "number": number })),
            ))
            .await
            .unwrap();
    }
    server.set_online(true);

    gate.arm();
    let engine = runtime.engine.clone();
    let drain = tokio::spawn(async move { engine.drain().await });
    gate.entered.notified().await;
    runtime.engine.request_stop();
    gate.release.notify_one();

    // The call in flight completes, nothing after it is sent
    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.deferred, 2);
    assert_eq!(runtime.queue.len().unwrap(), 2);
    assert_eq!(server.records(EntityType::Table).len(), 1);

    // A stop applies to one drain only
    let report = runtime.engine.drain().await.unwrap();
    assert_eq!(report.processed, 2);
    assert!(runtime.queue.is_empty().unwrap());
}
