//! Wires the engine's components together over one store and transport

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::clock::{system_clock, Clock};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::events::{EventBus, StatusTracker};
use crate::pipeline::SyncClient;
use crate::recovery::RecoveryManager;
use crate::routes::RouteRegistry;
use crate::store::LocalStore;
use crate::sync::{OperationQueue, Refresher, Replayer, SyncCoordinator, SyncEngine};
use crate::transport::{HttpTransport, StaticToken, Transport};

pub struct SyncRuntime {
    pub config: Config,
    pub store: Arc<LocalStore>,
    pub queue: OperationQueue,
    pub events: EventBus,
    pub status: Arc<StatusTracker>,
    pub connectivity: Connectivity,
    pub client: SyncClient,
    pub engine: Arc<SyncEngine>,
    pub recovery: Arc<RecoveryManager>,
    pub refresher: Arc<Refresher>,
}

impl SyncRuntime {
    /// Open the store from `config` and talk to the configured server over HTTP.
    pub fn open(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(
            config.server.base_url.clone(),
            config.request_timeout(),
            Arc::new(StaticToken(config.server.auth_token.clone())),
        );
        Self::open_with_transport(config, Arc::new(transport))
    }

    pub fn open_with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.store.data_dir)?);
        Self::with_store(config, store, transport, system_clock())
    }

    pub fn with_store(
        config: Config,
        store: Arc<LocalStore>,
        transport: Arc<dyn Transport>,
        clock: Clock,
    ) -> Result<Self> {
        let routes = Arc::new(RouteRegistry::standard()?);
        let timeout = config.request_timeout();
        let events = EventBus::new(config.sync.event_capacity);
        let status = Arc::new(StatusTracker::new(
            store.clone(),
            events.clone(),
            config.sync.status_error_limit,
            config.sync.history_limit,
        )?);
        let connectivity = Connectivity::new(true);
        let queue = OperationQueue::new(store.clone());
        let guard = Arc::new(Mutex::new(()));

        let replayer = Replayer::new(
            store.clone(),
            transport.clone(),
            connectivity.clone(),
            timeout,
            clock.clone(),
        );
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            queue.clone(),
            replayer.clone(),
            config.retry_policy(),
            status.clone(),
            connectivity.clone(),
            guard.clone(),
            clock.clone(),
        ));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            replayer,
            recovery.clone(),
            status.clone(),
            guard,
            clock.clone(),
        ));
        let refresher = Arc::new(Refresher::new(
            store.clone(),
            transport.clone(),
            status.clone(),
            connectivity.clone(),
            timeout,
            clock.clone(),
        ));
        let client = SyncClient::new(
            transport,
            routes,
            store.clone(),
            connectivity.clone(),
            timeout,
            clock,
        );

        info!(
            attached = store.is_attached(),
            base_url = %config.server.base_url,
            "Sync runtime ready"
        );
        Ok(Self {
            config,
            store,
            queue,
            events,
            status,
            connectivity,
            client,
            engine,
            recovery,
            refresher,
        })
    }

    pub fn coordinator(&self) -> SyncCoordinator {
        SyncCoordinator::new(
            self.engine.clone(),
            self.refresher.clone(),
            self.recovery.clone(),
            self.connectivity.clone(),
            self.config.refresh_interval(),
            self.config.tick_interval(),
        )
    }
}
