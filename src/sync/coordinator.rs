//! Sync coordinator: drives drains, refreshes and recovery in the background.
//!
//! Reacts to connectivity transitions, refreshes on an interval (probing while
//! offline), and runs the recovery tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::recovery::RecoveryManager;

use super::engine::SyncEngine;
use super::refresh::Refresher;

pub struct SyncCoordinator {
    engine: Arc<SyncEngine>,
    refresher: Arc<Refresher>,
    recovery: Arc<RecoveryManager>,
    connectivity: Connectivity,
    refresh_interval: Duration,
    tick_interval: Duration,
}

impl SyncCoordinator {
    pub fn new(
        engine: Arc<SyncEngine>,
        refresher: Arc<Refresher>,
        recovery: Arc<RecoveryManager>,
        connectivity: Connectivity,
        refresh_interval: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            engine,
            refresher,
            recovery,
            connectivity,
            refresh_interval,
            tick_interval,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.connectivity.subscribe();
        let mut refresh_timer = tokio::time::interval(self.refresh_interval);
        let mut tick_timer = tokio::time::interval(self.tick_interval);
        tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            refresh_secs = self.refresh_interval.as_secs(),
            tick_secs = self.tick_interval.as_secs(),
            "Sync coordinator started"
        );

        loop {
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        info!("Back online, syncing");
                        self.sync_now().await;
                    } else {
                        info!("Offline, mutations will be queued");
                    }
                }
                _ = refresh_timer.tick() => {
                    if self.connectivity.is_online() {
                        self.sync_now().await;
                    } else {
                        self.probe().await;
                    }
                }
                _ = tick_timer.tick() => {
                    if let Err(e) = self.recovery.tick().await {
                        warn!(error = %e, "Recovery tick failed");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        self.engine.request_stop();
                        break;
                    }
                }
            }
        }
        info!("Sync coordinator stopped");
    }

    /// Drain the queue, then refresh every collection.
    pub async fn sync_now(&self) {
        match self.engine.drain().await {
            Ok(report) => debug!(?report, "Drain complete"),
            Err(SyncError::DrainInProgress) => {
                debug!("Drain already running");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Drain failed");
                return;
            }
        }
        if !self.connectivity.is_online() {
            return;
        }
        if let Err(e) = self.refresher.refresh_all().await {
            warn!(error = %e, "Refresh failed");
        }
    }

    /// While offline, a refresh doubles as a reachability check.
    async fn probe(&self) {
        match self.refresher.refresh_all().await {
            Ok(_) => debug!("Probe reached the server"),
            Err(e) => debug!(error = %e, "Server still unreachable"),
        }
    }
}
