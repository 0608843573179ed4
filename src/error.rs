//! Error types for menu-sync

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("Record in {collection} has no string `id` field")]
    MissingId { collection: String },

    #[error("Stored schema version {stored} is newer than supported version {supported}")]
    SchemaTooNew { stored: u32, supported: u32 },

    #[error("No migration step registered for {0}")]
    MissingMigration(String),

    #[error("Migration step {step} failed: {reason}")]
    Migration { step: String, reason: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route registered for {method} {endpoint}")]
    Unmapped { method: String, endpoint: String },

    #[error("Route {method} {template} registered twice")]
    Duplicate { method: String, template: String },

    #[error("Entity {entity} has no {action} route")]
    Incomplete { entity: String, action: String },

    #[error("Invalid route template: {0}")]
    InvalidTemplate(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("A drain is already running")]
    DrainInProgress,

    #[error("Recovery plan not found: {0}")]
    PlanNotFound(String),

    #[error("Pending operation not found: {0}")]
    OperationNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
