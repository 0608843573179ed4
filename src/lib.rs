//! menu-sync: offline-first synchronization for restaurant menu and table data
//!
//! Keeps a local replica of server-owned entities (categories, subcategories,
//! dishes, variants, tables, table types) usable while the server is
//! unreachable, and reconciles it once connectivity returns:
//! - Mutations that get no response are applied locally and queued
//! - The queue is replayed in order with retry, backoff and recovery plans
//! - Full refreshes merge server snapshots and surface conflicts
//! - Progress is published on an event bus and a status channel

pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod entity;
pub mod error;
pub mod events;
pub mod optimistic;
pub mod pipeline;
pub mod recovery;
pub mod routes;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use conflict::{Conflict, ConflictKind, Resolution};
pub use entity::EntityType;
pub use error::{Result, SyncError};
pub use events::{EventBus, StatusTracker, SyncEvent, SyncStatus};
pub use pipeline::SyncClient;
pub use runtime::SyncRuntime;
pub use store::LocalStore;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, Transport, TransportError};
