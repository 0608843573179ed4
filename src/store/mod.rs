//! Local persistent store
//!
//! Handles:
//! - JSON record persistence per entity collection (SQLite)
//! - Engine metadata (schema version, sync status, recovery plans)
//! - Schema migration at open

pub mod local;
pub mod meta;
pub mod migrate;

// Re-exports
pub use local::{LocalStore, StoreTxn, DB_FILE, META, PENDING_OPERATIONS};
pub use migrate::{MigrationReport, MigrationStep, Migrator, TARGET_VERSION};
