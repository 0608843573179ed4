//! Keys and singleton records kept in the `meta` collection

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "schemaVersion";
pub const SYNC_STATUS: &str = "syncStatus";
pub const SYNC_HISTORY: &str = "syncHistory";
pub const RECOVERY_PLANS: &str = "recoveryPlans";
pub const FAILED_OPERATIONS: &str = "failedOperations";
pub const CONFLICTS: &str = "conflicts";

/// Stored schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub version: u32,
    pub updated_at: i64,
}
