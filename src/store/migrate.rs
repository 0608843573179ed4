//! Schema migration for the local store
//!
//! Steps are keyed `"<from>-<to>"` and always advance by one version. The
//! whole upgrade runs in a single transaction: either every step applies and
//! the stored version becomes the target, or nothing changes.

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::clock::{parse_timestamp, to_rfc3339};
use crate::entity::{
    is_temp_id, set_field, EntityType, FIELD_CREATED_AT, FIELD_ID, FIELD_IS_TEMP, FIELD_UPDATED_AT,
};
use crate::error::StoreError;

use super::local::{self, PENDING_OPERATIONS};
use super::meta::{SchemaVersion, SCHEMA_VERSION};

/// Schema version this build expects.
pub const TARGET_VERSION: u32 = 3;

/// Signature of a migration step body.
pub type StepFn = fn(&Connection, i64) -> Result<(), StoreError>;

/// One version-to-version upgrade.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
    pub run: StepFn,
}

impl MigrationStep {
    pub fn key(&self) -> String {
        format!("{}-{}", self.from, self.to)
    }
}

/// Steps shipped with this build, oldest first.
pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: 1,
        to: 2,
        run: add_dish_stock,
    },
    MigrationStep {
        from: 2,
        to: 3,
        run: add_table_types_and_temp_flags,
    },
];

/// Outcome of a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<String>,
}

pub struct Migrator {
    steps: Vec<MigrationStep>,
    target: u32,
    clock: fn() -> i64,
}

impl Migrator {
    pub fn new() -> Self {
        Self::with_steps(STEPS.to_vec(), TARGET_VERSION)
    }

    pub fn with_steps(steps: Vec<MigrationStep>, target: u32) -> Self {
        Self {
            steps,
            target,
            clock: || chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Bring the store to the target version.
    pub fn run(&self, conn: &mut Connection) -> Result<MigrationReport, StoreError> {
        let current = local::get_meta::<SchemaVersion>(conn, SCHEMA_VERSION)?
            .map(|v| v.version)
            .unwrap_or(1);

        if current > self.target {
            return Err(StoreError::SchemaTooNew {
                stored: current,
                supported: self.target,
            });
        }

        let mut report = MigrationReport {
            from: current,
            to: current,
            applied: Vec::new(),
        };

        if current == self.target {
            return Ok(report);
        }

        info!(from = current, to = self.target, "Migrating local store");
        let now = (self.clock)();
        let tx = conn.transaction()?;

        for version in current..self.target {
            let key = format!("{}-{}", version, version + 1);
            let step = self
                .steps
                .iter()
                .find(|s| s.from == version && s.to == version + 1)
                .ok_or_else(|| StoreError::MissingMigration(key.clone()))?;

            (step.run)(&tx, now).map_err(|e| {
                warn!(step = %key, error = %e, "Migration step failed, rolling back");
                match e {
                    StoreError::Migration { .. } => e,
                    other => StoreError::Migration {
                        step: key.clone(),
                        reason: other.to_string(),
                    },
                }
            })?;

            info!(step = %key, "Applied migration step");
            report.applied.push(key);
        }

        local::put_meta(
            &tx,
            SCHEMA_VERSION,
            &SchemaVersion {
                version: self.target,
                updated_at: now,
            },
        )?;
        tx.commit()?;

        report.to = self.target;
        Ok(report)
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite every record of `collection` through `f`.
fn rewrite_all(
    conn: &Connection,
    collection: &str,
    mut f: impl FnMut(&mut Value),
) -> Result<usize, StoreError> {
    let records = local::get_all(conn, collection)?;
    let count = records.len();
    for mut record in records {
        f(&mut record);
        local::put(conn, collection, &record)?;
    }
    Ok(count)
}

/// 1-2: dishes gain a nested `stock` object derived from legacy `isAvailable`.
fn add_dish_stock(conn: &Connection, now: i64) -> Result<(), StoreError> {
    let count = rewrite_all(conn, EntityType::Dish.collection(), |dish| {
        if dish.get("stock").is_some() {
            return;
        }
        let in_stock = dish
            .get("isAvailable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let updated_at = dish
            .get(FIELD_UPDATED_AT)
            .and_then(parse_timestamp)
            .unwrap_or(now);
        set_field(
            dish,
            "stock",
            json!({
                "inStock": in_stock,
                "quantity": null,
                "updatedAt": to_rfc3339(updated_at),
            }),
        );
    })?;
    info!(count, "Backfilled dish stock");
    Ok(())
}

/// 2-3: `tableTypes` collection; `isTemp`/`createdAt` on every record; `retryCount` on queued ops.
fn add_table_types_and_temp_flags(conn: &Connection, now: i64) -> Result<(), StoreError> {
    let table_types = EntityType::TableType.collection();
    if !local::collection_exists(conn, table_types)? {
        local::create_collection(conn, table_types)?;
    }

    for entity in EntityType::ALL {
        rewrite_all(conn, entity.collection(), |record| {
            if record.get(FIELD_IS_TEMP).is_none() {
                let temp = record
                    .get(FIELD_ID)
                    .and_then(Value::as_str)
                    .map(is_temp_id)
                    .unwrap_or(false);
                set_field(record, FIELD_IS_TEMP, Value::Bool(temp));
            }
            if record.get(FIELD_CREATED_AT).is_none() {
                let created = record
                    .get(FIELD_UPDATED_AT)
                    .cloned()
                    .unwrap_or_else(|| Value::String(to_rfc3339(now)));
                set_field(record, FIELD_CREATED_AT, created);
            }
        })?;
    }

    rewrite_all(conn, PENDING_OPERATIONS, |op| {
        if op.get("retryCount").is_none() {
            set_field(op, "retryCount", json!(0));
        }
    })?;
    Ok(())
}
