//! Conflict detection between the local replica and a server snapshot
//!
//! Conflicts are reported, persisted and left for an operator; nothing here
//! picks a winner.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{is_temp, is_temp_id, same_content, updated_at, EntityDescriptor, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the same record since the last refresh
    Update,
    /// A local create duplicates a record the server already has
    Create,
}

impl ConflictKind {
    fn as_str(self) -> &'static str {
        match self {
            ConflictKind::Update => "update",
            ConflictKind::Create => "create",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// `<collection>:<kind>:<localId>`
    pub id: String,
    pub kind: ConflictKind,
    pub entity: EntityType,
    pub local_id: String,
    pub server_id: String,
    pub local: Value,
    pub server: Value,
    #[serde(default)]
    pub last_sync: Option<i64>,
    pub detected_at: i64,
}

impl Conflict {
    pub fn conflict_id(entity: EntityType, kind: ConflictKind, local_id: &str) -> String {
        format!("{}:{}:{}", entity.collection(), kind.as_str(), local_id)
    }
}

/// How an operator settles a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepServer,
    /// Fields to lay over the server record
    Merge(Value),
}

pub struct ConflictDetector {
    descriptor: &'static EntityDescriptor,
}

impl ConflictDetector {
    pub fn for_entity(entity: EntityType) -> Self {
        Self {
            descriptor: entity.descriptor(),
        }
    }

    pub fn detect(
        &self,
        local: &[Value],
        server: &[Value],
        last_sync: Option<i64>,
        now: i64,
    ) -> Vec<Conflict> {
        let d = self.descriptor;
        let server_by_id: HashMap<&str, &Value> = server
            .iter()
            .filter_map(|record| d.id_of(record).map(|id| (id, record)))
            .collect();

        let mut conflicts = Vec::new();
        for record in local {
            let local_id = match d.id_of(record) {
                Some(id) => id,
                None => continue,
            };

            if is_temp(record) || is_temp_id(local_id) {
                if let Some(existing) = self.find_duplicate(record, server) {
                    conflicts.push(self.conflict(ConflictKind::Create, record, existing, last_sync, now));
                }
                continue;
            }

            // Without a baseline there is nothing to compare against
            let baseline = match last_sync {
                Some(ts) => ts,
                None => continue,
            };
            let counterpart = match server_by_id.get(local_id) {
                Some(record) => *record,
                None => continue,
            };
            let local_changed = updated_at(record).map_or(false, |t| t > baseline);
            let server_changed = updated_at(counterpart).map_or(false, |t| t > baseline);
            if local_changed && server_changed && !same_content(record, counterpart) {
                conflicts.push(self.conflict(ConflictKind::Update, record, counterpart, last_sync, now));
            }
        }
        conflicts
    }

    /// Server record matching a local create by match key within the same scope.
    fn find_duplicate<'a>(&self, record: &Value, server: &'a [Value]) -> Option<&'a Value> {
        let d = self.descriptor;
        let key = d.match_key(record)?;
        let scope = d.scope_of(record);
        server.iter().find(|candidate| {
            d.id_of(candidate).is_some()
                && d.match_key(candidate).as_deref() == Some(key.as_str())
                && d.scope_of(candidate) == scope
        })
    }

    fn conflict(
        &self,
        kind: ConflictKind,
        local: &Value,
        server: &Value,
        last_sync: Option<i64>,
        now: i64,
    ) -> Conflict {
        let d = self.descriptor;
        let local_id = d.id_of(local).unwrap_or_default().to_string();
        Conflict {
            id: Conflict::conflict_id(d.entity, kind, &local_id),
            kind,
            entity: d.entity,
            server_id: d.id_of(server).unwrap_or_default().to_string(),
            local_id,
            local: local.clone(),
            server: server.clone(),
            last_sync,
            detected_at: now,
        }
    }
}
