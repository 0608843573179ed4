//! Entity descriptors and record helpers
//!
//! Every server-owned entity kind is described once by an [`EntityDescriptor`];
//! the store, applier, replay engine and conflict detector are all driven by it
//! rather than carrying per-entity copies of the same logic.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{parse_timestamp, to_rfc3339};

/// Prefix of locally minted ids.
pub const TEMP_ID_PREFIX: &str = "temp_";

pub const FIELD_ID: &str = "id";
pub const FIELD_IS_TEMP: &str = "isTemp";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
/// Nested stock object on dishes and variants
pub const FIELD_STOCK: &str = "stock";

/// Server-owned entity kinds replicated locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Category,
    Subcategory,
    Dish,
    Variant,
    Table,
    TableType,
}

/// Static description of one entity collection.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub entity: EntityType,
    /// Local collection (table) name
    pub collection: &'static str,
    /// Field holding the record identity
    pub identity_field: &'static str,
    /// Field compared case-insensitively when looking for duplicate creates
    pub match_field: &'static str,
    /// Field that scopes `match_field` (e.g. parent category)
    pub scope_field: Option<&'static str>,
    /// Fields holding ids of other entities
    pub references: &'static [(&'static str, EntityType)],
    /// REST collection endpoint
    pub endpoint: &'static str,
    /// Meta key holding the last successful refresh time
    pub sync_key: &'static str,
    /// Upper snake name used in operation types
    pub op_name: &'static str,
}

static CATEGORY: EntityDescriptor = EntityDescriptor {
    entity: EntityType::Category,
    collection: "categories",
    identity_field: FIELD_ID,
    match_field: "name",
    scope_field: None,
    references: &[],
    endpoint: "/categories",
    sync_key: "lastCategoriesSync",
    op_name: "CATEGORY",
};

static SUBCATEGORY: EntityDescriptor = EntityDescriptor {
    entity: EntityType::Subcategory,
    collection: "subcategories",
    identity_field: FIELD_ID,
    match_field: "name",
    scope_field: Some("categoryId"),
    references: &[("categoryId", EntityType::Category)],
    endpoint: "/subcategories",
    sync_key: "lastSubcategoriesSync",
    op_name: "SUBCATEGORY",
};

static DISH: EntityDescriptor = EntityDescriptor {
    entity: EntityType::Dish,
    collection: "dishes",
    identity_field: FIELD_ID,
    match_field: "name",
    scope_field: Some("categoryId"),
    references: &[
        ("categoryId", EntityType::Category),
        ("subcategoryId", EntityType::Subcategory),
    ],
    endpoint: "/dishes",
    sync_key: "lastDishesSync",
    op_name: "DISH",
};

static VARIANT: EntityDescriptor = EntityDescriptor {
    entity: EntityType::Variant,
    collection: "variants",
    identity_field: FIELD_ID,
    match_field: "name",
    scope_field: Some("dishId"),
    references: &[("dishId", EntityType::Dish)],
    endpoint: "/variants",
    sync_key: "lastVariantsSync",
    op_name: "VARIANT",
};

static TABLE: EntityDescriptor = EntityDescriptor {
    entity: EntityType::Table,
    collection: "tables",
    identity_field: FIELD_ID,
    match_field: "number",
    scope_field: None,
    references: &[("tableTypeId", EntityType::TableType)],
    endpoint: "/tables",
    sync_key: "lastTablesSync",
    op_name: "TABLE",
};

static TABLE_TYPE: EntityDescriptor = EntityDescriptor {
    entity: EntityType::TableType,
    collection: "tableTypes",
    identity_field: FIELD_ID,
    match_field: "name",
    scope_field: None,
    references: &[],
    endpoint: "/tables/types",
    sync_key: "lastTableTypesSync",
    op_name: "TABLE_TYPE",
};

impl EntityType {
    /// All entity types, parents before children.
    pub const ALL: [EntityType; 6] = [
        EntityType::Category,
        EntityType::Subcategory,
        EntityType::Dish,
        EntityType::Variant,
        EntityType::TableType,
        EntityType::Table,
    ];

    pub fn descriptor(self) -> &'static EntityDescriptor {
        match self {
            EntityType::Category => &CATEGORY,
            EntityType::Subcategory => &SUBCATEGORY,
            EntityType::Dish => &DISH,
            EntityType::Variant => &VARIANT,
            EntityType::Table => &TABLE,
            EntityType::TableType => &TABLE_TYPE,
        }
    }

    pub fn collection(self) -> &'static str {
        self.descriptor().collection
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.descriptor().collection == collection)
    }

    pub fn from_op_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.descriptor().op_name == name)
    }

    /// Entity types whose records hold references to `self`, with the field.
    pub fn dependents(self) -> Vec<(EntityType, &'static str)> {
        Self::ALL
            .into_iter()
            .flat_map(|other| {
                other
                    .descriptor()
                    .references
                    .iter()
                    .filter(move |(_, target)| *target == self)
                    .map(move |(field, _)| (other, *field))
            })
            .collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl EntityDescriptor {
    /// Identity of a record under this descriptor.
    pub fn id_of<'a>(&self, record: &'a Value) -> Option<&'a str> {
        record.get(self.identity_field).and_then(Value::as_str)
    }

    /// Normalized duplicate-detection key: lowercased, trimmed match field.
    pub fn match_key(&self, record: &Value) -> Option<String> {
        let key = match record.get(self.match_field)? {
            Value::String(s) => s.trim().to_lowercase(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!key.is_empty()).then_some(key)
    }

    /// Scope value the match key is compared within.
    pub fn scope_of<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        self.scope_field.and_then(|field| record.get(field))
    }

    /// Every temp id this record refers to through its reference fields.
    pub fn temp_references(&self, record: &Value) -> Vec<String> {
        self.references
            .iter()
            .filter_map(|(field, _)| record.get(*field).and_then(Value::as_str))
            .filter(|id| is_temp_id(id))
            .map(str::to_string)
            .collect()
    }
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

pub fn mint_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

pub fn record_id(record: &Value) -> Option<&str> {
    record.get(FIELD_ID).and_then(Value::as_str)
}

pub fn is_temp(record: &Value) -> bool {
    record
        .get(FIELD_IS_TEMP)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn updated_at(record: &Value) -> Option<i64> {
    record.get(FIELD_UPDATED_AT).and_then(parse_timestamp)
}

/// Payload as a JSON object; non-object payloads become an empty object.
pub fn as_object(payload: Option<&Value>) -> Map<String, Value> {
    match payload {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Shallow-merge `patch` over `base`. Top-level keys in `patch` win.
pub fn shallow_merge(base: &Value, patch: Option<&Value>) -> Value {
    let mut merged = as_object(Some(base));
    for (key, value) in as_object(patch) {
        merged.insert(key, value);
    }
    Value::Object(merged)
}

/// Set `updatedAt` (and `createdAt` when `created`) to `now_ms`.
pub fn stamp(record: &mut Value, now_ms: i64, created: bool) {
    if let Value::Object(map) = record {
        let ts = Value::String(to_rfc3339(now_ms));
        if created {
            map.insert(FIELD_CREATED_AT.to_string(), ts.clone());
        }
        map.insert(FIELD_UPDATED_AT.to_string(), ts);
    }
}

pub fn set_field(record: &mut Value, field: &str, value: Value) {
    if let Value::Object(map) = record {
        map.insert(field.to_string(), value);
    }
}

/// Content equality ignoring local bookkeeping fields.
pub fn same_content(a: &Value, b: &Value) -> bool {
    let strip = |v: &Value| {
        let mut map = as_object(Some(v));
        map.remove(FIELD_IS_TEMP);
        map
    };
    strip(a) == strip(b)
}
