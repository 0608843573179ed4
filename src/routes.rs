//! Route registry: maps mutation endpoints to operation types
//!
//! Templates are registered explicitly (`/dishes/{id}/stock`) and validated
//! when the registry is built. An endpoint nobody registered is an error, not
//! a silently unqueued write.

use tracing::debug;

use crate::entity::EntityType;
use crate::error::RouteError;
use crate::sync::queue::{OperationAction, OperationType};
use crate::transport::HttpMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone)]
struct Route {
    method: HttpMethod,
    template: String,
    segments: Vec<Segment>,
    operation_type: OperationType,
}

impl Route {
    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Match path segments, returning the first `{param}` value.
    fn matches(&self, path: &[&str]) -> Option<Option<String>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut param = None;
        for (segment, part) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param => {
                    if part.is_empty() {
                        return None;
                    }
                    if param.is_none() {
                        param = Some(part.to_string());
                    }
                }
            }
        }
        Some(param)
    }
}

/// Result of classifying a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub operation_type: OperationType,
    /// Entity id taken from the path, if the template has one
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Vec<Route>,
}

/// Path segments of an endpoint, ignoring query string and surrounding slashes.
fn path_segments(endpoint: &str) -> Vec<&str> {
    let path = endpoint.split(['?', '#']).next().unwrap_or("");
    path.trim_matches('/').split('/').collect()
}

fn parse_template(template: &str) -> Result<Vec<Segment>, RouteError> {
    let segments = path_segments(template);
    if segments.iter().any(|s| s.is_empty()) {
        return Err(RouteError::InvalidTemplate(template.to_string()));
    }
    segments
        .into_iter()
        .map(|s| {
            if s.starts_with('{') && s.ends_with('}') {
                Ok(Segment::Param)
            } else if s.contains(['{', '}']) {
                Err(RouteError::InvalidTemplate(template.to_string()))
            } else {
                Ok(Segment::Literal(s.to_string()))
            }
        })
        .collect()
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering every entity type, validated.
    pub fn standard() -> Result<Self, RouteError> {
        let mut registry = Self::new();
        for entity in EntityType::ALL {
            let base = entity.descriptor().endpoint;
            let item = format!("{}/{{id}}", base);
            registry.register(HttpMethod::Post, base, OperationType::new(OperationAction::Create, entity))?;
            registry.register(HttpMethod::Put, &item, OperationType::new(OperationAction::Update, entity))?;
            registry.register(HttpMethod::Patch, &item, OperationType::new(OperationAction::Update, entity))?;
            registry.register(HttpMethod::Delete, &item, OperationType::new(OperationAction::Delete, entity))?;
        }
        for entity in [EntityType::Dish, EntityType::Variant] {
            let stock = format!("{}/{{id}}/stock", entity.descriptor().endpoint);
            let op = OperationType::new(OperationAction::UpdateStock, entity);
            registry.register(HttpMethod::Put, &stock, op)?;
            registry.register(HttpMethod::Patch, &stock, op)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        method: HttpMethod,
        template: &str,
        operation_type: OperationType,
    ) -> Result<&mut Self, RouteError> {
        let segments = parse_template(template)?;
        let duplicate = self
            .routes
            .iter()
            .any(|r| r.method == method && r.segments == segments);
        if duplicate {
            return Err(RouteError::Duplicate {
                method: method.to_string(),
                template: template.to_string(),
            });
        }
        if method == HttpMethod::Get {
            return Err(RouteError::InvalidTemplate(format!(
                "GET {} is not a mutation",
                template
            )));
        }
        self.routes.push(Route {
            method,
            template: template.to_string(),
            segments,
            operation_type,
        });
        Ok(self)
    }

    /// Every entity needs create, update and delete routes.
    pub fn validate(&self) -> Result<(), RouteError> {
        for entity in EntityType::ALL {
            for action in [
                OperationAction::Create,
                OperationAction::Update,
                OperationAction::Delete,
            ] {
                let present = self
                    .routes
                    .iter()
                    .any(|r| r.operation_type == OperationType::new(action, entity));
                if !present {
                    return Err(RouteError::Incomplete {
                        entity: entity.to_string(),
                        action: format!("{:?}", action).to_uppercase(),
                    });
                }
            }
        }
        debug!(routes = self.routes.len(), "Route registry validated");
        Ok(())
    }

    /// Classify a mutation. The most specific template (most literals) wins.
    pub fn classify(&self, method: HttpMethod, endpoint: &str) -> Result<RouteMatch, RouteError> {
        let path = path_segments(endpoint);
        self.routes
            .iter()
            .filter(|r| r.method == method)
            .filter_map(|r| r.matches(&path).map(|id| (r, id)))
            .max_by_key(|(r, _)| r.literal_count())
            .map(|(r, entity_id)| RouteMatch {
                operation_type: r.operation_type,
                entity_id,
            })
            .ok_or_else(|| RouteError::Unmapped {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    /// Endpoint for updating one record of `entity`.
    pub fn item_endpoint(entity: EntityType, id: &str) -> String {
        format!("{}/{}", entity.descriptor().endpoint, id)
    }

    pub fn templates(&self) -> impl Iterator<Item = (HttpMethod, &str, OperationType)> {
        self.routes
            .iter()
            .map(|r| (r.method, r.template.as_str(), r.operation_type))
    }
}
