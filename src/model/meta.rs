use crate::error::{ModelError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How many foreign references a relationship field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// The field holds a single composite-key reference (or is empty).
    One,
    /// The field holds a keyed map of composite-key-string -> marker value.
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directionality {
    /// Only the owning side is written; the foreign record is untouched.
    OneWay,
    /// The inverse property on the foreign record is kept consistent
    /// automatically.
    Bidirectional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMeta {
    pub name: String,
    pub is_relationship: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMeta {
    /// Field name on the owning model.
    pub property: String,
    pub cardinality: Cardinality,
    /// Name of the target model. Stored as a name rather than a resolved
    /// reference so that mutually-referencing models can be registered in any
    /// order; the registry resolves it only when the relationship is
    /// traversed.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse_property: Option<String>,
    pub directionality: Directionality,
}

/// Static description of a model type: where its records live and which of
/// its fields are plain properties versus relationships.
///
/// The `db_offset` path template may contain dynamic segments marked with a
/// `:` prefix (e.g. `":group/testing"`); each expands to
/// `<segment-name>/<field-value>` when a concrete record resolves its path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    /// Plural storage name appended to the resolved offset (e.g. "people").
    pub plural_name: String,
    /// Storage-path template; static segments are literal, dynamic segments
    /// carry a leading `:`.
    pub db_offset: String,
    /// Template for the record's location in local state; same dynamic
    /// segment rules as `db_offset`.
    pub local_prefix: String,
    pub properties: Vec<PropertyMeta>,
    pub relationships: Vec<RelationshipMeta>,
    /// Whether confirmed mutations of this model are handed to the audit
    /// sink.
    pub audit: bool,
}

impl ModelMeta {
    pub fn new(name: &str, plural_name: &str, db_offset: &str) -> Self {
        Self {
            name: name.to_string(),
            plural_name: plural_name.to_string(),
            db_offset: db_offset.to_string(),
            local_prefix: String::new(),
            properties: Vec::new(),
            relationships: Vec::new(),
            audit: false,
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn relationship(&self, property: &str) -> Option<&RelationshipMeta> {
        self.relationships.iter().find(|r| r.property == property)
    }

    pub fn is_relationship(&self, name: &str) -> bool {
        self.relationship(name).is_some()
    }

    /// True when the storage path depends on per-record field values.
    pub fn has_dynamic_path(&self) -> bool {
        self.db_offset.contains(':')
    }

    /// Structural checks applied at registration time, before any record of
    /// this model can be created.
    pub fn validate(&self) -> Result<()> {
        for rel in &self.relationships {
            if rel.directionality == Directionality::Bidirectional
                && rel
                    .inverse_property
                    .as_ref()
                    .map(|p| p.is_empty())
                    .unwrap_or(true)
            {
                return Err(ModelError::NotAllowed(format!(
                    "the bi-directional relationship {}.{} must declare an inverse property",
                    self.name, rel.property
                )));
            }
            if self.property(&rel.property).is_none() {
                return Err(ModelError::NotAllowed(format!(
                    "the relationship {}.{} has no matching property declaration",
                    self.name, rel.property
                )));
            }
        }
        Ok(())
    }
}

/// Explicit, statically-built registry of model metadata.
///
/// Populated at startup via `register()` calls and consumed as a pure lookup
/// by the composite-key resolver and the relationship path builder. Owned by
/// a `ModelContext` and passed by reference; never accessed through ambient
/// global state.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelMeta>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a model's metadata, returning the shared handle
    /// records of that model will carry.
    pub fn register(&self, meta: ModelMeta) -> Result<Arc<ModelMeta>> {
        meta.validate()?;
        let meta = Arc::new(meta);
        self.models
            .write()
            .insert(meta.name.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ModelMeta>> {
        self.models.read().get(name).cloned().ok_or_else(|| {
            ModelError::NotAllowed(format!(
                "the model \"{}\" has not been registered",
                name
            ))
        })
    }

    /// Resolve the target model of a relationship. Deferred to traversal time
    /// so that circular model references register cleanly.
    pub fn resolve_target(&self, rel: &RelationshipMeta) -> Result<Arc<ModelMeta>> {
        self.lookup(&rel.target)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.models.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_meta() -> ModelMeta {
        let mut meta = ModelMeta::new("Person", "people", "");
        meta.properties = vec![
            PropertyMeta {
                name: "name".to_string(),
                is_relationship: false,
            },
            PropertyMeta {
                name: "employer".to_string(),
                is_relationship: true,
            },
        ];
        meta.relationships = vec![RelationshipMeta {
            property: "employer".to_string(),
            cardinality: Cardinality::One,
            target: "Company".to_string(),
            inverse_property: Some("employees".to_string()),
            directionality: Directionality::Bidirectional,
        }];
        meta
    }

    #[test]
    fn registration_validates_and_resolves() {
        let registry = ModelRegistry::new();
        let person = registry.register(person_meta()).unwrap();
        assert!(registry.lookup("Person").is_ok());
        assert!(registry.lookup("Company").is_err());

        // circular targets resolve lazily: Company can land after Person
        let company = ModelMeta::new("Company", "companies", "");
        registry.register(company).unwrap();
        let rel = person.relationship("employer").unwrap();
        assert_eq!(registry.resolve_target(rel).unwrap().name, "Company");
    }

    #[test]
    fn bidirectional_without_inverse_is_rejected() {
        let mut meta = person_meta();
        meta.relationships[0].inverse_property = None;
        let registry = ModelRegistry::new();
        assert!(registry.register(meta).is_err());
    }

    #[test]
    fn relationship_without_property_declaration_is_rejected() {
        let mut meta = person_meta();
        meta.properties.retain(|p| p.name != "employer");
        let registry = ModelRegistry::new();
        assert!(registry.register(meta).is_err());
    }
}
