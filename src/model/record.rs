use crate::error::{ModelError, Result};
use crate::model::common::{Id, PROP_CREATED_AT, PROP_ID, PROP_LAST_UPDATED};
use crate::model::meta::{Cardinality, ModelMeta, RelationshipMeta};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory instance of a model type, bound to zero-or-one storage
/// identity.
///
/// Fields live in a name -> JSON value map. Many-relationship fields are
/// normalized to an empty map at construction time and are never absent
/// thereafter. The `id` may be assigned at most once; re-assignment is an
/// error, never a silent overwrite.
#[derive(Debug, Clone)]
pub struct Record {
    meta: Arc<ModelMeta>,
    data: HashMap<String, Value>,
    exists_in_store: bool,
    dirty: bool,
}

impl Record {
    /// Create an empty record of the given model.
    pub fn create(meta: Arc<ModelMeta>) -> Self {
        let mut rec = Self {
            meta,
            data: HashMap::new(),
            exists_in_store: false,
            dirty: false,
        };
        rec.normalize_relationship_fields();
        rec
    }

    /// Create a record and seed it with known local state. Passing an empty
    /// value map is treated as a mistake; use `create()` for that.
    pub fn local(meta: Arc<ModelMeta>, values: HashMap<String, Value>) -> Result<Self> {
        if values.is_empty() {
            return Err(ModelError::NotAllowed(
                "Record::local() was called with no values; use Record::create() for an empty record"
                    .to_string(),
            ));
        }
        let mut rec = Self::create(meta);
        for (key, value) in values {
            rec.data.insert(key, value);
        }
        rec.normalize_relationship_fields();
        Ok(rec)
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    pub fn model_name(&self) -> &str {
        &self.meta.name
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// The record's full field map as a JSON object, the shape written to the
    /// store on `add`.
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
    }

    pub fn id(&self) -> Option<&str> {
        match self.data.get(PROP_ID) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Assign the record's `id`. Allowed at most once.
    pub fn set_id(&mut self, id: impl Into<Id>) -> Result<()> {
        let id = id.into();
        if let Some(existing) = self.id() {
            return Err(ModelError::NotAllowed(format!(
                "you may not re-set the id of a record [ {}.id {} => {} ]",
                self.meta.name, existing, id
            )));
        }
        self.data.insert(PROP_ID.to_string(), Value::String(id));
        Ok(())
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.data.get(property)
    }

    /// Change a plain property locally. Relationship fields must go through
    /// the relationship operations and the `id` through `set_id()`.
    pub fn set(&mut self, property: &str, value: Value) -> Result<()> {
        if property == PROP_ID {
            return Err(ModelError::NotAllowed(format!(
                "use set_id() to assign the id of a {}",
                self.meta.name
            )));
        }
        if self.meta.is_relationship(property) {
            return Err(ModelError::NotAllowed(format!(
                "you can not set the property \"{}\" on {} because it is configured as a relationship",
                property, self.meta.name
            )));
        }
        if property != PROP_LAST_UPDATED
            && property != PROP_CREATED_AT
            && self.meta.property(property).is_none()
        {
            return Err(ModelError::NotAllowed(format!(
                "the property \"{}\" is not declared on the model {}",
                property, self.meta.name
            )));
        }
        self.data.insert(property.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    pub fn exists_in_store(&self) -> bool {
        self.exists_in_store
    }

    pub fn set_exists_in_store(&mut self, exists: bool) {
        self.exists_in_store = exists;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Stamp `lastUpdated` with the given time.
    pub fn touch(&mut self, now: i64) {
        self.data
            .insert(PROP_LAST_UPDATED.to_string(), json!(now));
    }

    /// Ensure `createdAt`/`lastUpdated` exist, as done when a record is first
    /// initialized.
    pub fn ensure_timestamps(&mut self, now: i64) {
        self.data
            .entry(PROP_CREATED_AT.to_string())
            .or_insert_with(|| json!(now));
        self.data
            .entry(PROP_LAST_UPDATED.to_string())
            .or_insert_with(|| json!(now));
    }

    pub fn last_updated(&self) -> Option<i64> {
        self.data.get(PROP_LAST_UPDATED).and_then(Value::as_i64)
    }

    /// Every declared relationship that currently carries one or more foreign
    /// references, together with those references.
    pub fn relationships_with_values(&self) -> Vec<(RelationshipMeta, Vec<String>)> {
        self.meta
            .relationships
            .iter()
            .filter_map(|rel| {
                let refs = self.relationship_refs(&rel.property);
                if refs.is_empty() {
                    None
                } else {
                    Some((rel.clone(), refs))
                }
            })
            .collect()
    }

    /// The foreign composite-key strings currently held by a relationship
    /// field (zero or one for single cardinality, the map keys for many).
    pub fn relationship_refs(&self, property: &str) -> Vec<String> {
        match self.meta.relationship(property).map(|r| r.cardinality) {
            Some(Cardinality::Many) => match self.data.get(property) {
                Some(Value::Object(map)) => map.keys().cloned().collect(),
                _ => Vec::new(),
            },
            Some(Cardinality::One) => match self.data.get(property) {
                Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// True when a many-relationship already contains the given foreign key.
    pub fn has_relationship_ref(&self, property: &str, fk: &str) -> bool {
        match self.data.get(property) {
            Some(Value::Object(map)) => map.contains_key(fk),
            Some(Value::String(s)) => s == fk,
            _ => false,
        }
    }

    pub(crate) fn insert_relationship_key(&mut self, property: &str, fk: &str, value: Value) {
        let entry = self
            .data
            .entry(property.to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = entry {
            map.insert(fk.to_string(), value);
        }
    }

    pub(crate) fn remove_relationship_key(&mut self, property: &str, fk: &str) {
        if let Some(Value::Object(map)) = self.data.get_mut(property) {
            map.remove(fk);
        }
    }

    pub(crate) fn set_relationship_value(&mut self, property: &str, value: Value) {
        self.data.insert(property.to_string(), value);
    }

    pub(crate) fn insert_raw(&mut self, property: &str, value: Value) {
        if value.is_null() {
            self.data.remove(property);
        } else {
            self.data.insert(property.to_string(), value);
        }
    }

    /// Many-relationship fields are represented by an empty map when no
    /// references exist, never by an absent field.
    fn normalize_relationship_fields(&mut self) {
        for rel in &self.meta.relationships {
            if rel.cardinality == Cardinality::Many {
                self.data
                    .entry(rel.property.clone())
                    .or_insert_with(|| json!({}));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::meta::{Directionality, PropertyMeta};

    fn meta() -> Arc<ModelMeta> {
        let mut meta = ModelMeta::new("Person", "people", "");
        meta.properties = vec![
            PropertyMeta {
                name: "name".to_string(),
                is_relationship: false,
            },
            PropertyMeta {
                name: "hobbies".to_string(),
                is_relationship: true,
            },
        ];
        meta.relationships = vec![RelationshipMeta {
            property: "hobbies".to_string(),
            cardinality: Cardinality::Many,
            target: "Hobby".to_string(),
            inverse_property: None,
            directionality: Directionality::OneWay,
        }];
        Arc::new(meta)
    }

    #[test]
    fn id_can_only_be_assigned_once() {
        let mut rec = Record::create(meta());
        rec.set_id("abc").unwrap();
        let err = rec.set_id("def").unwrap_err();
        assert!(matches!(err, ModelError::NotAllowed(_)));
        assert_eq!(rec.id(), Some("abc"));
    }

    #[test]
    fn many_relationship_fields_are_normalized_to_empty_maps() {
        let rec = Record::create(meta());
        assert_eq!(rec.get("hobbies"), Some(&json!({})));

        let seeded = Record::local(
            meta(),
            HashMap::from([("name".to_string(), json!("Bob"))]),
        )
        .unwrap();
        assert_eq!(seeded.get("hobbies"), Some(&json!({})));
    }

    #[test]
    fn set_rejects_relationships_and_undeclared_properties() {
        let mut rec = Record::create(meta());
        assert!(rec.set("hobbies", json!({})).is_err());
        assert!(rec.set("unknown", json!(1)).is_err());
        assert!(rec.set("name", json!("Bob")).is_ok());
        assert!(rec.is_dirty());
    }

    #[test]
    fn local_with_no_values_is_an_error() {
        assert!(Record::local(meta(), HashMap::new()).is_err());
    }

    #[test]
    fn relationship_refs_reads_both_cardinalities() {
        let mut rec = Record::create(meta());
        rec.insert_relationship_key("hobbies", "h1", json!(true));
        rec.insert_relationship_key("hobbies", "h2", json!(true));
        let mut refs = rec.relationship_refs("hobbies");
        refs.sort();
        assert_eq!(refs, vec!["h1", "h2"]);
        assert!(rec.has_relationship_ref("hobbies", "h1"));
        rec.remove_relationship_key("hobbies", "h1");
        assert!(!rec.has_relationship_ref("hobbies", "h1"));
    }
}
