use crate::error::{ModelError, Result};
use crate::model::common::Id;
use crate::model::meta::ModelMeta;
use crate::model::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The delimiter separating the `id` from dynamic-segment pairs in the string
/// form of a composite key. Values may not contain this sequence; the string
/// form would no longer be invertible (see `parse_composite_key_string`).
pub const KEY_DELIMITER: &str = "::";

/// A record's full identity: its `id` plus the resolved values of every
/// dynamic segment of its storage-path template, in template order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeKey {
    pub id: Id,
    /// `(segment-name, value)` pairs in the order the segments appear in the
    /// path template.
    pub segments: Vec<(String, String)>,
}

impl CompositeKey {
    pub fn from_id(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            segments: Vec::new(),
        }
    }

    /// Object form: a flat name -> value map including `id`.
    pub fn as_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .segments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("id".to_string(), self.id.clone());
        map
    }

    pub fn segment(&self, name: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// String form: the bare `id` when there are no dynamic segments,
    /// otherwise `id::name:value` pairs in template order.
    pub fn to_ref_string(&self) -> String {
        if self.segments.is_empty() {
            self.id.clone()
        } else {
            let mut out = self.id.clone();
            for (name, value) in &self.segments {
                out.push_str(KEY_DELIMITER);
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out
        }
    }
}

/// The ordered list of dynamic-segment field names in a model's path
/// template. Pure function of metadata; does not look at any record.
pub fn dynamic_segments(meta: &ModelMeta) -> Vec<String> {
    meta.db_offset
        .split('/')
        .filter_map(|seg| seg.strip_prefix(':'))
        .map(|s| s.to_string())
        .collect()
}

/// Derive the composite key of a record from its current field values.
pub fn composite_key(rec: &Record) -> Result<CompositeKey> {
    let meta = rec.meta();
    let id = rec.id().ok_or_else(|| ModelError::NotReady {
        model: meta.name.clone(),
        property: "id".to_string(),
        needed_for: "its composite key".to_string(),
    })?;
    let mut segments = Vec::new();
    for name in dynamic_segments(meta) {
        let value = dynamic_value(rec, &name, "its composite key")?;
        if value.contains(KEY_DELIMITER) {
            return Err(ModelError::InvalidKey {
                model: meta.name.clone(),
                key: value,
                reason: format!(
                    "the \"{}\" segment value contains the reserved \"{}\" delimiter",
                    name, KEY_DELIMITER
                ),
            });
        }
        segments.push((name, value));
    }
    Ok(CompositeKey {
        id: id.to_string(),
        segments,
    })
}

/// String form of a record's composite key; equals `id` alone for models
/// without dynamic segments.
pub fn composite_key_string(rec: &Record) -> Result<String> {
    Ok(composite_key(rec)?.to_ref_string())
}

/// Reconstruct a composite key from its string form.
///
/// The string does not self-describe segment order, so the model's template
/// supplies it. Values containing the `::` delimiter are rejected: they make
/// the string ambiguous (the extra parts either change the segment count or
/// masquerade as unknown segment names, both of which fail here).
pub fn parse_composite_key_string(meta: &ModelMeta, raw: &str) -> Result<CompositeKey> {
    let invalid = |reason: String| ModelError::InvalidKey {
        model: meta.name.clone(),
        key: raw.to_string(),
        reason,
    };

    let mut parts = raw.split(KEY_DELIMITER);
    let id = parts.next().unwrap_or_default();
    if id.is_empty() {
        return Err(invalid("the key has no id".to_string()));
    }
    let rest: Vec<&str> = parts.collect();

    let declared = dynamic_segments(meta);
    if rest.len() != declared.len() {
        return Err(invalid(format!(
            "expected {} dynamic segment(s) but found {}",
            declared.len(),
            rest.len()
        )));
    }

    let mut by_name: HashMap<String, String> = HashMap::new();
    for part in rest {
        let (name, value) = part
            .split_once(':')
            .ok_or_else(|| invalid(format!("the segment \"{}\" is not a name:value pair", part)))?;
        if !declared.iter().any(|d| d == name) {
            return Err(invalid(format!(
                "\"{}\" is not a dynamic segment of {}",
                name, meta.name
            )));
        }
        if by_name.insert(name.to_string(), value.to_string()).is_some() {
            return Err(invalid(format!("the segment \"{}\" appears twice", name)));
        }
    }

    // order per the template, not per the string
    let segments = declared
        .into_iter()
        .map(|name| {
            let value = by_name.remove(&name).expect("counts were checked above");
            (name, value)
        })
        .collect();

    Ok(CompositeKey {
        id: id.to_string(),
        segments,
    })
}

/// The record's fully-qualified storage path: the expanded offset template,
/// the plural storage name and the `id`.
///
/// Each dynamic `:name` segment expands to `name/<value>`, so a `Person` with
/// offset `":group/testing"`, `group = "CA"` and `id = "12345"` resolves to
/// `/group/CA/testing/people/12345`.
pub fn resolved_path(rec: &Record) -> Result<String> {
    let meta = rec.meta();
    let id = rec.id().ok_or_else(|| ModelError::NotReady {
        model: meta.name.clone(),
        property: "id".to_string(),
        needed_for: "its storage path".to_string(),
    })?;
    let mut parts = expand_template(&meta.db_offset, |name| {
        dynamic_value(rec, name, "its storage path")
    })?;
    parts.push(meta.plural_name.clone());
    parts.push(id.to_string());
    Ok(join_path(&parts))
}

/// Storage path of the collection a record of this model belongs to (no id),
/// with dynamic segments supplied out-of-band. Used by list watchers.
pub fn list_path(meta: &ModelMeta, offsets: &HashMap<String, Value>) -> Result<String> {
    let mut parts = expand_template(&meta.db_offset, |name| {
        let value = offsets.get(name).ok_or_else(|| ModelError::NotReady {
            model: meta.name.clone(),
            property: name.to_string(),
            needed_for: "its list path".to_string(),
        })?;
        value_as_segment(meta, name, value)
    })?;
    parts.push(meta.plural_name.clone());
    Ok(join_path(&parts))
}

/// The record's destination in local state, from the model's `local_prefix`
/// template.
pub fn local_path(rec: &Record) -> Result<String> {
    let meta = rec.meta();
    let mut parts = expand_template(&meta.local_prefix, |name| {
        dynamic_value(rec, name, "its local path")
    })?;
    parts.push(meta.plural_name.clone());
    Ok(join_path(&parts))
}

/// Same as `local_path` but with dynamic segments supplied out-of-band.
pub fn local_list_path(meta: &ModelMeta, offsets: &HashMap<String, Value>) -> Result<String> {
    let mut parts = expand_template(&meta.local_prefix, |name| {
        let value = offsets.get(name).ok_or_else(|| ModelError::NotReady {
            model: meta.name.clone(),
            property: name.to_string(),
            needed_for: "its local path".to_string(),
        })?;
        value_as_segment(meta, name, value)
    })?;
    parts.push(meta.plural_name.clone());
    Ok(join_path(&parts))
}

/// Storage path for a foreign record identified only by its composite key.
pub fn path_for_key(meta: &ModelMeta, key: &CompositeKey) -> Result<String> {
    let mut parts = expand_template(&meta.db_offset, |name| {
        key.segment(name)
            .map(|v| v.to_string())
            .ok_or_else(|| ModelError::InvalidKey {
                model: meta.name.clone(),
                key: key.to_ref_string(),
                reason: format!("the key carries no \"{}\" segment", name),
            })
    })?;
    parts.push(meta.plural_name.clone());
    parts.push(key.id.clone());
    Ok(join_path(&parts))
}

/// Pull a composite key back out of a resolved storage path, failing when the
/// static portions of the path do not line up with the model's template.
pub fn composite_key_from_path(meta: &ModelMeta, path: &str) -> Result<CompositeKey> {
    let invalid = |reason: String| ModelError::InvalidKey {
        model: meta.name.clone(),
        key: path.to_string(),
        reason,
    };

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut idx = 0;
    let mut segments = Vec::new();
    for seg in meta.db_offset.split('/').filter(|s| !s.is_empty()) {
        if let Some(name) = seg.strip_prefix(':') {
            if parts.get(idx) != Some(&name) {
                return Err(invalid(format!(
                    "expected the dynamic segment \"{}\" where the path has \"{}\"",
                    name,
                    parts.get(idx).unwrap_or(&"")
                )));
            }
            let value = parts
                .get(idx + 1)
                .ok_or_else(|| invalid(format!("the path ends before the \"{}\" value", name)))?;
            segments.push((name.to_string(), value.to_string()));
            idx += 2;
        } else {
            if parts.get(idx) != Some(&seg) {
                return Err(invalid(format!(
                    "the static segment \"{}\" did not match \"{}\"",
                    seg,
                    parts.get(idx).unwrap_or(&"")
                )));
            }
            idx += 1;
        }
    }
    if parts.get(idx) != Some(&meta.plural_name.as_str()) {
        return Err(invalid(format!(
            "expected the plural name \"{}\" where the path has \"{}\"",
            meta.plural_name,
            parts.get(idx).unwrap_or(&"")
        )));
    }
    let id = parts
        .get(idx + 1)
        .ok_or_else(|| invalid("the path carries no id".to_string()))?;
    Ok(CompositeKey {
        id: id.to_string(),
        segments,
    })
}

/// Expand a path template into concrete segments. Dynamic `:name` segments
/// expand to the pair `name/<resolved value>`.
fn expand_template(
    template: &str,
    mut resolve: impl FnMut(&str) -> Result<String>,
) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    for seg in template.split('/').filter(|s| !s.is_empty()) {
        if let Some(name) = seg.strip_prefix(':') {
            parts.push(name.to_string());
            parts.push(resolve(name)?);
        } else {
            parts.push(seg.to_string());
        }
    }
    Ok(parts)
}

fn join_path(parts: &[String]) -> String {
    format!("/{}", parts.join("/"))
}

/// Read a dynamic-segment field off a record; it must be set and be either
/// text or a number.
fn dynamic_value(rec: &Record, property: &str, needed_for: &str) -> Result<String> {
    let meta = rec.meta();
    match rec.get(property) {
        None | Some(Value::Null) => Err(ModelError::NotReady {
            model: meta.name.clone(),
            property: property.to_string(),
            needed_for: needed_for.to_string(),
        }),
        Some(value) => value_as_segment(meta, property, value),
    }
}

fn value_as_segment(meta: &ModelMeta, property: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ModelError::InvalidFieldType {
            model: meta.name.clone(),
            property: property.to_string(),
            actual: ModelError::json_type_name(other).to_string(),
        }),
    }
}
