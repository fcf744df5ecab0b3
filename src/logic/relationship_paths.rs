use crate::error::{ModelError, Result};
use crate::model::{
    composite_key_string, parse_composite_key_string, path_for_key, resolved_path, Cardinality,
    Directionality, ModelRegistry, PathWrite, Record, RelnOp, PROP_LAST_UPDATED,
};
use serde_json::{json, Value};

/// Options shaping one relationship path computation.
#[derive(Debug, Clone)]
pub struct RelnPathOptions {
    pub operation: RelnOp,
    /// Timestamp written to the `lastUpdated` stamp on both sides touched.
    pub now: i64,
    /// Value stored against each key of a many-relationship; `true` unless
    /// the caller supplies a payload.
    pub alt_many_value: Value,
    /// Treat a re-added foreign key as an error instead of an idempotent
    /// no-op.
    pub duplication_is_error: bool,
}

impl RelnPathOptions {
    pub fn new(operation: RelnOp, now: i64) -> Self {
        Self {
            operation,
            now,
            alt_many_value: json!(true),
            duplication_is_error: false,
        }
    }
}

/// The writes one foreign reference produces, plus what the builder learned
/// along the way.
#[derive(Debug, Clone)]
pub struct BuiltRelationshipPaths {
    /// Ordered `(path, value)` pairs covering the owning side, the inverse
    /// side (bi-directional only) and the `lastUpdated` stamps.
    pub writes: Vec<PathWrite>,
    /// The foreign reference in normalized composite-key-string form.
    pub fk_ref: String,
    /// Set when a many-add re-used a key already present on the record; the
    /// write itself stays idempotent and the orchestrator emits a non-fatal
    /// duplicate notification instead of consulting the store.
    pub duplicate: bool,
}

/// Compute the full set of store writes needed to keep one relationship
/// consistent from both sides.
///
/// The foreign reference is a composite-key string (a bare id for targets
/// without dynamic segments). The inverse side is written only for
/// bi-directional relationships, using the inverse relationship's own
/// declared cardinality, which may differ from the owning side's.
pub fn build_relationship_paths(
    registry: &ModelRegistry,
    rec: &Record,
    property: &str,
    fk_ref: &str,
    options: &RelnPathOptions,
) -> Result<BuiltRelationshipPaths> {
    let meta = rec.meta().clone();
    let rel = meta.relationship(property).ok_or_else(|| {
        ModelError::NotAllowed(format!(
            "\"{}\" is not a relationship on the model {}",
            property, meta.name
        ))
    })?;
    let target = registry.resolve_target(rel).map_err(|e| {
        ModelError::UnknownRelationshipProblem {
            model: meta.name.clone(),
            property: property.to_string(),
            operation: format!("{:?}", options.operation).to_lowercase(),
            reason: e.into(),
        }
    })?;

    let fk_key = parse_composite_key_string(&target, fk_ref)?;
    let fk_ref = fk_key.to_ref_string();
    let src_path = resolved_path(rec)?;
    let src_ref = composite_key_string(rec)?;
    let removing = matches!(options.operation, RelnOp::Remove | RelnOp::Clear);

    let mut duplicate = false;
    let mut writes = Vec::new();

    // owning side
    match rel.cardinality {
        Cardinality::Many => {
            if !removing && rec.has_relationship_ref(property, &fk_ref) {
                if options.duplication_is_error {
                    return Err(ModelError::DuplicateRelationship {
                        model: meta.name.clone(),
                        property: property.to_string(),
                        fk: fk_ref,
                    });
                }
                duplicate = true;
            }
            writes.push(PathWrite::new(
                format!("{}/{}/{}", src_path, property, fk_ref),
                if removing {
                    Value::Null
                } else {
                    options.alt_many_value.clone()
                },
            ));
        }
        Cardinality::One => {
            writes.push(PathWrite::new(
                format!("{}/{}", src_path, property),
                if removing {
                    Value::Null
                } else {
                    json!(fk_ref)
                },
            ));
        }
    }
    writes.push(PathWrite::new(
        format!("{}/{}", src_path, PROP_LAST_UPDATED),
        json!(options.now),
    ));

    // inverse side
    if rel.directionality == Directionality::Bidirectional {
        let inverse = rel
            .inverse_property
            .as_deref()
            .expect("bi-directional relationships carry an inverse; validated at registration");
        let inverse_rel = target.relationship(inverse).ok_or_else(|| {
            ModelError::MissingInverse {
                model: meta.name.clone(),
                property: property.to_string(),
                target: target.name.clone(),
                inverse: inverse.to_string(),
            }
        })?;
        let fk_path = path_for_key(&target, &fk_key)?;
        match inverse_rel.cardinality {
            Cardinality::Many => writes.push(PathWrite::new(
                format!("{}/{}/{}", fk_path, inverse, src_ref),
                if removing {
                    Value::Null
                } else {
                    options.alt_many_value.clone()
                },
            )),
            Cardinality::One => writes.push(PathWrite::new(
                format!("{}/{}", fk_path, inverse),
                if removing {
                    Value::Null
                } else {
                    json!(src_ref)
                },
            )),
        }
        writes.push(PathWrite::new(
            format!("{}/{}", fk_path, PROP_LAST_UPDATED),
            json!(options.now),
        ));
    }

    Ok(BuiltRelationshipPaths {
        writes,
        fk_ref,
        duplicate,
    })
}
