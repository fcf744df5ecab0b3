use crate::context::ModelContext;
use crate::error::{ModelError, Result};
use crate::logic::relationship_paths::{build_relationship_paths, RelnPathOptions};
use crate::logic::map_store_error;
use crate::model::{
    generate_transaction_id, now_millis, resolved_path, Cardinality, DispatchEvent, EventPhase,
    PathWrite, Record, RelationshipMeta, RelnOp,
};
use crate::watch::WatchMediator;
use itertools::Itertools;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Caller-facing options for a relationship operation.
#[derive(Debug, Clone, Default)]
pub struct RelnOptions {
    /// Payload stored against each key of a many-relationship instead of the
    /// default `true` marker.
    pub alt_many_value: Option<Value>,
    /// Treat re-adding an existing foreign key as `DuplicateRelationship`
    /// instead of an idempotent no-op.
    pub duplication_is_error: bool,
}

/// Sequences a relationship change through the optimistic two-phase commit:
/// local apply, "local" dispatch, one atomic multi-path store write, then a
/// "confirmed" or "rollback" dispatch.
///
/// On store failure the in-memory changes are NOT automatically reverted;
/// the rollback event and the returned error are the caller's signal to
/// compensate.
pub struct RelationshipOperator;

impl RelationshipOperator {
    /// Point a single-cardinality relationship at a foreign record.
    pub async fn set_relationship(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
        fk_ref: &str,
        options: RelnOptions,
    ) -> Result<()> {
        let rel = require_relationship(rec, property)?;
        if rel.cardinality != Cardinality::One {
            return Err(wrong_cardinality(rec, property, "set_relationship", rel.cardinality));
        }
        if fk_ref.is_empty() {
            return Err(ModelError::NotAllowed(format!(
                "failed to set the relationship {}.{} because no foreign key was passed in",
                rec.model_name(),
                property
            )));
        }
        Self::run(ctx, rec, RelnOp::Set, property, vec![fk_ref.to_string()], options).await
    }

    /// Add one or more foreign keys to a many-relationship. All references in
    /// one call land in one atomic multi-path write.
    pub async fn add_to_relationship<S: AsRef<str>>(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
        fk_refs: &[S],
        options: RelnOptions,
    ) -> Result<()> {
        let rel = require_relationship(rec, property)?;
        if rel.cardinality != Cardinality::Many {
            return Err(wrong_cardinality(rec, property, "add_to_relationship", rel.cardinality));
        }
        let refs = fk_refs.iter().map(|s| s.as_ref().to_string()).collect();
        Self::run(ctx, rec, RelnOp::Add, property, refs, options).await
    }

    /// Remove one or more foreign keys from a many-relationship.
    pub async fn remove_from_relationship<S: AsRef<str>>(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
        fk_refs: &[S],
    ) -> Result<()> {
        let rel = require_relationship(rec, property)?;
        if rel.cardinality != Cardinality::Many {
            return Err(wrong_cardinality(
                rec,
                property,
                "remove_from_relationship",
                rel.cardinality,
            ));
        }
        let refs = fk_refs.iter().map(|s| s.as_ref().to_string()).collect();
        Self::run(ctx, rec, RelnOp::Remove, property, refs, RelnOptions::default()).await
    }

    /// Clear a single-cardinality foreign key, or every entry of a
    /// many-relationship.
    pub async fn clear_relationship(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
    ) -> Result<()> {
        require_relationship(rec, property)?;
        let refs = rec.relationship_refs(property);
        Self::run(ctx, rec, RelnOp::Clear, property, refs, RelnOptions::default()).await
    }

    /// Associate foreign keys with a relationship regardless of cardinality.
    pub async fn associate<S: AsRef<str>>(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
        fk_refs: &[S],
        options: RelnOptions,
    ) -> Result<()> {
        let rel = require_relationship(rec, property)?;
        match rel.cardinality {
            Cardinality::Many => {
                Self::add_to_relationship(ctx, rec, property, fk_refs, options).await
            }
            Cardinality::One => {
                if fk_refs.len() != 1 {
                    return Err(ModelError::NotAllowed(format!(
                        "associate() was given {} foreign keys for the single-cardinality relationship {}.{}",
                        fk_refs.len(),
                        rec.model_name(),
                        property
                    )));
                }
                Self::set_relationship(ctx, rec, property, fk_refs[0].as_ref(), options).await
            }
        }
    }

    /// Remove an association regardless of cardinality.
    pub async fn disassociate<S: AsRef<str>>(
        ctx: &ModelContext,
        rec: &mut Record,
        property: &str,
        fk_refs: &[S],
    ) -> Result<()> {
        let rel = require_relationship(rec, property)?;
        match rel.cardinality {
            Cardinality::Many => {
                Self::remove_from_relationship(ctx, rec, property, fk_refs).await
            }
            Cardinality::One => Self::clear_relationship(ctx, rec, property).await,
        }
    }

    async fn run(
        ctx: &ModelContext,
        rec: &mut Record,
        op: RelnOp,
        property: &str,
        fk_refs: Vec<String>,
        options: RelnOptions,
    ) -> Result<()> {
        let model = rec.model_name().to_string();
        let now = now_millis();
        let path_options = RelnPathOptions {
            operation: op,
            now,
            alt_many_value: options.alt_many_value.clone().unwrap_or_else(|| json!(true)),
            duplication_is_error: options.duplication_is_error,
        };

        // build the combined write set before touching any state
        let mut writes: Vec<PathWrite> = Vec::new();
        let mut normalized: Vec<String> = Vec::new();
        let mut duplicates: Vec<String> = Vec::new();
        for fk_ref in &fk_refs {
            let built =
                build_relationship_paths(&ctx.registry, rec, property, fk_ref, &path_options)?;
            if built.duplicate {
                duplicates.push(built.fk_ref.clone());
            }
            normalized.push(built.fk_ref.clone());
            writes.extend(built.writes);
        }
        let writes: Vec<PathWrite> = writes
            .into_iter()
            .unique_by(|w| w.path.clone())
            .collect();

        let transaction_id = generate_transaction_id();
        let db_path = resolved_path(rec)?;

        // optimistic local apply on the owning record; the foreign record is
        // not held in memory, its side lives only in the store writes
        for fk_ref in &normalized {
            locally_update_fk(rec, op, property, fk_ref, &path_options.alt_many_value, now);
        }

        let reln_event = |phase: EventPhase| {
            let transaction_id = transaction_id.clone();
            let model = model.clone();
            let property = property.to_string();
            let foreign_keys = normalized.clone();
            let paths = writes.clone();
            move |context| DispatchEvent::Relationship {
                transaction_id: transaction_id.clone(),
                phase,
                operation: op,
                model: model.clone(),
                property: property.clone(),
                foreign_keys: foreign_keys.clone(),
                paths: paths.clone(),
                context,
            }
        };

        WatchMediator::broadcast(ctx, rec, &db_path, &reln_event(EventPhase::Local));
        for fk_ref in &duplicates {
            log::debug!(
                "{}.{} re-added the existing foreign key {}; treating as idempotent",
                model,
                property,
                fk_ref
            );
            let transaction_id = transaction_id.clone();
            let model = model.clone();
            let property = property.to_string();
            let foreign_key = fk_ref.clone();
            WatchMediator::broadcast(ctx, rec, &db_path, &move |context| {
                DispatchEvent::RelationshipDuplicate {
                    transaction_id: transaction_id.clone(),
                    model: model.clone(),
                    property: property.clone(),
                    foreign_key: foreign_key.clone(),
                    context,
                }
            });
        }

        let updates: HashMap<String, Value> = writes
            .iter()
            .map(|w| (w.path.clone(), w.value.clone()))
            .collect();
        match ctx.store.multi_path_write(updates, "/").await {
            Ok(()) => {
                log::debug!(
                    "relationship {:?} on {}.{} confirmed [txn {}]",
                    op,
                    model,
                    property,
                    transaction_id
                );
                WatchMediator::broadcast(ctx, rec, &db_path, &reln_event(EventPhase::Confirmed));
                Ok(())
            }
            Err(e) => {
                // terminal event first, then the error; local state stays as
                // applied
                WatchMediator::broadcast(ctx, rec, &db_path, &reln_event(EventPhase::Rollback));
                Err(map_store_error(
                    e,
                    &model,
                    &format!("{:?}", op).to_lowercase(),
                    &db_path,
                    &transaction_id,
                ))
            }
        }
    }
}

/// Apply the optimistic local change a relationship operation implies to the
/// owning record's field. Has no concern with dispatch or the foreign model.
fn locally_update_fk(
    rec: &mut Record,
    op: RelnOp,
    property: &str,
    fk_ref: &str,
    alt_many_value: &Value,
    now: i64,
) {
    rec.touch(now);
    let cardinality = match rec.meta().relationship(property) {
        Some(rel) => rel.cardinality,
        None => return,
    };
    match (op, cardinality) {
        (RelnOp::Set | RelnOp::Add, Cardinality::Many) => {
            rec.insert_relationship_key(property, fk_ref, alt_many_value.clone());
        }
        (RelnOp::Set | RelnOp::Add, Cardinality::One) => {
            rec.set_relationship_value(property, json!(fk_ref));
        }
        (RelnOp::Remove | RelnOp::Clear, Cardinality::Many) => {
            rec.remove_relationship_key(property, fk_ref);
        }
        (RelnOp::Remove | RelnOp::Clear, Cardinality::One) => {
            rec.set_relationship_value(property, json!(""));
        }
    }
}

fn require_relationship(rec: &Record, property: &str) -> Result<RelationshipMeta> {
    rec.meta()
        .relationship(property)
        .cloned()
        .ok_or_else(|| {
            ModelError::NotAllowed(format!(
                "attempt to use the property \"{}\" as a relationship on {} but it is not defined as one",
                property,
                rec.model_name()
            ))
        })
}

fn wrong_cardinality(
    rec: &Record,
    property: &str,
    operation: &str,
    actual: Cardinality,
) -> ModelError {
    ModelError::WrongCardinality {
        model: rec.model_name().to_string(),
        property: property.to_string(),
        operation: operation.to_string(),
        actual,
    }
}
