use crate::context::ModelContext;
use crate::error::{ModelError, Result};
use crate::logic::map_store_error;
use crate::logic::relationships::{RelationshipOperator, RelnOptions};
use crate::model::{
    generate_transaction_id, now_millis, parse_composite_key_string, resolved_path, CrudOp,
    DispatchEvent, EventPhase, ModelMeta, Record, RecordDelta, PROP_ID,
};
use crate::store::AuditEntry;
use crate::watch::WatchMediator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Two-phase CRUD on whole records: apply locally, emit a "local" event,
/// write to the store, then emit "confirmed" or "rollback".
///
/// Per-operation state machine:
/// `Idle -> LocalApplied -> (StoreConfirmed | StoreFailed)`, where
/// `StoreFailed` always dispatches the rollback event before the error is
/// propagated. In-memory field values are not reverted on failure.
pub struct CrudOperator;

impl CrudOperator {
    /// Add a record to the store. An identity is generated through the
    /// store's unique-key generator when the record has none yet. After the
    /// record write is confirmed, every relationship field that already
    /// carries foreign references is re-associated so the inverse sides are
    /// populated; a failure there is surfaced but does not retract the
    /// already-confirmed record write.
    pub async fn add(ctx: &ModelContext, rec: &mut Record) -> Result<()> {
        let model = rec.model_name().to_string();
        let transaction_id = generate_transaction_id();
        if rec.id().is_none() {
            let key = ctx.store.generate_unique_key().await.map_err(|e| {
                ModelError::StoreWriteFailure {
                    model: model.clone(),
                    operation: "add".to_string(),
                    transaction_id: transaction_id.clone(),
                    reason: e,
                }
            })?;
            rec.set_id(key)?;
        }
        rec.ensure_timestamps(now_millis());
        rec.set_dirty(true);
        Self::local_crud_operation(ctx, rec, CrudOp::Add, None, &transaction_id).await?;
        rec.set_dirty(false);
        rec.set_exists_in_store(true);

        // backfill: foreign keys that arrived with the payload only exist on
        // the owning side so far; run associate over them so the inverse
        // sides are written too
        let touched = rec.relationships_with_values();
        let mut completed: Vec<String> = Vec::new();
        for (rel, refs) in touched {
            if let Err(e) =
                RelationshipOperator::associate(ctx, rec, &rel.property, &refs, RelnOptions::default())
                    .await
            {
                return Err(ModelError::CascadeFailure {
                    model,
                    operation: "add".to_string(),
                    completed,
                    failed_property: rel.property.clone(),
                    reason: Box::new(e),
                });
            }
            completed.push(rel.property.clone());
        }
        Ok(())
    }

    /// Update a set of plain properties atomically. Relationship properties
    /// are rejected before anything is touched; a `null` value removes the
    /// property. Only the changed paths are written, not the whole record.
    pub async fn update(
        ctx: &ModelContext,
        rec: &mut Record,
        updates: HashMap<String, Value>,
    ) -> Result<()> {
        let meta = rec.meta().clone();

        let offending: Vec<String> = updates
            .keys()
            .filter(|key| meta.is_relationship(root_of(key)))
            .cloned()
            .collect();
        if !offending.is_empty() {
            return Err(ModelError::RelationshipNotAllowedInUpdate {
                model: meta.name.clone(),
                properties: offending,
            });
        }
        if updates.contains_key(PROP_ID) {
            return Err(ModelError::NotAllowed(format!(
                "the id of a {} can not be changed through update()",
                meta.name
            )));
        }
        for key in updates.keys() {
            if meta.property(root_of(key)).is_none() {
                return Err(ModelError::NotAllowed(format!(
                    "the property \"{}\" is not declared on the model {}",
                    key, meta.name
                )));
            }
        }

        let transaction_id = generate_transaction_id();
        let prior = rec.data().clone();
        for (key, value) in updates {
            rec.insert_raw(&key, value);
        }
        rec.touch(now_millis());
        rec.set_dirty(true);
        Self::local_crud_operation(ctx, rec, CrudOp::Update, Some(prior), &transaction_id).await?;
        rec.set_dirty(false);
        Ok(())
    }

    /// Remove a record. Every declared relationship with a non-empty value is
    /// disassociated first (one operation per foreign key) so foreign sides
    /// do not retain dangling references; only then is the record's own path
    /// deleted. A failure mid-cascade aborts the remove; relationships
    /// already disassociated stay that way.
    pub async fn remove(ctx: &ModelContext, rec: &mut Record) -> Result<()> {
        let transaction_id = generate_transaction_id();
        let prior = rec.data().clone();
        rec.set_dirty(true);
        Self::local_crud_operation(ctx, rec, CrudOp::Remove, Some(prior), &transaction_id).await?;
        rec.set_dirty(false);
        rec.set_exists_in_store(false);
        Ok(())
    }

    /// Load a record by id or composite-key string.
    pub async fn get(ctx: &ModelContext, meta: &Arc<ModelMeta>, key: &str) -> Result<Record> {
        let composite = parse_composite_key_string(meta, key)?;
        let mut rec = Record::create(Arc::clone(meta));
        for (name, value) in &composite.segments {
            rec.insert_raw(name, Value::String(value.clone()));
        }
        rec.set_id(composite.id.clone())?;
        let path = resolved_path(&rec)?;
        let data = ctx
            .store
            .read(&path)
            .await
            .map_err(|e| ModelError::StoreWriteFailure {
                model: meta.name.clone(),
                operation: "get".to_string(),
                transaction_id: generate_transaction_id(),
                reason: e,
            })?;
        match data {
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    if k == PROP_ID {
                        continue;
                    }
                    rec.insert_raw(&k, v);
                }
                rec.set_exists_in_store(true);
                Ok(rec)
            }
            _ => Err(ModelError::NotFound {
                model: meta.name.clone(),
                path,
            }),
        }
    }

    /// The shared two-phase commit: local dispatch, store write, terminal
    /// dispatch.
    async fn local_crud_operation(
        ctx: &ModelContext,
        rec: &mut Record,
        op: CrudOp,
        prior: Option<HashMap<String, Value>>,
        transaction_id: &str,
    ) -> Result<()> {
        let meta = rec.meta().clone();
        let db_path = resolved_path(rec)?;
        let delta = prior
            .as_ref()
            .map(|p| RecordDelta::between(rec.data(), p));
        let value = rec.to_value();
        let prior_value = prior.as_ref().map(|p| {
            Value::Object(p.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
        });

        let record_key = rec.id().map(|s| s.to_string());
        let record_event = |phase: EventPhase| {
            let transaction_id = transaction_id.to_string();
            let model = meta.name.clone();
            let key = record_key.clone();
            let db_path = db_path.clone();
            let value = value.clone();
            let prior_value = prior_value.clone();
            let delta = delta.clone();
            move |context| DispatchEvent::Record {
                transaction_id: transaction_id.clone(),
                phase,
                operation: op,
                model: model.clone(),
                key: key.clone(),
                db_path: db_path.clone(),
                value: Some(value.clone()),
                prior_value: prior_value.clone(),
                delta: delta.clone(),
                prior_child_key: None,
                context,
            }
        };

        WatchMediator::broadcast(ctx, rec, &db_path, &record_event(EventPhase::Local));

        // remove disassociates every populated relationship before the
        // record's own path goes away, one operation per foreign key
        if op == CrudOp::Remove {
            let mut completed: Vec<String> = Vec::new();
            for (rel, refs) in rec.relationships_with_values() {
                for fk_ref in refs {
                    if let Err(e) =
                        RelationshipOperator::disassociate(ctx, rec, &rel.property, &[fk_ref]).await
                    {
                        WatchMediator::broadcast(
                            ctx,
                            rec,
                            &db_path,
                            &record_event(EventPhase::Rollback),
                        );
                        return Err(ModelError::CascadeFailure {
                            model: meta.name.clone(),
                            operation: "remove".to_string(),
                            completed,
                            failed_property: rel.property.clone(),
                            reason: Box::new(e),
                        });
                    }
                }
                completed.push(rel.property.clone());
            }
        }

        let store_result = match op {
            CrudOp::Add => ctx.store.write(&db_path, value.clone()).await,
            CrudOp::Update => {
                let delta = delta.as_ref().expect("update always carries a prior state");
                let mut updates: HashMap<String, Value> = HashMap::new();
                for key in delta.added.iter().chain(delta.changed.iter()) {
                    updates.insert(
                        format!("{}/{}", db_path, key),
                        rec.get(key).cloned().unwrap_or(Value::Null),
                    );
                }
                for key in &delta.removed {
                    updates.insert(format!("{}/{}", db_path, key), Value::Null);
                }
                ctx.store.multi_path_write(updates, "/").await
            }
            CrudOp::Remove => ctx.store.remove(&db_path).await,
        };

        match store_result {
            Ok(()) => {
                log::debug!(
                    "{:?} of {} at {} store-confirmed [txn {}]",
                    op,
                    meta.name,
                    db_path,
                    transaction_id
                );
                if meta.audit {
                    Self::write_audit(ctx, rec, op, &delta, prior.as_ref()).await;
                }
                WatchMediator::broadcast(ctx, rec, &db_path, &record_event(EventPhase::Confirmed));
                Ok(())
            }
            Err(e) => {
                WatchMediator::broadcast(ctx, rec, &db_path, &record_event(EventPhase::Rollback));
                Err(map_store_error(
                    e,
                    &meta.name,
                    match op {
                        CrudOp::Add => "add",
                        CrudOp::Update => "update",
                        CrudOp::Remove => "remove",
                    },
                    &db_path,
                    transaction_id,
                ))
            }
        }
    }

    /// Hand the confirmed mutation to the audit sink. Sink failures are
    /// logged, never propagated.
    async fn write_audit(
        ctx: &ModelContext,
        rec: &Record,
        op: CrudOp,
        delta: &Option<RecordDelta>,
        prior: Option<&HashMap<String, Value>>,
    ) {
        let Some(sink) = &ctx.audit else {
            return;
        };
        let empty = HashMap::new();
        let prior = prior.unwrap_or(&empty);
        let delta = match delta {
            Some(delta) => delta.clone(),
            None => RecordDelta::between(rec.data(), &empty),
        };
        let entry = AuditEntry {
            model: rec.model_name().to_string(),
            plural_name: rec.meta().plural_name.clone(),
            record_id: rec.id().unwrap_or_default().to_string(),
            action: match op {
                CrudOp::Add => "added",
                CrudOp::Update => "updated",
                CrudOp::Remove => "removed",
            }
            .to_string(),
            changes: AuditEntry::changes_from_delta(&delta, rec.data(), prior),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = sink.write_audit(entry).await {
            log::warn!(
                "audit sink rejected the {:?} entry for {}: {}",
                op,
                rec.model_name(),
                e
            );
        }
    }
}

fn root_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}
