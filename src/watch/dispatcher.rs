use crate::context::ModelContext;
use crate::error::{ModelError, Result};
use crate::model::{
    composite_key, composite_key_from_path, dynamic_segments, generate_transaction_id, list_path,
    local_list_path, local_path, now_millis, resolved_path, CrudOp, DispatchEvent, DispatchFn,
    EventContext, EventFamily, EventPhase, ModelMeta, ModelRegistry, Record, WatcherPhase,
};
use crate::store::{StoreEvent, StoreEventKind};
use crate::watch::pool::{watcher_id, Watcher, WatcherSource};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

/// Starts and stops watchers and turns raw store events into context-rich
/// dispatch events.
///
/// Also the funnel the CRUD/relationship layers use to emit their two-phase
/// events: paths with live watchers get one event per watcher (carrying that
/// watcher's context), paths with none get a single synthesized "unknown
/// source" event on the context's default dispatch.
pub struct WatchMediator;

impl WatchMediator {
    /// Watch a single record's path for whole-value events.
    pub async fn start_record_watch(
        ctx: &ModelContext,
        rec: &Record,
        dispatch: DispatchFn,
    ) -> Result<Watcher> {
        let path = resolved_path(rec)?;
        let watcher = Watcher {
            watcher_id: watcher_id(WatcherSource::Record, &path),
            source: WatcherSource::Record,
            model: rec.model_name().to_string(),
            event_family: EventFamily::Value,
            query_path: path.clone(),
            watcher_paths: vec![path],
            local_path: local_path(rec)?,
            dynamic_path_properties: dynamic_segments(rec.meta()),
            created_at: now_millis(),
        };
        Self::start(ctx, watcher, dispatch).await
    }

    /// Watch a model's collection path for incremental child events. Dynamic
    /// path segments are supplied out-of-band through `offsets`.
    pub async fn start_list_watch(
        ctx: &ModelContext,
        meta: &Arc<ModelMeta>,
        offsets: &HashMap<String, Value>,
        dispatch: DispatchFn,
    ) -> Result<Watcher> {
        let path = list_path(meta, offsets)?;
        let watcher = Watcher {
            watcher_id: watcher_id(WatcherSource::List, &path),
            source: WatcherSource::List,
            model: meta.name.clone(),
            event_family: EventFamily::Child,
            query_path: path.clone(),
            watcher_paths: vec![path],
            local_path: local_list_path(meta, offsets)?,
            dynamic_path_properties: dynamic_segments(meta),
            created_at: now_millis(),
        };
        Self::start(ctx, watcher, dispatch).await
    }

    /// Register the watcher, begin the store subscription and wait (bounded)
    /// for the first observed value, so "started" implies "initial sync
    /// received or timed out". Timed-out watchers remain active.
    async fn start(ctx: &ModelContext, watcher: Watcher, dispatch: DispatchFn) -> Result<Watcher> {
        if let Some(existing) = ctx.watchers.lookup(&watcher.watcher_id) {
            log::debug!(
                "watcher [ {} ] is already active; start() is idempotent",
                existing.watcher_id
            );
            return Ok(existing);
        }

        let rx = match ctx
            .store
            .subscribe(&watcher.query_path, watcher.event_family)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                dispatch(Self::lifecycle_event(
                    &watcher,
                    WatcherPhase::Failed,
                    Some(e.to_string()),
                ));
                return Err(ModelError::StoreWriteFailure {
                    model: watcher.model.clone(),
                    operation: "watch".to_string(),
                    transaction_id: generate_transaction_id(),
                    reason: e,
                });
            }
        };

        ctx.watchers.register(watcher.clone(), dispatch.clone());
        dispatch(Self::lifecycle_event(&watcher, WatcherPhase::Starting, None));

        let (init_tx, init_rx) = oneshot::channel::<()>();
        {
            let pool = Arc::clone(&ctx.watchers);
            let registry = Arc::clone(&ctx.registry);
            let watcher = watcher.clone();
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                let mut rx = rx;
                let mut init_tx = Some(init_tx);
                while let Some(event) = rx.recv().await {
                    pool.mark_initialized(&watcher.watcher_id);
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(());
                    }
                    dispatch(Self::contextualize(&registry, &watcher, event));
                }
                log::debug!("watcher [ {} ] event stream ended", watcher.watcher_id);
            });
        }

        let wait = Duration::from_millis(ctx.config.watcher.sync_timeout_ms);
        match timeout(wait, init_rx).await {
            Ok(Ok(())) => {}
            _ => {
                ctx.watchers.mark_timed_out(&watcher.watcher_id);
                log::warn!(
                    "watcher [ {} ] has not returned an event in the timeout window [ {}ms ]; this can simply mean the watched path [ {} ] has no data yet",
                    watcher.watcher_id,
                    ctx.config.watcher.sync_timeout_ms,
                    watcher.query_path
                );
            }
        }

        dispatch(Self::lifecycle_event(&watcher, WatcherPhase::Started, None));
        Ok(watcher)
    }

    /// Tear a watcher down: drop the store subscription and remove it from
    /// the pool.
    pub async fn stop(ctx: &ModelContext, watcher_id: &str) -> Result<()> {
        let dispatch = ctx.watchers.dispatch_for(watcher_id);
        let watcher = ctx.watchers.remove(watcher_id).ok_or_else(|| {
            ModelError::NotAllowed(format!(
                "no watcher with id \"{}\" is registered",
                watcher_id
            ))
        })?;
        if let Err(e) = ctx.store.unsubscribe(&watcher.query_path).await {
            log::warn!(
                "failed to unsubscribe watcher [ {} ] from {}: {}",
                watcher_id,
                watcher.query_path,
                e
            );
        }
        if let Some(dispatch) = dispatch {
            dispatch(Self::lifecycle_event(&watcher, WatcherPhase::Stopped, None));
        }
        Ok(())
    }

    /// Wrap a raw store event with the watcher's captured context.
    pub fn contextualize(
        registry: &ModelRegistry,
        watcher: &Watcher,
        event: StoreEvent,
    ) -> DispatchEvent {
        let operation = match event.kind {
            StoreEventKind::Value => {
                if event.value.is_null() {
                    CrudOp::Remove
                } else {
                    CrudOp::Update
                }
            }
            StoreEventKind::ChildAdded => CrudOp::Add,
            StoreEventKind::ChildChanged | StoreEventKind::ChildMoved => CrudOp::Update,
            StoreEventKind::ChildRemoved => CrudOp::Remove,
        };
        let db_path = match event.kind {
            StoreEventKind::Value => event.path.clone(),
            _ => format!(
                "{}/{}",
                event.path,
                event.key.clone().unwrap_or_default()
            ),
        };
        let composite_key = registry
            .lookup(&watcher.model)
            .ok()
            .and_then(|meta| composite_key_from_path(&meta, &db_path).ok());

        DispatchEvent::Record {
            transaction_id: generate_transaction_id(),
            phase: EventPhase::Remote,
            operation,
            model: watcher.model.clone(),
            key: event.key.clone(),
            db_path,
            value: if event.value.is_null() {
                None
            } else {
                Some(event.value.clone())
            },
            prior_value: None,
            delta: None,
            prior_child_key: event.prior_child_key,
            context: EventContext {
                watcher_source: watcher.source.as_str().to_string(),
                watcher_id: Some(watcher.watcher_id.clone()),
                local_path: Some(watcher.local_path.clone()),
                dynamic_path_properties: watcher.dynamic_path_properties.clone(),
                composite_key,
            },
        }
    }

    /// Route a locally-originated event: once per watcher covering the path,
    /// or once on the default dispatch with an "unknown" source when nothing
    /// watches it.
    pub(crate) fn broadcast(
        ctx: &ModelContext,
        rec: &Record,
        db_path: &str,
        build: &dyn Fn(EventContext) -> DispatchEvent,
    ) {
        let watchers = ctx.watchers.find_watchers(db_path);
        if watchers.is_empty() {
            if let Some(dispatch) = &ctx.dispatch {
                dispatch(build(Self::unwatched_context(rec)));
            }
        } else {
            for (watcher, dispatch) in watchers {
                dispatch(build(Self::watcher_context(&watcher, rec)));
            }
        }
    }

    fn unwatched_context(rec: &Record) -> EventContext {
        EventContext {
            watcher_source: "unknown".to_string(),
            watcher_id: None,
            local_path: local_path(rec).ok(),
            dynamic_path_properties: dynamic_segments(rec.meta()),
            composite_key: composite_key(rec).ok(),
        }
    }

    fn watcher_context(watcher: &Watcher, rec: &Record) -> EventContext {
        EventContext {
            watcher_source: watcher.source.as_str().to_string(),
            watcher_id: Some(watcher.watcher_id.clone()),
            local_path: Some(watcher.local_path.clone()),
            dynamic_path_properties: watcher.dynamic_path_properties.clone(),
            composite_key: composite_key(rec).ok(),
        }
    }

    fn lifecycle_event(
        watcher: &Watcher,
        phase: WatcherPhase,
        error: Option<String>,
    ) -> DispatchEvent {
        DispatchEvent::Watcher {
            phase,
            watcher_id: watcher.watcher_id.clone(),
            model: watcher.model.clone(),
            event_family: watcher.event_family,
            watcher_paths: watcher.watcher_paths.clone(),
            error,
        }
    }
}
