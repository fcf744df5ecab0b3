use pathmodel::{
    composite_key, composite_key_string, parse_composite_key_string, resolved_path, AuditEntry,
    AuditSink, Cardinality, CrudOperator, Directionality, DispatchEvent, DispatchFn, EventPhase,
    MemoryStore, ModelContext, ModelError, ModelMeta, ModelRegistry, PropertyMeta, Record,
    RelationshipMeta, RelationshipOperator, RelnOptions, StoreOp, WatchMediator,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

fn prop(name: &str, is_relationship: bool) -> PropertyMeta {
    PropertyMeta {
        name: name.to_string(),
        is_relationship,
    }
}

/// Person lives under a dynamic path (`:group/testing`), Company and Hobby
/// live at flat paths; Person<->Company is one-to-many, Person<->Hobby is
/// many-to-many.
fn build_registry() -> Arc<ModelRegistry> {
    let registry = ModelRegistry::new();

    let mut person = ModelMeta::new("Person", "people", ":group/testing");
    person.properties = vec![
        prop("name", false),
        prop("age", false),
        prop("group", false),
        prop("employer", true),
        prop("hobbies", true),
    ];
    person.relationships = vec![
        RelationshipMeta {
            property: "employer".to_string(),
            cardinality: Cardinality::One,
            target: "Company".to_string(),
            inverse_property: Some("employees".to_string()),
            directionality: Directionality::Bidirectional,
        },
        RelationshipMeta {
            property: "hobbies".to_string(),
            cardinality: Cardinality::Many,
            target: "Hobby".to_string(),
            inverse_property: Some("practitioners".to_string()),
            directionality: Directionality::Bidirectional,
        },
    ];
    registry.register(person).unwrap();

    let mut company = ModelMeta::new("Company", "companies", "");
    company.properties = vec![prop("name", false), prop("employees", true)];
    company.relationships = vec![RelationshipMeta {
        property: "employees".to_string(),
        cardinality: Cardinality::Many,
        target: "Person".to_string(),
        inverse_property: Some("employer".to_string()),
        directionality: Directionality::Bidirectional,
    }];
    registry.register(company).unwrap();

    let mut hobby = ModelMeta::new("Hobby", "hobbies", "");
    hobby.properties = vec![prop("name", false), prop("practitioners", true)];
    hobby.relationships = vec![RelationshipMeta {
        property: "practitioners".to_string(),
        cardinality: Cardinality::Many,
        target: "Person".to_string(),
        inverse_property: Some("hobbies".to_string()),
        directionality: Directionality::Bidirectional,
    }];
    registry.register(hobby).unwrap();

    Arc::new(registry)
}

fn collecting_dispatch() -> (DispatchFn, Arc<Mutex<Vec<DispatchEvent>>>) {
    let seen: Arc<Mutex<Vec<DispatchEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let dispatch: DispatchFn = Arc::new(move |ev| sink.lock().unwrap().push(ev));
    (dispatch, seen)
}

fn new_context() -> (
    ModelContext,
    Arc<MemoryStore>,
    Arc<Mutex<Vec<DispatchEvent>>>,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = build_registry();
    let store = Arc::new(MemoryStore::new());
    let (dispatch, seen) = collecting_dispatch();
    let ctx = ModelContext::new(registry, store.clone()).with_dispatch(dispatch);
    (ctx, store, seen)
}

async fn added_person(ctx: &ModelContext, id: &str, group: &str) -> Record {
    let meta = ctx.registry.lookup("Person").unwrap();
    let mut rec = Record::local(
        meta,
        HashMap::from([
            ("name".to_string(), json!("Bob")),
            ("group".to_string(), json!(group)),
        ]),
    )
    .unwrap();
    rec.set_id(id).unwrap();
    CrudOperator::add(ctx, &mut rec).await.unwrap();
    rec
}

fn record_phases(seen: &Mutex<Vec<DispatchEvent>>) -> Vec<(EventPhase, String)> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|ev| match ev {
            DispatchEvent::Record {
                phase,
                transaction_id,
                ..
            } => Some((*phase, transaction_id.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn composite_keys_and_resolved_paths() {
    let (ctx, _store, _seen) = new_context();

    // a model without dynamic segments qualifies by id alone
    let mut company = Record::create(ctx.registry.lookup("Company").unwrap());
    company.set_id("c-1").unwrap();
    assert_eq!(composite_key_string(&company).unwrap(), "c-1");

    // dynamic segments round-trip through the string form
    let person_meta = ctx.registry.lookup("Person").unwrap();
    let mut person = Record::create(person_meta.clone());
    person.set("group", json!("CA")).unwrap();
    person.set_id("12345").unwrap();
    let raw = composite_key_string(&person).unwrap();
    assert_eq!(raw, "12345::group:CA");
    assert_eq!(
        parse_composite_key_string(&person_meta, &raw).unwrap(),
        composite_key(&person).unwrap()
    );

    // segment substitution + plural name + id
    assert_eq!(
        resolved_path(&person).unwrap(),
        "/group/CA/testing/people/12345"
    );
    println!("✓ composite keys and resolved paths behave");
}

#[tokio::test]
async fn add_runs_the_two_phase_commit_and_backfills_inverses() {
    let (ctx, store, seen) = new_context();
    let person_meta = ctx.registry.lookup("Person").unwrap();

    // the payload already carries an employer reference
    let mut rec = Record::local(
        person_meta,
        HashMap::from([
            ("name".to_string(), json!("Bob")),
            ("group".to_string(), json!("CA")),
            ("employer".to_string(), json!("c-1")),
        ]),
    )
    .unwrap();
    CrudOperator::add(&ctx, &mut rec).await.unwrap();

    let id = rec.id().expect("add assigns an id").to_string();
    assert!(rec.exists_in_store());

    // record landed under its dynamic path
    let path = format!("/group/CA/testing/people/{}", id);
    assert_eq!(store.value_at(&format!("{}/name", path)), Some(json!("Bob")));

    // the local event preceded the confirmation, with one transaction id
    let phases = record_phases(&seen);
    assert_eq!(phases[0].0, EventPhase::Local);
    assert_eq!(phases[1].0, EventPhase::Confirmed);
    assert_eq!(phases[0].1, phases[1].1);

    // relationship backfill populated the inverse side after confirmation
    let person_ref = format!("{}::group:CA", id);
    assert_eq!(
        store.value_at(&format!("/companies/c-1/employees/{}", person_ref)),
        Some(json!(true))
    );
    println!("✓ add = local dispatch → store write → confirm → inverse backfill");
}

#[tokio::test]
async fn bidirectional_single_set_writes_both_sides() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;

    RelationshipOperator::set_relationship(&ctx, &mut person, "employer", "c-1", RelnOptions::default())
        .await
        .unwrap();

    // owning side holds the foreign ref, inverse side holds the keyed marker
    assert_eq!(
        store.value_at("/group/CA/testing/people/p-1/employer"),
        Some(json!("c-1"))
    );
    assert_eq!(
        store.value_at("/companies/c-1/employees/p-1::group:CA"),
        Some(json!(true))
    );
    assert_eq!(person.get("employer"), Some(&json!("c-1")));

    // both sides got a lastUpdated stamp
    assert!(store
        .value_at("/companies/c-1/lastUpdated")
        .is_some());
    println!("✓ person.employer → companyRef and company.employees[personRef] → true");
}

#[tokio::test]
async fn wrong_cardinality_fails_before_any_write() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    store.clear_operations();

    let err = RelationshipOperator::set_relationship(
        &ctx,
        &mut person,
        "hobbies",
        "h-1",
        RelnOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::WrongCardinality { .. }));

    let err = RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "employer",
        &["c-1"],
        RelnOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::WrongCardinality { .. }));

    assert!(store.operations().is_empty(), "no write may be attempted");
    println!("✓ cardinality guards fire before the store is touched");
}

#[tokio::test]
async fn add_then_remove_leaves_the_many_relationship_unchanged() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;

    let before = person.relationship_refs("hobbies");
    RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "hobbies",
        &["h-1"],
        RelnOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(person.relationship_refs("hobbies"), vec!["h-1"]);

    RelationshipOperator::remove_from_relationship(&ctx, &mut person, "hobbies", &["h-1"])
        .await
        .unwrap();
    assert_eq!(person.relationship_refs("hobbies"), before);
    assert_eq!(
        store.value_at("/group/CA/testing/people/p-1/hobbies/h-1"),
        None
    );
    assert_eq!(
        store.value_at("/hobbies/h-1/practitioners/p-1::group:CA"),
        None
    );
    println!("✓ add + remove round-trips to the original key set");
}

#[tokio::test]
async fn duplicate_adds_are_idempotent_and_notified() {
    let (ctx, _store, seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;

    RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "hobbies",
        &["h-1"],
        RelnOptions::default(),
    )
    .await
    .unwrap();
    seen.lock().unwrap().clear();

    // second add of the same key: no error, one duplicate notification
    RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "hobbies",
        &["h-1"],
        RelnOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(person.relationship_refs("hobbies"), vec!["h-1"]);
    assert!(seen.lock().unwrap().iter().any(|ev| matches!(
        ev,
        DispatchEvent::RelationshipDuplicate { foreign_key, .. } if foreign_key == "h-1"
    )));

    // opting into strictness turns the same re-add into an error
    let err = RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "hobbies",
        &["h-1"],
        RelnOptions {
            duplication_is_error: true,
            ..RelnOptions::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::DuplicateRelationship { .. }));
    println!("✓ duplicate adds: idempotent by default, error on request");
}

#[tokio::test]
async fn update_rejects_relationships_and_writes_only_changed_paths() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    store.clear_operations();

    // relationship keys are rejected before the store is touched
    let err = CrudOperator::update(
        &ctx,
        &mut person,
        HashMap::from([("employer".to_string(), json!("c-1"))]),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        ModelError::RelationshipNotAllowedInUpdate { .. }
    ));
    assert!(store.operations().is_empty());

    // a legal update writes only the changed paths
    CrudOperator::update(
        &ctx,
        &mut person,
        HashMap::from([
            ("age".to_string(), json!(41)),
            ("name".to_string(), Value::Null),
        ]),
    )
    .await
    .unwrap();

    let ops = store.operations();
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        StoreOp::MultiPathWrite { paths } => {
            assert_eq!(
                paths,
                &vec![
                    "/group/CA/testing/people/p-1/age".to_string(),
                    "/group/CA/testing/people/p-1/lastUpdated".to_string(),
                    "/group/CA/testing/people/p-1/name".to_string(),
                ]
            );
        }
        other => panic!("expected a multi-path write, got {:?}", other),
    }
    assert_eq!(
        store.value_at("/group/CA/testing/people/p-1/age"),
        Some(json!(41))
    );
    // null removed the property on both sides
    assert_eq!(store.value_at("/group/CA/testing/people/p-1/name"), None);
    assert_eq!(person.get("name"), None);
    println!("✓ update = relationship guard + changed-paths-only write");
}

#[tokio::test]
async fn remove_disassociates_every_foreign_key_before_deleting() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    RelationshipOperator::set_relationship(&ctx, &mut person, "employer", "c-1", RelnOptions::default())
        .await
        .unwrap();
    RelationshipOperator::add_to_relationship(
        &ctx,
        &mut person,
        "hobbies",
        &["h-1", "h-2"],
        RelnOptions::default(),
    )
    .await
    .unwrap();
    store.clear_operations();

    CrudOperator::remove(&ctx, &mut person).await.unwrap();

    let ops = store.operations();
    // one disassociate write per foreign key (1 employer + 2 hobbies), then
    // the record's own path
    let disassociates = ops
        .iter()
        .take_while(|op| matches!(op, StoreOp::MultiPathWrite { .. }))
        .count();
    assert_eq!(disassociates, 3);
    assert_eq!(
        ops.last(),
        Some(&StoreOp::Remove {
            path: "/group/CA/testing/people/p-1".to_string()
        })
    );

    // no dangling references remain on the foreign sides
    assert_eq!(
        store.value_at("/companies/c-1/employees/p-1::group:CA"),
        None
    );
    assert_eq!(
        store.value_at("/hobbies/h-1/practitioners/p-1::group:CA"),
        None
    );
    assert_eq!(
        store.value_at("/hobbies/h-2/practitioners/p-1::group:CA"),
        None
    );
    assert_eq!(store.value_at("/group/CA/testing/people/p-1"), None);
    assert!(!person.exists_in_store());
    println!("✓ remove cleans both sides of every relationship first");
}

#[tokio::test]
async fn store_failure_dispatches_rollback_but_keeps_local_state() {
    let (ctx, store, seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    seen.lock().unwrap().clear();
    store.fail_writes_under("/group/CA/testing/people/p-1");

    let err = CrudOperator::update(
        &ctx,
        &mut person,
        HashMap::from([("age".to_string(), json!(50))]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::StoreWriteFailure { .. }));

    // terminal rollback event correlates with the local event
    let phases = record_phases(&seen);
    assert_eq!(phases[0].0, EventPhase::Local);
    assert_eq!(phases[1].0, EventPhase::Rollback);
    assert_eq!(phases[0].1, phases[1].1);

    // documented limitation: the optimistic local change is NOT reverted
    assert_eq!(person.get("age"), Some(&json!(50)));
    assert_eq!(store.value_at("/group/CA/testing/people/p-1/age"), None);
    println!("✓ rollback event fired, local state intentionally left advanced");
}

#[tokio::test]
async fn relationship_store_failure_also_rolls_back_with_context() {
    let (ctx, store, seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    seen.lock().unwrap().clear();
    store.fail_writes_under("/companies");

    let err = RelationshipOperator::set_relationship(
        &ctx,
        &mut person,
        "employer",
        "c-1",
        RelnOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::StoreWriteFailure { .. }));

    let reln_phases: Vec<EventPhase> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|ev| match ev {
            DispatchEvent::Relationship { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(reln_phases, vec![EventPhase::Local, EventPhase::Rollback]);

    // the optimistic owning-side value stays; nothing reached the store
    assert_eq!(person.get("employer"), Some(&json!("c-1")));
    assert_eq!(
        store.value_at("/group/CA/testing/people/p-1/employer"),
        None
    );
    println!("✓ relationship failure = rollback event + error, no store write");
}

#[tokio::test]
async fn permission_denied_is_surfaced_as_such() {
    let (ctx, store, _seen) = new_context();
    let mut person = added_person(&ctx, "p-1", "CA").await;
    store.deny_writes_under("/group/CA/testing/people/p-1");

    let err = CrudOperator::update(
        &ctx,
        &mut person,
        HashMap::from([("age".to_string(), json!(50))]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ModelError::PermissionDenied { .. }));
    println!("✓ store permission problems keep their identity");
}

#[tokio::test]
async fn watched_paths_route_events_through_the_watcher() {
    let (mut ctx, _store, default_seen) = new_context();
    // the empty collection has no children to sync; don't wait long for it
    ctx.config.watcher.sync_timeout_ms = 50;
    let person_meta = ctx.registry.lookup("Person").unwrap();
    let (watch_dispatch, watched_seen) = collecting_dispatch();

    let offsets = HashMap::from([("group".to_string(), json!("CA"))]);
    WatchMediator::start_list_watch(&ctx, &person_meta, &offsets, watch_dispatch)
        .await
        .unwrap();
    default_seen.lock().unwrap().clear();
    watched_seen.lock().unwrap().clear();

    let _person = added_person(&ctx, "p-1", "CA").await;
    sleep(Duration::from_millis(30)).await;

    let watched = watched_seen.lock().unwrap();
    // the locally-originated two-phase events went to the watcher, enriched
    // with its context
    assert!(watched.iter().any(|ev| matches!(
        ev,
        DispatchEvent::Record { phase: EventPhase::Local, context, .. }
            if context.watcher_source == "list"
    )));
    assert!(watched.iter().any(|ev| matches!(
        ev,
        DispatchEvent::Record { phase: EventPhase::Confirmed, .. }
    )));
    // the store subscription delivered the change as a remote event
    assert!(watched.iter().any(|ev| matches!(
        ev,
        DispatchEvent::Record { phase: EventPhase::Remote, key: Some(k), .. } if k == "p-1"
    )));
    // nothing leaked onto the default (unwatched) dispatch
    assert!(record_phases(&default_seen).is_empty());
    println!("✓ watcher context wraps both local and store-originated events");
}

#[tokio::test]
async fn unwatched_paths_synthesize_events_on_the_default_dispatch() {
    let (ctx, _store, seen) = new_context();
    let _person = added_person(&ctx, "p-1", "CA").await;

    let events = seen.lock().unwrap();
    let local = events
        .iter()
        .find_map(|ev| match ev {
            DispatchEvent::Record {
                phase: EventPhase::Local,
                context,
                ..
            } => Some(context.clone()),
            _ => None,
        })
        .expect("an unwatched local event should reach the default dispatch");
    assert_eq!(local.watcher_source, "unknown");
    assert_eq!(local.watcher_id, None);
    assert_eq!(local.dynamic_path_properties, vec!["group"]);
    println!("✓ zero-watcher paths still reach the default dispatch sink");
}

struct CollectingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

#[async_trait::async_trait]
impl AuditSink for CollectingAudit {
    async fn write_audit(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

#[tokio::test]
async fn audited_models_hand_confirmed_deltas_to_the_sink() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = ModelRegistry::new();
    let mut meta = ModelMeta::new("Invoice", "invoices", "");
    meta.properties = vec![prop("total", false)];
    meta.audit = true;
    let meta = registry.register(meta).unwrap();

    let audit = Arc::new(CollectingAudit {
        entries: Mutex::new(Vec::new()),
    });
    let ctx = ModelContext::new(Arc::new(registry), Arc::new(MemoryStore::new()))
        .with_audit(audit.clone());

    let mut rec = Record::local(
        meta,
        HashMap::from([("total".to_string(), json!(100))]),
    )
    .unwrap();
    CrudOperator::add(&ctx, &mut rec).await.unwrap();
    CrudOperator::update(&ctx, &mut rec, HashMap::from([("total".to_string(), json!(150))]))
        .await
        .unwrap();

    let entries = audit.entries.lock().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, "added");
    assert_eq!(entries[1].action, "updated");
    let total_change = entries[1]
        .changes
        .iter()
        .find(|c| c.property == "total")
        .unwrap();
    assert_eq!(total_change.before, Some(json!(100)));
    assert_eq!(total_change.after, Some(json!(150)));
    println!("✓ audit sink sees confirmed mutations with field-level deltas");
}
