use rustmemodb_orm::{
    AttachManager, CallbackAction, CallbackMode, ClassMeta, CopyRegistry, DetachedGraph,
    DetachedKey, DetachedObject, FieldKind, FieldMeta, FieldValue, InMemoryStore, KernelConfig,
    KernelError, ManagedObject, ObjectId, OpCallbacks, PcState, PersistenceContext, StoredValue,
    Version,
};
use serde_json::json;
use std::sync::Arc;

fn item_class() -> Arc<ClassMeta> {
    Arc::new(
        ClassMeta::new("Item")
            .field(FieldMeta::new("id", FieldKind::Integer).primary_key())
            .field(FieldMeta::new("name", FieldKind::Text))
            .field(FieldMeta::new("payload", FieldKind::Object)),
    )
}

fn node_class() -> Arc<ClassMeta> {
    Arc::new(
        ClassMeta::new("Node")
            .field(FieldMeta::new("id", FieldKind::Integer).primary_key())
            .field(FieldMeta::new("label", FieldKind::Text))
            .field(FieldMeta::new("next", FieldKind::Reference).cascade_attach()),
    )
}

fn store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.register_class(item_class());
    store.register_class(node_class());
    store
}

fn context(store: &Arc<InMemoryStore>, config: KernelConfig) -> PersistenceContext {
    PersistenceContext::new(config, store.clone()).unwrap()
}

fn seed(store: &InMemoryStore, id: i64, name: &str) {
    store.insert_record(
        &item_class(),
        ObjectId::Long(id),
        vec![
            StoredValue::Integer(id),
            StoredValue::Text(name.to_string()),
            StoredValue::Null,
        ],
    );
}

/// Detach the given stored items from a short-lived context.
fn detach_items(store: &Arc<InMemoryStore>, ids: &[i64]) -> DetachedGraph {
    let mut ctx = context(store, KernelConfig::default());
    ctx.begin().unwrap();
    let handles: Vec<_> = ids
        .iter()
        .map(|id| ctx.find("Item", &ObjectId::Long(*id)).unwrap().unwrap())
        .collect();
    let graph = ctx.detach_all(&handles).unwrap();
    ctx.commit().unwrap();
    graph
}

#[test]
fn test_detach_modify_attach_round_trip() {
    let store = store();
    seed(&store, 1, "lamp");
    let mut graph = detach_items(&store, &[1]);
    let root = graph.roots[0];

    let detached = graph.get(root).unwrap();
    assert_eq!(detached.object_id(), Some(&ObjectId::Long(1)));
    assert_eq!(detached.version(), Some(Version(1)));
    graph.get_mut(root).unwrap().set(1, FieldValue::text("lantern"));

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.attach(&graph, root).unwrap().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PDirty);
    assert_eq!(ctx.read_field(id, "name").unwrap(), FieldValue::text("lantern"));
    ctx.commit().unwrap();

    let (values, version) = store.record("Item", &ObjectId::Long(1)).unwrap();
    assert_eq!(values[1], StoredValue::Text("lantern".into()));
    assert_eq!(version, Version(2));
}

#[test]
fn test_unchanged_attach_leaves_instance_clean() {
    let store = store();
    seed(&store, 1, "lamp");
    let graph = detach_items(&store, &[1]);

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.attach(&graph, graph.roots[0]).unwrap().unwrap();
    assert_ne!(ctx.state(id).unwrap(), PcState::PDirty);
    ctx.commit().unwrap();
    assert_eq!(store.record("Item", &ObjectId::Long(1)).unwrap().1, Version(1));
}

#[test]
fn test_stale_attach_is_an_optimistic_conflict() {
    let store = store();
    seed(&store, 1, "lamp");
    let graph = detach_items(&store, &[1]);
    let root = graph.roots[0];
    store.bump_version("Item", &ObjectId::Long(1));

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    match ctx.attach(&graph, root).unwrap_err() {
        KernelError::OptimisticConflict { failed, .. } => {
            assert_eq!(failed.detached_key(), Some(root));
            assert_eq!(failed.object_id(), Some(&ObjectId::Long(1)));
        }
        other => panic!("expected conflict, got {other}"),
    }
}

#[test]
fn test_attach_of_record_deleted_in_store_fails() {
    let store = store();
    seed(&store, 1, "lamp");
    let graph = detach_items(&store, &[1]);
    store.remove_record("Item", &ObjectId::Long(1));

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let err = ctx.attach(&graph, graph.roots[0]).unwrap_err();
    assert!(err.is_optimistic_conflict());
}

#[test]
fn test_cyclic_graph_attaches_each_object_once() {
    let store = store();
    let mut a = DetachedObject::new(
        "Node",
        vec![FieldValue::Integer(1), FieldValue::text("a"), FieldValue::Null],
    );
    let mut b = DetachedObject::new(
        "Node",
        vec![FieldValue::Integer(2), FieldValue::text("b"), FieldValue::Null],
    );
    a.values[2] = FieldValue::Detached(b.key);
    b.values[2] = FieldValue::Detached(a.key);

    let mut graph = DetachedGraph::new();
    let a_key = graph.insert_root(a);
    graph.insert(b);

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let a_id = ctx.attach(&graph, a_key).unwrap().unwrap();
    assert_eq!(ctx.state(a_id).unwrap(), PcState::PNew);

    let FieldValue::Managed(b_id) = ctx.read_field(a_id, "next").unwrap() else {
        panic!("next should resolve to a managed instance");
    };
    assert_eq!(ctx.read_field(b_id, "next").unwrap(), FieldValue::Managed(a_id));
    assert_eq!(ctx.read_field(b_id, "label").unwrap(), FieldValue::text("b"));
    assert_eq!(ctx.managed_instances().len(), 2);

    ctx.commit().unwrap();
    let (values, _) = store.record("Node", &ObjectId::Long(1)).unwrap();
    assert_eq!(
        values[2],
        StoredValue::Ref {
            class: "Node".into(),
            object_id: ObjectId::Long(2),
        }
    );
    assert!(store.record("Node", &ObjectId::Long(2)).is_some());
}

#[test]
fn test_attach_all_collects_failures() {
    let store = store();
    for (id, name) in [(1, "lamp"), (2, "rug"), (3, "jar")] {
        seed(&store, id, name);
    }
    let graph = detach_items(&store, &[1, 2, 3]);
    let keys = graph.roots.clone();
    store.bump_version("Item", &ObjectId::Long(2));

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    match ctx.attach_all(&graph, &keys).unwrap_err() {
        KernelError::Aggregate(aggregate) => {
            assert_eq!(aggregate.attempted, 3);
            assert_eq!(aggregate.len(), 1);
            assert_eq!(aggregate.failures[0].0.detached_key(), Some(keys[1]));
            assert!(aggregate.failures[0].1.is_optimistic_conflict());
            assert_eq!(aggregate.results.len(), 3);
            assert!(aggregate.results[0].is_some());
            assert_eq!(aggregate.results[1], None);
            assert_eq!(
                aggregate.results[2],
                ctx.find_cached("Item", &ObjectId::Long(3))
            );
        }
        other => panic!("expected aggregate, got {other}"),
    }
    // The batch kept going past the failure.
    assert!(ctx.find_cached("Item", &ObjectId::Long(3)).is_some());
}

#[test]
fn test_attach_all_fail_fast_stops_at_first_failure() {
    let store = store();
    for (id, name) in [(1, "lamp"), (2, "rug"), (3, "jar")] {
        seed(&store, id, name);
    }
    let graph = detach_items(&store, &[1, 2, 3]);
    let keys = graph.roots.clone();
    store.bump_version("Item", &ObjectId::Long(2));

    let config = KernelConfig::default().callback_mode(CallbackMode::fail_fast());
    let mut ctx = context(&store, config);
    ctx.begin().unwrap();
    match ctx.attach_all(&graph, &keys).unwrap_err() {
        KernelError::Aggregate(aggregate) => {
            assert_eq!(aggregate.attempted, 2);
            assert_eq!(aggregate.len(), 1);
            assert_eq!(aggregate.results.len(), 2);
            assert_eq!(
                aggregate.results[0],
                ctx.find_cached("Item", &ObjectId::Long(1))
            );
        }
        other => panic!("expected aggregate, got {other}"),
    }
    assert_eq!(ctx.find_cached("Item", &ObjectId::Long(3)), None);
}

struct SkipAll;

impl OpCallbacks for SkipAll {
    fn process_argument(&self, _object: &DetachedObject) -> CallbackAction {
        CallbackAction::Skip
    }
}

#[test]
fn test_skipped_argument_stays_detached() {
    let store = store();
    let mut graph = DetachedGraph::new();
    let key = graph.insert_root(DetachedObject::new(
        "Item",
        vec![FieldValue::Integer(9), FieldValue::text("vase"), FieldValue::Null],
    ));

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let mut manager = AttachManager::for_context(&ctx).with_callbacks(Arc::new(SkipAll));
    assert_eq!(manager.attach(&mut ctx, &graph, key).unwrap(), None);
    assert_eq!(manager.attached(key), None);
    assert!(ctx.managed_instances().is_empty());
}

#[test]
fn test_detached_new_instance_has_no_state() {
    let store = store();
    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    let object = ManagedObject::new(item_class())
        .with("id", 5i64)
        .unwrap()
        .with("name", "jar")
        .unwrap();
    let id = ctx.persist(object).unwrap();

    let graph = ctx.detach(id).unwrap();
    let detached = graph.get(graph.roots[0]).unwrap();
    assert!(detached.state.is_none());
    assert_eq!(detached.values[1], FieldValue::text("jar"));
    assert_eq!(ctx.state(id).unwrap(), PcState::PNew);
}

#[test]
fn test_uncopyable_field_is_left_unloaded() {
    let store = store();
    store.insert_record(
        &item_class(),
        ObjectId::Long(1),
        vec![
            StoredValue::Integer(1),
            StoredValue::Text("lamp".into()),
            StoredValue::Object {
                type_name: "blob".into(),
                data: json!({"bytes": [1, 2]}),
            },
        ],
    );
    let graph = detach_items(&store, &[1]);
    let detached = graph.get(graph.roots[0]).unwrap();

    let state = detached.state.as_ref().unwrap();
    assert!(state.loaded.contains(1));
    assert!(!state.loaded.contains(2));
    assert_eq!(detached.values[2], FieldValue::Null);
}

fn opaque_graph() -> (DetachedGraph, DetachedKey, FieldValue) {
    let payload = FieldValue::object("Opaque", json!({"shade": "green"}));
    let mut graph = DetachedGraph::new();
    let key = graph.insert_root(DetachedObject::new(
        "Item",
        vec![FieldValue::Integer(4), FieldValue::text("lamp"), payload.clone()],
    ));
    (graph, key, payload)
}

#[test]
fn test_attach_rejects_payload_it_cannot_copy() {
    let store = store();
    let (graph, key, _) = opaque_graph();

    let mut ctx = context(&store, KernelConfig::default());
    ctx.begin().unwrap();
    match ctx.attach(&graph, key).unwrap_err() {
        KernelError::UnsupportedCopy { field, type_name } => {
            assert_eq!(field, "payload");
            assert_eq!(type_name, "Opaque");
        }
        other => panic!("expected unsupported copy, got {other}"),
    }
}

#[test]
fn test_attached_payload_does_not_alias_detached_copy() {
    let store = store();
    let (graph, key, payload) = opaque_graph();
    let mut registry = CopyRegistry::new();
    registry.register_cloneable("Opaque");

    let mut ctx = context(&store, KernelConfig::default()).with_copy_registry(Arc::new(registry));
    ctx.begin().unwrap();
    let id = ctx.attach(&graph, key).unwrap().unwrap();

    let attached = ctx.read_field(id, "payload").unwrap();
    assert_eq!(attached, payload);
    let (FieldValue::Object(ours), FieldValue::Object(theirs)) = (&attached, &payload) else {
        panic!("payload should stay a custom object");
    };
    assert!(!Arc::ptr_eq(&ours.data, &theirs.data));
}
