use parking_lot::Mutex;
use rustmemodb_orm::{
    CallbackMode, ClassMeta, EventSource, FieldKind, FieldMeta, FieldValue, InMemoryStore,
    KernelConfig, KernelError, LifecycleEvent, LifecycleListener, LockLevel, ManagedObject,
    ObjectId, PcState, PersistenceContext, StoredValue, Version,
};
use std::sync::Arc;

fn item_class() -> Arc<ClassMeta> {
    Arc::new(
        ClassMeta::new("Item")
            .field(FieldMeta::new("id", FieldKind::Integer).primary_key())
            .field(FieldMeta::new("name", FieldKind::Text))
            .field(FieldMeta::new("tags", FieldKind::List)),
    )
}

fn person_class() -> Arc<ClassMeta> {
    Arc::new(
        ClassMeta::new("Person")
            .field(FieldMeta::new("id", FieldKind::Integer).primary_key())
            .field(FieldMeta::new("address", FieldKind::Reference)),
    )
}

fn address_class() -> Arc<ClassMeta> {
    Arc::new(ClassMeta::new("Address").field(FieldMeta::new("street", FieldKind::Text)))
}

fn setup(config: KernelConfig) -> (Arc<InMemoryStore>, PersistenceContext) {
    let store = Arc::new(InMemoryStore::new());
    store.register_class(item_class());
    store.register_class(person_class());
    store.register_class(address_class());
    let ctx = PersistenceContext::new(config, store.clone()).unwrap();
    (store, ctx)
}

fn item(id: i64, name: &str) -> ManagedObject {
    ManagedObject::new(item_class())
        .with("id", id)
        .unwrap()
        .with("name", name)
        .unwrap()
        .with("tags", FieldValue::list(Vec::new()))
        .unwrap()
}

fn seed(store: &InMemoryStore, id: i64, name: &str) {
    store.insert_record(
        &item_class(),
        ObjectId::Long(id),
        vec![
            StoredValue::Integer(id),
            StoredValue::Text(name.to_string()),
            StoredValue::List(vec![StoredValue::Text("a".to_string())]),
        ],
    );
}

fn stored_name(store: &InMemoryStore, id: i64) -> Option<StoredValue> {
    store
        .record("Item", &ObjectId::Long(id))
        .map(|(values, _)| values[1].clone())
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<LifecycleEvent>>,
    fail_on: Option<LifecycleEvent>,
}

impl LifecycleListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_event(&self, event: LifecycleEvent, _source: &EventSource) -> Result<(), String> {
        self.events.lock().push(event);
        if self.fail_on == Some(event) {
            return Err(format!("refused {}", event));
        }
        Ok(())
    }
}

#[test]
fn test_persist_and_commit_retain_keeps_values() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.persist(item(1, "lamp")).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNew);
    assert_eq!(ctx.transactional_instances(), vec![id]);

    ctx.commit().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
    assert!(ctx.get(id).unwrap().is_loaded(1));
    assert_eq!(ctx.get(id).unwrap().version(), Some(Version(1)));
    assert_eq!(ctx.find_cached("Item", &ObjectId::Long(1)), Some(id));
    assert_eq!(store.record("Item", &ObjectId::Long(1)).unwrap().1, Version(1));
    assert!(ctx.transactional_instances().is_empty());
}

#[test]
fn test_commit_without_retain_hollows_instances() {
    let (_store, mut ctx) = setup(KernelConfig::default().retain_state(false));
    ctx.begin().unwrap();
    let id = ctx.persist(item(1, "lamp")).unwrap();
    ctx.commit().unwrap();

    assert_eq!(ctx.state(id).unwrap(), PcState::Hollow);
    assert!(ctx.get(id).unwrap().is_loaded(0));
    assert!(!ctx.get(id).unwrap().is_loaded(1));

    let name = ctx.read_field(id, "name").unwrap();
    assert_eq!(name, FieldValue::text("lamp"));
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
}

#[test]
fn test_store_assigns_id_when_key_is_unset() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 40, "desk");
    ctx.begin().unwrap();
    let object = ManagedObject::new(item_class()).with("name", "shelf").unwrap();
    let id = ctx.persist(object).unwrap();
    assert!(ctx.get(id).unwrap().object_id().is_temporary());

    ctx.commit().unwrap();
    let oid = ctx.get(id).unwrap().object_id().clone();
    assert_eq!(oid, ObjectId::Long(41));
    assert_eq!(ctx.find_cached("Item", &oid), Some(id));
    assert_eq!(ctx.read_field(id, "id").unwrap(), FieldValue::Integer(41));
}

#[test]
fn test_rollback_of_new_instance_makes_it_transient() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.persist(item(1, "lamp")).unwrap();
    ctx.rollback().unwrap();

    assert_eq!(ctx.state(id).unwrap(), PcState::Transient);
    assert!(!ctx.is_cached(id));
    assert!(store.is_empty());
    assert!(!ctx.is_active());
}

#[test]
fn test_flushed_new_instance_deleted_before_commit() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.persist(item(1, "lamp")).unwrap();
    ctx.flush().unwrap();
    assert!(store.record("Item", &ObjectId::Long(1)).is_some());

    ctx.delete(id).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNewFlushedDeleted);
    ctx.commit().unwrap();

    assert_eq!(ctx.state(id).unwrap(), PcState::Transient);
    assert!(store.record("Item", &ObjectId::Long(1)).is_none());
    assert_eq!(ctx.find_cached("Item", &ObjectId::Long(1)), None);
}

#[test]
fn test_repersist_after_flushed_delete_inserts_again() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let id = ctx.persist(item(1, "lamp")).unwrap();
    ctx.flush().unwrap();
    ctx.delete(id).unwrap();
    ctx.flush().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNewFlushedDeletedFlushed);
    assert!(store.record("Item", &ObjectId::Long(1)).is_none());

    ctx.persist_instance(id).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNew);
    assert!(!ctx.get(id).unwrap().flags().flushed);

    ctx.commit().unwrap();
    assert_eq!(stored_name(&store, 1), Some(StoredValue::Text("lamp".into())));
}

#[test]
fn test_optimistic_update_bumps_version() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 7, "chair");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(7)).unwrap().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);

    ctx.write_field(id, "name", FieldValue::text("stool")).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PDirty);
    assert_eq!(ctx.dirty_instances(), vec![id]);

    ctx.commit().unwrap();
    let (values, version) = store.record("Item", &ObjectId::Long(7)).unwrap();
    assert_eq!(values[1], StoredValue::Text("stool".into()));
    assert_eq!(version, Version(2));
    assert_eq!(ctx.get(id).unwrap().version(), Some(Version(2)));
}

#[test]
fn test_concurrent_update_fails_commit_and_rolls_back() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 7, "chair");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(7)).unwrap().unwrap();
    ctx.write_field(id, "name", FieldValue::text("stool")).unwrap();
    store.bump_version("Item", &ObjectId::Long(7));

    let err = ctx.commit().unwrap_err();
    match err {
        KernelError::OptimisticConflict { failed, .. } => {
            assert_eq!(failed.object_id(), Some(&ObjectId::Long(7)));
        }
        other => panic!("expected conflict, got {other}"),
    }
    assert!(!ctx.is_active());
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
    assert_eq!(ctx.get(id).unwrap().object().get(1), Some(&FieldValue::text("chair")));
    assert_eq!(stored_name(&store, 7), Some(StoredValue::Text("chair".into())));
}

#[test]
fn test_pessimistic_read_enlists_instance() {
    let (store, mut ctx) = setup(KernelConfig::default().optimistic(false));
    seed(&store, 3, "bench");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(3)).unwrap().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PClean);
    assert_eq!(ctx.transactional_instances(), vec![id]);
    ctx.commit().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
}

#[test]
fn test_read_lock_level_applies_to_transactional_reads() {
    let config = KernelConfig::default()
        .optimistic(false)
        .read_lock_level(LockLevel::Read)
        .write_lock_level(LockLevel::Write);
    let (store, mut ctx) = setup(config);
    seed(&store, 3, "bench");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(3)).unwrap().unwrap();
    assert_eq!(ctx.lock_level(id).unwrap(), LockLevel::Read);

    ctx.write_field(id, "name", FieldValue::text("stool")).unwrap();
    assert_eq!(ctx.lock_level(id).unwrap(), LockLevel::Write);
    ctx.commit().unwrap();
    assert_eq!(ctx.lock_level(id).unwrap(), LockLevel::None);
}

#[test]
fn test_find_of_deleted_instance_returns_none() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 2, "rug");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(2)).unwrap().unwrap();
    ctx.delete(id).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PDeleted);
    assert_eq!(ctx.find("Item", &ObjectId::Long(2)).unwrap(), None);
    assert_eq!(ctx.find("Item", &ObjectId::Long(99)).unwrap(), None);

    ctx.commit().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::Transient);
    assert!(store.is_empty());
}

#[test]
fn test_duplicate_persist_is_rejected() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let first = ctx.persist(item(1, "lamp")).unwrap();
    let err = ctx.persist(item(1, "other lamp")).unwrap_err();
    assert!(matches!(err, KernelError::DuplicateObjectId { .. }));
    assert_eq!(ctx.managed_instances(), vec![first]);
}

#[test]
fn test_new_instance_may_reuse_id_of_deleted_one() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 3, "old");
    ctx.begin().unwrap();
    let old = ctx.find("Item", &ObjectId::Long(3)).unwrap().unwrap();
    ctx.delete(old).unwrap();
    let fresh = ctx.persist(item(3, "new")).unwrap();

    ctx.flush().unwrap();
    assert_eq!(ctx.conflict("Item", &ObjectId::Long(3)), Some(fresh));
    assert_eq!(ctx.find_cached("Item", &ObjectId::Long(3)), Some(fresh));

    ctx.commit().unwrap();
    assert_eq!(ctx.state(old).unwrap(), PcState::Transient);
    assert_eq!(ctx.conflict("Item", &ObjectId::Long(3)), None);
    assert_eq!(ctx.find_cached("Item", &ObjectId::Long(3)), Some(fresh));
    assert_eq!(stored_name(&store, 3), Some(StoredValue::Text("new".into())));
}

#[test]
fn test_writes_outside_transaction_need_permission() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 5, "vase");
    let id = ctx.find("Item", &ObjectId::Long(5)).unwrap().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);

    let err = ctx.write_field(id, "name", FieldValue::text("urn")).unwrap_err();
    assert!(matches!(err, KernelError::NoTransaction));
    assert!(matches!(ctx.persist(item(6, "jar")), Err(KernelError::NoTransaction)));
}

#[test]
fn test_nontransactional_changes_enlist_at_begin() {
    let (store, mut ctx) = setup(KernelConfig::default().nontransactional_write(true));
    seed(&store, 5, "vase");
    let id = ctx.find("Item", &ObjectId::Long(5)).unwrap().unwrap();
    ctx.write_field(id, "name", FieldValue::text("urn")).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTransDirty);

    let fresh = ctx.persist(item(6, "jar")).unwrap();
    assert_eq!(ctx.state(fresh).unwrap(), PcState::PNonTransNew);
    assert_eq!(ctx.pending_instances(), vec![id, fresh]);

    ctx.begin().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PDirty);
    assert_eq!(ctx.state(fresh).unwrap(), PcState::PNew);
    assert!(ctx.pending_instances().is_empty());

    ctx.commit().unwrap();
    assert_eq!(stored_name(&store, 5), Some(StoredValue::Text("urn".into())));
    assert_eq!(stored_name(&store, 6), Some(StoredValue::Text("jar".into())));
}

#[test]
fn test_reads_outside_transaction_can_be_disabled() {
    let (store, mut ctx) = setup(KernelConfig::default().nontransactional_read(false));
    seed(&store, 5, "vase");
    assert!(matches!(
        ctx.find("Item", &ObjectId::Long(5)),
        Err(KernelError::NoTransaction)
    ));
}

#[test]
fn test_evict_and_release() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    let id = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();

    ctx.evict(id).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::Hollow);
    assert!(!ctx.get(id).unwrap().is_loaded(1));
    assert_eq!(ctx.read_field(id, "name").unwrap(), FieldValue::text("lamp"));

    ctx.release(id).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::Transient);
    assert!(!ctx.is_cached(id));
    assert_eq!(ctx.get(id).unwrap().object().get(1), Some(&FieldValue::text("lamp")));
}

#[test]
fn test_reference_is_hollow_until_read() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 9, "clock");
    let id = ctx.reference("Item", &ObjectId::Long(9)).unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::Hollow);
    assert!(ctx.get(id).unwrap().is_loaded(0));
    assert_eq!(ctx.read_field(id, "name").unwrap(), FieldValue::text("clock"));
    assert_eq!(ctx.reference("Item", &ObjectId::Long(9)).unwrap(), id);
}

#[test]
fn test_mutating_a_list_in_place_is_flushed() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();
    ctx.mutate_field(id, "tags", |value| {
        if let FieldValue::List(items) = value {
            items.update(|list| list.push(FieldValue::text("b")));
        }
    })
    .unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PDirty);
    ctx.commit().unwrap();

    let (values, _) = store.record("Item", &ObjectId::Long(1)).unwrap();
    assert_eq!(
        values[2],
        StoredValue::List(vec![
            StoredValue::Text("a".into()),
            StoredValue::Text("b".into())
        ])
    );
}

#[test]
fn test_untracked_changes_found_by_dirty_check() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();
    ctx.set_intercepting(id, false).unwrap();
    assert!(ctx.untracked_object_mut(id).is_some());

    let object = ctx.untracked_object_mut(id).unwrap();
    object.values[1] = FieldValue::text("lantern");
    ctx.commit().unwrap();

    assert_eq!(stored_name(&store, 1), Some(StoredValue::Text("lantern".into())));
    ctx.set_intercepting(id, true).unwrap();
    assert!(ctx.untracked_object_mut(id).is_none());
}

#[test]
fn test_reachable_transient_instances_are_persisted() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let owner = ctx
        .persist(ManagedObject::new(person_class()).with("id", 1i64).unwrap())
        .unwrap();
    let target = ctx.transient(item(2, "hat"));
    assert_eq!(ctx.state(target).unwrap(), PcState::Transient);

    ctx.write_field(owner, "address", FieldValue::Managed(target))
        .unwrap();
    ctx.commit().unwrap();

    assert_eq!(ctx.state(target).unwrap(), PcState::PNonTrans);
    assert_eq!(stored_name(&store, 2), Some(StoredValue::Text("hat".into())));
    let (values, _) = store.record("Person", &ObjectId::Long(1)).unwrap();
    assert_eq!(
        values[1],
        StoredValue::Ref {
            class: "Item".into(),
            object_id: ObjectId::Long(2)
        }
    );
}

#[test]
fn test_embedded_instance_is_stored_inline() {
    let (store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let person = ctx
        .persist(ManagedObject::new(person_class()).with("id", 1i64).unwrap())
        .unwrap();
    let address = ManagedObject::new(address_class())
        .with("street", "Main St")
        .unwrap();
    let embedded = ctx.embed(person, "address", address).unwrap();
    assert_eq!(ctx.state(embedded).unwrap(), PcState::EClean);
    assert_eq!(ctx.get(embedded).unwrap().owner(), Some((person, 1)));

    ctx.write_field(embedded, "street", FieldValue::text("High St"))
        .unwrap();
    assert_eq!(ctx.state(embedded).unwrap(), PcState::EDirty);
    ctx.commit().unwrap();

    let (values, _) = store.record("Person", &ObjectId::Long(1)).unwrap();
    assert_eq!(
        values[1],
        StoredValue::Embedded {
            class: "Address".into(),
            values: vec![StoredValue::Text("High St".into())]
        }
    );

    let mut other = PersistenceContext::new(KernelConfig::default(), store.clone()).unwrap();
    let loaded = other.find("Person", &ObjectId::Long(1)).unwrap().unwrap();
    let inner = other
        .read_field(loaded, "address")
        .unwrap()
        .as_managed()
        .unwrap();
    assert!(other.state(inner).unwrap().is_embedded());
    assert_eq!(
        other.read_field(inner, "street").unwrap(),
        FieldValue::text("High St")
    );
}

#[test]
fn test_deleting_owner_deletes_embedded() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let person = ctx
        .persist(ManagedObject::new(person_class()).with("id", 1i64).unwrap())
        .unwrap();
    let address = ManagedObject::new(address_class())
        .with("street", "Main St")
        .unwrap();
    let embedded = ctx.embed(person, "address", address).unwrap();

    ctx.delete(person).unwrap();
    assert_eq!(ctx.state(person).unwrap(), PcState::PNewDeleted);
    assert_eq!(ctx.state(embedded).unwrap(), PcState::EDeleted);
}

#[test]
fn test_embedded_copy_is_unowned() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    ctx.begin().unwrap();
    let person = ctx
        .persist(ManagedObject::new(person_class()).with("id", 1i64).unwrap())
        .unwrap();
    let address = ManagedObject::new(address_class())
        .with("street", "Main St")
        .unwrap();
    let embedded = ctx.embed(person, "address", address).unwrap();

    let copy = ctx.embedded_copy(embedded).unwrap();
    assert_eq!(ctx.state(copy).unwrap(), PcState::ECopy);
    assert_eq!(ctx.get(copy).unwrap().owner(), None);
    assert!(ctx.delete(copy).is_err());
}

#[test]
fn test_extent_lists_live_instances_of_class() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    seed(&store, 2, "rug");
    ctx.begin().unwrap();
    let a = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();
    let b = ctx.find("Item", &ObjectId::Long(2)).unwrap().unwrap();
    let c = ctx.persist(item(3, "vase")).unwrap();
    ctx.delete(b).unwrap();

    let ids: Vec<_> = ctx.extent("Item").collect();
    assert_eq!(ids, vec![a, c]);
    assert!(ctx.extent("Person").next().is_none());

    let mut open = ctx.extent("Item");
    assert_eq!(ctx.open_extents(), 1);
    assert_eq!(ctx.close_all_extents(), 1);
    assert!(open.next().is_none());
    assert!(open.is_closed());
}

#[test]
fn test_listeners_see_persist_and_store_events() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    let recorder = Arc::new(Recorder::default());
    ctx.add_listener(recorder.clone());

    ctx.begin().unwrap();
    ctx.persist(item(1, "lamp")).unwrap();
    ctx.commit().unwrap();

    assert_eq!(
        *recorder.events.lock(),
        vec![
            LifecycleEvent::BeforePersist,
            LifecycleEvent::AfterPersist,
            LifecycleEvent::BeforeStore,
            LifecycleEvent::AfterStore,
        ]
    );
}

#[test]
fn test_failing_listener_aborts_persist() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    ctx.add_listener(Arc::new(Recorder {
        fail_on: Some(LifecycleEvent::BeforePersist),
        ..Default::default()
    }));

    ctx.begin().unwrap();
    let err = ctx.persist(item(1, "lamp")).unwrap_err();
    match err {
        KernelError::Callback { listener, .. } => assert_eq!(listener, "recorder"),
        other => panic!("expected callback error, got {other}"),
    }
    assert!(ctx.managed_instances().is_empty());
}

#[test]
fn test_logged_or_ignored_listener_failures_do_not_abort() {
    for mode in [CallbackMode::log(), CallbackMode::ignore()] {
        let (_store, mut ctx) = setup(KernelConfig::default().callback_mode(mode));
        ctx.add_listener(Arc::new(Recorder {
            fail_on: Some(LifecycleEvent::BeforePersist),
            ..Default::default()
        }));
        ctx.begin().unwrap();
        let id = ctx.persist(item(1, "lamp")).unwrap();
        assert_eq!(ctx.state(id).unwrap(), PcState::PNew);
    }
}

#[test]
fn test_delete_fires_before_and_after_delete() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    let recorder = Arc::new(Recorder::default());
    ctx.add_listener(recorder.clone());

    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();
    ctx.delete(id).unwrap();
    assert_eq!(
        *recorder.events.lock(),
        vec![LifecycleEvent::BeforeDelete, LifecycleEvent::AfterDelete]
    );
}

#[test]
fn test_vetoed_delete_leaves_instance_unchanged() {
    let (store, mut ctx) = setup(KernelConfig::default());
    seed(&store, 1, "lamp");
    ctx.add_listener(Arc::new(Recorder {
        fail_on: Some(LifecycleEvent::BeforeDelete),
        ..Default::default()
    }));

    ctx.begin().unwrap();
    let id = ctx.find("Item", &ObjectId::Long(1)).unwrap().unwrap();
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
    assert!(matches!(ctx.delete(id), Err(KernelError::Callback { .. })));
    assert_eq!(ctx.state(id).unwrap(), PcState::PNonTrans);
    assert!(ctx.transactional_instances().is_empty());

    ctx.commit().unwrap();
    assert!(store.record("Item", &ObjectId::Long(1)).is_some());
    assert_eq!(ctx.find("Item", &ObjectId::Long(1)).unwrap(), Some(id));
    assert!(!ctx.state(id).unwrap().is_deleted());
}

#[test]
fn test_transaction_boundaries() {
    let (_store, mut ctx) = setup(KernelConfig::default());
    assert!(matches!(ctx.commit(), Err(KernelError::NoTransaction)));
    assert!(matches!(ctx.rollback(), Err(KernelError::NoTransaction)));
    assert!(matches!(ctx.flush(), Err(KernelError::NoTransaction)));
    ctx.begin().unwrap();
    assert!(matches!(ctx.begin(), Err(KernelError::TransactionActive)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let config = KernelConfig::default().read_lock_level(LockLevel::Write);
    assert!(matches!(
        PersistenceContext::new(config, store),
        Err(KernelError::Config(_))
    ));

    let parsed = KernelConfig::from_json(r#"{"optimistic": false, "multithreaded": true}"#).unwrap();
    assert!(!parsed.optimistic);
    assert!(parsed.retain_state);
    let ctx = PersistenceContext::new(parsed, Arc::new(InMemoryStore::new())).unwrap();
    assert!(ctx.shared_cache().is_some());
}
